//! Branchings of the phase-space tree.
//!
//! A branching splits one timelike channel into two: a [`DecayBranching`]
//! in the rest frame of its parent, a [`TransferBranching`] by exchanging a
//! spacelike invariant with the second beam. Every event runs three passes
//! over the branchings of a topology: `generate_s` samples the invariant
//! masses (top-down when sampling backward, bottom-up when sampling
//! forward), `generate_t` the spacelike invariants and `generate_p` the
//! momenta, always top-down. The same passes with [`Action::Evaluate`] score
//! a configuration produced elsewhere.

pub mod decay;
pub mod sum;
pub mod transfer;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::channel::{Action, ChannelArena, ChannelId};
use crate::grid::AdaptiveGrid;
use crate::random::RandomSource;

pub use decay::DecayBranching;
pub use sum::SumBranching;
pub use transfer::TransferBranching;

#[derive(Debug, Clone)]
pub enum Branching {
    Decay(DecayBranching),
    Transfer(TransferBranching),
}

/// Adaptive state of a branching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchingState {
    pub pair_alphas: Option<Vec<f64>>,
    pub polar_grid: Option<AdaptiveGrid>,
}

impl Branching {
    pub fn generate_s<const D: usize, R: RandomSource + ?Sized>(
        &mut self,
        arena: &mut ChannelArena<D>,
        action: &mut Action<'_, R>,
    ) -> bool {
        match self {
            Branching::Decay(b) => b.generate_s(arena, action),
            Branching::Transfer(b) => b.generate_s(arena, action),
        }
    }

    pub fn generate_t<const D: usize, R: RandomSource + ?Sized>(
        &mut self,
        arena: &mut ChannelArena<D>,
        action: &mut Action<'_, R>,
    ) -> bool {
        match self {
            Branching::Decay(_) => true,
            Branching::Transfer(b) => b.generate_t(arena, action),
        }
    }

    pub fn generate_p<const D: usize, R: RandomSource + ?Sized>(
        &mut self,
        arena: &mut ChannelArena<D>,
        action: &mut Action<'_, R>,
    ) -> bool {
        match self {
            Branching::Decay(b) => b.generate_p(arena, action),
            Branching::Transfer(b) => b.generate_p(arena, action),
        }
    }

    /// Product of the mass, angular and phase-space weights of the last pass.
    pub fn weight(&self) -> f64 {
        match self {
            Branching::Decay(b) => b.weight(),
            Branching::Transfer(b) => b.weight(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Branching::Decay(b) => b.reset(),
            Branching::Transfer(b) => b.reset(),
        }
    }

    /// Every channel read or written by this branching.
    pub fn channels(&self) -> SmallVec<[ChannelId; 6]> {
        match self {
            Branching::Decay(b) => b.channels(),
            Branching::Transfer(b) => b.channels(),
        }
    }

    pub fn update<const D: usize>(&mut self, arena: &mut ChannelArena<D>, value: f64) {
        match self {
            Branching::Decay(b) => b.update(arena, value),
            Branching::Transfer(b) => b.update(arena, value),
        }
    }

    pub fn adapt<const D: usize>(&mut self, arena: &mut ChannelArena<D>) {
        match self {
            Branching::Decay(b) => b.adapt(arena),
            Branching::Transfer(b) => b.adapt(arena),
        }
    }

    pub fn state(&self) -> BranchingState {
        match self {
            Branching::Decay(b) => b.state(),
            Branching::Transfer(b) => b.state(),
        }
    }

    pub fn load_state(&mut self, state: &BranchingState) -> bool {
        match self {
            Branching::Decay(b) => b.load_state(state),
            Branching::Transfer(b) => b.load_state(state),
        }
    }
}

/// `(√s1 + √s2)²` of the current masses of `children`.
pub(crate) fn threshold<const D: usize>(arena: &ChannelArena<D>, children: [ChannelId; 2]) -> f64 {
    let m = arena[children[0]].mass() + arena[children[1]].mass();
    m * m
}

/// Bottom-up mass sampling of one branching: outgoing external legs draw
/// their own mass, then the parent draws above the children's threshold.
/// The root only records the threshold as its floor for this event, the sum
/// branching checks or samples it. Returns the product of the mass weights.
pub(crate) fn sample_forward<const D: usize, R: RandomSource + ?Sized>(
    arena: &mut ChannelArena<D>,
    parent: ChannelId,
    children: [ChannelId; 2],
    parent_is_root: bool,
    action: &mut Action<'_, R>,
) -> Option<f64> {
    let mut weight = 1.;
    for child in children {
        let channel = &mut arena[child];
        if channel.external {
            let (lo, hi) = (channel.s_min_abs, channel.s_max_abs);
            if !channel.sample_invariant(lo, hi, action) {
                return None;
            }
            weight *= channel.weight();
        }
    }
    let threshold = threshold(arena, children);
    let channel = &mut arena[parent];
    let lo = threshold.max(channel.s_min_abs);
    if parent_is_root {
        channel.s_min = lo;
        return Some(weight);
    }
    let hi = channel.s_max_abs;
    if !channel.sample_invariant(lo, hi, action) {
        return None;
    }
    Some(weight * channel.weight())
}
