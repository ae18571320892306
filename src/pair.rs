//! Joint sampling of the two invariant masses produced by a branching.
//!
//! The pair must satisfy `√s1 + √s2 ≤ √s` besides each channel's own floor.
//! The asymmetric sampler draws `s1` first on the widest range compatible with
//! the floor of `s2`, then `s2` on what is left. The symmetric sampler
//! combines both orderings as a two-channel [`MultiChannel`].

use log::debug;

use crate::channel::{Action, ChannelArena, ChannelId, Evaluation};
use crate::multichannel::{MultiChannel, Sampleable};
use crate::random::RandomSource;
use crate::sampler::composite::CompositeIntegrator;
use crate::{MultiChannelingSettings, PairSampling};

/// `(√s − √other)²`, or `None` when `other` alone exhausts the budget.
fn remaining(sqrt_s: f64, other: f64) -> Option<f64> {
    let r = sqrt_s - other.max(0.).sqrt();
    (r >= 0.).then_some(r * r)
}

/// Sample (or score) `children[first]` then the other child under `√s`.
/// Returns the product of both channel weights, zero on failure.
fn sample_ordered<const D: usize, R: RandomSource + ?Sized>(
    arena: &mut ChannelArena<D>,
    children: [ChannelId; 2],
    s: f64,
    first: usize,
    action: &mut Action<'_, R>,
) -> f64 {
    if !(s > 0.) || !s.is_finite() {
        return 0.;
    }
    let sqrt_s = s.sqrt();
    let (a, b) = (children[first], children[1 - first]);

    let floor_a = arena[a].s_min_abs;
    let floor_b = arena[b].s_min_abs;
    let Some(budget_a) = remaining(sqrt_s, floor_b) else {
        return 0.;
    };
    let hi_a = arena[a].s_max_abs.min(budget_a);
    if !arena[a].sample_invariant(floor_a, hi_a, action) {
        return 0.;
    }

    let Some(budget_b) = remaining(sqrt_s, arena[a].mass_squared) else {
        return 0.;
    };
    let hi_b = arena[b].s_max_abs.min(budget_b);
    if !arena[b].sample_invariant(floor_b, hi_b, action) {
        return 0.;
    }
    arena[a].weight() * arena[b].weight()
}

/// The event a pair is sampled in.
pub struct PairContext<'a, const D: usize> {
    pub arena: &'a mut ChannelArena<D>,
    pub children: [ChannelId; 2],
    pub s: f64,
}

/// One of the two orderings of a symmetric pair.
#[derive(Debug, Clone, Copy)]
pub struct PairOrdering {
    first: usize,
}

impl<'a, const D: usize> Sampleable<PairContext<'a, D>> for PairOrdering {
    fn generate<R: RandomSource + ?Sized>(
        &mut self,
        ctx: &mut PairContext<'a, D>,
        rng: &mut R,
    ) -> f64 {
        sample_ordered(
            ctx.arena,
            ctx.children,
            ctx.s,
            self.first,
            &mut Action::Generate(rng),
        )
    }

    fn evaluate_weight(&mut self, ctx: &mut PairContext<'a, D>) -> f64 {
        sample_ordered(
            ctx.arena,
            ctx.children,
            ctx.s,
            self.first,
            &mut Evaluation::Evaluate,
        )
    }
}

#[derive(Debug, Clone)]
enum PairMode {
    Asymmetric,
    Symmetric(MultiChannel<PairOrdering>),
}

/// Sampler of the two outgoing invariants of a branching.
#[derive(Debug, Clone)]
pub struct ConstrainedPairSampler {
    mode: PairMode,
    weight: f64,
}

impl ConstrainedPairSampler {
    pub fn new(sampling: PairSampling, settings: &MultiChannelingSettings) -> Self {
        let mode = match sampling {
            PairSampling::Asymmetric => PairMode::Asymmetric,
            PairSampling::Symmetric => PairMode::Symmetric(MultiChannel::new(
                vec![PairOrdering { first: 0 }, PairOrdering { first: 1 }],
                settings,
            )),
        };
        ConstrainedPairSampler { mode, weight: 0. }
    }

    pub fn is_symmetric(&self) -> bool {
        matches!(self.mode, PairMode::Symmetric(_))
    }

    /// Weight of the last pair, including the `1/2π` of each integrated mass.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Probabilities of the two orderings of a symmetric sampler.
    pub fn alphas(&self) -> Option<&[f64]> {
        match &self.mode {
            PairMode::Asymmetric => None,
            PairMode::Symmetric(mc) => Some(mc.alphas()),
        }
    }

    pub fn set_alphas(&mut self, alphas: &[f64]) -> bool {
        match &mut self.mode {
            PairMode::Asymmetric => false,
            PairMode::Symmetric(mc) => mc.set_alphas(alphas),
        }
    }

    /// Sample (or score) the invariants of `children` under the parent's `s`.
    pub fn sample<const D: usize, R: RandomSource + ?Sized>(
        &mut self,
        arena: &mut ChannelArena<D>,
        children: [ChannelId; 2],
        s: f64,
        action: &mut Action<'_, R>,
    ) -> bool {
        self.weight = match &mut self.mode {
            PairMode::Asymmetric => sample_ordered(arena, children, s, 0, action),
            PairMode::Symmetric(mc) => {
                let mut ctx = PairContext {
                    arena,
                    children,
                    s,
                };
                match action {
                    Action::Generate(rng) => mc.generate(&mut ctx, &mut **rng),
                    Action::Evaluate => mc.evaluate_weight(&mut ctx),
                }
            }
        };
        self.weight > 0.
    }

    /// Feed the weighted integrand of the last event to the ordering probabilities.
    pub fn update<const D: usize>(
        &mut self,
        arena: &mut ChannelArena<D>,
        children: [ChannelId; 2],
        value: f64,
    ) {
        if let PairMode::Symmetric(mc) = &mut self.mode {
            let mut ctx = PairContext {
                arena,
                children,
                s: 0.,
            };
            mc.update(&mut ctx, value);
        }
    }

    pub fn adapt<const D: usize>(&mut self, arena: &mut ChannelArena<D>, children: [ChannelId; 2]) {
        if let PairMode::Symmetric(mc) = &mut self.mode {
            let mut ctx = PairContext {
                arena,
                children,
                s: 0.,
            };
            mc.adapt(&mut ctx);
            debug!("Pair {:?} ordering probabilities {:?}", children, mc.alphas());
        }
    }
}

/// Unnormalised mass of the joint density of the pair `children` under `s`,
/// with each channel's sampler restricted to its absolute range.
pub fn joint_integral<const D: usize>(
    integrator: &CompositeIntegrator,
    arena: &ChannelArena<D>,
    children: [ChannelId; 2],
    s: f64,
) -> f64 {
    let (a, b) = (&arena[children[0]], &arena[children[1]]);
    integrator.integrate_densities(
        a.sampler.density(),
        (a.s_min_abs, a.s_max_abs),
        b.sampler.density(),
        (b.s_min_abs, b.s_max_abs),
        s,
    )
}
