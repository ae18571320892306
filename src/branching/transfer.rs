use std::f64::consts::PI;

use smallvec::{smallvec, SmallVec};

use super::{sample_forward, BranchingState};
use crate::channel::{Action, ChannelArena, ChannelId};
use crate::momentum::Momentum;
use crate::pair::ConstrainedPairSampler;
use crate::random::{orthogonal_direction, RandomSource};
use crate::utils::{compute_surface_and_volume, kallen, two_body_momentum};
use crate::{MultiChannelingSettings, PhaseSpaceSettings, SamplingDirection};

/// `a + b -> o + y` through the spacelike exchange `t = (a - o)²`.
///
/// `a` is the first beam or the exchange of the previous link of a chain,
/// `b` the second beam and `total` the timelike channel `a + b`. The exchange
/// is sampled in `u = -t`, then `o` is placed at the matching polar angle
/// around the direction of `a` in the rest frame of `total`.
#[derive(Debug, Clone)]
pub struct TransferBranching {
    incoming: [ChannelId; 2],
    total: ChannelId,
    outgoing: [ChannelId; 2],
    exchange: ChannelId,
    direction: SamplingDirection,
    root: bool,
    pair: ConstrainedPairSampler,
    cos_theta: f64,
    energy: f64,
    modulus: f64,
    mass_weight: f64,
    transfer_weight: f64,
}

impl TransferBranching {
    pub fn new(
        incoming: [ChannelId; 2],
        total: ChannelId,
        outgoing: [ChannelId; 2],
        exchange: ChannelId,
        root: bool,
        settings: &PhaseSpaceSettings,
        multi_channeling: &MultiChannelingSettings,
    ) -> Self {
        TransferBranching {
            incoming,
            total,
            outgoing,
            exchange,
            direction: settings.sampling_direction,
            root,
            pair: ConstrainedPairSampler::new(settings.pair_sampling, multi_channeling),
            cos_theta: 0.,
            energy: 0.,
            modulus: 0.,
            mass_weight: 0.,
            transfer_weight: 0.,
        }
    }

    pub fn incoming(&self) -> [ChannelId; 2] {
        self.incoming
    }

    pub fn total(&self) -> ChannelId {
        self.total
    }

    pub fn outgoing(&self) -> [ChannelId; 2] {
        self.outgoing
    }

    pub fn exchange(&self) -> ChannelId {
        self.exchange
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn cos_theta(&self) -> f64 {
        self.cos_theta
    }

    pub fn weight(&self) -> f64 {
        self.mass_weight * self.transfer_weight
    }

    pub fn reset(&mut self) {
        self.mass_weight = 0.;
        self.transfer_weight = 0.;
    }

    pub fn channels(&self) -> SmallVec<[ChannelId; 6]> {
        smallvec![
            self.incoming[0],
            self.incoming[1],
            self.total,
            self.outgoing[0],
            self.outgoing[1],
            self.exchange
        ]
    }

    pub fn generate_s<const D: usize, R: RandomSource + ?Sized>(
        &mut self,
        arena: &mut ChannelArena<D>,
        action: &mut Action<'_, R>,
    ) -> bool {
        self.mass_weight = 0.;
        let weight = match self.direction {
            SamplingDirection::Backward => {
                let s = arena[self.total].mass_squared;
                if !self.pair.sample(arena, self.outgoing, s, action) {
                    return false;
                }
                self.pair.weight()
            }
            SamplingDirection::Forward => {
                match sample_forward(arena, self.total, self.outgoing, self.root, action) {
                    Some(w) => w,
                    None => return false,
                }
            }
        };
        self.mass_weight = weight;
        true
    }

    /// Sample `u = -t` between the kinematic limits set by the masses and
    /// compute the weight of the exchange and of the two-body phase space.
    pub fn generate_t<const D: usize, R: RandomSource + ?Sized>(
        &mut self,
        arena: &mut ChannelArena<D>,
        action: &mut Action<'_, R>,
    ) -> bool {
        self.transfer_weight = 0.;
        let s = arena[self.total].mass_squared;
        let (sa, sb) = (
            arena[self.incoming[0]].mass_squared,
            arena[self.incoming[1]].mass_squared,
        );
        let (s1, s2) = (
            arena[self.outgoing[0]].mass_squared,
            arena[self.outgoing[1]].mass_squared,
        );
        let lambda_in = kallen(s, sa, sb);
        if !(s > 0.) || !(lambda_in > 0.) {
            return false;
        }
        let Some(p_out) = two_body_momentum(s, s1, s2) else {
            return false;
        };
        let sqrt_s = s.sqrt();
        let p_in = lambda_in.sqrt() / (2. * sqrt_s);
        let e_a = (s + sa - sb) / (2. * sqrt_s);
        let e_1 = (s + s1 - s2) / (2. * sqrt_s);

        // t = t_mid + spread cos θ
        let t_mid = sa + s1 - 2. * e_a * e_1;
        let spread = 2. * p_in * p_out;
        let exchange = &mut arena[self.exchange];
        if !exchange.sample_invariant(-(t_mid + spread), -(t_mid - spread), action) {
            return false;
        }
        let cos_theta = ((exchange.mass_squared - t_mid) / spread).clamp(-1., 1.);

        let angular = compute_surface_and_volume(D - 3, 1.).0
            * (1. - cos_theta * cos_theta).powf((D as f64 - 4.) / 2.);
        let phase_space = (2. * PI).powi(2 - D as i32) * p_out.powi(D as i32 - 3) / (4. * sqrt_s);
        let weight = exchange.weight() / spread * angular * phase_space;
        if !weight.is_finite() || !(weight > 0.) {
            return false;
        }

        self.cos_theta = cos_theta;
        self.energy = e_1;
        self.modulus = p_out;
        self.transfer_weight = weight;
        true
    }

    pub fn generate_p<const D: usize, R: RandomSource + ?Sized>(
        &mut self,
        arena: &mut ChannelArena<D>,
        action: &mut Action<'_, R>,
    ) -> bool {
        let Action::Generate(rng) = action else {
            return self.transfer_weight > 0.;
        };
        let total = arena[self.total].momentum;
        let a = arena[self.incoming[0]].momentum;
        let Some(axis) = a.boost_to_rest_frame_of(&total).spatial_direction() else {
            return false;
        };
        let perpendicular = orthogonal_direction(&mut **rng, &axis);
        let sin_theta = (1. - self.cos_theta * self.cos_theta).max(0.).sqrt();
        let direction = axis * self.cos_theta + perpendicular * sin_theta;

        let p1 = Momentum::from_direction(self.energy, self.modulus, &direction)
            .boost_from_rest_frame_of(&total);
        let p2 = total - p1;
        let q = a - p1;
        if !p1.is_finite() || !p2.is_finite() {
            return false;
        }
        arena[self.outgoing[0]].set_momentum(p1);
        arena[self.outgoing[1]].set_momentum(p2);
        arena[self.exchange].set_momentum(q);
        true
    }

    pub fn update<const D: usize>(&mut self, arena: &mut ChannelArena<D>, value: f64) {
        self.pair.update(arena, self.outgoing, value);
    }

    pub fn adapt<const D: usize>(&mut self, arena: &mut ChannelArena<D>) {
        self.pair.adapt(arena, self.outgoing);
    }

    pub fn state(&self) -> BranchingState {
        BranchingState {
            pair_alphas: self.pair.alphas().map(|a| a.to_vec()),
            polar_grid: None,
        }
    }

    pub fn load_state(&mut self, state: &BranchingState) -> bool {
        if state.polar_grid.is_some() || state.pair_alphas.is_some() != self.pair.is_symmetric() {
            return false;
        }
        match &state.pair_alphas {
            Some(alphas) => self.pair.set_alphas(alphas),
            None => true,
        }
    }
}
