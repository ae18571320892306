use std::f64::consts::PI;

use smallvec::{smallvec, SmallVec};

use super::{sample_forward, BranchingState};
use crate::channel::{Action, ChannelArena, ChannelId};
use crate::grid::AdaptiveGrid;
use crate::momentum::Momentum;
use crate::pair::ConstrainedPairSampler;
use crate::random::{unit_direction, RandomSource};
use crate::sampler::{Density, ValueSampler};
use crate::utils::{two_body_momentum, two_body_phase_space};
use crate::{MultiChannelingSettings, PhaseSpaceSettings, SamplingDirection};

/// Isotropic (or polar-grid driven) two-body decay in the rest frame of the
/// incoming channel.
#[derive(Debug, Clone)]
pub struct DecayBranching {
    incoming: ChannelId,
    outgoing: [ChannelId; 2],
    direction: SamplingDirection,
    root: bool,
    pair: ConstrainedPairSampler,
    /// Distribution of `cos θ` of the first product, four dimensions only.
    polar_grid: Option<AdaptiveGrid>,
    mass_weight: f64,
    angular_weight: f64,
    phase_space: f64,
}

impl DecayBranching {
    pub fn new(
        incoming: ChannelId,
        outgoing: [ChannelId; 2],
        root: bool,
        dimension: usize,
        settings: &PhaseSpaceSettings,
        multi_channeling: &MultiChannelingSettings,
    ) -> Self {
        let polar_grid = (settings.polar_grid && dimension == 4).then(|| {
            AdaptiveGrid::new(
                ValueSampler::with_bounds(Density::Flat, -1., 1.),
                &settings.grid,
            )
        });
        DecayBranching {
            incoming,
            outgoing,
            direction: settings.sampling_direction,
            root,
            pair: ConstrainedPairSampler::new(settings.pair_sampling, multi_channeling),
            polar_grid,
            mass_weight: 0.,
            angular_weight: 0.,
            phase_space: 0.,
        }
    }

    pub fn incoming(&self) -> ChannelId {
        self.incoming
    }

    pub fn outgoing(&self) -> [ChannelId; 2] {
        self.outgoing
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn polar_grid(&self) -> Option<&AdaptiveGrid> {
        self.polar_grid.as_ref()
    }

    pub fn weight(&self) -> f64 {
        self.mass_weight * self.angular_weight * self.phase_space
    }

    pub fn reset(&mut self) {
        self.mass_weight = 0.;
        self.angular_weight = 0.;
        self.phase_space = 0.;
        if let Some(grid) = &mut self.polar_grid {
            grid.clear_bin();
        }
    }

    pub fn channels(&self) -> SmallVec<[ChannelId; 6]> {
        smallvec![self.incoming, self.outgoing[0], self.outgoing[1]]
    }

    pub fn generate_s<const D: usize, R: RandomSource + ?Sized>(
        &mut self,
        arena: &mut ChannelArena<D>,
        action: &mut Action<'_, R>,
    ) -> bool {
        self.mass_weight = 0.;
        let weight = match self.direction {
            SamplingDirection::Backward => {
                let s = arena[self.incoming].mass_squared;
                if !self.pair.sample(arena, self.outgoing, s, action) {
                    return false;
                }
                self.pair.weight()
            }
            SamplingDirection::Forward => {
                match sample_forward(arena, self.incoming, self.outgoing, self.root, action) {
                    Some(w) => w,
                    None => return false,
                }
            }
        };
        self.mass_weight = weight;
        true
    }

    pub fn generate_p<const D: usize, R: RandomSource + ?Sized>(
        &mut self,
        arena: &mut ChannelArena<D>,
        action: &mut Action<'_, R>,
    ) -> bool {
        self.angular_weight = 0.;
        self.phase_space = 0.;
        let [first, second] = self.outgoing;
        let (p, s) = (arena[self.incoming].momentum, arena[self.incoming].mass_squared);
        let (s1, s2) = (arena[first].mass_squared, arena[second].mass_squared);
        let Some(q) = two_body_momentum(s, s1, s2) else {
            return false;
        };
        let e1 = (s + s1 - s2) / (2. * s.sqrt());

        let angular = match action {
            Action::Generate(rng) => {
                let (direction, angular) = match &mut self.polar_grid {
                    Some(grid) if D == 4 => {
                        if !grid.generate(&mut **rng) {
                            return false;
                        }
                        let cos_theta = grid.value();
                        let sin_theta = (1. - cos_theta * cos_theta).max(0.).sqrt();
                        let phi = 2. * PI * (**rng).uniform();
                        let mut direction = Momentum::<D>::zero();
                        direction[1] = sin_theta * phi.cos();
                        direction[2] = sin_theta * phi.sin();
                        direction[D - 1] = cos_theta;
                        // dΩ = dcos θ dφ against the full solid angle 4π
                        (direction, grid.weight() / 2.)
                    }
                    _ => (unit_direction::<D, R>(&mut **rng), 1.),
                };
                let p1 = Momentum::from_direction(e1, q, &direction).boost_from_rest_frame_of(&p);
                let p2 = p - p1;
                if !p1.is_finite() || !p2.is_finite() {
                    return false;
                }
                arena[first].set_momentum(p1);
                arena[second].set_momentum(p2);
                angular
            }
            Action::Evaluate => match &mut self.polar_grid {
                Some(grid) if D == 4 => {
                    let rest = arena[first].momentum.boost_to_rest_frame_of(&p);
                    let norm = rest.spatial_norm();
                    if !(norm > 0.) {
                        return false;
                    }
                    grid.set_value((rest[D - 1] / norm).clamp(-1., 1.));
                    if !grid.evaluate_weight() {
                        return false;
                    }
                    grid.weight() / 2.
                }
                _ => 1.,
            },
        };

        self.angular_weight = angular;
        self.phase_space = two_body_phase_space(s, s1, s2, D);
        self.phase_space > 0. && self.weight().is_finite()
    }

    pub fn update<const D: usize>(&mut self, arena: &mut ChannelArena<D>, value: f64) {
        if let Some(grid) = &mut self.polar_grid {
            grid.update(value);
        }
        self.pair.update(arena, self.outgoing, value);
    }

    pub fn adapt<const D: usize>(&mut self, arena: &mut ChannelArena<D>) {
        if let Some(grid) = &mut self.polar_grid {
            grid.adapt();
        }
        self.pair.adapt(arena, self.outgoing);
    }

    pub fn state(&self) -> BranchingState {
        BranchingState {
            pair_alphas: self.pair.alphas().map(|a| a.to_vec()),
            polar_grid: self.polar_grid.clone(),
        }
    }

    pub fn load_state(&mut self, state: &BranchingState) -> bool {
        if state.polar_grid.is_some() != self.polar_grid.is_some()
            || state.pair_alphas.is_some() != self.pair.is_symmetric()
        {
            return false;
        }
        if let Some(alphas) = &state.pair_alphas {
            if !self.pair.set_alphas(alphas) {
                return false;
            }
        }
        if let Some(grid) = &state.polar_grid {
            let mut grid = grid.clone();
            grid.refresh();
            self.polar_grid = Some(grid);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, Evaluation, LegSet, MassSampler};
    use crate::momentum::FourMomentum;
    use crate::utils::{ApproxEq, CONSERVATION_TOLERANCE};
    use rand::{rngs::SmallRng, SeedableRng};

    fn fixed(value: f64) -> MassSampler {
        MassSampler::Plain(ValueSampler::with_bounds(
            Density::DiracDelta { value },
            value,
            value,
        ))
    }

    /// A particle of mass 10 at rest decaying to masses 1 and 2.
    fn at_rest_decay(settings: &PhaseSpaceSettings) -> (ChannelArena<4>, DecayBranching) {
        let mut arena = ChannelArena::<4>::new(1, 2).unwrap();
        let parent = arena
            .insert(Channel::new(LegSet::single(0), fixed(100.), 100., 100.).external())
            .unwrap();
        let first = arena
            .insert(Channel::new(LegSet::single(1), fixed(1.), 1., 1.).external())
            .unwrap();
        let second = arena
            .insert(Channel::new(LegSet::single(2), fixed(4.), 4., 4.).external())
            .unwrap();
        arena[parent].set_mass_squared(100.);
        arena[parent].set_momentum(FourMomentum::at_rest(10.));
        let decay = DecayBranching::new(
            parent,
            [first, second],
            true,
            4,
            settings,
            &MultiChannelingSettings::default(),
        );
        (arena, decay)
    }

    #[test]
    fn massive_decay_conserves_momentum() {
        for direction in [SamplingDirection::Backward, SamplingDirection::Forward] {
            let settings = PhaseSpaceSettings {
                sampling_direction: direction,
                ..PhaseSpaceSettings::default()
            };
            let (mut arena, mut decay) = at_rest_decay(&settings);
            let mut rng = SmallRng::seed_from_u64(5);
            let [first, second] = decay.outgoing();
            for _ in 0..100 {
                assert!(decay.generate_s(&mut arena, &mut Action::Generate(&mut rng)));
                assert!(decay.generate_p(&mut arena, &mut Action::Generate(&mut rng)));
                let p1 = arena[first].momentum;
                let p2 = arena[second].momentum;
                let total = FourMomentum::at_rest(10.);
                assert!((p1 + p2).approx_eq(&total, &CONSERVATION_TOLERANCE));
                assert!(p1.square().approx_eq(&1., &1e-9));
                assert!(p2.square().approx_eq(&4., &1e-9));
                let expected = two_body_phase_space(100., 1., 4., 4);
                assert!(decay.weight().approx_eq(&expected, &1e-12));
            }
        }
    }

    #[test]
    fn polar_grid_weight_is_reproduced() {
        let settings = PhaseSpaceSettings {
            polar_grid: true,
            ..PhaseSpaceSettings::default()
        };
        let (mut arena, mut decay) = at_rest_decay(&settings);
        assert!(decay.polar_grid().is_some());
        let mut rng = SmallRng::seed_from_u64(9);
        for _ in 0..100 {
            assert!(decay.generate_s(&mut arena, &mut Action::Generate(&mut rng)));
            assert!(decay.generate_p(&mut arena, &mut Action::Generate(&mut rng)));
            let generated = decay.weight();
            assert!(decay.generate_s(&mut arena, &mut Evaluation::Evaluate));
            assert!(decay.generate_p(&mut arena, &mut Evaluation::Evaluate));
            assert!(decay.weight().approx_eq(&generated, &1e-12));
        }
    }

    #[test]
    fn closed_channel_fails() {
        let (mut arena, mut decay) = at_rest_decay(&PhaseSpaceSettings::default());
        let parent = decay.incoming();
        arena[parent].set_mass_squared(8.);
        arena[parent].set_momentum(FourMomentum::at_rest(8f64.sqrt()));
        let mut rng = SmallRng::seed_from_u64(1);
        assert!(!decay.generate_s(&mut arena, &mut Action::Generate(&mut rng)));
        assert_eq!(decay.weight(), 0.);
    }
}
