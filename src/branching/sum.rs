use smallvec::SmallVec;

use crate::channel::{Action, ChannelArena, ChannelId};
use crate::momentum::Momentum;
use crate::random::RandomSource;
use crate::utils::two_body_momentum;
use crate::BeamSettings;

/// Root of every topology: fixes (or samples) the total invariant mass and
/// produces the momenta of the incoming legs.
///
/// With fixed beams the incoming momenta are back to back along the last
/// spatial axis at the collision energy. With hadronic beams the partonic
/// `ŝ` is sampled from the sampler of the total channel, above the floor the
/// topology reached for this event, and the partons carry the momentum
/// fractions `x1 = √τ e^y`, `x2 = √τ e^-y` at flat rapidity `y`.
#[derive(Debug, Clone)]
pub struct SumBranching {
    beams: SmallVec<[ChannelId; 2]>,
    total: ChannelId,
    /// Squared energy of the collision, hadronic when the beams are.
    s: f64,
    beam_settings: BeamSettings,
    weight: f64,
    x1: f64,
    x2: f64,
}

impl SumBranching {
    pub fn new(
        beams: SmallVec<[ChannelId; 2]>,
        total: ChannelId,
        s: f64,
        beam_settings: BeamSettings,
    ) -> Self {
        SumBranching {
            beams,
            total,
            s,
            beam_settings,
            weight: 0.,
            x1: 1.,
            x2: 1.,
        }
    }

    pub fn total(&self) -> ChannelId {
        self.total
    }

    pub fn beams(&self) -> &[ChannelId] {
        &self.beams
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Momentum fractions of the two partons, one for fixed beams.
    pub fn x1(&self) -> f64 {
        self.x1
    }

    pub fn x2(&self) -> f64 {
        self.x2
    }

    pub fn reset(&mut self) {
        self.weight = 0.;
        self.x1 = 1.;
        self.x2 = 1.;
    }

    pub fn generate_s<const D: usize, R: RandomSource + ?Sized>(
        &mut self,
        arena: &mut ChannelArena<D>,
        action: &mut Action<'_, R>,
    ) -> bool {
        self.weight = 0.;
        for beam in self.beams.iter().copied().filter(|b| *b != self.total) {
            let channel = &mut arena[beam];
            let (lo, hi) = (channel.s_min_abs, channel.s_max_abs);
            if !channel.sample_invariant(lo, hi, action) {
                return false;
            }
        }

        let total = &mut arena[self.total];
        match self.beam_settings {
            BeamSettings::Fixed => {
                let (lo, hi) = (total.s_min, total.s_max_abs);
                if !total.sample_invariant(lo, hi, action) {
                    return false;
                }
                self.weight = total.sampler.weight();
            }
            BeamSettings::Hadronic { tau_min } => {
                let lo = total.s_min.max(tau_min * self.s);
                if !total.sample_invariant(lo, self.s, action) {
                    return false;
                }
                let tau = total.mass_squared / self.s;
                if !(tau > 0. && tau <= 1.) {
                    return false;
                }
                // ds dy / S with y flat in [ln τ / 2, -ln τ / 2]
                self.weight = total.sampler.weight() * -tau.ln() / self.s;
            }
        }
        self.weight > 0. && self.weight.is_finite()
    }

    pub fn generate_p<const D: usize, R: RandomSource + ?Sized>(
        &mut self,
        arena: &mut ChannelArena<D>,
        action: &mut Action<'_, R>,
    ) -> bool {
        let s_total = arena[self.total].mass_squared;
        if let [beam] = self.beams[..] {
            // a decaying particle at rest
            if action.is_generate() {
                arena[beam].set_momentum(Momentum::at_rest(s_total.sqrt()));
            }
            return true;
        }
        let [a, b] = [self.beams[0], self.beams[1]];
        let axis = D - 1;
        match self.beam_settings {
            BeamSettings::Fixed => {
                if !action.is_generate() {
                    return true;
                }
                let (sa, sb) = (arena[a].mass_squared, arena[b].mass_squared);
                let Some(p) = two_body_momentum(s_total, sa, sb) else {
                    return false;
                };
                let sqrt_s = s_total.sqrt();
                let e_a = (s_total + sa - sb) / (2. * sqrt_s);
                let mut pa = Momentum::<D>::at_rest(e_a);
                pa[axis] = p;
                let mut pb = Momentum::<D>::at_rest(sqrt_s - e_a);
                pb[axis] = -p;
                self.set_incoming(arena, pa, pb);
                true
            }
            BeamSettings::Hadronic { .. } => {
                let beam_energy = self.s.sqrt() / 2.;
                match action.uniform() {
                    Some(r) => {
                        let tau = s_total / self.s;
                        let y = (0.5 - r) * tau.ln();
                        self.x1 = tau.sqrt() * y.exp();
                        self.x2 = tau.sqrt() * (-y).exp();
                        let pa = Momentum::<D>::along_axis(self.x1 * beam_energy, axis);
                        let mut pb = Momentum::<D>::along_axis(self.x2 * beam_energy, axis);
                        pb[axis] = -pb[axis];
                        self.set_incoming(arena, pa, pb);
                    }
                    None => {
                        self.x1 = arena[a].momentum.temporal() / beam_energy;
                        self.x2 = arena[b].momentum.temporal() / beam_energy;
                    }
                }
                let valid = |x: f64| x > 0. && x <= 1. + 1e-12;
                valid(self.x1) && valid(self.x2)
            }
        }
    }

    fn set_incoming<const D: usize>(
        &self,
        arena: &mut ChannelArena<D>,
        pa: Momentum<D>,
        pb: Momentum<D>,
    ) {
        arena[self.beams[0]].set_momentum(pa);
        arena[self.beams[1]].set_momentum(pb);
        arena[self.total].set_momentum(pa + pb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, Evaluation, LegSet, MassSampler};
    use crate::sampler::{Density, ValueSampler};
    use crate::utils::ApproxEq;
    use rand::{rngs::SmallRng, SeedableRng};
    use smallvec::smallvec;

    fn hadronic_arena() -> (ChannelArena<4>, SumBranching) {
        let mut arena = ChannelArena::<4>::new(2, 2).unwrap();
        let delta = || {
            MassSampler::Plain(ValueSampler::with_bounds(
                Density::DiracDelta { value: 0. },
                0.,
                0.,
            ))
        };
        let a = arena
            .insert(Channel::new(LegSet::single(0), delta(), 0., 0.).external())
            .unwrap();
        let b = arena
            .insert(Channel::new(LegSet::single(1), delta(), 0., 0.).external())
            .unwrap();
        let shat = MassSampler::Plain(ValueSampler::with_bounds(
            Density::PowerLaw {
                exponent: 1.,
                offset: 0.,
            },
            1.,
            1e4,
        ));
        let total = arena
            .insert(Channel::new(LegSet::range(2, 4), shat, 1., 1e4))
            .unwrap();
        let sum = SumBranching::new(
            smallvec![a, b],
            total,
            1e4,
            BeamSettings::Hadronic { tau_min: 1e-4 },
        );
        (arena, sum)
    }

    #[test]
    fn partons_carry_the_sampled_invariant() {
        let (mut arena, mut sum) = hadronic_arena();
        let mut rng = SmallRng::seed_from_u64(4);
        let total = sum.total();
        for _ in 0..100 {
            arena.reset();
            assert!(sum.generate_s(&mut arena, &mut Action::Generate(&mut rng)));
            assert!(sum.generate_p(&mut arena, &mut Action::Generate(&mut rng)));
            let shat = arena[total].mass_squared;
            assert!(arena[total].momentum.square().approx_eq(&shat, &1e-9));
            assert!((sum.x1() * sum.x2() * 1e4).approx_eq(&shat, &1e-12));
            let [a, b] = [sum.beams()[0], sum.beams()[1]];
            assert!(arena[a].momentum.square().abs() < 1e-9);
            assert!(arena[b].momentum[3] <= 0.);

            let weight = sum.weight();
            let (x1, x2) = (sum.x1(), sum.x2());
            assert!(sum.generate_s(&mut arena, &mut Evaluation::Evaluate));
            assert!(sum.generate_p(&mut arena, &mut Evaluation::Evaluate));
            assert_eq!(sum.weight(), weight);
            assert!(sum.x1().approx_eq(&x1, &1e-12));
            assert!(sum.x2().approx_eq(&x2, &1e-12));
        }
    }

    #[test]
    fn hadronic_jacobian_integrates_the_rapidity_range() {
        // ∫ dτ dy = ∫_{τ0}^1 -ln τ dτ
        let (mut arena, mut sum) = hadronic_arena();
        let mut rng = SmallRng::seed_from_u64(8);
        let n = 100_000;
        let mut total = 0.;
        for _ in 0..n {
            arena.reset();
            if sum.generate_s(&mut arena, &mut Action::Generate(&mut rng)) {
                total += sum.weight();
            }
        }
        let tau0: f64 = 1e-4;
        let expected = 1. - tau0 + tau0 * tau0.ln();
        assert!((total / n as f64).approx_eq(&expected, &0.02));
    }
}
