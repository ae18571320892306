use rand::Rng;

use crate::momentum::Momentum;
use crate::utils::box_muller;

/// Source of uniform variates consumed by every sampling step.
pub trait RandomSource {
    /// A uniform variate in `[0, 1)`.
    fn uniform(&mut self) -> f64;

    /// A uniform integer in `[0, n)`.
    fn dice(&mut self, n: usize) -> usize {
        ((self.uniform() * n as f64) as usize).min(n.saturating_sub(1))
    }

    fn gaussian_pair(&mut self) -> (f64, f64) {
        box_muller(1. - self.uniform(), self.uniform())
    }
}

impl<R: rand::RngCore + ?Sized> RandomSource for R {
    fn uniform(&mut self) -> f64 {
        self.gen::<f64>()
    }

    fn dice(&mut self, n: usize) -> usize {
        self.gen_range(0..n)
    }
}

/// Isotropic spatial unit vector in `D - 1` dimensions.
pub fn unit_direction<const D: usize, R: RandomSource + ?Sized>(rng: &mut R) -> Momentum<D> {
    loop {
        let mut direction = Momentum::<D>::zero();
        let mut i = 1;
        while i < D {
            let (g1, g2) = rng.gaussian_pair();
            direction[i] = g1;
            if i + 1 < D {
                direction[i + 1] = g2;
            }
            i += 2;
        }
        if let Some(d) = direction.spatial_direction() {
            return d;
        }
    }
}

/// Isotropic spatial unit vector orthogonal to the unit vector `axis`.
pub fn orthogonal_direction<const D: usize, R: RandomSource + ?Sized>(
    rng: &mut R,
    axis: &Momentum<D>,
) -> Momentum<D> {
    loop {
        let candidate = unit_direction::<D, R>(rng);
        let projected = candidate - *axis * candidate.spatial_dot(axis);
        if projected.spatial_norm() > 1e-6 {
            if let Some(d) = projected.spatial_direction() {
                return d;
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, SeedableRng};

    #[test]
    fn directions_are_normalised_and_orthogonal() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..100 {
            let n = unit_direction::<5, _>(&mut rng);
            assert!((n.spatial_norm() - 1.).abs() < 1e-12);
            assert_eq!(n.temporal(), 0.);
            let m = orthogonal_direction(&mut rng, &n);
            assert!(m.spatial_dot(&n).abs() < 1e-12);
            assert!((m.spatial_norm() - 1.).abs() < 1e-12);
        }
    }

    #[test]
    fn sequence_dice() {
        let mut seq = test_sources::Sequence::new(vec![0.0, 0.5, 0.999]);
        assert_eq!(seq.dice(4), 0);
        assert_eq!(seq.dice(4), 2);
        assert_eq!(seq.dice(4), 3);
    }
}
