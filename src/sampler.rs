//! One-dimensional samplers for invariant masses.
//!
//! A [`ValueSampler`] maps a uniform variate onto `[lo, hi]` following one of
//! the analytic shapes of [`Density`]. The weight attached to a value `x` is
//! `I / f(x)` with `I = ∫_lo^hi f`, i.e. the inverse of the normalised density.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::random::RandomSource;

pub mod composite;

/// Relative tolerance for recognising the value of a Dirac delta.
const DELTA_TOLERANCE: f64 = 1.0e-9;

/// Unnormalised shape of a sampler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Density {
    Flat,
    /// `f(x) = (x + offset)^(-exponent)`
    PowerLaw { exponent: f64, offset: f64 },
    /// `f(x) = 1 / ((x - mass²)² + mass² width²)`
    BreitWigner { mass: f64, width: f64 },
    DiracDelta { value: f64 },
}

impl Default for Density {
    fn default() -> Self {
        Density::Flat
    }
}

impl Density {
    pub fn is_delta(&self) -> bool {
        matches!(self, Density::DiracDelta { .. })
    }

    /// The unnormalised density at `x`.
    pub fn shape(&self, x: f64) -> f64 {
        match *self {
            Density::Flat => 1.,
            Density::PowerLaw { exponent, offset } => {
                let y = x + offset;
                if exponent == 1. {
                    1. / y
                } else if exponent == 2. {
                    1. / (y * y)
                } else {
                    y.powf(-exponent)
                }
            }
            Density::BreitWigner { mass, width } => {
                let m2 = mass * mass;
                let d = x - m2;
                1. / (d * d + m2 * width * width)
            }
            Density::DiracDelta { .. } => 1.,
        }
    }

    /// A primitive of [`Density::shape`].
    pub fn primitive(&self, x: f64) -> f64 {
        match *self {
            Density::Flat => x,
            Density::PowerLaw { exponent, offset } => {
                let y = x + offset;
                if exponent == 1. {
                    y.ln()
                } else if exponent == 2. {
                    -1. / y
                } else {
                    y.powf(1. - exponent) / (1. - exponent)
                }
            }
            Density::BreitWigner { mass, width } => {
                let mw = mass * width;
                ((x - mass * mass) / mw).atan() / mw
            }
            Density::DiracDelta { value } => {
                if x >= value {
                    1.
                } else {
                    0.
                }
            }
        }
    }

    /// Inverse of [`Density::primitive`].
    pub fn inverse_primitive(&self, p: f64) -> f64 {
        match *self {
            Density::Flat => p,
            Density::PowerLaw { exponent, offset } => {
                if exponent == 1. {
                    p.exp() - offset
                } else if exponent == 2. {
                    -1. / p - offset
                } else {
                    (p * (1. - exponent)).powf(1. / (1. - exponent)) - offset
                }
            }
            Density::BreitWigner { mass, width } => {
                let mw = mass * width;
                mass * mass + mw * (p * mw).tan()
            }
            Density::DiracDelta { value } => value,
        }
    }

    /// `∫_lo^hi f`, `None` when the shape cannot be normalised on `[lo, hi]`.
    pub fn integral(&self, lo: f64, hi: f64) -> Option<f64> {
        if !(lo <= hi) {
            return None;
        }
        let integral = match *self {
            Density::Flat => hi - lo,
            Density::PowerLaw { exponent, offset } => {
                let y_lo = lo + offset;
                if y_lo < 0. || (y_lo == 0. && exponent >= 1.) {
                    return None;
                }
                if exponent == 1. {
                    ((hi + offset) / y_lo).ln()
                } else {
                    self.primitive(hi) - self.primitive(lo)
                }
            }
            Density::BreitWigner { mass, width } => {
                if !(mass > 0. && width > 0.) {
                    return None;
                }
                self.primitive(hi) - self.primitive(lo)
            }
            Density::DiracDelta { value } => {
                if lo <= value && value <= hi {
                    1.
                } else {
                    0.
                }
            }
        };
        if integral.is_finite() && integral > 0. {
            Some(integral)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    InvalidBounds = 1,
    NotNormalizable = 2,
    OutOfBounds = 4,
}

/// A bounded one-dimensional sampler with a fixed analytic density.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueSampler {
    density: Density,
    lo: f64,
    hi: f64,
    #[serde(skip)]
    integral: f64,
    #[serde(skip)]
    normalizable: bool,
    #[serde(skip)]
    value: f64,
    #[serde(skip)]
    weight: f64,
    #[serde(skip)]
    warned: u8,
}

impl ValueSampler {
    pub fn new(density: Density) -> Self {
        ValueSampler {
            density,
            lo: 0.,
            hi: 0.,
            integral: 0.,
            normalizable: false,
            value: 0.,
            weight: 0.,
            warned: 0,
        }
    }

    pub fn with_bounds(density: Density, lo: f64, hi: f64) -> Self {
        let mut sampler = Self::new(density);
        sampler.set_bounds(lo, hi);
        sampler
    }

    fn warn_once(&mut self, failure: Failure, message: impl FnOnce() -> String) {
        if self.warned & failure as u8 == 0 {
            self.warned |= failure as u8;
            warn!("{}", message());
        }
    }

    /// Restrict the sampler to `[lo, hi]`. Returns whether the density is
    /// normalizable on the new range.
    pub fn set_bounds(&mut self, lo: f64, hi: f64) -> bool {
        self.lo = lo;
        self.hi = hi;
        if !(lo <= hi) || !lo.is_finite() || !hi.is_finite() {
            self.normalizable = false;
            self.integral = 0.;
            let density = self.density;
            self.warn_once(Failure::InvalidBounds, || {
                format!("Invalid bounds [{:e}, {:e}] for {:?} sampler", lo, hi, density)
            });
            return false;
        }
        match self.density.integral(lo, hi) {
            Some(integral) => {
                self.integral = integral;
                self.normalizable = true;
            }
            None => {
                self.integral = 0.;
                self.normalizable = false;
            }
        }
        self.normalizable
    }

    /// Recompute the cached normalisation, e.g. after deserialisation.
    pub fn refresh(&mut self) -> bool {
        self.set_bounds(self.lo, self.hi)
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.lo, self.hi)
    }

    pub fn density(&self) -> &Density {
        &self.density
    }

    pub fn is_normalizable(&self) -> bool {
        self.normalizable
    }

    /// `∫_lo^hi f` on the current bounds, zero when not normalizable.
    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn set_value(&mut self, value: f64) {
        self.value = value;
    }

    /// Monotonic map from `[0, 1]` onto the current bounds.
    pub fn map(&self, r: f64) -> f64 {
        match self.density {
            Density::Flat => self.lo + r * (self.hi - self.lo),
            Density::DiracDelta { value } => value,
            Density::PowerLaw { exponent, offset } if exponent == 1. => {
                let y_lo = self.lo + offset;
                y_lo * ((self.hi + offset) / y_lo).powf(r) - offset
            }
            _ => {
                let p_lo = self.density.primitive(self.lo);
                self.density.inverse_primitive(p_lo + r * self.integral)
            }
        }
        .clamp(self.lo, self.hi)
    }

    /// Inverse of [`ValueSampler::map`].
    pub fn inverse_map(&self, x: f64) -> f64 {
        match self.density {
            Density::DiracDelta { .. } => 0.,
            Density::Flat => (x - self.lo) / (self.hi - self.lo),
            Density::PowerLaw { exponent, offset } if exponent == 1. => {
                ((x + offset) / (self.lo + offset)).ln() / self.integral
            }
            _ => (self.density.primitive(x) - self.density.primitive(self.lo)) / self.integral,
        }
    }

    /// Normalised probability density at `x`.
    pub fn probability_density(&self, x: f64) -> f64 {
        if !self.normalizable || x < self.lo || x > self.hi {
            return 0.;
        }
        self.density.shape(x) / self.integral
    }

    /// `I / f(x)`, without bound checks.
    pub(crate) fn weight_at(&self, x: f64) -> f64 {
        match self.density {
            Density::DiracDelta { .. } => 1.,
            Density::Flat => self.integral,
            _ => self.integral / self.density.shape(x),
        }
    }

    fn finish(&mut self, weight: f64) -> bool {
        if weight.is_finite() && weight > 0. {
            self.weight = weight;
            true
        } else {
            self.weight = 0.;
            false
        }
    }

    /// Set the value from the uniform variate `r` and compute its weight.
    pub fn generate_from(&mut self, r: f64) -> bool {
        if !self.normalizable {
            return self.fail_not_normalizable();
        }
        self.value = self.map(r);
        let weight = self.weight_at(self.value);
        self.finish(weight)
    }

    pub fn generate<R: RandomSource + ?Sized>(&mut self, rng: &mut R) -> bool {
        if !self.normalizable {
            return self.fail_not_normalizable();
        }
        if self.density.is_delta() {
            return self.generate_from(0.);
        }
        let r = rng.uniform();
        self.generate_from(r)
    }

    fn fail_not_normalizable(&mut self) -> bool {
        self.weight = 0.;
        let (density, lo, hi) = (self.density, self.lo, self.hi);
        self.warn_once(Failure::NotNormalizable, || {
            format!(
                "{:?} sampler is not normalizable on [{:e}, {:e}], events get zero weight",
                density, lo, hi
            )
        });
        false
    }

    /// Recompute the weight of an externally set value.
    pub fn evaluate_weight(&mut self) -> bool {
        if !self.normalizable {
            return self.fail_not_normalizable();
        }
        let x = self.value;
        let in_bounds = match self.density {
            Density::DiracDelta { value } => {
                (x - value).abs() <= DELTA_TOLERANCE * value.abs().max(1.)
            }
            _ => x >= self.lo && x <= self.hi,
        };
        if !in_bounds {
            self.weight = 0.;
            let (lo, hi) = (self.lo, self.hi);
            self.warn_once(Failure::OutOfBounds, || {
                format!("Value {:e} outside of the sampler range [{:e}, {:e}]", x, lo, hi)
            });
            return false;
        }
        let weight = self.weight_at(x);
        self.finish(weight)
    }

    pub fn evaluate_weight_at(&mut self, x: f64) -> bool {
        self.value = x;
        self.evaluate_weight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ApproxEq;
    use rand::{rngs::SmallRng, SeedableRng};

    fn all_shapes() -> Vec<ValueSampler> {
        vec![
            ValueSampler::with_bounds(Density::Flat, 1., 9.),
            ValueSampler::with_bounds(
                Density::PowerLaw {
                    exponent: 1.,
                    offset: 0.5,
                },
                1.,
                9.,
            ),
            ValueSampler::with_bounds(
                Density::PowerLaw {
                    exponent: 2.,
                    offset: 0.,
                },
                1.,
                9.,
            ),
            ValueSampler::with_bounds(
                Density::PowerLaw {
                    exponent: 0.7,
                    offset: 0.,
                },
                0.,
                9.,
            ),
            ValueSampler::with_bounds(
                Density::PowerLaw {
                    exponent: -2.,
                    offset: 0.,
                },
                0.,
                1.,
            ),
            ValueSampler::with_bounds(
                Density::BreitWigner {
                    mass: 2.,
                    width: 0.1,
                },
                1.,
                9.,
            ),
        ]
    }

    #[test]
    fn map_is_monotonic_and_inverted() {
        for sampler in all_shapes() {
            assert!(sampler.is_normalizable(), "{:?}", sampler.density());
            let mut last = f64::NEG_INFINITY;
            for i in 0..=100 {
                let r = i as f64 / 100.;
                let x = sampler.map(r);
                assert!(x >= last);
                last = x;
                assert!(
                    sampler.inverse_map(x).approx_eq(&r, &1e-9),
                    "{:?}: {} vs {}",
                    sampler.density(),
                    sampler.inverse_map(x),
                    r
                );
            }
        }
    }

    #[test]
    fn weight_reciprocity() {
        let mut rng = SmallRng::seed_from_u64(11);
        for mut sampler in all_shapes() {
            for _ in 0..100 {
                assert!(sampler.generate(&mut rng));
                let (x, w) = (sampler.value(), sampler.weight());
                sampler.set_value(x);
                assert!(sampler.evaluate_weight());
                assert_eq!(sampler.weight().to_bits(), w.to_bits());
            }
        }
    }

    #[test]
    fn weights_integrate_the_range() {
        // the mean weight of f(x) w(x) under the sampler is I
        let mut rng = SmallRng::seed_from_u64(5);
        // x² on [0, 1] has an unbounded weight variance
        for mut sampler in all_shapes().into_iter().filter(|s| {
            !matches!(s.density(), Density::PowerLaw { exponent, .. } if *exponent < 0.)
        }) {
            let n = 100_000;
            let mut sum = 0.;
            for _ in 0..n {
                sampler.generate(&mut rng);
                sum += sampler.weight();
            }
            let (lo, hi) = sampler.bounds();
            // E[w] = ∫ dx over the range
            assert!(
                (sum / n as f64).approx_eq(&(hi - lo), &0.05),
                "{:?}: {}",
                sampler.density(),
                sum / n as f64
            );
        }
    }

    #[test]
    fn invalid_bounds() {
        let mut sampler = ValueSampler::new(Density::Flat);
        assert!(!sampler.set_bounds(2., 1.));
        assert!(!sampler.is_normalizable());
        let mut rng = SmallRng::seed_from_u64(1);
        assert!(!sampler.generate(&mut rng));
        assert_eq!(sampler.weight(), 0.);

        let mut bw = ValueSampler::new(Density::BreitWigner {
            mass: 1.,
            width: 0.,
        });
        assert!(!bw.set_bounds(0., 2.));
    }

    #[test]
    fn dirac_delta() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut delta = ValueSampler::with_bounds(Density::DiracDelta { value: 4. }, 1., 9.);
        assert!(delta.generate(&mut rng));
        assert_eq!(delta.value(), 4.);
        assert_eq!(delta.weight(), 1.);

        assert!(!delta.set_bounds(5., 9.));
        assert!(!delta.generate(&mut rng));
        assert_eq!(delta.weight(), 0.);
    }

    #[test]
    fn out_of_bounds_evaluation() {
        let mut sampler = ValueSampler::with_bounds(Density::Flat, 0., 1.);
        assert!(!sampler.evaluate_weight_at(1.5));
        assert_eq!(sampler.weight(), 0.);
        assert!(sampler.evaluate_weight_at(0.5));
        assert_eq!(sampler.weight(), 1.);
    }

    #[test]
    fn power_law_singular_at_origin() {
        let mut sampler = ValueSampler::new(Density::PowerLaw {
            exponent: 1.,
            offset: 0.,
        });
        assert!(!sampler.set_bounds(0., 1.));
        assert!(sampler.set_bounds(0.1, 1.));
        assert!(sampler.integral().approx_eq(&(10f64).ln(), &1e-14));
    }
}
