//! Integrals of products of two densities over the region
//! `√s1 + √s2 ≤ √s`, used to normalise jointly constrained mass pairs.

use super::{Density, ValueSampler};
use crate::utils::{gauss_legendre, integrate_gauss_legendre};

/// Evaluates `∫∫ f1(s1) f2(s2) θ(√s − √s1 − √s2) ds1 ds2` over the bounds of
/// two samplers, in closed form where one is known and by a fixed-order
/// Gauss–Legendre rule over `s1` otherwise.
#[derive(Debug, Clone)]
pub struct CompositeIntegrator {
    rule: Vec<(f64, f64)>,
}

impl CompositeIntegrator {
    pub fn new(order: usize) -> Self {
        CompositeIntegrator {
            rule: gauss_legendre(order),
        }
    }

    pub fn order(&self) -> usize {
        self.rule.len()
    }

    pub fn integrate(&self, first: &ValueSampler, second: &ValueSampler, s: f64) -> f64 {
        let (lo1, hi1) = first.bounds();
        let (lo2, hi2) = second.bounds();
        self.integrate_densities(first.density(), (lo1, hi1), second.density(), (lo2, hi2), s)
    }

    pub fn integrate_densities(
        &self,
        first: &Density,
        (lo1, hi1): (f64, f64),
        second: &Density,
        (lo2, hi2): (f64, f64),
        s: f64,
    ) -> f64 {
        if !(s > 0.) || lo1 < 0. || lo2 < 0. {
            return 0.;
        }
        let sqrt_s = s.sqrt();
        let budget = |other: f64| {
            let r = sqrt_s - other.sqrt();
            if r > 0. {
                r * r
            } else {
                0.
            }
        };

        let inner = |density: &Density, lo: f64, hi: f64, partner: f64| -> f64 {
            let upper = hi.min(budget(partner));
            density.integral(lo, upper).unwrap_or(0.)
        };

        match (*first, *second) {
            (Density::DiracDelta { value: v1 }, Density::DiracDelta { value: v2 }) => {
                let inside = lo1 <= v1 && v1 <= hi1 && lo2 <= v2 && v2 <= hi2;
                if inside && v1.sqrt() + v2.sqrt() <= sqrt_s {
                    1.
                } else {
                    0.
                }
            }
            (Density::DiracDelta { value }, _) => {
                if lo1 <= value && value <= hi1 {
                    inner(second, lo2, hi2, value)
                } else {
                    0.
                }
            }
            (_, Density::DiracDelta { value }) => {
                if lo2 <= value && value <= hi2 {
                    inner(first, lo1, hi1, value)
                } else {
                    0.
                }
            }
            (Density::Flat, Density::Flat) if hi1 >= budget(lo2) && hi2 >= budget(lo1) => {
                flat_flat(s, lo1, lo2)
            }
            _ => {
                let upper1 = hi1.min(budget(lo2));
                if upper1 <= lo1 || first.integral(lo1, upper1).is_none() {
                    return 0.;
                }
                if let Density::Flat = first {
                    // s1 = u², ds1 = 2u du smooths the square-root boundary
                    integrate_gauss_legendre(&self.rule, lo1.sqrt(), upper1.sqrt(), |u| {
                        2. * u * inner(second, lo2, hi2, u * u)
                    })
                } else {
                    // integrate in the primitive of f1 so that peaks are resolved
                    let (p_lo, p_hi) = (first.primitive(lo1), first.primitive(upper1));
                    integrate_gauss_legendre(&self.rule, p_lo, p_hi, |p| {
                        let s1 = first.inverse_primitive(p).clamp(lo1, upper1);
                        inner(second, lo2, hi2, s1)
                    })
                }
            }
        }
    }
}

/// Area of `{s1 ≥ l1, s2 ≥ l2, √s1 + √s2 ≤ √s}`.
fn flat_flat(s: f64, l1: f64, l2: f64) -> f64 {
    let sqrt_s = s.sqrt();
    let upper = sqrt_s - l2.sqrt();
    if upper * upper <= l1 || upper <= 0. {
        return 0.;
    }
    // ∫ ((√s − √s1)² − l2) ds1
    let g = |x: f64| (s - l2) * x - 4. / 3. * sqrt_s * x.powf(1.5) + 0.5 * x * x;
    g(upper * upper) - g(l1)
}
