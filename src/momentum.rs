use std::{
    fmt::{Display, LowerExp},
    ops::{Add, AddAssign, Index, IndexMut, Mul, Neg, Sub, SubAssign},
};

use crate::utils::ApproxEq;

/// A Lorentz vector in `D` spacetime dimensions with metric `(+, -, ..., -)`.
/// Component `0` is the energy, components `1..D` the spatial part.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Momentum<const D: usize> {
    pub components: [f64; D],
}

pub type FourMomentum = Momentum<4>;

impl<const D: usize> Default for Momentum<D> {
    fn default() -> Self {
        Self::zero()
    }
}

impl FourMomentum {
    pub fn from_args(energy: f64, px: f64, py: f64, pz: f64) -> Self {
        Momentum {
            components: [energy, px, py, pz],
        }
    }
}

impl<const D: usize> Momentum<D> {
    pub const DIMENSION: usize = D;

    pub fn zero() -> Self {
        Momentum {
            components: [0.; D],
        }
    }

    pub fn from_components(components: [f64; D]) -> Self {
        Momentum { components }
    }

    /// Momentum at rest with invariant mass `mass`.
    pub fn at_rest(mass: f64) -> Self {
        let mut p = Self::zero();
        p.components[0] = mass;
        p
    }

    /// Energy `energy` along the spatial unit vector `direction` (its temporal
    /// component is ignored) with spatial magnitude `modulus`.
    pub fn from_direction(energy: f64, modulus: f64, direction: &Momentum<D>) -> Self {
        let mut p = *direction * modulus;
        p.components[0] = energy;
        p
    }

    /// A massless momentum of energy `energy` along spatial axis `axis` (1-based).
    pub fn along_axis(energy: f64, axis: usize) -> Self {
        let mut p = Self::zero();
        p.components[0] = energy;
        p.components[axis] = if energy >= 0. { energy } else { -energy };
        p
    }

    #[inline]
    pub fn temporal(&self) -> f64 {
        self.components[0]
    }

    /// Copy of the vector with a vanishing temporal component.
    pub fn spatial_part(&self) -> Self {
        let mut p = *self;
        p.components[0] = 0.;
        p
    }

    pub fn spatial_dot(&self, other: &Momentum<D>) -> f64 {
        self.components[1..]
            .iter()
            .zip(&other.components[1..])
            .map(|(a, b)| a * b)
            .sum()
    }

    pub fn spatial_norm_squared(&self) -> f64 {
        self.spatial_dot(self)
    }

    pub fn spatial_norm(&self) -> f64 {
        self.spatial_norm_squared().sqrt()
    }

    /// Minkowski product.
    pub fn dot(&self, other: &Momentum<D>) -> f64 {
        self.components[0] * other.components[0] - self.spatial_dot(other)
    }

    pub fn square(&self) -> f64 {
        self.dot(self)
    }

    pub fn norm(&self) -> f64 {
        self.square().sqrt()
    }

    /// Spatial unit vector, `None` for a vanishing spatial part.
    pub fn spatial_direction(&self) -> Option<Momentum<D>> {
        let n = self.spatial_norm();
        if n > 0. && n.is_finite() {
            Some(self.spatial_part() * (1. / n))
        } else {
            None
        }
    }

    pub fn is_finite(&self) -> bool {
        self.components.iter().all(|c| c.is_finite())
    }

    /// Apply the boost with velocity given by the spatial part of `boost_vector`.
    pub fn boost(&self, boost_vector: &Momentum<D>) -> Momentum<D> {
        let b2 = boost_vector.spatial_norm_squared();
        let gamma = 1. / (1. - b2).sqrt();

        let bp = self.spatial_dot(boost_vector);
        let gamma2 = if b2 > 0. { (gamma - 1.) / b2 } else { 0. };
        let factor = gamma2 * bp + gamma * self.temporal();

        let mut boosted = *self;
        boosted.components[0] = (bp + self.temporal()) * gamma;
        for i in 1..D {
            boosted.components[i] = self.components[i] + factor * boost_vector.components[i];
        }
        boosted
    }

    /// Velocity of the rest frame of `self`, as a boost vector.
    pub fn velocity(&self) -> Momentum<D> {
        self.spatial_part() * (1. / self.temporal())
    }

    /// Express `self`, given in the frame where `frame` is measured, in the rest frame of `frame`.
    pub fn boost_to_rest_frame_of(&self, frame: &Momentum<D>) -> Momentum<D> {
        self.boost(&-frame.velocity())
    }

    /// Inverse of [`Momentum::boost_to_rest_frame_of`].
    pub fn boost_from_rest_frame_of(&self, frame: &Momentum<D>) -> Momentum<D> {
        self.boost(&frame.velocity())
    }

    pub fn max_abs_component(&self) -> f64 {
        self.components.iter().fold(0., |acc: f64, c| acc.max(c.abs()))
    }
}

impl<const D: usize> ApproxEq<Momentum<D>, f64> for Momentum<D> {
    fn approx_eq(&self, other: &Momentum<D>, tolerance: &f64) -> bool {
        let scale = self.max_abs_component().max(other.max_abs_component()).max(1.);
        self.components
            .iter()
            .zip(&other.components)
            .all(|(a, b)| (a - b).abs() <= tolerance * scale)
    }
}

impl<const D: usize> Index<usize> for Momentum<D> {
    type Output = f64;
    fn index(&self, index: usize) -> &f64 {
        &self.components[index]
    }
}

impl<const D: usize> IndexMut<usize> for Momentum<D> {
    fn index_mut(&mut self, index: usize) -> &mut f64 {
        &mut self.components[index]
    }
}

impl<const D: usize> Add<Momentum<D>> for Momentum<D> {
    type Output = Momentum<D>;
    fn add(mut self, rhs: Momentum<D>) -> Self::Output {
        self += rhs;
        self
    }
}

impl<const D: usize> Add<&Momentum<D>> for &Momentum<D> {
    type Output = Momentum<D>;
    fn add(self, rhs: &Momentum<D>) -> Self::Output {
        *self + *rhs
    }
}

impl<const D: usize> AddAssign<Momentum<D>> for Momentum<D> {
    fn add_assign(&mut self, rhs: Momentum<D>) {
        for (a, b) in self.components.iter_mut().zip(rhs.components) {
            *a += b;
        }
    }
}

impl<'a, const D: usize> AddAssign<&'a Momentum<D>> for Momentum<D> {
    fn add_assign(&mut self, rhs: &'a Momentum<D>) {
        *self += *rhs;
    }
}

impl<const D: usize> Sub<Momentum<D>> for Momentum<D> {
    type Output = Momentum<D>;
    fn sub(mut self, rhs: Momentum<D>) -> Self::Output {
        self -= rhs;
        self
    }
}

impl<const D: usize> Sub<&Momentum<D>> for &Momentum<D> {
    type Output = Momentum<D>;
    fn sub(self, rhs: &Momentum<D>) -> Self::Output {
        *self - *rhs
    }
}

impl<const D: usize> SubAssign<Momentum<D>> for Momentum<D> {
    fn sub_assign(&mut self, rhs: Momentum<D>) {
        for (a, b) in self.components.iter_mut().zip(rhs.components) {
            *a -= b;
        }
    }
}

impl<'a, const D: usize> SubAssign<&'a Momentum<D>> for Momentum<D> {
    fn sub_assign(&mut self, rhs: &'a Momentum<D>) {
        *self -= *rhs;
    }
}

impl<const D: usize> Mul<f64> for Momentum<D> {
    type Output = Momentum<D>;
    fn mul(mut self, rhs: f64) -> Self::Output {
        for a in self.components.iter_mut() {
            *a *= rhs;
        }
        self
    }
}

impl<const D: usize> Neg for Momentum<D> {
    type Output = Momentum<D>;
    fn neg(self) -> Self::Output {
        self * -1.
    }
}

impl<const D: usize> Display for Momentum<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "E: {}, p: (", self.components[0])?;
        for (i, c) in self.components[1..].iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", c)?;
        }
        write!(f, ")")
    }
}

impl<const D: usize> LowerExp for Momentum<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "E: {:+.16e}, p: (", self.components[0])?;
        for (i, c) in self.components[1..].iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:+.16e}", c)?;
        }
        write!(f, ")")
    }
}

impl<const D: usize> From<[f64; D]> for Momentum<D> {
    fn from(components: [f64; D]) -> Self {
        Momentum { components }
    }
}

impl<const D: usize> From<Momentum<D>> for [f64; D] {
    fn from(p: Momentum<D>) -> Self {
        p.components
    }
}

impl<const D: usize> std::iter::Sum for Momentum<D> {
    fn sum<I: Iterator<Item = Momentum<D>>>(iter: I) -> Self {
        iter.fold(Momentum::zero(), |acc, p| acc + p)
    }
}
