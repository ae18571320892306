//! Momentum channels shared between topologies.
//!
//! Every channel is named by the set of external legs whose momenta it
//! combines. Channels live in a [`ChannelArena`] and are referred to by
//! [`ChannelId`] from every branching that produces or consumes them, so that
//! topologies sharing a sub-configuration operate on the same state.

use std::f64::consts::PI;
use std::fmt::{Display, Formatter};
use std::ops::{BitOr, Index, IndexMut};

use ahash::AHashMap;
use derive_more::{From, Into};
use itertools::Itertools;
use log::warn;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use typed_index_collections::TiVec;

use crate::grid::AdaptiveGrid;
use crate::momentum::Momentum;
use crate::random::RandomSource;
use crate::sampler::{Density, ValueSampler};
use crate::{PhaseSpaceError, MAX_LEGS};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LegSet(pub u64);

impl LegSet {
    pub const EMPTY: LegSet = LegSet(0);

    pub fn single(leg: usize) -> Self {
        LegSet(1 << leg)
    }

    pub fn range(start: usize, end: usize) -> Self {
        (start..end).map(LegSet::single).fold(LegSet::EMPTY, |a, b| a | b)
    }

    pub fn contains_leg(self, leg: usize) -> bool {
        self.0 & (1 << leg) != 0
    }

    /// Whether `other` is a subset of `self`.
    pub fn contains(self, other: LegSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: LegSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn difference(self, other: LegSet) -> LegSet {
        LegSet(self.0 & !other.0)
    }

    pub fn intersection(self, other: LegSet) -> LegSet {
        LegSet(self.0 & other.0)
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn legs(self) -> impl Iterator<Item = usize> {
        (0..MAX_LEGS).filter(move |i| self.contains_leg(*i))
    }
}

impl BitOr for LegSet {
    type Output = LegSet;
    fn bitor(self, rhs: LegSet) -> LegSet {
        LegSet(self.0 | rhs.0)
    }
}

impl FromIterator<usize> for LegSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        iter.into_iter()
            .fold(LegSet::EMPTY, |acc, leg| acc | LegSet::single(leg))
    }
}

impl Display for LegSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}}}", self.legs().join(","))
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    From,
    Into,
    Serialize,
    Deserialize,
)]
pub struct ChannelId(pub usize);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelStatus {
    #[default]
    Reset,
    MassGenerated,
    MomentumGenerated,
}

/// Whether a sampling step draws new values or scores values already in place.
pub enum Action<'a, R: ?Sized> {
    Generate(&'a mut R),
    Evaluate,
}

impl<'a, R: RandomSource + ?Sized> Action<'a, R> {
    pub fn is_generate(&self) -> bool {
        matches!(self, Action::Generate(_))
    }

    /// A uniform variate when generating, `None` when evaluating.
    pub fn uniform(&mut self) -> Option<f64> {
        match self {
            Action::Generate(rng) => Some((**rng).uniform()),
            Action::Evaluate => None,
        }
    }
}

/// Action of scoring passes, which never draw.
pub type Evaluation<'a> = Action<'a, SmallRng>;

/// The sampler bound to a channel's invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MassSampler {
    Plain(ValueSampler),
    Adaptive(AdaptiveGrid),
}

impl MassSampler {
    pub fn density(&self) -> &Density {
        match self {
            MassSampler::Plain(s) => s.density(),
            MassSampler::Adaptive(g) => g.density(),
        }
    }

    pub fn is_delta(&self) -> bool {
        self.density().is_delta()
    }

    pub fn is_adaptive(&self) -> bool {
        matches!(self, MassSampler::Adaptive(_))
    }

    pub fn set_bounds(&mut self, lo: f64, hi: f64) -> bool {
        match self {
            MassSampler::Plain(s) => s.set_bounds(lo, hi),
            MassSampler::Adaptive(g) => g.set_bounds(lo, hi),
        }
    }

    pub fn bounds(&self) -> (f64, f64) {
        match self {
            MassSampler::Plain(s) => s.bounds(),
            MassSampler::Adaptive(g) => g.bounds(),
        }
    }

    pub fn generate<R: RandomSource + ?Sized>(&mut self, rng: &mut R) -> bool {
        match self {
            MassSampler::Plain(s) => s.generate(rng),
            MassSampler::Adaptive(g) => g.generate(rng),
        }
    }

    pub fn evaluate_weight(&mut self) -> bool {
        match self {
            MassSampler::Plain(s) => s.evaluate_weight(),
            MassSampler::Adaptive(g) => g.evaluate_weight(),
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            MassSampler::Plain(s) => s.value(),
            MassSampler::Adaptive(g) => g.value(),
        }
    }

    pub fn set_value(&mut self, value: f64) {
        match self {
            MassSampler::Plain(s) => s.set_value(value),
            MassSampler::Adaptive(g) => g.set_value(value),
        }
    }

    pub fn weight(&self) -> f64 {
        match self {
            MassSampler::Plain(s) => s.weight(),
            MassSampler::Adaptive(g) => g.weight(),
        }
    }

    pub fn update(&mut self, value: f64) {
        if let MassSampler::Adaptive(g) = self {
            g.update(value);
        }
    }

    pub fn adapt(&mut self) -> bool {
        match self {
            MassSampler::Plain(_) => false,
            MassSampler::Adaptive(g) => g.adapt(),
        }
    }

    pub fn clear_bin(&mut self) {
        if let MassSampler::Adaptive(g) = self {
            g.clear_bin();
        }
    }

    pub fn refresh(&mut self) -> bool {
        match self {
            MassSampler::Plain(s) => s.refresh(),
            MassSampler::Adaptive(g) => g.refresh(),
        }
    }
}

/// A node of the phase-space tree.
///
/// Timelike channels sample their invariant mass squared `s`, spacelike ones
/// the positive `u = -t`. `mass_squared` always holds the signed invariant.
#[derive(Debug, Clone)]
pub struct Channel<const D: usize> {
    pub legs: LegSet,
    pub momentum: Momentum<D>,
    pub mass_squared: f64,
    pub s_min_abs: f64,
    pub s_max_abs: f64,
    /// Floor of the current event, at least `s_min_abs`.
    pub s_min: f64,
    pub on_shell: bool,
    pub spacelike: bool,
    pub external: bool,
    pub status: ChannelStatus,
    pub sampler: MassSampler,
    weight: f64,
}

impl<const D: usize> Channel<D> {
    pub fn new(legs: LegSet, sampler: MassSampler, s_min_abs: f64, s_max_abs: f64) -> Self {
        let on_shell = sampler.is_delta();
        Channel {
            legs,
            momentum: Momentum::zero(),
            mass_squared: 0.,
            s_min_abs,
            s_max_abs,
            s_min: s_min_abs,
            on_shell,
            spacelike: false,
            external: false,
            status: ChannelStatus::Reset,
            sampler,
            weight: 0.,
        }
    }

    pub fn spacelike(mut self) -> Self {
        self.spacelike = true;
        self
    }

    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }

    pub fn reset(&mut self) {
        self.status = ChannelStatus::Reset;
        self.s_min = self.s_min_abs;
        self.weight = 0.;
        self.sampler.clear_bin();
    }

    pub fn set_mass_squared(&mut self, s: f64) {
        self.mass_squared = s;
        if self.status < ChannelStatus::MassGenerated {
            self.status = ChannelStatus::MassGenerated;
        }
    }

    pub fn set_momentum(&mut self, momentum: Momentum<D>) {
        self.momentum = momentum;
        self.status = ChannelStatus::MomentumGenerated;
    }

    /// `√s`, zero for spacelike or vanishing invariants.
    pub fn mass(&self) -> f64 {
        self.mass_squared.max(0.).sqrt()
    }

    /// The invariant in the variable of the sampler.
    pub fn sampled_invariant(&self) -> f64 {
        if self.spacelike {
            -self.mass_squared
        } else {
            self.mass_squared
        }
    }

    /// Weight of the last sampled invariant, including the `1/2π` of every
    /// integrated timelike mass.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Sample (or score) the invariant within `[lo, hi]` in the sampler's variable.
    pub fn sample_invariant<R: RandomSource + ?Sized>(
        &mut self,
        lo: f64,
        hi: f64,
        action: &mut Action<'_, R>,
    ) -> bool {
        if !self.sampler.set_bounds(lo, hi) {
            self.weight = 0.;
            return false;
        }
        let accepted = match action {
            Action::Generate(rng) => self.sampler.generate(&mut **rng),
            Action::Evaluate => {
                self.sampler.set_value(self.sampled_invariant());
                self.sampler.evaluate_weight()
            }
        };
        if !accepted {
            self.weight = 0.;
            return false;
        }
        if action.is_generate() {
            let value = self.sampler.value();
            self.set_mass_squared(if self.spacelike { -value } else { value });
        }
        self.weight = if self.sampler.is_delta() || self.spacelike {
            self.sampler.weight()
        } else {
            self.sampler.weight() / (2. * PI)
        };
        true
    }
}

/// Owner of every channel of a generator, indexed by [`ChannelId`] and by legs.
#[derive(Debug, Clone)]
pub struct ChannelArena<const D: usize> {
    channels: TiVec<ChannelId, Channel<D>>,
    index: AHashMap<LegSet, ChannelId>,
    n_incoming: usize,
    n_legs: usize,
}

impl<const D: usize> ChannelArena<D> {
    pub fn new(n_incoming: usize, n_outgoing: usize) -> Result<Self, PhaseSpaceError> {
        let n_legs = n_incoming + n_outgoing;
        if n_legs > MAX_LEGS {
            return Err(PhaseSpaceError::InvalidProcess(format!(
                "{} legs exceed the maximum of {}",
                n_legs, MAX_LEGS
            )));
        }
        if !(1..=2).contains(&n_incoming) || n_outgoing < 2 {
            return Err(PhaseSpaceError::InvalidProcess(format!(
                "{} -> {} processes are not supported",
                n_incoming, n_outgoing
            )));
        }
        Ok(ChannelArena {
            channels: TiVec::new(),
            index: AHashMap::default(),
            n_incoming,
            n_legs,
        })
    }

    pub fn n_incoming(&self) -> usize {
        self.n_incoming
    }

    pub fn n_legs(&self) -> usize {
        self.n_legs
    }

    pub fn beams(&self) -> LegSet {
        LegSet::range(0, self.n_incoming)
    }

    pub fn finals(&self) -> LegSet {
        LegSet::range(self.n_incoming, self.n_legs)
    }

    /// Leg index of outgoing leg `i`.
    pub fn outgoing_leg(&self, i: usize) -> usize {
        self.n_incoming + i
    }

    /// Unique name of the momentum combination `legs`: a set containing every
    /// beam is replaced by its complement among the final-state legs.
    pub fn canonical(&self, legs: LegSet) -> LegSet {
        if legs.contains(self.beams()) {
            self.finals().difference(legs)
        } else {
            legs
        }
    }

    pub fn find(&self, legs: LegSet) -> Option<ChannelId> {
        self.index.get(&self.canonical(legs)).copied()
    }

    /// Insert `channel` unless a channel with the same legs exists already.
    /// Returns the id of the channel now registered under those legs.
    pub fn insert(&mut self, mut channel: Channel<D>) -> Result<ChannelId, PhaseSpaceError> {
        let legs = self.canonical(channel.legs);
        if legs.is_empty() || !(self.beams() | self.finals()).contains(channel.legs) {
            warn!("Refusing to register channel with legs {}", channel.legs);
            return Err(PhaseSpaceError::InvalidProcess(format!(
                "channel {} does not name a momentum of the process",
                channel.legs
            )));
        }
        if let Some(id) = self.index.get(&legs) {
            let existing = &self.channels[*id];
            if existing.sampler.density() != channel.sampler.density()
                || existing.sampler.is_adaptive() != channel.sampler.is_adaptive()
            {
                warn!(
                    "Channel {} is shared between topologies with different samplers, keeping {:?}",
                    legs,
                    existing.sampler.density()
                );
            }
            return Ok(*id);
        }
        channel.legs = legs;
        let id: ChannelId = self.channels.len().into();
        self.channels.push(channel);
        self.index.insert(legs, id);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelId, &Channel<D>)> {
        self.channels.iter_enumerated()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ChannelId, &mut Channel<D>)> {
        self.channels.iter_mut_enumerated()
    }

    /// Mutable access to two distinct channels at once.
    pub fn pair_mut(&mut self, a: ChannelId, b: ChannelId) -> (&mut Channel<D>, &mut Channel<D>) {
        let (ia, ib): (usize, usize) = (a.into(), b.into());
        assert_ne!(ia, ib, "a channel cannot be paired with itself");
        if ia < ib {
            let (left, right) = self.channels.raw.split_at_mut(ib);
            (&mut left[ia], &mut right[0])
        } else {
            let (left, right) = self.channels.raw.split_at_mut(ia);
            (&mut right[0], &mut left[ib])
        }
    }

    pub fn reset(&mut self) {
        for channel in self.channels.iter_mut() {
            channel.reset();
        }
    }

    /// Momentum of `legs` built from the external momenta: beams enter with
    /// a positive sign, final-state legs with a negative one if the set
    /// contains a beam.
    pub fn momentum_of(&self, legs: LegSet) -> Option<Momentum<D>> {
        let with_beam = legs.intersects(self.beams());
        let mut momentum = Momentum::zero();
        for leg in legs.legs() {
            let id = self.index.get(&self.canonical(LegSet::single(leg)))?;
            let external = &self.channels[*id];
            if external.status != ChannelStatus::MomentumGenerated {
                return None;
            }
            if leg < self.n_incoming || !with_beam {
                momentum += external.momentum;
            } else {
                momentum -= external.momentum;
            }
        }
        Some(momentum)
    }

    /// Rebuild the momentum and invariant of `id` from the external legs when
    /// no branching produced it in this event.
    pub fn reconstruct(&mut self, id: ChannelId) -> bool {
        if self.channels[id].status == ChannelStatus::MomentumGenerated {
            return true;
        }
        if self.channels[id].external {
            return false;
        }
        match self.momentum_of(self.channels[id].legs) {
            Some(p) => {
                let channel = &mut self.channels[id];
                channel.mass_squared = p.square();
                channel.set_momentum(p);
                true
            }
            None => false,
        }
    }

    /// Set every external momentum, beams first.
    pub fn set_external_momenta(&mut self, momenta: &[Momentum<D>]) -> Result<(), PhaseSpaceError> {
        if momenta.len() != self.n_legs {
            return Err(PhaseSpaceError::InvalidProcess(format!(
                "expected {} external momenta, got {}",
                self.n_legs,
                momenta.len()
            )));
        }
        for (leg, p) in momenta.iter().enumerate() {
            let id = self
                .find(LegSet::single(leg))
                .ok_or(PhaseSpaceError::UnknownLeg(leg))?;
            let channel = &mut self.channels[id];
            channel.mass_squared = match *channel.sampler.density() {
                Density::DiracDelta { value } => value,
                _ => p.square(),
            };
            channel.set_momentum(*p);
        }
        Ok(())
    }

    /// External momenta, beams first, if all of them are generated.
    pub fn external_momenta(&self) -> Option<Vec<Momentum<D>>> {
        (0..self.n_legs)
            .map(|leg| {
                let id = self.find(LegSet::single(leg))?;
                let channel = &self.channels[id];
                (channel.status == ChannelStatus::MomentumGenerated).then_some(channel.momentum)
            })
            .collect()
    }
}

impl<const D: usize> Index<ChannelId> for ChannelArena<D> {
    type Output = Channel<D>;
    fn index(&self, id: ChannelId) -> &Channel<D> {
        &self.channels[id]
    }
}

impl<const D: usize> IndexMut<ChannelId> for ChannelArena<D> {
    fn index_mut(&mut self, id: ChannelId) -> &mut Channel<D> {
        &mut self.channels[id]
    }
}
