//! Topologies: trees of branchings that map random numbers to a full
//! phase-space point, and their construction from [`TopologySettings`].

use std::fmt::Write;

use log::{debug, warn};
use smallvec::SmallVec;

use crate::branching::{Branching, BranchingState, DecayBranching, SumBranching, TransferBranching};
use crate::channel::{Action, Channel, ChannelArena, ChannelId, Evaluation, LegSet, MassSampler};
use crate::grid::AdaptiveGrid;
use crate::multichannel::Sampleable;
use crate::pair::joint_integral;
use crate::random::RandomSource;
use crate::sampler::composite::CompositeIntegrator;
use crate::sampler::{Density, ValueSampler};
use crate::{
    BeamSettings, ChannelSettings, GridSettings, NodeSettings, PhaseSpaceError, SamplingDirection,
    Settings, TopologySettings,
};

/// External legs and total channel of a process, shared by all of its topologies.
#[derive(Debug, Clone)]
pub struct ProcessLayout {
    pub beams: SmallVec<[ChannelId; 2]>,
    pub total: ChannelId,
    /// Squared collision energy, the squared mass of a decaying particle.
    pub s: f64,
    pub n_incoming: usize,
    pub n_outgoing: usize,
    /// Lowest mass every leg can take, zero for beams.
    min_masses: Vec<f64>,
}

impl ProcessLayout {
    /// Check the process and register its external and total channels.
    pub fn register<const D: usize>(
        settings: &Settings,
        arena: &mut ChannelArena<D>,
    ) -> Result<Self, PhaseSpaceError> {
        let process = &settings.process;
        let n_incoming = process.n_incoming();
        let n_outgoing = process.outgoing.len();

        for leg in process.incoming.iter().chain(&process.outgoing) {
            if !(leg.mass >= 0.) || !(leg.width >= 0.) {
                return Err(PhaseSpaceError::InvalidProcess(format!(
                    "negative mass or width in {:?}",
                    leg
                )));
            }
        }

        let hadronic = matches!(settings.kinematics.beams, BeamSettings::Hadronic { .. });
        if hadronic && (n_incoming != 2 || process.incoming.iter().any(|l| l.mass != 0.)) {
            return Err(PhaseSpaceError::Unsupported(
                "hadronic beams need two massless incoming partons".to_owned(),
            ));
        }

        let s = if n_incoming == 1 {
            let mass = process.incoming[0].mass;
            if !(mass > 0.) {
                return Err(PhaseSpaceError::InvalidProcess(
                    "a decaying particle needs a positive mass".to_owned(),
                ));
            }
            mass * mass
        } else {
            let e_cm = settings.kinematics.e_cm;
            if !(e_cm > 0.) || !e_cm.is_finite() {
                return Err(PhaseSpaceError::InvalidProcess(format!(
                    "invalid centre-of-mass energy {}",
                    e_cm
                )));
            }
            let m: f64 = process.incoming.iter().map(|l| l.mass).sum();
            if m >= e_cm {
                return Err(PhaseSpaceError::InvalidProcess(format!(
                    "incoming masses {} exceed the collision energy {}",
                    m, e_cm
                )));
            }
            e_cm * e_cm
        };

        let mut min_masses = vec![0.; n_incoming];
        min_masses.extend(
            process
                .outgoing
                .iter()
                .map(|l| if l.width > 0. { 0. } else { l.mass }),
        );
        let threshold: f64 = min_masses.iter().sum();
        if threshold >= s.sqrt() {
            return Err(PhaseSpaceError::InvalidProcess(format!(
                "final-state masses {} close the phase space at √s = {}",
                threshold,
                s.sqrt()
            )));
        }

        let mut layout = ProcessLayout {
            beams: SmallVec::new(),
            total: ChannelId(0),
            s,
            n_incoming,
            n_outgoing,
            min_masses,
        };

        for (i, leg) in process.incoming.iter().enumerate() {
            let m2 = leg.mass * leg.mass;
            let channel = if n_incoming == 1 {
                Channel::new(LegSet::single(i), delta(m2), threshold * threshold, m2)
            } else {
                Channel::new(LegSet::single(i), delta(m2), m2, m2)
            };
            layout.beams.push(arena.insert(channel.external())?);
        }

        for (i, leg) in process.outgoing.iter().enumerate() {
            let legs = LegSet::single(arena.outgoing_leg(i));
            let m2 = leg.mass * leg.mass;
            let channel = if leg.width > 0. {
                let (lo, hi) = layout.timelike_bounds(legs, arena.finals());
                let sampler = MassSampler::Plain(ValueSampler::with_bounds(
                    Density::BreitWigner {
                        mass: leg.mass,
                        width: leg.width,
                    },
                    lo,
                    hi,
                ));
                Channel::new(legs, sampler, lo, hi)
            } else {
                Channel::new(legs, delta(m2), m2, m2)
            };
            arena.insert(channel.external())?;
        }

        layout.total = if n_incoming == 1 {
            layout.beams[0]
        } else {
            let floor = threshold * threshold;
            let sampler = match settings.kinematics.beams {
                BeamSettings::Fixed => delta(s),
                BeamSettings::Hadronic { tau_min } => make_sampler(
                    &process.shat_sampling,
                    floor.max(tau_min * s),
                    s,
                    &settings.phase_space.grid,
                    arena.finals(),
                ),
            };
            arena.insert(Channel::new(arena.finals(), sampler, floor, s))?
        };
        debug!(
            "Registered {} -> {} process at √s = {} with threshold {}",
            n_incoming,
            n_outgoing,
            s.sqrt(),
            threshold
        );
        Ok(layout)
    }

    /// `[(Σ m_min)², (√S - Σ m_min of the other final legs)²]` for the timelike
    /// channel of final-state legs `legs`.
    pub fn timelike_bounds(&self, legs: LegSet, finals: LegSet) -> (f64, f64) {
        let inside: f64 = legs.legs().map(|l| self.min_masses[l]).sum();
        let outside: f64 = finals.difference(legs).legs().map(|l| self.min_masses[l]).sum();
        let top = (self.s.sqrt() - outside).max(0.);
        (inside * inside, top * top)
    }
}

fn delta(value: f64) -> MassSampler {
    MassSampler::Plain(ValueSampler::with_bounds(
        Density::DiracDelta { value },
        value,
        value,
    ))
}

/// Sampler of a channel with reference bounds `[lo, hi]`. Adaptive samplers
/// need a normalizable reference and fall back to the plain one otherwise.
fn make_sampler(
    settings: &ChannelSettings,
    lo: f64,
    hi: f64,
    grid: &GridSettings,
    legs: LegSet,
) -> MassSampler {
    let plain = ValueSampler::with_bounds(settings.sampling, lo, hi);
    if !settings.adaptive || settings.sampling.is_delta() {
        return MassSampler::Plain(plain);
    }
    if !plain.is_normalizable() {
        warn!(
            "{:?} is not normalizable on [{:e}, {:e}], channel {} will not be adapted",
            settings.sampling, lo, hi, legs
        );
        return MassSampler::Plain(plain);
    }
    MassSampler::Adaptive(AdaptiveGrid::new(plain, grid))
}

/// One way of generating the whole event: the sum branching producing the
/// incoming legs followed by the branchings of the tree, parents first.
#[derive(Debug, Clone)]
pub struct Topology<const D: usize> {
    name: String,
    sum: SumBranching,
    branchings: Vec<Branching>,
    direction: SamplingDirection,
    weight: f64,
}

impl<const D: usize> Topology<D> {
    /// Build the topology described by `topology`, registering its channels in
    /// `arena`.
    pub fn build(
        topology: &TopologySettings,
        layout: &ProcessLayout,
        arena: &mut ChannelArena<D>,
        settings: &Settings,
    ) -> Result<Self, PhaseSpaceError> {
        let mut builder = Builder {
            name: &topology.name,
            layout,
            arena,
            settings,
        };
        let branchings = builder.root(&topology.tree)?;
        let sum = SumBranching::new(
            layout.beams.clone(),
            layout.total,
            layout.s,
            settings.kinematics.beams,
        );
        let topology = Topology {
            name: topology.name.clone(),
            sum,
            branchings,
            direction: settings.phase_space.sampling_direction,
            weight: 0.,
        };
        topology.validate(arena)?;
        Ok(topology)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sum(&self) -> &SumBranching {
        &self.sum
    }

    pub fn branchings(&self) -> &[Branching] {
        &self.branchings
    }

    /// Weight of the last pass, zero after a failure or a reset.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn reset(&mut self) {
        self.weight = 0.;
        self.sum.reset();
        for branching in self.branchings.iter_mut() {
            branching.reset();
        }
    }

    /// Every branching splits its parent into its children.
    fn validate(&self, arena: &ChannelArena<D>) -> Result<(), PhaseSpaceError> {
        let check = |parent: ChannelId, children: LegSet| {
            let expected = arena[parent].legs;
            if arena.canonical(children) == expected {
                Ok(())
            } else {
                Err(PhaseSpaceError::MismatchedChannels {
                    parent: expected,
                    child: children,
                })
            }
        };
        for branching in &self.branchings {
            match branching {
                Branching::Decay(b) => {
                    let [o1, o2] = b.outgoing();
                    check(b.incoming(), arena[o1].legs | arena[o2].legs)?;
                }
                Branching::Transfer(b) => {
                    let [o, y] = b.outgoing();
                    let [a, _] = b.incoming();
                    check(b.total(), arena[o].legs | arena[y].legs)?;
                    let a_legs = if arena[a].external {
                        LegSet::single(0)
                    } else {
                        arena[a].legs
                    };
                    check(b.exchange(), a_legs | arena[o].legs)?;
                }
            }
        }
        Ok(())
    }

    /// Rebuild every channel this topology reads from the external momenta.
    fn reconstruct(&self, arena: &mut ChannelArena<D>) -> bool {
        let sum_channels = self.sum.beams().iter().copied().chain([self.sum.total()]);
        let mut ok = true;
        for id in sum_channels {
            ok &= arena.reconstruct(id);
        }
        for branching in &self.branchings {
            for id in branching.channels() {
                ok &= arena.reconstruct(id);
            }
        }
        ok
    }

    /// Run the three passes over the topology: masses, spacelike invariants
    /// and momenta.
    pub fn run<R: RandomSource + ?Sized>(
        &mut self,
        arena: &mut ChannelArena<D>,
        action: &mut Action<'_, R>,
    ) -> f64 {
        self.reset();
        if !action.is_generate() && !self.reconstruct(arena) {
            return 0.;
        }

        let masses = match self.direction {
            SamplingDirection::Backward => {
                self.sum.generate_s(arena, action)
                    && self.branchings.iter_mut().all(|b| b.generate_s(arena, action))
            }
            SamplingDirection::Forward => {
                self.branchings
                    .iter_mut()
                    .rev()
                    .all(|b| b.generate_s(arena, action))
                    && self.sum.generate_s(arena, action)
            }
        };
        if !masses || !self.sum.generate_p(arena, action) {
            return 0.;
        }
        for branching in self.branchings.iter_mut() {
            if !branching.generate_t(arena, action) || !branching.generate_p(arena, action) {
                return 0.;
            }
        }

        let weight = self.sum.weight() * self.branchings.iter().map(|b| b.weight()).product::<f64>();
        self.weight = if weight > 0. && weight.is_finite() {
            weight
        } else {
            0.
        };
        self.weight
    }

    pub fn state(&self) -> Vec<BranchingState> {
        self.branchings.iter().map(|b| b.state()).collect()
    }

    pub fn load_state(&mut self, states: &[BranchingState]) -> Result<(), PhaseSpaceError> {
        if states.len() != self.branchings.len() {
            return Err(PhaseSpaceError::StateMismatch(format!(
                "topology '{}' has {} branchings, the state {}",
                self.name,
                self.branchings.len(),
                states.len()
            )));
        }
        for (i, (branching, state)) in self.branchings.iter_mut().zip(states).enumerate() {
            if !branching.load_state(state) {
                return Err(PhaseSpaceError::StateMismatch(format!(
                    "branching {} of topology '{}'",
                    i, self.name
                )));
            }
        }
        Ok(())
    }

    /// Unnormalised mass of the joint density of the two children of every
    /// branching, under the largest invariant their parent can take.
    pub fn pair_integrals(
        &self,
        arena: &ChannelArena<D>,
        integrator: &CompositeIntegrator,
    ) -> Vec<f64> {
        self.branchings
            .iter()
            .map(|branching| {
                let (parent, children) = match branching {
                    Branching::Decay(b) => (b.incoming(), b.outgoing()),
                    Branching::Transfer(b) => (b.total(), b.outgoing()),
                };
                joint_integral(integrator, arena, children, arena[parent].s_max_abs)
            })
            .collect()
    }

    /// One line per branching, e.g. `decay {2,3,4} -> {2} {3,4}`.
    pub fn describe(&self, arena: &ChannelArena<D>) -> String {
        let mut out = String::new();
        for branching in &self.branchings {
            let _ = match branching {
                Branching::Decay(b) => {
                    let [o1, o2] = b.outgoing();
                    writeln!(
                        out,
                        "decay {} -> {} {}",
                        arena[b.incoming()].legs,
                        arena[o1].legs,
                        arena[o2].legs
                    )
                }
                Branching::Transfer(b) => {
                    let [a, c] = b.incoming();
                    let [o, y] = b.outgoing();
                    writeln!(
                        out,
                        "transfer {} {} -> {} {} via {}",
                        arena[a].legs,
                        arena[c].legs,
                        arena[o].legs,
                        arena[y].legs,
                        arena[b.exchange()].legs
                    )
                }
            };
        }
        out
    }
}

impl<const D: usize> Sampleable<ChannelArena<D>> for Topology<D> {
    fn generate<R: RandomSource + ?Sized>(&mut self, arena: &mut ChannelArena<D>, rng: &mut R) -> f64 {
        self.run(arena, &mut Action::Generate(rng))
    }

    fn evaluate_weight(&mut self, arena: &mut ChannelArena<D>) -> f64 {
        self.run(arena, &mut Evaluation::Evaluate)
    }

    fn update(&mut self, arena: &mut ChannelArena<D>, value: f64) {
        // only branchings that took part in the last event hold its bins
        if self.weight <= 0. {
            return;
        }
        for branching in self.branchings.iter_mut() {
            branching.update(arena, value);
        }
    }

    fn adapt(&mut self, arena: &mut ChannelArena<D>) {
        for branching in self.branchings.iter_mut() {
            branching.adapt(arena);
        }
    }
}

struct Builder<'a, const D: usize> {
    name: &'a str,
    layout: &'a ProcessLayout,
    arena: &'a mut ChannelArena<D>,
    settings: &'a Settings,
}

impl<'a, const D: usize> Builder<'a, D> {
    fn root(&mut self, tree: &NodeSettings) -> Result<Vec<Branching>, PhaseSpaceError> {
        let finals = self.arena.finals();
        match tree {
            NodeSettings::Decay { children, .. } => {
                let mut branchings = vec![];
                let (legs, ids) = self.children(children, &mut branchings)?;
                self.check_complete(legs)?;
                branchings.insert(0, Branching::Decay(self.decay(self.layout.total, ids, true)));
                Ok(branchings)
            }
            NodeSettings::Transfer {
                exchanges,
                channels,
                outgoing,
            } => self.chain(exchanges, channels, outgoing),
            NodeSettings::Leg(i) => Err(PhaseSpaceError::IncompleteTopology {
                name: self.name.to_owned(),
                covered: LegSet::single(self.arena.outgoing_leg(*i)),
                expected: finals,
            }),
        }
    }

    fn check_complete(&self, covered: LegSet) -> Result<(), PhaseSpaceError> {
        let expected = self.arena.finals();
        if covered != expected {
            return Err(PhaseSpaceError::IncompleteTopology {
                name: self.name.to_owned(),
                covered,
                expected,
            });
        }
        Ok(())
    }

    /// Legs and channel of `node`; its branchings are appended parents first.
    fn node(
        &mut self,
        node: &NodeSettings,
        branchings: &mut Vec<Branching>,
    ) -> Result<(LegSet, ChannelId), PhaseSpaceError> {
        match node {
            NodeSettings::Leg(i) => {
                if *i >= self.layout.n_outgoing {
                    return Err(PhaseSpaceError::UnknownLeg(*i));
                }
                let legs = LegSet::single(self.arena.outgoing_leg(*i));
                let id = self.arena.find(legs).ok_or(PhaseSpaceError::UnknownLeg(*i))?;
                Ok((legs, id))
            }
            NodeSettings::Decay { channel, children } => {
                let mut below = vec![];
                let (legs, ids) = self.children(children, &mut below)?;
                let id = self.timelike(legs, channel)?;
                branchings.push(Branching::Decay(self.decay(id, ids, false)));
                branchings.extend(below);
                Ok((legs, id))
            }
            NodeSettings::Transfer { .. } => Err(PhaseSpaceError::InvalidProcess(format!(
                "topology '{}': transfers are only allowed at the root",
                self.name
            ))),
        }
    }

    fn children(
        &mut self,
        children: &[NodeSettings],
        branchings: &mut Vec<Branching>,
    ) -> Result<(LegSet, [ChannelId; 2]), PhaseSpaceError> {
        let [first, second] = children else {
            return Err(PhaseSpaceError::InvalidProcess(format!(
                "topology '{}': a decay needs two children, got {}",
                self.name,
                children.len()
            )));
        };
        let (l1, id1) = self.node(first, branchings)?;
        let (l2, id2) = self.node(second, branchings)?;
        if l1.intersects(l2) {
            return Err(PhaseSpaceError::DuplicateLeg(l1.intersection(l2)));
        }
        Ok((l1 | l2, [id1, id2]))
    }

    /// A chain `a_i + b -> o_i + X_{i+1}` with exchanges `t_i` from the first
    /// beam, followed by the decays of the outgoing subsystems.
    fn chain(
        &mut self,
        exchanges: &[ChannelSettings],
        channels: &[ChannelSettings],
        outgoing: &[NodeSettings],
    ) -> Result<Vec<Branching>, PhaseSpaceError> {
        if self.layout.n_incoming != 2 {
            return Err(PhaseSpaceError::InvalidProcess(format!(
                "topology '{}': transfers need two incoming legs",
                self.name
            )));
        }
        if outgoing.len() < 2 {
            return Err(PhaseSpaceError::InvalidProcess(format!(
                "topology '{}': a transfer needs at least two outgoing subsystems",
                self.name
            )));
        }

        let mut below = vec![];
        let mut parts = Vec::with_capacity(outgoing.len());
        let mut covered = LegSet::EMPTY;
        for node in outgoing {
            let (legs, id) = self.node(node, &mut below)?;
            if covered.intersects(legs) {
                return Err(PhaseSpaceError::DuplicateLeg(covered.intersection(legs)));
            }
            covered = covered | legs;
            parts.push((legs, id));
        }
        self.check_complete(covered)?;

        let finals = self.arena.finals();
        let n = parts.len();
        let b = self.layout.beams[1];
        let mut a = self.layout.beams[0];
        let mut total = self.layout.total;
        let mut emitted = LegSet::EMPTY;
        let mut branchings = Vec::with_capacity(n - 1 + below.len());
        for (i, (legs, o)) in parts.iter().copied().take(n - 1).enumerate() {
            emitted = emitted | legs;
            let y = if i + 2 == n {
                parts[n - 1].1
            } else {
                let settings = channels.get(i).copied().unwrap_or_default();
                self.timelike(finals.difference(emitted), &settings)?
            };
            let settings = exchanges.get(i).copied().unwrap_or_default();
            let exchange = self.spacelike(LegSet::single(0) | emitted, &settings, i == 0)?;
            branchings.push(Branching::Transfer(TransferBranching::new(
                [a, b],
                total,
                [o, y],
                exchange,
                i == 0,
                &self.settings.phase_space,
                &self.settings.multi_channeling,
            )));
            a = exchange;
            total = y;
        }
        branchings.extend(below);
        Ok(branchings)
    }

    fn decay(&self, incoming: ChannelId, outgoing: [ChannelId; 2], root: bool) -> DecayBranching {
        DecayBranching::new(
            incoming,
            outgoing,
            root,
            D,
            &self.settings.phase_space,
            &self.settings.multi_channeling,
        )
    }

    fn timelike(&mut self, legs: LegSet, settings: &ChannelSettings) -> Result<ChannelId, PhaseSpaceError> {
        let (lo, hi) = self.layout.timelike_bounds(legs, self.arena.finals());
        if !(lo < hi) {
            return Err(PhaseSpaceError::InvalidBounds { legs, lo, hi });
        }
        let sampler = make_sampler(settings, lo, hi, &self.settings.phase_space.grid, legs);
        self.arena.insert(Channel::new(legs, sampler, lo, hi))
    }

    /// Exchange channel sampled in `u = -t`. Past the first link of a chain the
    /// incoming momentum is spacelike and `t > 0`, i.e. `u < 0`, is reachable.
    fn spacelike(
        &mut self,
        legs: LegSet,
        settings: &ChannelSettings,
        first_link: bool,
    ) -> Result<ChannelId, PhaseSpaceError> {
        let s = self.layout.s;
        let lo = if first_link { 0. } else { -s };
        if settings.sampling.integral(lo, s).is_none() {
            warn!(
                "{:?} cannot be normalized on u in [{:e}, {:e}] for exchange {}, events outside its support get zero weight",
                settings.sampling, lo, s, legs
            );
        }
        let sampler = make_sampler(settings, lo, s, &self.settings.phase_space.grid, legs);
        self.arena
            .insert(Channel::new(legs, sampler, lo, s).spacelike())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::momentum::Momentum;
    use crate::utils::{ApproxEq, CONSERVATION_TOLERANCE};
    use crate::{LegSettings, ProcessSettings};
    use rand::{rngs::SmallRng, SeedableRng};

    fn leg(i: usize) -> NodeSettings {
        NodeSettings::Leg(i)
    }

    fn decay(children: Vec<NodeSettings>) -> NodeSettings {
        NodeSettings::Decay {
            channel: ChannelSettings::default(),
            children,
        }
    }

    fn settings(incoming: usize, outgoing: usize, tree: NodeSettings) -> Settings {
        let mut settings = Settings::default();
        settings.kinematics.e_cm = 10.;
        settings.process = ProcessSettings {
            incoming: vec![LegSettings::default(); incoming],
            outgoing: vec![LegSettings::default(); outgoing],
            topologies: vec![TopologySettings {
                name: "test".to_owned(),
                tree,
            }],
            ..ProcessSettings::default()
        };
        settings
    }

    fn build(settings: &Settings) -> Result<(ChannelArena<4>, Topology<4>), PhaseSpaceError> {
        let process = &settings.process;
        let mut arena = ChannelArena::new(process.n_incoming(), process.outgoing.len())?;
        let layout = ProcessLayout::register(settings, &mut arena)?;
        let topology = Topology::build(&process.topologies[0], &layout, &mut arena, settings)?;
        Ok((arena, topology))
    }

    fn conserves(momenta: &[Momentum<4>], n_incoming: usize) -> bool {
        let mut balance = Momentum::<4>::zero();
        for (i, p) in momenta.iter().enumerate() {
            if i < n_incoming {
                balance += *p;
            } else {
                balance -= *p;
            }
        }
        balance.approx_eq(&Momentum::zero(), &CONSERVATION_TOLERANCE)
    }

    #[test]
    fn shared_subsystems_reuse_channels() {
        let tree = decay(vec![leg(0), decay(vec![leg(1), leg(2)])]);
        let (arena, topology) = build(&settings(2, 3, tree)).unwrap();
        // beams, three finals, total and {3,4}
        assert_eq!(arena.len(), 7);
        assert_eq!(topology.branchings().len(), 2);
        assert!(arena.find(LegSet::single(3) | LegSet::single(4)).is_some());
        assert!(topology.describe(&arena).starts_with("decay {2,3,4}"));
    }

    #[test]
    fn malformed_trees_are_rejected() {
        let duplicate = decay(vec![leg(0), decay(vec![leg(0), leg(1)])]);
        assert!(matches!(
            build(&settings(2, 2, duplicate)),
            Err(PhaseSpaceError::DuplicateLeg(_))
        ));
        let incomplete = decay(vec![leg(0), leg(1)]);
        assert!(matches!(
            build(&settings(2, 3, incomplete)),
            Err(PhaseSpaceError::IncompleteTopology { .. })
        ));
        let unknown = decay(vec![leg(0), leg(5)]);
        assert!(matches!(
            build(&settings(2, 2, unknown)),
            Err(PhaseSpaceError::UnknownLeg(5))
        ));
        let three = decay(vec![leg(0), leg(1), leg(2)]);
        assert!(build(&settings(2, 3, three)).is_err());
        let transfer_decay = NodeSettings::Transfer {
            exchanges: vec![],
            channels: vec![],
            outgoing: vec![leg(0), leg(1)],
        };
        let mut decay_settings = settings(1, 2, transfer_decay);
        decay_settings.process.incoming[0].mass = 10.;
        assert!(build(&decay_settings).is_err());
    }

    #[test]
    fn later_exchanges_reach_positive_momentum_transfer() {
        let chain = |exchanges: Vec<ChannelSettings>| NodeSettings::Transfer {
            exchanges,
            channels: vec![],
            outgoing: vec![leg(0), leg(1), leg(2)],
        };
        let mut settings = settings(2, 3, chain(vec![]));
        for beam in settings.process.incoming.iter_mut() {
            beam.mass = 1.;
        }
        let (mut arena, _) = build(&settings).unwrap();
        let s = 100.;
        let exchanges: Vec<ChannelId> = arena
            .iter()
            .filter(|(_, c)| c.spacelike)
            .map(|(id, _)| id)
            .collect();
        assert_eq!(exchanges.len(), 2);
        assert_eq!(exchanges.iter().filter(|id| arena[**id].s_min_abs == 0.).count(), 1);
        let later = exchanges
            .iter()
            .copied()
            .find(|id| arena[*id].s_min_abs < 0.)
            .unwrap();
        assert_eq!(arena[later].s_min_abs, -s);

        // u in [-0.1, 10] holds a sliver of t > 0
        let mut rng = SmallRng::seed_from_u64(4);
        let mut positive = 0;
        for _ in 0..2000 {
            assert!(arena[later].sample_invariant(-0.1, 10., &mut Action::Generate(&mut rng)));
            let t = arena[later].mass_squared;
            assert!((-10. ..=0.1).contains(&t));
            assert!(arena[later].weight().approx_eq(&10.1, &1e-12));
            if t > 0. {
                positive += 1;
            }
        }
        assert!(positive > 0);

        // densities without support at u < 0 still build
        let power_law = ChannelSettings {
            sampling: Density::PowerLaw {
                exponent: 0.5,
                offset: 0.,
            },
            adaptive: false,
        };
        settings.process.topologies[0].tree = chain(vec![power_law, power_law]);
        assert!(build(&settings).is_ok());
    }

    #[test]
    fn every_topology_shape_conserves_momentum() {
        let trees = [
            decay(vec![decay(vec![leg(0), leg(1)]), decay(vec![leg(2), leg(3)])]),
            NodeSettings::Transfer {
                exchanges: vec![],
                channels: vec![],
                outgoing: vec![leg(0), leg(1), decay(vec![leg(2), leg(3)])],
            },
        ];
        for tree in trees {
            for direction in [SamplingDirection::Backward, SamplingDirection::Forward] {
                let mut settings = settings(2, 4, tree.clone());
                settings.phase_space.sampling_direction = direction;
                settings.process.outgoing[0].mass = 1.;
                settings.process.outgoing[3].mass = 0.5;
                let (mut arena, mut topology) = build(&settings).unwrap();
                let mut rng = SmallRng::seed_from_u64(12);
                // forward sampling draws the two pair masses independently and
                // loses the events with √s12 + √s34 > √s, about 5/6 of them
                let forward_pairs = matches!(tree, NodeSettings::Decay { .. })
                    && matches!(direction, SamplingDirection::Forward);
                let min_accepted = if forward_pairs { 100 } else { 900 };
                let mut accepted = 0;
                for _ in 0..1000 {
                    arena.reset();
                    let weight = Sampleable::generate(&mut topology, &mut arena, &mut rng);
                    if weight == 0. {
                        continue;
                    }
                    accepted += 1;
                    let momenta = arena.external_momenta().unwrap();
                    assert!(conserves(&momenta, 2));
                    assert!(momenta[2].square().approx_eq(&1., &1e-8));
                    assert!(momenta[5].square().approx_eq(&0.25, &1e-8));

                    let mut scored = arena.clone();
                    scored.reset();
                    scored.set_external_momenta(&momenta).unwrap();
                    let evaluated = topology.evaluate_weight(&mut scored);
                    assert!(evaluated.approx_eq(&weight, &1e-6));
                }
                assert!(accepted > min_accepted, "{} of 1000 events accepted", accepted);
            }
        }
    }
}
