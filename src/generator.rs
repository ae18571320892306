//! The phase-space generator: all topologies of a process combined into one
//! adaptive multichannel sampler.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::branching::BranchingState;
use crate::channel::{ChannelArena, LegSet, MassSampler};
use crate::momentum::Momentum;
use crate::multichannel::MultiChannel;
use crate::random::RandomSource;
use crate::sampler::composite::CompositeIntegrator;
use crate::statistics::RunningStatistics;
use crate::topology::{ProcessLayout, Topology};
use crate::utils::{ApproxEq, CONSERVATION_TOLERANCE};
use crate::{PhaseSpaceError, Settings};

/// One generated event.
#[derive(Debug, Clone)]
pub struct PhaseSpacePoint<const D: usize> {
    /// External momenta, beams first. All zero when the event failed.
    pub momenta: Vec<Momentum<D>>,
    pub n_incoming: usize,
    /// Parton momentum fractions, one for fixed beams.
    pub x1: f64,
    pub x2: f64,
    pub weight: f64,
    /// Topology that produced the event.
    pub topology: Option<usize>,
}

impl<const D: usize> PhaseSpacePoint<D> {
    pub fn incoming(&self) -> &[Momentum<D>] {
        &self.momenta[..self.n_incoming]
    }

    pub fn outgoing(&self) -> &[Momentum<D>] {
        &self.momenta[self.n_incoming..]
    }

    pub fn is_valid(&self) -> bool {
        self.weight > 0.
    }
}

/// Everything adaptation learned, detached from the settings that describe
/// the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorState {
    pub dimension: usize,
    pub channels: Vec<(LegSet, MassSampler)>,
    pub alphas: Vec<f64>,
    pub topologies: Vec<Vec<BranchingState>>,
}

impl GeneratorState {
    pub fn to_bytes(&self) -> Result<Vec<u8>, PhaseSpaceError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PhaseSpaceError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PhaseSpaceError> {
        let (state, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PhaseSpaceError::Serialization(e.to_string()))?;
        Ok(state)
    }
}

#[derive(Debug, Clone)]
pub struct Generator<const D: usize> {
    arena: ChannelArena<D>,
    layout: ProcessLayout,
    topologies: MultiChannel<Topology<D>>,
    integrator: CompositeIntegrator,
    statistics: RunningStatistics,
    adapt_every: usize,
    since_adaptation: usize,
    n_adaptations: usize,
}

impl<const D: usize> Generator<D> {
    pub fn new(settings: &Settings) -> Result<Self, PhaseSpaceError> {
        if settings.kinematics.dimension != D {
            return Err(PhaseSpaceError::Unsupported(format!(
                "generator built for {} dimensions, settings ask for {}",
                D, settings.kinematics.dimension
            )));
        }
        if D < 3 {
            return Err(PhaseSpaceError::Unsupported(format!(
                "{} spacetime dimensions",
                D
            )));
        }
        let process = &settings.process;
        let mut arena = ChannelArena::new(process.n_incoming(), process.outgoing.len())?;
        let layout = ProcessLayout::register(settings, &mut arena)?;
        if settings.phase_space.polar_grid && D != 4 {
            warn!("Polar grids need four dimensions, decays stay isotropic in {} dimensions", D);
        }

        let mut topologies = vec![];
        for (i, topology) in process.topologies.iter().enumerate() {
            match Topology::build(topology, &layout, &mut arena, settings) {
                Ok(t) => {
                    debug!("Topology {} '{}':\n{}", i, t.name(), t.describe(&arena));
                    topologies.push(t);
                }
                Err(e) => warn!("Skipping topology {} '{}': {}", i, topology.name, e),
            }
        }
        if topologies.is_empty() {
            return Err(PhaseSpaceError::InvalidProcess(
                "no valid topology to generate from".to_owned(),
            ));
        }
        info!(
            "Generator with {} topologies over {} channels",
            topologies.len(),
            arena.len()
        );

        Ok(Generator {
            arena,
            layout,
            topologies: MultiChannel::new(topologies, &settings.multi_channeling),
            integrator: CompositeIntegrator::new(settings.phase_space.quadrature_order),
            statistics: RunningStatistics::new(),
            adapt_every: settings.multi_channeling.adapt_every,
            since_adaptation: 0,
            n_adaptations: 0,
        })
    }

    pub fn arena(&self) -> &ChannelArena<D> {
        &self.arena
    }

    pub fn topologies(&self) -> &[Topology<D>] {
        self.topologies.channels()
    }

    pub fn alphas(&self) -> &[f64] {
        self.topologies.alphas()
    }

    /// Weights of every topology for the last event.
    pub fn topology_weights(&self) -> &[f64] {
        self.topologies.weights()
    }

    /// Variance contributions accumulated since the last adaptation.
    pub fn topology_accumulators(&self) -> &[f64] {
        self.topologies.accumulators()
    }

    /// Joint mass of the pair densities of every branching of topology `i`.
    pub fn pair_integrals(&self, i: usize) -> Option<Vec<f64>> {
        self.topologies
            .channels()
            .get(i)
            .map(|t| t.pair_integrals(&self.arena, &self.integrator))
    }

    pub fn statistics(&self) -> &RunningStatistics {
        &self.statistics
    }

    pub fn statistics_mut(&mut self) -> &mut RunningStatistics {
        &mut self.statistics
    }

    pub fn n_adaptations(&self) -> usize {
        self.n_adaptations
    }

    /// Squared collision energy.
    pub fn s(&self) -> f64 {
        self.layout.s
    }

    pub fn n_incoming(&self) -> usize {
        self.layout.n_incoming
    }

    fn start_event(&mut self) {
        self.arena.reset();
        for topology in self.topologies.channels_mut() {
            topology.reset();
        }
    }

    pub fn generate<R: RandomSource + ?Sized>(&mut self, rng: &mut R) -> PhaseSpacePoint<D> {
        self.start_event();
        let weight = self.topologies.generate(&mut self.arena, rng);
        let topology = self.topologies.selected();
        let (x1, x2) = topology
            .map(|i| {
                let sum = self.topologies.channels()[i].sum();
                (sum.x1(), sum.x2())
            })
            .unwrap_or((1., 1.));
        let momenta = match self.arena.external_momenta() {
            Some(momenta) if weight > 0. => momenta,
            _ => vec![Momentum::zero(); self.arena.n_legs()],
        };
        PhaseSpacePoint {
            momenta,
            n_incoming: self.layout.n_incoming,
            x1,
            x2,
            weight: if weight > 0. { weight } else { 0. },
            topology,
        }
    }

    /// Feed back the integrand at the last event. Adapts every `adapt_every`
    /// samples when that is positive. Returns whether the sample was used.
    pub fn add_sample(&mut self, integrand: f64) -> bool {
        let value = integrand * self.topologies.weight();
        let accepted = self.statistics.add_sample(value);
        if accepted {
            self.topologies.update(&mut self.arena, value);
            for (_, channel) in self.arena.iter_mut() {
                channel.sampler.update(value);
            }
        }
        self.since_adaptation += 1;
        if self.adapt_every > 0 && self.since_adaptation >= self.adapt_every {
            self.adapt();
        }
        accepted
    }

    /// Adapt topology probabilities, pair samplers and grids to the samples
    /// added since the last adaptation.
    pub fn adapt(&mut self) {
        self.topologies.adapt(&mut self.arena);
        let mut adapted = 0;
        for (_, channel) in self.arena.iter_mut() {
            if channel.sampler.adapt() {
                adapted += 1;
            }
        }
        self.since_adaptation = 0;
        self.n_adaptations += 1;
        debug!(
            "Adaptation {}: {} grids adapted, alphas {:?}",
            self.n_adaptations,
            adapted,
            self.topologies.alphas()
        );
    }

    /// Combined weight of externally supplied momenta, beams first.
    pub fn evaluate_external(&mut self, momenta: &[Momentum<D>]) -> Result<f64, PhaseSpaceError> {
        self.start_event();
        let mut balance = Momentum::<D>::zero();
        for (i, p) in momenta.iter().enumerate() {
            if i < self.layout.n_incoming {
                balance += *p;
            } else {
                balance -= *p;
            }
        }
        if !balance.approx_eq(&Momentum::zero(), &CONSERVATION_TOLERANCE) {
            return Err(PhaseSpaceError::InvalidProcess(
                "external momenta do not conserve momentum".to_owned(),
            ));
        }
        self.arena.set_external_momenta(momenta)?;
        Ok(self.topologies.evaluate_weight(&mut self.arena))
    }

    pub fn state(&self) -> GeneratorState {
        GeneratorState {
            dimension: D,
            channels: self
                .arena
                .iter()
                .map(|(_, c)| (c.legs, c.sampler.clone()))
                .collect(),
            alphas: self.topologies.alphas().to_vec(),
            topologies: self.topologies.channels().iter().map(|t| t.state()).collect(),
        }
    }

    /// Install a state saved from a generator with the same settings.
    pub fn load_state(&mut self, state: &GeneratorState) -> Result<(), PhaseSpaceError> {
        if state.dimension != D
            || state.channels.len() != self.arena.len()
            || state.topologies.len() != self.topologies.len()
        {
            return Err(PhaseSpaceError::StateMismatch(format!(
                "state has {} channels and {} topologies in {} dimensions",
                state.channels.len(),
                state.topologies.len(),
                state.dimension
            )));
        }
        for ((_, channel), (legs, sampler)) in self.arena.iter().zip(&state.channels) {
            if channel.legs != *legs || channel.sampler.density() != sampler.density() {
                return Err(PhaseSpaceError::StateMismatch(format!(
                    "channel {} against {}",
                    channel.legs, legs
                )));
            }
        }
        for (topology, branchings) in self.topologies.channels_mut().iter_mut().zip(&state.topologies) {
            topology.load_state(branchings)?;
        }
        if !self.topologies.set_alphas(&state.alphas) {
            return Err(PhaseSpaceError::StateMismatch(
                "invalid topology probabilities".to_owned(),
            ));
        }
        for ((_, channel), (_, sampler)) in self.arena.iter_mut().zip(&state.channels) {
            channel.sampler = sampler.clone();
            channel.sampler.refresh();
        }
        info!("Loaded generator state with alphas {:?}", state.alphas);
        Ok(())
    }

    pub fn save_state(&self) -> Result<Vec<u8>, PhaseSpaceError> {
        self.state().to_bytes()
    }

    pub fn restore_state(&mut self, bytes: &[u8]) -> Result<(), PhaseSpaceError> {
        self.load_state(&GeneratorState::from_bytes(bytes)?)
    }
}
