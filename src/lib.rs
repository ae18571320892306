#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
// #![deny(clippy::all)]
// #![warn(clippy::pedantic)]
#![warn(clippy::all)]
pub mod branching;
pub mod channel;
pub mod cli_functions;
pub mod evaluation_result;
pub mod generator;
pub mod grid;
pub mod integrands;
pub mod integrate;
pub mod momentum;
pub mod multichannel;
pub mod pair;
pub mod random;
pub mod sampler;
pub mod statistics;
#[cfg(test)]
mod tests;
pub mod topology;
pub mod utils;

use color_eyre::{Help, Report};
#[allow(unused)]
use colored::Colorize;
use eyre::WrapErr;

use channel::LegSet;
use integrands::IntegrandSettings;
use sampler::Density;
use std::fs::File;
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Number of external legs a [`LegSet`] can address.
pub const MAX_LEGS: usize = 64;

pub fn set_interrupt_handler() {
    INTERRUPTED.store(false, std::sync::atomic::Ordering::Relaxed);
    let _ = ctrlc::set_handler(|| {
        INTERRUPTED.store(true, std::sync::atomic::Ordering::Relaxed);
    });
}

#[inline]
pub fn is_interrupted() -> bool {
    INTERRUPTED.load(std::sync::atomic::Ordering::Relaxed)
}

#[inline]
pub fn set_interrupted(flag: bool) {
    INTERRUPTED.store(flag, std::sync::atomic::Ordering::Relaxed);
}

const fn _default_false() -> bool {
    false
}
const fn _default_dimension() -> usize {
    4
}
const fn _default_quadrature_order() -> usize {
    20
}
const fn _default_tau_min() -> f64 {
    1.0e-4
}

#[derive(Error, Debug)]
pub enum PhaseSpaceError {
    #[error("Invalid process: {0}")]
    InvalidProcess(String),
    #[error("Leg {0} is not an outgoing leg of the process")]
    UnknownLeg(usize),
    #[error("Channel {0} declared twice in the same topology")]
    DuplicateLeg(LegSet),
    #[error("Topology '{name}' covers legs {covered} instead of {expected}")]
    IncompleteTopology {
        name: String,
        covered: LegSet,
        expected: LegSet,
    },
    #[error("Channel {child} is not contained in its parent {parent}")]
    MismatchedChannels { parent: LegSet, child: LegSet },
    #[error("Invalid sampler bounds [{lo:e}, {hi:e}] for channel {legs}")]
    InvalidBounds { legs: LegSet, lo: f64, hi: f64 },
    #[error("Unsupported configuration: {0}")]
    Unsupported(String),
    #[error("Generator state does not match the generator layout: {0}")]
    StateMismatch(String),
    #[error("Could not (de)serialize generator state: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GeneralSettings {
    #[serde(default)]
    pub debug: usize,
    #[serde(default = "_default_false")]
    pub show_channel_table: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub enum BeamSettings {
    #[serde(rename = "fixed")]
    #[default]
    Fixed,
    /// Massless hadrons of total energy `e_cm`; the partonic `ŝ` is sampled in
    /// `[max(τ_min S, s_min), S]`.
    #[serde(rename = "hadronic")]
    Hadronic {
        #[serde(default = "_default_tau_min")]
        tau_min: f64,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KinematicsSettings {
    pub e_cm: f64,
    #[serde(default)]
    pub beams: BeamSettings,
    #[serde(default = "_default_dimension")]
    pub dimension: usize,
}

impl Default for KinematicsSettings {
    fn default() -> Self {
        Self {
            e_cm: 1.0,
            beams: BeamSettings::Fixed,
            dimension: _default_dimension(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub struct LegSettings {
    #[serde(default)]
    pub mass: f64,
    /// A positive width samples the leg's mass from a Breit–Wigner.
    #[serde(default)]
    pub width: f64,
}

/// Sampling of the invariant of one internal channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub struct ChannelSettings {
    #[serde(default)]
    pub sampling: Density,
    #[serde(default = "_default_false")]
    pub adaptive: bool,
}

/// A node of a topology tree. Legs are indices into the outgoing legs.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeSettings {
    Leg(usize),
    /// Two-body splitting of the timelike channel formed by the children.
    Decay {
        #[serde(default)]
        channel: ChannelSettings,
        children: Vec<NodeSettings>,
    },
    /// Chain of momentum transfers between the two beams, emitting the
    /// `outgoing` subsystems ordered from the first beam to the second.
    /// `exchanges` configures the spacelike invariants `u = -t` along the chain.
    Transfer {
        #[serde(default)]
        exchanges: Vec<ChannelSettings>,
        #[serde(default)]
        channels: Vec<ChannelSettings>,
        outgoing: Vec<NodeSettings>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopologySettings {
    #[serde(default)]
    pub name: String,
    pub tree: NodeSettings,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProcessSettings {
    pub incoming: Vec<LegSettings>,
    pub outgoing: Vec<LegSettings>,
    pub topologies: Vec<TopologySettings>,
    /// Sampling of the partonic `ŝ` for hadronic beams.
    #[serde(default = "_default_shat_sampling")]
    pub shat_sampling: ChannelSettings,
}

fn _default_shat_sampling() -> ChannelSettings {
    ChannelSettings {
        sampling: Density::PowerLaw {
            exponent: 1.,
            offset: 0.,
        },
        adaptive: false,
    }
}

impl ProcessSettings {
    pub fn n_incoming(&self) -> usize {
        self.incoming.len()
    }

    pub fn n_legs(&self) -> usize {
        self.incoming.len() + self.outgoing.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum SamplingDirection {
    #[serde(rename = "backward")]
    #[default]
    Backward,
    #[serde(rename = "forward")]
    Forward,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum PairSampling {
    #[serde(rename = "asymmetric")]
    #[default]
    Asymmetric,
    #[serde(rename = "symmetric")]
    Symmetric,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GridSettings {
    pub n_bins: usize,
    pub min_samples_for_update: usize,
    pub learning_rate: f64,
    pub train_on_avg: bool,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            n_bins: 64,
            min_samples_for_update: 100,
            learning_rate: 1.5,
            train_on_avg: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PhaseSpaceSettings {
    #[serde(default)]
    pub sampling_direction: SamplingDirection,
    #[serde(default)]
    pub pair_sampling: PairSampling,
    #[serde(default)]
    pub grid: GridSettings,
    /// Adaptive polar angle of four-dimensional decays.
    #[serde(default = "_default_false")]
    pub polar_grid: bool,
    #[serde(default = "_default_quadrature_order")]
    pub quadrature_order: usize,
}

impl Default for PhaseSpaceSettings {
    fn default() -> Self {
        Self {
            sampling_direction: SamplingDirection::default(),
            pair_sampling: PairSampling::default(),
            grid: GridSettings::default(),
            polar_grid: false,
            quadrature_order: _default_quadrature_order(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MultiChannelingSettings {
    pub beta: f64,
    /// Channels whose probability falls below this fraction of the mean are switched off.
    pub pruning_threshold: f64,
    /// Number of accepted events between adaptations, `0` disables them.
    pub adapt_every: usize,
}

impl Default for MultiChannelingSettings {
    fn default() -> Self {
        Self {
            beta: 0.5,
            pruning_threshold: 0.01,
            adapt_every: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UnweightingSettings {
    #[serde(default = "_default_false")]
    pub enabled: bool,
    /// Quantile of the calibration weights used as the initial maximum weight.
    #[serde(default = "_default_max_weight_quantile")]
    pub max_weight_quantile: f64,
}

fn _default_max_weight_quantile() -> f64 {
    1.0
}

impl Default for UnweightingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_weight_quantile: _default_max_weight_quantile(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IntegratorSettings {
    pub n_start: usize,
    pub n_increase: usize,
    pub n_max: usize,
    pub seed: u64,
    #[serde(default = "_default_false")]
    pub show_max_wgt_info: bool,
    #[serde(default)]
    pub unweighting: UnweightingSettings,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        Self {
            n_start: 10_000,
            n_increase: 0,
            n_max: 100_000,
            seed: 0,
            show_max_wgt_info: false,
            unweighting: UnweightingSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(rename = "General")]
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(rename = "Kinematics")]
    pub kinematics: KinematicsSettings,
    #[serde(rename = "Process")]
    pub process: ProcessSettings,
    #[serde(rename = "PhaseSpace")]
    #[serde(default)]
    pub phase_space: PhaseSpaceSettings,
    #[serde(rename = "MultiChanneling")]
    #[serde(default)]
    pub multi_channeling: MultiChannelingSettings,
    #[serde(rename = "Integrator")]
    #[serde(default)]
    pub integrator: IntegratorSettings,
    #[serde(rename = "Integrand")]
    #[serde(default)]
    pub integrand: IntegrandSettings,
}

impl Settings {
    pub fn from_file(filename: &str) -> Result<Settings, Report> {
        let f = File::open(filename)
            .wrap_err_with(|| format!("Could not open settings file {}", filename))
            .suggestion("Does the path exist?")?;
        Self::deserialize_yaml(serde_yaml::Deserializer::from_reader(f))
            .wrap_err("Could not parse settings file")
            .suggestion("Is it a correct yaml file")
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Settings, Report> {
        Self::deserialize_yaml(serde_yaml::Deserializer::from_str(yaml))
            .wrap_err("Could not parse settings")
            .suggestion("Is it a correct yaml file")
    }

    /// Enum variants with data are written as single-key maps, e.g.
    /// `tree: {decay: {children: [...]}}` or `sampling: {power_law: {...}}`.
    fn deserialize_yaml(deserializer: serde_yaml::Deserializer<'_>) -> Result<Settings, serde_yaml::Error> {
        serde_yaml::with::singleton_map_recursive::deserialize(deserializer)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationResult {
    pub neval: usize,
    pub fail: usize,
    pub result: f64,
    pub error: f64,
    pub chi_sq: f64,
    pub alphas: Vec<f64>,
}
