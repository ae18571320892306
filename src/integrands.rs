use crate::evaluation_result::{EvaluationMetaData, EvaluationResult};
use crate::generator::PhaseSpacePoint;
use crate::momentum::Momentum;
use crate::{PhaseSpaceError, Settings};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IntegrandSettings {
    #[serde(rename = "unit")]
    Unit,
    #[serde(rename = "breit_wigner")]
    BreitWigner(BreitWignerSettings),
    #[serde(rename = "t_channel_pole")]
    TChannelPole(TChannelPoleSettings),
}

impl Display for IntegrandSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrandSettings::Unit => write!(f, "unit"),
            IntegrandSettings::BreitWigner(_) => write!(f, "breit_wigner"),
            IntegrandSettings::TChannelPole(_) => write!(f, "t_channel_pole"),
        }
    }
}

impl Default for IntegrandSettings {
    fn default() -> IntegrandSettings {
        IntegrandSettings::Unit
    }
}

/// `1 / ((s - M²)² + M² Γ²)` in the invariant mass of some outgoing legs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreitWignerSettings {
    pub legs: Vec<usize>,
    pub mass: f64,
    pub width: f64,
}

/// `1 / (t - M²)²` with `t = (p_beam - Σ p_legs)²`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TChannelPoleSettings {
    #[serde(default)]
    pub beam: usize,
    pub legs: Vec<usize>,
    pub mass: f64,
}

pub trait HasIntegrand<const D: usize> {
    /// The integrand at a valid phase-space point.
    fn evaluate_point(&self, point: &PhaseSpacePoint<D>) -> f64;

    fn name(&self) -> String;
}

#[derive(Debug, Clone)]
pub enum Integrand {
    Unit(UnitIntegrand),
    BreitWigner(BreitWignerIntegrand),
    TChannelPole(TChannelPoleIntegrand),
}

impl<const D: usize> HasIntegrand<D> for Integrand {
    fn evaluate_point(&self, point: &PhaseSpacePoint<D>) -> f64 {
        match self {
            Integrand::Unit(integrand) => integrand.evaluate_point(point),
            Integrand::BreitWigner(integrand) => integrand.evaluate_point(point),
            Integrand::TChannelPole(integrand) => integrand.evaluate_point(point),
        }
    }

    fn name(&self) -> String {
        match self {
            Integrand::Unit(integrand) => HasIntegrand::<D>::name(integrand),
            Integrand::BreitWigner(integrand) => HasIntegrand::<D>::name(integrand),
            Integrand::TChannelPole(integrand) => HasIntegrand::<D>::name(integrand),
        }
    }
}

impl Integrand {
    /// Evaluate the integrand at `point` and attach the timings of the event.
    /// Failed points contribute zero without calling the integrand.
    pub fn evaluate_sample<const D: usize>(
        &self,
        point: &PhaseSpacePoint<D>,
        generation_time: Duration,
        debug: usize,
    ) -> EvaluationResult {
        let before_evaluation = std::time::Instant::now();
        let itg_wgt = if point.is_valid() {
            self.evaluate_point(point)
        } else {
            0.
        };
        let integrand_time = before_evaluation.elapsed();

        if debug > 1 && point.is_valid() {
            info!("Sampled momenta:");
            for (i, p) in point.momenta.iter().enumerate() {
                info!("p{} = ( {:-23})", i, format!("{:+.16e}", p));
            }
            info!("Phase-space weight: {:+.16e}", point.weight);
            info!("Integrand weight  : {:+.16e}", itg_wgt);
            info!("Final contribution: {:+.16e}", itg_wgt * point.weight);
        }

        EvaluationResult {
            integrand_result: itg_wgt * point.weight,
            integrator_weight: point.weight,
            evaluation_metadata: EvaluationMetaData {
                generation_time,
                integrand_time,
                failed: !point.is_valid(),
                is_nan: itg_wgt.is_nan(),
            },
        }
    }
}

fn check_legs(legs: &[usize], settings: &Settings) -> Result<(), PhaseSpaceError> {
    let n_outgoing = settings.process.outgoing.len();
    match legs.iter().find(|l| **l >= n_outgoing) {
        Some(leg) => Err(PhaseSpaceError::UnknownLeg(*leg)),
        None if legs.is_empty() => Err(PhaseSpaceError::InvalidProcess(
            "integrand needs at least one leg".to_owned(),
        )),
        None => Ok(()),
    }
}

pub fn integrand_factory(settings: &Settings) -> Result<Integrand, PhaseSpaceError> {
    match &settings.integrand {
        IntegrandSettings::Unit => Ok(Integrand::Unit(UnitIntegrand)),
        IntegrandSettings::BreitWigner(integrand_settings) => {
            check_legs(&integrand_settings.legs, settings)?;
            Ok(Integrand::BreitWigner(BreitWignerIntegrand::new(
                integrand_settings.clone(),
            )))
        }
        IntegrandSettings::TChannelPole(integrand_settings) => {
            check_legs(&integrand_settings.legs, settings)?;
            if integrand_settings.beam >= settings.process.n_incoming() {
                return Err(PhaseSpaceError::UnknownLeg(integrand_settings.beam));
            }
            Ok(Integrand::TChannelPole(TChannelPoleIntegrand::new(
                integrand_settings.clone(),
            )))
        }
    }
}

fn sum_of<const D: usize>(point: &PhaseSpacePoint<D>, legs: &[usize]) -> Momentum<D> {
    let outgoing = point.outgoing();
    legs.iter().fold(Momentum::zero(), |acc, l| acc + outgoing[*l])
}

/// The phase-space volume.
#[derive(Debug, Clone, Copy)]
pub struct UnitIntegrand;

impl<const D: usize> HasIntegrand<D> for UnitIntegrand {
    fn evaluate_point(&self, _point: &PhaseSpacePoint<D>) -> f64 {
        1.
    }

    fn name(&self) -> String {
        "unit".to_owned()
    }
}

#[derive(Debug, Clone)]
pub struct BreitWignerIntegrand {
    pub settings: BreitWignerSettings,
}

impl BreitWignerIntegrand {
    pub fn new(settings: BreitWignerSettings) -> Self {
        BreitWignerIntegrand { settings }
    }
}

impl<const D: usize> HasIntegrand<D> for BreitWignerIntegrand {
    fn evaluate_point(&self, point: &PhaseSpacePoint<D>) -> f64 {
        let s = sum_of(point, &self.settings.legs).square();
        let m2 = self.settings.mass * self.settings.mass;
        let d = s - m2;
        1. / (d * d + m2 * self.settings.width * self.settings.width)
    }

    fn name(&self) -> String {
        format!(
            "breit_wigner({:?}, M={}, Γ={})",
            self.settings.legs, self.settings.mass, self.settings.width
        )
    }
}

#[derive(Debug, Clone)]
pub struct TChannelPoleIntegrand {
    pub settings: TChannelPoleSettings,
}

impl TChannelPoleIntegrand {
    pub fn new(settings: TChannelPoleSettings) -> Self {
        TChannelPoleIntegrand { settings }
    }
}

impl<const D: usize> HasIntegrand<D> for TChannelPoleIntegrand {
    fn evaluate_point(&self, point: &PhaseSpacePoint<D>) -> f64 {
        let q = point.incoming()[self.settings.beam] - sum_of(point, &self.settings.legs);
        let d = q.square() - self.settings.mass * self.settings.mass;
        1. / (d * d)
    }

    fn name(&self) -> String {
        format!(
            "t_channel_pole(beam {}, {:?}, M={})",
            self.settings.beam, self.settings.legs, self.settings.mass
        )
    }
}
