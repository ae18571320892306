use colored::Colorize;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::evaluation_result::{EvaluationResult, MetaDataStatistics};
use crate::generator::{Generator, PhaseSpacePoint};
use crate::integrands::{HasIntegrand, Integrand};
use crate::momentum::Momentum;
use crate::random::RandomSource;
use crate::statistics::RunningStatistics;
use crate::utils;
use crate::IntegrationResult;
use crate::{Settings, UnweightingSettings};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::time::Instant;
use tabled::{Style, Table, Tabled};

#[derive(Tabled)]
pub struct ChannelResult {
    id: String,
    name: String,
    n_samples: String,
    #[tabled(rename = "n_samples[%]")]
    n_samples_perc: String,
    #[tabled(rename = "α")]
    alpha: String,
    #[tabled(rename = "W")]
    accumulator: String,
}

/// Rejection of weighted events against a maximal weight. The maximum is
/// calibrated as a quantile of the first `calibration_size` non-zero weights
/// and raised by every larger weight when the quantile is one.
#[derive(Debug, Clone)]
pub struct Unweighter {
    calibration: Vec<f64>,
    calibration_size: usize,
    quantile: f64,
    max_weight: f64,
    pub n_seen: usize,
    pub n_accepted: usize,
    pub n_overweight: usize,
}

impl Unweighter {
    pub fn new(settings: &UnweightingSettings, calibration_size: usize) -> Self {
        Unweighter {
            calibration: Vec::with_capacity(calibration_size),
            calibration_size: calibration_size.max(1),
            quantile: settings.max_weight_quantile.clamp(0., 1.),
            max_weight: 0.,
            n_seen: 0,
            n_accepted: 0,
            n_overweight: 0,
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.max_weight > 0.
    }

    pub fn max_weight(&self) -> f64 {
        self.max_weight
    }

    fn calibrate(&mut self) {
        self.calibration.sort_by(|a, b| a.total_cmp(b));
        let last = self.calibration.len() - 1;
        let index = ((self.quantile * last as f64).round() as usize).min(last);
        self.max_weight = self.calibration[index];
        self.calibration.clear();
        debug!("Unweighting against a maximal weight of {:e}", self.max_weight);
    }

    /// Offer an event of weight `weight`. Returns the weight of the
    /// unweighted event when it is kept, `None` when it is rejected or used
    /// for calibration.
    pub fn add<R: RandomSource + ?Sized>(&mut self, weight: f64, rng: &mut R) -> Option<f64> {
        let abs = weight.abs();
        if !abs.is_finite() || abs == 0. {
            if self.is_calibrated() {
                self.n_seen += 1;
            }
            return None;
        }
        if !self.is_calibrated() {
            self.calibration.push(abs);
            if self.calibration.len() >= self.calibration_size {
                self.calibrate();
            }
            return None;
        }

        self.n_seen += 1;
        if abs > self.max_weight {
            self.n_overweight += 1;
            if self.quantile >= 1. {
                self.max_weight = abs;
            }
            self.n_accepted += 1;
            return Some(weight);
        }
        if rng.uniform() * self.max_weight < abs {
            self.n_accepted += 1;
            Some(self.max_weight.copysign(weight))
        } else {
            None
        }
    }

    pub fn efficiency(&self) -> f64 {
        if self.n_seen == 0 {
            0.
        } else {
            self.n_accepted as f64 / self.n_seen as f64
        }
    }
}

fn print_integral_result(itg: &RunningStatistics, trgt: Option<f64>) {
    let (avg, err) = (itg.avg, itg.err);
    info!(
        "|  itg {}: {} {} {} {} {}",
        format!("{:-2}", "ps").blue().bold(),
        format!("{:-19}", utils::format_uncertainty(avg, err))
            .blue()
            .bold(),
        if avg != 0. {
            if (err / avg).abs() > 0.01 {
                format!("{:-8}", format!("{:.3}%", (err / avg).abs() * 100.).red())
            } else {
                format!("{:-8}", format!("{:.3}%", (err / avg).abs() * 100.).green())
            }
        } else {
            format!("{:-8}", "")
        },
        if itg.chi_sq_per_dof() > 5. {
            format!("{:-6.3} χ²/dof", itg.chi_sq_per_dof()).red()
        } else {
            format!("{:-6.3} χ²/dof", itg.chi_sq_per_dof()).normal()
        },
        if let Some(t) = trgt {
            let delta_sigma = (t - avg).abs() / err;
            let delta_perc = if t.abs() > 0. {
                (t - avg).abs() / t.abs() * 100.
            } else {
                0.
            };
            let line = format!("Δ={:-7.3}σ, Δ={:-7.3}%", delta_sigma, delta_perc);
            if delta_sigma > 5. || delta_perc > 1. {
                line.red()
            } else {
                line.green()
            }
        } else {
            String::new().normal()
        },
        {
            let mwi = itg.max_weight_impact();
            if mwi > 1. {
                format!("  mwi: {:-5.3}", mwi).red()
            } else {
                format!("  mwi: {:-5.3}", mwi).normal()
            }
        }
    );
}

fn channel_table<const D: usize>(generator: &Generator<D>, counts: &[usize], total: usize) -> String {
    let rows: Vec<ChannelResult> = generator
        .topologies()
        .iter()
        .enumerate()
        .map(|(i, topology)| ChannelResult {
            id: format!("chann#{}", i),
            name: topology.name().to_owned(),
            n_samples: format!("{}", counts[i]),
            n_samples_perc: format!(
                "{:.3e}%",
                counts[i] as f64 / total.max(1) as f64 * 100.
            ),
            alpha: format!("{:.6e}", generator.alphas()[i]),
            accumulator: format!("{:.6e}", generator.topology_accumulators()[i]),
        })
        .collect();
    Table::new(rows).with(Style::psql()).to_string()
}

/// Generate one event, evaluate `integrand` on it and feed the generator's
/// statistics and channel weights with the bare integrand value.
pub fn generate_and_evaluate<const D: usize, R: RandomSource + ?Sized>(
    generator: &mut Generator<D>,
    integrand: &Integrand,
    rng: &mut R,
    debug: usize,
) -> (PhaseSpacePoint<D>, EvaluationResult) {
    let before_generation = Instant::now();
    let point = generator.generate(rng);
    let generation_time = before_generation.elapsed();
    let result = integrand.evaluate_sample(&point, generation_time, debug);
    // the generator multiplies by the event weight itself
    let integrand_value = if point.is_valid() {
        result.integrand_result / point.weight
    } else {
        0.
    };
    generator.add_sample(integrand_value);
    (point, result)
}

/// Integrate `integrand` over the phase space of `generator` in iterations of
/// `n_start + iter·n_increase` events until `n_max` events are generated or
/// the run is interrupted.
pub fn integrate<const D: usize>(
    generator: &mut Generator<D>,
    integrand: &Integrand,
    settings: &Settings,
    target: Option<f64>,
) -> IntegrationResult {
    let mut rng = SmallRng::seed_from_u64(settings.integrator.seed);
    let mut unweighter = settings
        .integrator
        .unweighting
        .enabled
        .then(|| Unweighter::new(&settings.integrator.unweighting, settings.integrator.n_start));
    let n_topologies = generator.topologies().len();
    let mut selected_counts = vec![0; n_topologies];
    let mut metadata = vec![];
    let mut max_weight_event: Option<(f64, Vec<Momentum<D>>)> = None;

    let mut num_points = 0;
    let mut iter = 0;
    let t_start = Instant::now();
    info!(
        "Integrating '{}' over {} topologies in {} dimensions ...\n",
        format!("{}", HasIntegrand::<D>::name(integrand)).green(),
        format!("{}", n_topologies).bold().blue(),
        D
    );

    while num_points < settings.integrator.n_max && !crate::is_interrupted() {
        let cur_points = (settings.integrator.n_start + settings.integrator.n_increase * iter)
            .min(settings.integrator.n_max - num_points);
        let mut results = Vec::with_capacity(cur_points);
        for _ in 0..cur_points {
            if crate::is_interrupted() {
                break;
            }
            let (point, result) =
                generate_and_evaluate(generator, integrand, &mut rng, settings.general.debug);
            if let Some(i) = point.topology {
                selected_counts[i] += 1;
            }

            let contribution = result.integrand_result;
            if contribution.abs() > max_weight_event.as_ref().map_or(0., |(w, _)| w.abs()) {
                max_weight_event = Some((contribution, point.momenta.clone()));
            }
            if let Some(unweighter) = unweighter.as_mut() {
                unweighter.add(contribution, &mut rng);
            }
            results.push(result);
            num_points += 1;
        }
        metadata.push(MetaDataStatistics::from_evaluation_results(&results));

        if settings.multi_channeling.adapt_every == 0 {
            generator.adapt();
        }
        if !generator.statistics_mut().update_iter() {
            info!("WARNING: too few samples in this iteration to update the combined result.");
        }
        iter += 1;

        info!(
            "/  [ {} ] {}: n_pts={:-6.0}K {} {} /sample",
            format!(
                "{:^7}",
                utils::format_wdhms(t_start.elapsed().as_secs() as usize)
            )
            .bold(),
            format!("Iteration #{:-4}", iter).bold().green(),
            results.len() as f64 / 1000.,
            if num_points >= 10_000_000 {
                format!("n_tot={:-7.0}M", num_points as f64 / 1_000_000.)
                    .bold()
                    .green()
            } else {
                format!("n_tot={:-7.0}K", num_points as f64 / 1000.)
                    .bold()
                    .green()
            },
            format!(
                "{:-17.3} µs",
                t_start.elapsed().as_secs_f64() * 1.0e6 / num_points.max(1) as f64
            )
            .bold()
            .blue()
        );
        print_integral_result(generator.statistics(), target);

        if settings.integrator.show_max_wgt_info {
            if let Some((weight, momenta)) = &max_weight_event {
                info!("|  -------------------------------------------------------------------------------------------");
                info!("|  {:<16} | {:<23}", "Max Eval", "Momenta");
                info!(
                    "|  {:<16} | {}",
                    format!("{:+.16e}", weight),
                    momenta
                        .iter()
                        .map(|p| format!("( {:+.16e} )", p))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
        }
        if settings.general.show_channel_table || settings.general.debug > 1 {
            info!(
                "\n{}",
                channel_table(generator, &selected_counts, num_points)
            );
        }
        info!("");
    }

    if crate::is_interrupted() {
        warn!("Integration interrupted after {} points", num_points);
    }
    MetaDataStatistics::merge_list(metadata).print_stats();
    if let Some(unweighter) = &unweighter {
        info!(
            "Unweighting efficiency: {} ({} events, {} above the maximal weight {:e})",
            format!("{:.3}%", unweighter.efficiency() * 100.).green(),
            unweighter.n_accepted,
            unweighter.n_overweight,
            unweighter.max_weight()
        );
    }

    let statistics = generator.statistics();
    IntegrationResult {
        neval: statistics.n(),
        fail: statistics.num_zero_evaluations,
        result: statistics.avg,
        error: statistics.err,
        chi_sq: statistics.chi_sq,
        alphas: generator.alphas().to_vec(),
    }
}
