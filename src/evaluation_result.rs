use std::time::Duration;

use colored::Colorize;
use log::info;

use crate::utils::format_evaluation_time;

const MAX_FAILED_FRACTION_FOR_GREEN: f64 = 0.1;

/// Outcome of one event: integrand times phase-space weight.
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub integrand_result: f64,
    pub integrator_weight: f64,
    pub evaluation_metadata: EvaluationMetaData,
}

#[derive(Debug, Clone, Default)]
pub struct EvaluationMetaData {
    pub generation_time: Duration,
    pub integrand_time: Duration,
    /// The generator produced no point.
    pub failed: bool,
    pub is_nan: bool,
}

#[derive(Debug, Clone)]
pub struct MetaDataStatistics {
    pub avg_generation_time: Duration,
    pub avg_integrand_time: Duration,
    pub num_evals: usize,
    pub num_failed_evals: usize,
    pub num_nan_evals: usize,
}

#[derive(Default)]
struct TempStatisticsCounter {
    total_generation_time: Duration,
    total_integrand_time: Duration,
    num_failed_evals: usize,
    num_nan_evals: usize,
}

impl TempStatisticsCounter {
    fn to_metadata_statistics(&self, len: usize) -> MetaDataStatistics {
        let n = len.max(1) as u32;
        MetaDataStatistics {
            avg_generation_time: self.total_generation_time / n,
            avg_integrand_time: self.total_integrand_time / n,
            num_evals: len,
            num_failed_evals: self.num_failed_evals,
            num_nan_evals: self.num_nan_evals,
        }
    }
}

impl MetaDataStatistics {
    pub fn from_evaluation_results(data: &[EvaluationResult]) -> Self {
        let counter = data.iter().fold(
            TempStatisticsCounter::default(),
            |mut accumulator, data_entry| {
                let metadata = &data_entry.evaluation_metadata;
                accumulator.total_generation_time += metadata.generation_time;
                accumulator.total_integrand_time += metadata.integrand_time;
                accumulator.num_failed_evals += metadata.failed as usize;
                accumulator.num_nan_evals += metadata.is_nan as usize;
                accumulator
            },
        );
        counter.to_metadata_statistics(data.len())
    }

    /// Combine with the statistics of another batch, weighting the averages
    /// by the number of evaluations.
    pub fn merge(self, other: Self) -> Self {
        let n = self.num_evals + other.num_evals;
        let average = |a: Duration, na: usize, b: Duration, nb: usize| {
            if n == 0 {
                Duration::ZERO
            } else {
                (a * na as u32 + b * nb as u32) / n as u32
            }
        };
        Self {
            avg_generation_time: average(
                self.avg_generation_time,
                self.num_evals,
                other.avg_generation_time,
                other.num_evals,
            ),
            avg_integrand_time: average(
                self.avg_integrand_time,
                self.num_evals,
                other.avg_integrand_time,
                other.num_evals,
            ),
            num_evals: n,
            num_failed_evals: self.num_failed_evals + other.num_failed_evals,
            num_nan_evals: self.num_nan_evals + other.num_nan_evals,
        }
    }

    fn new_empty() -> Self {
        TempStatisticsCounter::default().to_metadata_statistics(0)
    }

    pub fn merge_list(list: Vec<Self>) -> Self {
        list.into_iter()
            .reduce(|acc, x| acc.merge(x))
            .unwrap_or_else(Self::new_empty)
    }

    pub fn failed_fraction(&self) -> f64 {
        if self.num_evals == 0 {
            0.
        } else {
            self.num_failed_evals as f64 / self.num_evals as f64
        }
    }

    pub fn print_stats(&self) {
        let failed = self.failed_fraction();
        let failed_str = format!("{:.2}%", failed * 100.);
        let failed_str = if failed > MAX_FAILED_FRACTION_FOR_GREEN {
            failed_str.red()
        } else {
            failed_str.green()
        };
        let nan_str = if self.num_nan_evals > 0 {
            format!("{}", self.num_nan_evals).red()
        } else {
            format!("{}", self.num_nan_evals).green()
        };

        info!(
            "Average generation time: {}",
            format_evaluation_time(self.avg_generation_time)
        );
        info!(
            "Average integrand time: {}",
            format_evaluation_time(self.avg_integrand_time)
        );
        info!("Percentage of failed phase-space points: {}", failed_str);
        info!("Number of NaN evaluations: {}", nan_str);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(generation_ms: u64, failed: bool) -> EvaluationResult {
        EvaluationResult {
            integrand_result: 0.,
            integrator_weight: 0.,
            evaluation_metadata: EvaluationMetaData {
                generation_time: Duration::from_millis(generation_ms),
                integrand_time: Duration::ZERO,
                failed,
                is_nan: false,
            },
        }
    }

    #[test]
    fn merged_averages_are_weighted_by_counts() {
        let a = MetaDataStatistics::from_evaluation_results(&[result(1, false), result(3, true)]);
        let b = MetaDataStatistics::from_evaluation_results(&[result(8, false)]);
        let merged = MetaDataStatistics::merge_list(vec![a, b]);
        assert_eq!(merged.num_evals, 3);
        assert_eq!(merged.num_failed_evals, 1);
        assert_eq!(merged.avg_generation_time, Duration::from_millis(4));
        assert_eq!(MetaDataStatistics::merge_list(vec![]).num_evals, 0);
    }
}
