use log::debug;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// First to fourth power sums of a stream of weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerSums {
    pub n: usize,
    pub sum: f64,
    pub sum_sq: f64,
    pub sum_cube: f64,
    pub sum_quartic: f64,
}

impl PowerSums {
    pub fn add(&mut self, w: f64) {
        let w2 = w * w;
        self.n += 1;
        self.sum += w;
        self.sum_sq += w2;
        self.sum_cube += w2 * w;
        self.sum_quartic += w2 * w2;
    }

    pub fn merge(&mut self, other: &PowerSums) {
        self.n += other.n;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.sum_cube += other.sum_cube;
        self.sum_quartic += other.sum_quartic;
    }

    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            0.
        } else {
            self.sum / self.n as f64
        }
    }

    /// Unbiased estimate of the variance of a single weight.
    pub fn sample_variance(&self) -> f64 {
        if self.n < 2 {
            return 0.;
        }
        let n = self.n as f64;
        ((self.sum_sq - self.sum * self.sum / n) / (n - 1.)).max(0.)
    }

    /// Variance of the mean, `(Σw² − (Σw)²/N) / (N(N−1))`.
    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            return 0.;
        }
        self.sample_variance() / self.n as f64
    }

    pub fn error(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Standard deviation of [`PowerSums::error`], from the fourth central moment.
    pub fn error_of_error(&self) -> f64 {
        if self.n < 4 {
            return 0.;
        }
        let n = self.n as f64;
        let mu = self.mean();
        let m2 = self.sample_variance();
        let m4 = self.sum_quartic / n - 4. * mu * self.sum_cube / n + 6. * mu * mu * self.sum_sq / n
            - 3. * mu.powi(4);
        let var_s2 = ((m4 - (n - 3.) / (n - 1.) * m2 * m2) / n).max(0.);
        let s = m2.sqrt();
        if s == 0. {
            return 0.;
        }
        var_s2.sqrt() / (2. * s) / n.sqrt()
    }
}

/// Running Monte-Carlo estimate of an integral from a stream of weighted samples.
///
/// Samples are accumulated both into the statistics of the whole run and into
/// those of the current iteration; finished iterations can be folded into an
/// inverse-variance weighted average with [`RunningStatistics::update_iter`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunningStatistics {
    total: PowerSums,
    iteration: PowerSums,
    pub num_zero_evaluations: usize,
    pub num_non_finite: usize,
    pub max_weight: f64,
    // iteration combination
    weight_sum: f64,
    avg_sum: f64,
    guess: f64,
    chi_sum: f64,
    chi_sq_sum: f64,
    n_combined: usize,
    exact_sum: f64,
    n_exact: usize,
    pub avg: f64,
    pub err: f64,
    pub chi_sq: f64,
    pub cur_iter: usize,
}

impl RunningStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a weighted sample. NaN and infinite samples are counted and
    /// discarded; returns whether the sample was accepted.
    pub fn add_sample(&mut self, w: f64) -> bool {
        if !w.is_finite() {
            self.num_non_finite += 1;
            debug!("Discarding non-finite sample {}", w);
            return false;
        }
        if w == 0. {
            self.num_zero_evaluations += 1;
        }
        if w.abs() > self.max_weight {
            self.max_weight = w.abs();
        }
        self.total.add(w);
        self.iteration.add(w);
        true
    }

    pub fn n(&self) -> usize {
        self.total.n
    }

    pub fn mean(&self) -> f64 {
        self.total.mean()
    }

    pub fn variance(&self) -> f64 {
        self.total.variance()
    }

    pub fn error(&self) -> f64 {
        self.total.error()
    }

    pub fn error_of_error(&self) -> f64 {
        self.total.error_of_error()
    }

    pub fn relative_error(&self) -> f64 {
        let mean = self.mean();
        if mean == 0. {
            0.
        } else {
            (self.error() / mean).abs()
        }
    }

    pub fn totals(&self) -> &PowerSums {
        &self.total
    }

    pub fn current_iteration(&self) -> &PowerSums {
        &self.iteration
    }

    /// Impact of the largest weight on the current mean.
    pub fn max_weight_impact(&self) -> f64 {
        if self.total.sum == 0. {
            0.
        } else {
            (self.max_weight / self.total.sum).abs()
        }
    }

    /// Fold the current iteration into the combined average and start a new one.
    ///
    /// Iterations with fewer than two samples are skipped. An iteration with
    /// vanishing variance is exact: the average of the exact iterations then
    /// replaces the inverse-variance average, with zero error.
    pub fn update_iter(&mut self) -> bool {
        let iteration = std::mem::take(&mut self.iteration);
        self.cur_iter += 1;
        if iteration.n < 2 {
            return false;
        }

        let mean = iteration.mean();
        let variance = iteration.variance();
        if variance > 0. {
            let w = 1. / variance;
            if self.n_combined == 0 {
                self.guess = mean;
            }
            self.weight_sum += w;
            self.avg_sum += w * mean;
            self.chi_sum += w * (mean - self.guess);
            self.chi_sq_sum += w * (mean - self.guess) * mean;
            self.n_combined += 1;
        } else {
            self.exact_sum += mean;
            self.n_exact += 1;
        }

        if self.n_combined > 0 {
            let weighted_avg = self.avg_sum / self.weight_sum;
            self.chi_sq = self.chi_sq_sum - weighted_avg * self.chi_sum;
            self.avg = weighted_avg;
            self.err = (1. / self.weight_sum).sqrt();
        }
        if self.n_exact > 0 {
            self.avg = self.exact_sum / self.n_exact as f64;
            self.err = 0.;
        }
        true
    }

    /// Number of iterations folded into the inverse-variance average.
    pub fn n_combined(&self) -> usize {
        self.n_combined
    }

    /// χ² per degree of freedom of the combined iterations.
    pub fn chi_sq_per_dof(&self) -> f64 {
        if self.n_combined > 1 {
            self.chi_sq / (self.n_combined - 1) as f64
        } else {
            0.
        }
    }

    /// Probability of a χ² at least as large as the observed one.
    pub fn chi_sq_probability(&self) -> f64 {
        if self.n_combined < 2 {
            return 1.;
        }
        match ChiSquared::new((self.n_combined - 1) as f64) {
            Ok(dist) => 1. - dist.cdf(self.chi_sq.max(0.)),
            Err(_) => 1.,
        }
    }

    /// Drop the samples of the current iteration only.
    pub fn reset_iteration(&mut self) {
        self.iteration = PowerSums::default();
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn merge(&mut self, other: &RunningStatistics) {
        self.total.merge(&other.total);
        self.iteration.merge(&other.iteration);
        self.num_zero_evaluations += other.num_zero_evaluations;
        self.num_non_finite += other.num_non_finite;
        self.max_weight = self.max_weight.max(other.max_weight);
    }
}
