use log::debug;
use serde::{Deserialize, Serialize};

use crate::random::RandomSource;
use crate::sampler::{Density, ValueSampler};
use crate::GridSettings;

/// A VEGAS-style importance sampling grid layered on top of a [`ValueSampler`].
///
/// The grid lives in the unit interval of the reference sampler, the sampler
/// restricted to the widest range the channel can ever reach. Every bin carries
/// the same probability. Sampling on a narrower range restricts the grid's
/// cumulative distribution, so the learned shape survives when the range
/// shrinks and grows between events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveGrid {
    reference: ValueSampler,
    edges: Vec<f64>,
    accumulators: Vec<f64>,
    counts: Vec<usize>,
    n_samples: usize,
    settings: GridSettings,
    lo: f64,
    hi: f64,
    #[serde(skip)]
    cdf_lo: f64,
    #[serde(skip)]
    cdf_hi: f64,
    #[serde(skip)]
    normalizable: bool,
    #[serde(skip)]
    value: f64,
    #[serde(skip)]
    weight: f64,
    #[serde(skip)]
    bin: Option<usize>,
}

impl AdaptiveGrid {
    /// A uniform grid over the range of `reference`, which must be set already.
    pub fn new(reference: ValueSampler, settings: &GridSettings) -> Self {
        let n_bins = settings.n_bins.max(1);
        let (lo, hi) = reference.bounds();
        let mut grid = AdaptiveGrid {
            reference,
            edges: (0..=n_bins).map(|i| i as f64 / n_bins as f64).collect(),
            accumulators: vec![0.; n_bins],
            counts: vec![0; n_bins],
            n_samples: 0,
            settings: settings.clone(),
            lo,
            hi,
            cdf_lo: 0.,
            cdf_hi: 1.,
            normalizable: false,
            value: 0.,
            weight: 0.,
            bin: None,
        };
        grid.set_bounds(lo, hi);
        grid
    }

    pub fn n_bins(&self) -> usize {
        self.edges.len() - 1
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    pub fn density(&self) -> &Density {
        self.reference.density()
    }

    pub fn reference_bounds(&self) -> (f64, f64) {
        self.reference.bounds()
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.lo, self.hi)
    }

    pub fn is_normalizable(&self) -> bool {
        self.normalizable
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn set_value(&mut self, value: f64) {
        self.value = value;
    }

    pub fn clear_bin(&mut self) {
        self.bin = None;
    }

    fn bin_of(&self, y: f64) -> usize {
        let n = self.n_bins();
        self.edges[1..n]
            .partition_point(|e| *e <= y)
            .min(n - 1)
    }

    fn cdf(&self, y: f64) -> f64 {
        let y = y.clamp(0., 1.);
        let k = self.bin_of(y);
        let width = self.edges[k + 1] - self.edges[k];
        let frac = if width > 0. {
            ((y - self.edges[k]) / width).clamp(0., 1.)
        } else {
            0.
        };
        (k as f64 + frac) / self.n_bins() as f64
    }

    fn inverse_cdf(&self, c: f64) -> (usize, f64) {
        let n = self.n_bins();
        let scaled = c * n as f64;
        let k = (scaled as usize).min(n - 1);
        let frac = scaled - k as f64;
        let y = self.edges[k] + frac * (self.edges[k + 1] - self.edges[k]);
        (k, y)
    }

    /// Extend the reference range to cover `[lo, hi]`, remapping the edges so
    /// that the learned shape is kept.
    fn grow(&mut self, lo: f64, hi: f64) -> bool {
        let (ref_lo, ref_hi) = self.reference.bounds();
        let old = self.reference.clone();
        let (new_lo, new_hi) = (lo.min(ref_lo), hi.max(ref_hi));
        if !self.reference.set_bounds(new_lo, new_hi) {
            self.reference = old;
            return false;
        }
        debug!(
            "Growing grid range from [{:e}, {:e}] to [{:e}, {:e}]",
            ref_lo, ref_hi, new_lo, new_hi
        );
        let mut edges: Vec<f64> = self
            .edges
            .iter()
            .map(|y| self.reference.inverse_map(old.map(*y)).clamp(0., 1.))
            .collect();
        if edges[0] > 0. {
            edges.insert(0, 0.);
            self.accumulators.insert(0, 0.);
            self.counts.insert(0, 0);
        } else {
            edges[0] = 0.;
        }
        let last = edges.len() - 1;
        if edges[last] < 1. {
            edges.push(1.);
            self.accumulators.push(0.);
            self.counts.push(0);
        } else {
            edges[last] = 1.;
        }
        self.edges = edges;
        true
    }

    /// Restrict the grid to `[lo, hi]`, growing the reference range when needed.
    pub fn set_bounds(&mut self, lo: f64, hi: f64) -> bool {
        self.lo = lo;
        self.hi = hi;
        self.normalizable = false;
        if !(lo <= hi) || !lo.is_finite() || !hi.is_finite() {
            return false;
        }
        let (ref_lo, ref_hi) = self.reference.bounds();
        if (lo < ref_lo || hi > ref_hi || !self.reference.is_normalizable()) && !self.grow(lo, hi) {
            return false;
        }
        self.cdf_lo = self.cdf(self.reference.inverse_map(lo));
        self.cdf_hi = self.cdf(self.reference.inverse_map(hi));
        self.normalizable = self.cdf_hi > self.cdf_lo;
        self.normalizable
    }

    pub fn refresh(&mut self) -> bool {
        self.reference.refresh();
        self.set_bounds(self.lo, self.hi)
    }

    fn weight_at(&self, x: f64, bin: usize) -> f64 {
        let width = self.edges[bin + 1] - self.edges[bin];
        (self.cdf_hi - self.cdf_lo) * self.n_bins() as f64 * width * self.reference.weight_at(x)
    }

    fn finish(&mut self, weight: f64, bin: usize) -> bool {
        if weight.is_finite() && weight > 0. {
            self.weight = weight;
            self.bin = Some(bin);
            true
        } else {
            self.weight = 0.;
            self.bin = None;
            false
        }
    }

    pub fn generate_from(&mut self, r: f64) -> bool {
        if !self.normalizable {
            self.weight = 0.;
            self.bin = None;
            return false;
        }
        let c = self.cdf_lo + r * (self.cdf_hi - self.cdf_lo);
        let (bin, y) = self.inverse_cdf(c);
        self.value = self.reference.map(y).clamp(self.lo, self.hi);
        let weight = self.weight_at(self.value, bin);
        self.finish(weight, bin)
    }

    pub fn generate<R: RandomSource + ?Sized>(&mut self, rng: &mut R) -> bool {
        let r = rng.uniform();
        self.generate_from(r)
    }

    /// Recompute the weight of an externally set value.
    pub fn evaluate_weight(&mut self) -> bool {
        let x = self.value;
        if !self.normalizable || x < self.lo || x > self.hi {
            self.weight = 0.;
            self.bin = None;
            return false;
        }
        let bin = self.bin_of(self.reference.inverse_map(x));
        let weight = self.weight_at(x, bin);
        self.finish(weight, bin)
    }

    /// Accumulate the weighted integrand `value` in the bin of the last point.
    pub fn update(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        if let Some(bin) = self.bin {
            self.accumulators[bin] += if self.settings.train_on_avg {
                value.abs()
            } else {
                value * value
            };
            self.counts[bin] += 1;
            self.n_samples += 1;
        }
    }

    /// Redistribute the bin edges following the accumulated statistic.
    /// Returns whether the grid changed.
    pub fn adapt(&mut self) -> bool {
        if self.n_samples < self.settings.min_samples_for_update.max(1) {
            return false;
        }
        let n = self.n_bins();
        let mut d: Vec<f64> = self
            .accumulators
            .iter()
            .zip(&self.counts)
            .map(|(a, c)| {
                if self.settings.train_on_avg && *c > 0 {
                    a / *c as f64
                } else {
                    *a
                }
            })
            .collect();

        if n > 1 {
            let raw = d.clone();
            d[0] = (raw[0] + raw[1]) / 2.;
            d[n - 1] = (raw[n - 2] + raw[n - 1]) / 2.;
            for i in 1..n - 1 {
                d[i] = (raw[i - 1] + raw[i] + raw[i + 1]) / 3.;
            }
        }

        let total: f64 = d.iter().sum();
        if !(total > 0.) || !total.is_finite() {
            self.reset_accumulators();
            return false;
        }

        let mut importance: Vec<f64> = d
            .iter()
            .map(|di| {
                let r = di / total;
                if r <= 0. {
                    0.
                } else if r >= 1. {
                    1.
                } else {
                    ((1. - r) / (1. / r).ln()).powf(self.settings.learning_rate)
                }
            })
            .collect();
        // no region may end up with vanishing probability
        let floor = 1e-3 * importance.iter().sum::<f64>() / n as f64;
        for m in importance.iter_mut() {
            *m = m.max(floor);
        }

        let target_bins = self.settings.n_bins.max(1);
        let per_bin = importance.iter().sum::<f64>() / target_bins as f64;
        let mut new_edges = Vec::with_capacity(target_bins + 1);
        new_edges.push(0.);
        let mut acc = 0.;
        let mut k = 0;
        for _ in 1..target_bins {
            let mut needed = per_bin;
            loop {
                let available = importance[k] - acc;
                if available >= needed || k == n - 1 {
                    acc += needed.min(available);
                    break;
                }
                needed -= available;
                acc = 0.;
                k += 1;
            }
            let width = self.edges[k + 1] - self.edges[k];
            let edge = self.edges[k] + width * (acc / importance[k]).min(1.);
            new_edges.push(edge.max(*new_edges.last().unwrap_or(&0.)));
        }
        new_edges.push(1.);

        self.edges = new_edges;
        self.accumulators = vec![0.; target_bins];
        self.counts = vec![0; target_bins];
        self.n_samples = 0;
        self.bin = None;
        self.set_bounds(self.lo, self.hi);
        true
    }

    fn reset_accumulators(&mut self) {
        self.accumulators.iter_mut().for_each(|a| *a = 0.);
        self.counts.iter_mut().for_each(|c| *c = 0);
        self.n_samples = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ApproxEq;
    use rand::{rngs::SmallRng, SeedableRng};

    fn settings() -> GridSettings {
        GridSettings {
            n_bins: 16,
            min_samples_for_update: 100,
            learning_rate: 1.5,
            train_on_avg: false,
        }
    }

    #[test]
    fn uniform_grid_reproduces_sampler() {
        let reference = ValueSampler::with_bounds(Density::Flat, 0., 10.);
        let mut grid = AdaptiveGrid::new(reference, &settings());
        assert!(grid.set_bounds(2., 4.));
        let mut rng = SmallRng::seed_from_u64(2);
        for _ in 0..100 {
            assert!(grid.generate(&mut rng));
            assert!(grid.value() >= 2. && grid.value() <= 4.);
            assert!(grid.weight().approx_eq(&2., &1e-12));
        }
    }

    #[test]
    fn reciprocity_after_adaptation() {
        let reference = ValueSampler::with_bounds(Density::Flat, 0., 1.);
        let mut grid = AdaptiveGrid::new(reference, &settings());
        let mut rng = SmallRng::seed_from_u64(4);
        for _ in 0..2000 {
            grid.generate(&mut rng);
            let x = grid.value();
            grid.update(x.powi(4) * grid.weight());
        }
        assert!(grid.adapt());
        for _ in 0..100 {
            assert!(grid.generate(&mut rng));
            let (x, w) = (grid.value(), grid.weight());
            grid.set_value(x);
            assert!(grid.evaluate_weight());
            assert_eq!(w.to_bits(), grid.weight().to_bits());
        }
    }

    #[test]
    fn adaptation_reduces_variance() {
        let f = |x: f64| 5. * x.powi(4);
        let reference = ValueSampler::with_bounds(Density::Flat, 0., 1.);
        let mut grid = AdaptiveGrid::new(reference, &settings());
        let mut rng = SmallRng::seed_from_u64(8);

        let mut variances = vec![];
        for _ in 0..6 {
            let mut stats = crate::statistics::RunningStatistics::new();
            for _ in 0..20000 {
                grid.generate(&mut rng);
                let v = f(grid.value()) * grid.weight();
                stats.add_sample(v);
                grid.update(v);
            }
            assert!(stats.mean().approx_eq(&1., &0.05));
            variances.push(stats.variance());
            grid.adapt();
        }
        assert!(variances[5] < 0.2 * variances[0]);
    }

    #[test]
    fn restricted_range_is_unbiased() {
        let f = |x: f64| 3. * x * x;
        let reference = ValueSampler::with_bounds(Density::Flat, 0., 1.);
        let mut grid = AdaptiveGrid::new(reference, &settings());
        let mut rng = SmallRng::seed_from_u64(9);
        for _ in 0..5000 {
            grid.generate(&mut rng);
            let v = f(grid.value()) * grid.weight();
            grid.update(v);
        }
        grid.adapt();

        assert!(grid.set_bounds(0.25, 0.75));
        let mut stats = crate::statistics::RunningStatistics::new();
        for _ in 0..20000 {
            grid.generate(&mut rng);
            stats.add_sample(f(grid.value()) * grid.weight());
        }
        let exact = 0.75f64.powi(3) - 0.25f64.powi(3);
        assert!((stats.mean() - exact).abs() < 5. * stats.error());
    }

    #[test]
    fn growing_range_keeps_edges_ordered() {
        let reference = ValueSampler::with_bounds(Density::Flat, 1., 2.);
        let mut grid = AdaptiveGrid::new(reference, &settings());
        assert!(grid.set_bounds(0., 4.));
        assert_eq!(grid.reference_bounds(), (0., 4.));
        assert_eq!(grid.n_bins(), 18);
        assert!(grid.edges().windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(grid.edges()[0], 0.);
        assert_eq!(*grid.edges().last().unwrap(), 1.);
        let mut rng = SmallRng::seed_from_u64(1);
        let mut stats = crate::statistics::RunningStatistics::new();
        for _ in 0..10000 {
            grid.generate(&mut rng);
            stats.add_sample(grid.weight());
        }
        assert!((stats.mean() - 4.).abs() < 5. * stats.error());
    }
}
