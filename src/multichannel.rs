//! Adaptive combination of several sampling channels into one estimator.
//!
//! Every point is drawn from channel `i` with probability `α_i` and carries
//! the weight `1 / Σ_j α_j / w_j`, where `w_j` is the weight with which channel
//! `j` would have produced the same point. The `α_j` are adapted from the
//! accumulated variance contributions after Kleiss and Pittau.

use log::debug;

use crate::random::RandomSource;
use crate::MultiChannelingSettings;

/// A generator that can produce a point in a shared context and score points
/// produced by others.
pub trait Sampleable<Ctx: ?Sized> {
    /// Generate a point into `ctx` and return its weight, zero on failure.
    fn generate<R: RandomSource + ?Sized>(&mut self, ctx: &mut Ctx, rng: &mut R) -> f64;

    /// Weight with which this channel would have produced the point in `ctx`.
    fn evaluate_weight(&mut self, ctx: &mut Ctx) -> f64;

    /// Accumulate the weighted integrand of the last point.
    fn update(&mut self, _ctx: &mut Ctx, _value: f64) {}

    fn adapt(&mut self, _ctx: &mut Ctx) {}
}

#[derive(Debug, Clone)]
pub struct MultiChannel<C> {
    channels: Vec<C>,
    alphas: Vec<f64>,
    accumulators: Vec<f64>,
    weights: Vec<f64>,
    beta: f64,
    pruning_threshold: f64,
    selected: Option<usize>,
    weight: f64,
}

impl<C> MultiChannel<C> {
    pub fn new(channels: Vec<C>, settings: &MultiChannelingSettings) -> Self {
        Self::with_parameters(channels, settings.beta, settings.pruning_threshold)
    }

    pub fn with_parameters(channels: Vec<C>, beta: f64, pruning_threshold: f64) -> Self {
        let mut multichannel = MultiChannel {
            channels,
            alphas: vec![],
            accumulators: vec![],
            weights: vec![],
            beta,
            pruning_threshold,
            selected: None,
            weight: 0.,
        };
        multichannel.reset_alphas();
        multichannel
    }

    fn reset_alphas(&mut self) {
        let n = self.channels.len();
        self.alphas = vec![1. / n.max(1) as f64; n];
        self.accumulators = vec![0.; n];
        self.weights = vec![0.; n];
        self.selected = None;
        self.weight = 0.;
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channels(&self) -> &[C] {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut [C] {
        &mut self.channels
    }

    /// Adding a channel restarts the adaptation from uniform probabilities.
    pub fn add_channel(&mut self, channel: C) {
        self.channels.push(channel);
        self.reset_alphas();
    }

    pub fn remove_channel(&mut self, index: usize) -> Option<C> {
        if index >= self.channels.len() {
            return None;
        }
        let channel = self.channels.remove(index);
        self.reset_alphas();
        Some(channel)
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    /// Install externally determined probabilities, which are renormalised.
    /// Returns `false` and leaves the state untouched on a length mismatch or
    /// when the probabilities do not sum to a positive value.
    pub fn set_alphas(&mut self, alphas: &[f64]) -> bool {
        let total: f64 = alphas.iter().sum();
        if alphas.len() != self.channels.len()
            || !(total > 0.)
            || alphas.iter().any(|a| !(*a >= 0.) || !a.is_finite())
        {
            return false;
        }
        self.alphas = alphas.iter().map(|a| a / total).collect();
        true
    }

    /// Per-channel weights of the last point.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn accumulators(&self) -> &[f64] {
        &self.accumulators
    }

    /// Channel that generated the last point.
    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    /// Combined weight of the last point.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Draw a channel index with probability `α_i`.
    pub fn select<R: RandomSource + ?Sized>(&self, rng: &mut R) -> usize {
        if self.channels.len() == 1 {
            return 0;
        }
        let r = rng.uniform();
        let mut cumulative = 0.;
        let mut last_active = 0;
        for (i, alpha) in self.alphas.iter().enumerate() {
            if *alpha <= 0. {
                continue;
            }
            cumulative += alpha;
            last_active = i;
            if r < cumulative {
                return i;
            }
        }
        last_active
    }

    /// `1 / Σ α_i / w_i` over the active channels, exactly zero as soon as an
    /// active channel cannot produce the point.
    fn combine(&self) -> f64 {
        let mut denominator = 0.;
        for (alpha, w) in self.alphas.iter().zip(&self.weights) {
            if *alpha <= 0. {
                continue;
            }
            if !(*w > 0.) || !w.is_finite() {
                return 0.;
            }
            denominator += alpha / w;
        }
        if denominator > 0. && denominator.is_finite() {
            1. / denominator
        } else {
            0.
        }
    }

    /// Generate a point from a randomly selected channel and score it with
    /// every other active channel.
    pub fn generate<Ctx: ?Sized, R: RandomSource + ?Sized>(
        &mut self,
        ctx: &mut Ctx,
        rng: &mut R,
    ) -> f64
    where
        C: Sampleable<Ctx>,
    {
        self.weight = 0.;
        self.weights.iter_mut().for_each(|w| *w = 0.);
        if self.channels.is_empty() {
            self.selected = None;
            return 0.;
        }
        let selected = self.select(rng);
        self.selected = Some(selected);
        let w = self.channels[selected].generate(ctx, rng);
        if !(w > 0.) || !w.is_finite() {
            return 0.;
        }
        self.weights[selected] = w;
        for i in 0..self.channels.len() {
            if i != selected && self.alphas[i] > 0. {
                self.weights[i] = self.channels[i].evaluate_weight(ctx);
            }
        }
        self.weight = self.combine();
        self.weight
    }

    /// Combined weight of a point placed in `ctx` by someone else.
    pub fn evaluate_weight<Ctx: ?Sized>(&mut self, ctx: &mut Ctx) -> f64
    where
        C: Sampleable<Ctx>,
    {
        self.selected = None;
        for i in 0..self.channels.len() {
            self.weights[i] = if self.alphas[i] > 0. {
                self.channels[i].evaluate_weight(ctx)
            } else {
                0.
            };
        }
        self.weight = self.combine();
        self.weight
    }

    /// Recombine the cached channel weights, e.g. after new probabilities were
    /// installed, without scoring the point again.
    pub fn recombine(&mut self) -> f64 {
        self.weight = self.combine();
        self.weight
    }

    /// Accumulate `W_i += value² w / w_i` for the last point, with `value` the
    /// integrand times the combined weight, then forward to every channel.
    pub fn update<Ctx: ?Sized>(&mut self, ctx: &mut Ctx, value: f64)
    where
        C: Sampleable<Ctx>,
    {
        if !value.is_finite() {
            return;
        }
        if self.weight > 0. {
            for i in 0..self.channels.len() {
                let w_i = self.weights[i];
                if self.alphas[i] > 0. && w_i > 0. && w_i.is_finite() {
                    self.accumulators[i] += value * value * self.weight / w_i;
                }
            }
        }
        for channel in self.channels.iter_mut() {
            channel.update(ctx, value);
        }
    }

    /// Rescale `α_i *= W_i^β`, renormalise and switch off channels below the
    /// pruning threshold, then adapt every channel.
    pub fn adapt<Ctx: ?Sized>(&mut self, ctx: &mut Ctx)
    where
        C: Sampleable<Ctx>,
    {
        self.adapt_alphas();
        for channel in self.channels.iter_mut() {
            channel.adapt(ctx);
        }
    }

    fn adapt_alphas(&mut self) {
        let n = self.channels.len();
        if n < 2 {
            self.accumulators.iter_mut().for_each(|a| *a = 0.);
            return;
        }
        let scaled: Vec<f64> = self
            .alphas
            .iter()
            .zip(&self.accumulators)
            .map(|(alpha, acc)| {
                if *alpha > 0. && *acc > 0. {
                    alpha * acc.powf(self.beta)
                } else {
                    0.
                }
            })
            .collect();
        let total: f64 = scaled.iter().sum();
        // without any information keep the old probabilities
        if !(total > 0.) || !total.is_finite() {
            self.accumulators.iter_mut().for_each(|a| *a = 0.);
            return;
        }
        let mut alphas: Vec<f64> = scaled.iter().map(|a| a / total).collect();

        let cut = self.pruning_threshold / n as f64;
        for alpha in alphas.iter_mut() {
            if *alpha < cut {
                *alpha = 0.;
            }
        }
        let total: f64 = alphas.iter().sum();
        if total > 0. {
            alphas.iter_mut().for_each(|a| *a /= total);
            self.alphas = alphas;
        }
        debug!("Adapted channel probabilities: {:?}", self.alphas);
        self.accumulators.iter_mut().for_each(|a| *a = 0.);
    }
}

impl<Ctx: ?Sized, C: Sampleable<Ctx>> Sampleable<Ctx> for MultiChannel<C> {
    fn generate<R: RandomSource + ?Sized>(&mut self, ctx: &mut Ctx, rng: &mut R) -> f64 {
        MultiChannel::generate(self, ctx, rng)
    }

    fn evaluate_weight(&mut self, ctx: &mut Ctx) -> f64 {
        MultiChannel::evaluate_weight(self, ctx)
    }

    fn update(&mut self, ctx: &mut Ctx, value: f64) {
        MultiChannel::update(self, ctx, value)
    }

    fn adapt(&mut self, ctx: &mut Ctx) {
        MultiChannel::adapt(self, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::test_sources::Sequence;
    use crate::sampler::{Density, ValueSampler};
    use crate::statistics::PowerSums;
    use crate::utils::ApproxEq;
    use rand::{rngs::SmallRng, SeedableRng};

    /// One-dimensional channel sharing the sampled point through the context.
    struct Line(ValueSampler);

    impl Sampleable<f64> for Line {
        fn generate<R: RandomSource + ?Sized>(&mut self, x: &mut f64, rng: &mut R) -> f64 {
            if self.0.generate(rng) {
                *x = self.0.value();
                self.0.weight()
            } else {
                0.
            }
        }

        fn evaluate_weight(&mut self, x: &mut f64) -> f64 {
            if self.0.evaluate_weight_at(*x) {
                self.0.weight()
            } else {
                0.
            }
        }
    }

    fn line(density: Density) -> Line {
        Line(ValueSampler::with_bounds(density, 0., 1.))
    }

    fn quadratic_and_flat(beta: f64, threshold: f64) -> MultiChannel<Line> {
        MultiChannel::with_parameters(
            vec![
                line(Density::PowerLaw {
                    exponent: -2.,
                    offset: 0.,
                }),
                line(Density::Flat),
            ],
            beta,
            threshold,
        )
    }

    #[test]
    fn reciprocal_sum_of_channel_weights() {
        let mut mc = quadratic_and_flat(0.5, 0.01);
        let mut x = 0.;
        // the flat channel is selected by the first variate and maps the second to x = 0.5
        let mut rng = Sequence::new(vec![0.9, 0.5]);
        let w = mc.generate(&mut x, &mut rng);
        assert_eq!(mc.selected(), Some(1));
        assert_eq!(x, 0.5);
        // the quadratic channel has density 3x²
        let w1 = 1. / 0.75;
        assert!(mc.weights()[0].approx_eq(&w1, &1e-14));
        assert_eq!(mc.weights()[1], 1.);
        assert!(w.approx_eq(&(1. / (0.5 / w1 + 0.5 / 1.)), &1e-14));
    }

    #[test]
    fn unreachable_point_has_zero_weight() {
        let mut mc = MultiChannel::with_parameters(
            vec![
                Line(ValueSampler::with_bounds(Density::Flat, 0., 1.)),
                Line(ValueSampler::with_bounds(Density::Flat, 0., 0.5)),
            ],
            0.5,
            0.01,
        );
        let mut rng = Sequence::new(vec![0.1, 0.8]);
        let w = mc.generate(&mut 0., &mut rng);
        assert_eq!(mc.selected(), Some(0));
        assert_eq!(mc.weights()[1], 0.);
        assert_eq!(w, 0.);

        // switching the restricted channel off removes the guard
        assert!(mc.set_alphas(&[1., 0.]));
        let mut x = 0.8;
        assert_eq!(mc.evaluate_weight(&mut x), 1.);
    }

    #[test]
    fn single_channel_draws_no_selection_variate() {
        let mut mc = MultiChannel::with_parameters(vec![line(Density::Flat)], 0.5, 0.01);
        let mut x = 0.;
        let mut rng = Sequence::new(vec![0.25]);
        assert_eq!(mc.generate(&mut x, &mut rng), 1.);
        assert_eq!(x, 0.25);
    }

    #[test]
    fn adding_a_channel_resets_probabilities() {
        let mut mc = quadratic_and_flat(0.5, 0.01);
        assert!(mc.set_alphas(&[3., 1.]));
        assert_eq!(mc.alphas(), &[0.75, 0.25]);
        mc.add_channel(line(Density::Flat));
        assert_eq!(mc.alphas(), &[1. / 3.; 3]);
        assert!(mc.remove_channel(2).is_some());
        assert_eq!(mc.alphas(), &[0.5, 0.5]);
        assert!(!mc.set_alphas(&[1.]));
    }

    #[test]
    fn adaptation_converges_to_the_matching_channel() {
        let mut mc = quadratic_and_flat(1.0, 0.2);
        let mut rng = SmallRng::seed_from_u64(7);
        let integrand = |x: f64| 3. * x * x;
        let mut variances = vec![];

        for _ in 0..12 {
            let mut sums = PowerSums::default();
            for _ in 0..20_000 {
                let mut x = 0.;
                let w = mc.generate(&mut x, &mut rng);
                let value = integrand(x) * w;
                sums.add(value);
                mc.update(&mut x, value);
            }
            assert!(sums.mean().approx_eq(&1., &0.05));
            variances.push(sums.sample_variance());
            mc.adapt(&mut 0.);
        }

        assert_eq!(mc.alphas(), &[1., 0.]);
        assert!(variances[11] < variances[0]);
        assert!(variances[11] < 1e-20);
        // no adaptation step makes the estimate noisier beyond sampling noise
        for (i, pair) in variances.windows(2).enumerate() {
            assert!(
                pair[1] <= pair[0] * 1.1 + 1e-20,
                "variance grew after adaptation {}: {:?}",
                i + 1,
                variances
            );
        }
    }
}
