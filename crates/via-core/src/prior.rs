//! Residual Priors
//!
//! The probability calculator asks a prior how likely a sample at least
//! as unusual as the one observed is. Two implementations are provided:
//! a normal-gamma conjugate prior for scalar residuals, whose predictive
//! distribution is a Student-t, and a multivariate normal prior whose
//! coordinates are evaluated both marginally and conditioned on the
//! other coordinates.

use crate::aggregator::JointProbabilityOfLessLikelySamples;
use crate::stats::{SMALLEST_PROBABILITY, normal_cdf, normal_sf, truncate};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use statrs::distribution::{ContinuousCDF, StudentsT};
use tracing::{debug, error};

/// Smallest predictive variance, relative to the squared mean.
const MINIMUM_COEFFICIENT_OF_VARIATION: f64 = 1e-4;
const MINIMUM_VARIANCE: f64 = 1e-10;

/// Which tail(s) of the predictive distribution count as anomalous.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Calculation {
    #[default]
    TwoSided,
    OneSidedBelow,
    OneSidedAbove,
}

/// The tail a sample fell in.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Tail {
    #[default]
    Undetermined,
    Left,
    Right,
    Mixed,
}

/// Per-sample weights.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct SampleWeights {
    /// How many values the sample stands for.
    pub count: f64,
    /// Seasonal scaling of the residual variance.
    pub seasonal_variance_scale: f64,
    /// Scaling of the variance for the number of values in a statistic.
    pub count_variance_scale: f64,
}

impl Default for SampleWeights {
    fn default() -> Self {
        Self { count: 1.0, seasonal_variance_scale: 1.0, count_variance_scale: 1.0 }
    }
}

impl SampleWeights {
    pub fn variance_scale(&self) -> f64 {
        self.seasonal_variance_scale * self.count_variance_scale
    }

    fn is_valid(&self) -> bool {
        self.count.is_finite()
            && self.count >= 0.0
            && self.variance_scale().is_finite()
            && self.variance_scale() > 0.0
    }
}

/// Probability of a less likely sample given a predictive distribution
/// function value and its complement.
pub fn tail_probability(calculation: Calculation, cdf: f64, sf: f64) -> (f64, Tail) {
    let (p, tail) = match calculation {
        Calculation::TwoSided => {
            let tail = if cdf < sf {
                Tail::Left
            } else if sf < cdf {
                Tail::Right
            } else {
                Tail::Mixed
            };
            (2.0 * cdf.min(sf), tail)
        }
        Calculation::OneSidedBelow => (2.0 * cdf, Tail::Left),
        Calculation::OneSidedAbove => (2.0 * sf, Tail::Right),
    };
    (truncate(p, SMALLEST_PROBABILITY, 1.0), tail)
}

/// A univariate prior for residuals.
pub trait ConjugatePrior {
    fn is_non_informative(&self) -> bool;

    fn add_samples(&mut self, weights: &[SampleWeights], samples: &[f64]);

    /// Age the prior by `time`, measured in the decay rate's units.
    fn propagate_forwards_by_time(&mut self, time: f64);

    fn marginal_likelihood_mean(&self) -> f64;

    /// Lower and upper bounds on the probability of a sample less likely
    /// than `sample`, and the tail it is in. `None` for invalid input.
    fn probability_of_less_likely_samples(
        &self,
        calculation: Calculation,
        weights: &SampleWeights,
        sample: f64,
    ) -> Option<(f64, f64, Tail)>;
}

/// Marginal and conditional probabilities for one coordinate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoordinateProbability {
    pub marginal: f64,
    pub conditional: f64,
    pub tail: Tail,
}

/// A prior for vector residuals.
pub trait MultivariatePrior {
    fn dimension(&self) -> usize;

    fn is_non_informative(&self) -> bool;

    fn add_samples(&mut self, weights: &[SampleWeights], samples: &[Vec<f64>]);

    fn propagate_forwards_by_time(&mut self, time: f64);

    fn marginal_likelihood_mean(&self) -> Vec<f64>;

    /// Probabilities of a less likely value of each of `coordinates`,
    /// both marginally and conditioned on the remaining coordinates.
    /// `weights` has one entry per coordinate.
    fn probability_of_less_likely_samples(
        &self,
        calculation: Calculation,
        weights: &[SampleWeights],
        sample: &[f64],
        coordinates: &[usize],
    ) -> Option<SmallVec<[CoordinateProbability; 2]>>;

    /// Joint probability over every coordinate: the geometric mean of the
    /// joint marginal and joint conditional probabilities.
    fn joint_probability_of_less_likely_samples(
        &self,
        calculation: Calculation,
        weights: &[SampleWeights],
        sample: &[f64],
    ) -> Option<(f64, SmallVec<[Tail; 2]>)> {
        let coordinates: Vec<usize> = (0..self.dimension()).collect();
        let probabilities = self.probability_of_less_likely_samples(calculation, weights, sample, &coordinates)?;
        let mut marginal = JointProbabilityOfLessLikelySamples::new();
        let mut conditional = JointProbabilityOfLessLikelySamples::new();
        let mut tails = SmallVec::new();
        for probability in &probabilities {
            marginal.add(probability.marginal, 1.0);
            conditional.add(probability.conditional, 1.0);
            tails.push(probability.tail);
        }
        let p = (marginal.calculate()? * conditional.calculate()?).sqrt();
        Some((truncate(p, SMALLEST_PROBABILITY, 1.0), tails))
    }
}

/// Normal-gamma prior on the mean and precision of normal residuals.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NormalPrior {
    decay_rate: f64,
    mean: f64,
    /// Pseudo-count for the mean.
    precision: f64,
    shape: f64,
    rate: f64,
    number_samples: f64,
}

impl NormalPrior {
    const NON_INFORMATIVE_SHAPE: f64 = 1.0;

    pub fn non_informative(decay_rate: f64) -> Self {
        Self {
            decay_rate,
            mean: 0.0,
            precision: 0.0,
            shape: Self::NON_INFORMATIVE_SHAPE,
            rate: 0.0,
            number_samples: 0.0,
        }
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    pub fn number_samples(&self) -> f64 {
        self.number_samples
    }

    /// Location, squared scale and degrees of freedom of the predictive.
    fn predictive(&self, variance_scale: f64) -> (f64, f64, f64) {
        let variance = (self.rate / self.shape)
            .max(MINIMUM_COEFFICIENT_OF_VARIATION.powi(2) * self.mean * self.mean)
            .max(MINIMUM_VARIANCE);
        let scale2 = variance * (variance_scale + 1.0 / self.precision);
        (self.mean, scale2, 2.0 * self.shape)
    }
}

impl ConjugatePrior for NormalPrior {
    fn is_non_informative(&self) -> bool {
        self.precision <= 0.0
    }

    fn add_samples(&mut self, weights: &[SampleWeights], samples: &[f64]) {
        let mut precision_weight = 0.0;
        let mut count = 0.0;
        let mut weighted_mean = 0.0;
        let default = SampleWeights::default();
        for (i, x) in samples.iter().enumerate() {
            let w = weights.get(i).unwrap_or(&default);
            if !x.is_finite() || !w.is_valid() {
                error!(sample = x, "discarding invalid sample");
                continue;
            }
            let wi = w.count / w.variance_scale();
            precision_weight += wi;
            count += w.count;
            weighted_mean += wi * x;
        }
        if precision_weight <= 0.0 {
            return;
        }
        weighted_mean /= precision_weight;

        let mut scatter = 0.0;
        for (i, x) in samples.iter().enumerate() {
            let w = weights.get(i).unwrap_or(&default);
            if x.is_finite() && w.is_valid() {
                scatter += w.count / w.variance_scale() * (x - weighted_mean).powi(2);
            }
        }

        let precision = self.precision + precision_weight;
        self.rate += 0.5 * scatter
            + self.precision * precision_weight * (weighted_mean - self.mean).powi(2) / (2.0 * precision);
        self.mean = (self.precision * self.mean + precision_weight * weighted_mean) / precision;
        self.precision = precision;
        self.shape += count / 2.0;
        self.number_samples += count;
    }

    fn propagate_forwards_by_time(&mut self, time: f64) {
        if !time.is_finite() || time < 0.0 {
            error!(time, "bad propagation time");
            return;
        }
        let alpha = (-self.decay_rate * time).exp();
        let shape = Self::NON_INFORMATIVE_SHAPE + alpha * (self.shape - Self::NON_INFORMATIVE_SHAPE);
        self.rate *= shape / self.shape;
        self.shape = shape;
        self.precision *= alpha;
        self.number_samples *= alpha;
    }

    fn marginal_likelihood_mean(&self) -> f64 {
        if self.is_non_informative() { 0.0 } else { self.mean }
    }

    fn probability_of_less_likely_samples(
        &self,
        calculation: Calculation,
        weights: &SampleWeights,
        sample: f64,
    ) -> Option<(f64, f64, Tail)> {
        if !sample.is_finite() || !weights.is_valid() {
            debug!(sample, "invalid sample");
            return None;
        }
        if self.is_non_informative() {
            return Some((1.0, 1.0, Tail::Undetermined));
        }
        let (location, scale2, dof) = self.predictive(weights.variance_scale());
        let t = match StudentsT::new(0.0, 1.0, dof) {
            Ok(t) => t,
            Err(e) => {
                error!(dof, error = %e, "bad predictive distribution");
                return None;
            }
        };
        let z = (sample - location) / scale2.sqrt();
        let (p, tail) = tail_probability(calculation, t.cdf(z), t.sf(z));
        Some((p, p, tail))
    }
}

/// Multivariate normal prior with a maximum likelihood covariance.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MultivariateNormalPrior {
    dimension: usize,
    decay_rate: f64,
    count: f64,
    mean: Vec<f64>,
    /// Row major.
    covariance: Vec<f64>,
}

impl MultivariateNormalPrior {
    pub fn non_informative(dimension: usize, decay_rate: f64) -> Self {
        Self {
            dimension,
            decay_rate,
            count: 0.0,
            mean: vec![0.0; dimension],
            covariance: vec![0.0; dimension * dimension],
        }
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    /// Predictive covariance scaled by the per-coordinate variance scales.
    fn predictive_covariance(&self, weights: &[SampleWeights]) -> Vec<f64> {
        let d = self.dimension;
        let inflation = (self.count + 1.0) / (self.count - 1.0);
        let scales: Vec<f64> = (0..d)
            .map(|i| weights.get(i).map(|w| w.variance_scale()).unwrap_or(1.0).sqrt())
            .collect();
        let mut covariance = vec![0.0; d * d];
        for i in 0..d {
            for j in 0..d {
                covariance[i * d + j] = self.covariance[i * d + j] * inflation * scales[i] * scales[j];
            }
            let floor = (MINIMUM_COEFFICIENT_OF_VARIATION * self.mean[i]).powi(2).max(MINIMUM_VARIANCE);
            covariance[i * d + i] = covariance[i * d + i].max(floor);
        }
        covariance
    }

    /// Mean and variance of coordinate `i` given the others' values.
    fn conditional(&self, covariance: &[f64], i: usize, sample: &[f64]) -> Option<(f64, f64)> {
        let d = self.dimension;
        let others: Vec<usize> = (0..d).filter(|&j| j != i).collect();
        if others.is_empty() {
            return Some((self.mean[i], covariance[i * d + i]));
        }
        let k = others.len();
        let mut system = vec![0.0; k * k];
        for (a, &ja) in others.iter().enumerate() {
            for (b, &jb) in others.iter().enumerate() {
                system[a * k + b] = covariance[ja * d + jb];
            }
        }
        let cross: Vec<f64> = others.iter().map(|&j| covariance[i * d + j]).collect();
        let gain = solve(system, cross.clone(), k)?;
        let mut mean = self.mean[i];
        let mut variance = covariance[i * d + i];
        for (a, &j) in others.iter().enumerate() {
            mean += gain[a] * (sample[j] - self.mean[j]);
            variance -= gain[a] * cross[a];
        }
        Some((mean, variance.max(MINIMUM_VARIANCE)))
    }
}

/// Solve `a x = b` for a small dense system by Gaussian elimination.
fn solve(mut a: Vec<f64>, mut b: Vec<f64>, n: usize) -> Option<Vec<f64>> {
    for col in 0..n {
        let pivot = (col..n).max_by(|&r, &s| a[r * n + col].abs().total_cmp(&a[s * n + col].abs()))?;
        if a[pivot * n + col].abs() < 1e-300 {
            return None;
        }
        if pivot != col {
            for c in 0..n {
                a.swap(col * n + c, pivot * n + c);
            }
            b.swap(col, pivot);
        }
        for r in col + 1..n {
            let f = a[r * n + col] / a[col * n + col];
            for c in col..n {
                a[r * n + c] -= f * a[col * n + c];
            }
            b[r] -= f * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for r in (0..n).rev() {
        let s: f64 = (r + 1..n).map(|c| a[r * n + c] * x[c]).sum();
        x[r] = (b[r] - s) / a[r * n + r];
    }
    Some(x)
}

impl MultivariatePrior for MultivariateNormalPrior {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn is_non_informative(&self) -> bool {
        self.count <= self.dimension as f64 + 1.0
    }

    fn add_samples(&mut self, weights: &[SampleWeights], samples: &[Vec<f64>]) {
        let d = self.dimension;
        for (i, x) in samples.iter().enumerate() {
            let w = weights.get(i).map(|w| w.count).unwrap_or(1.0);
            if x.len() != d || x.iter().any(|v| !v.is_finite()) || !(w > 0.0) {
                error!(dimension = x.len(), expected = d, "discarding invalid sample");
                continue;
            }
            let count = self.count + w;
            let r = w / count;
            let delta: Vec<f64> = x.iter().zip(&self.mean).map(|(x, m)| x - m).collect();
            for a in 0..d {
                self.mean[a] += r * delta[a];
                for b in 0..d {
                    let c = &mut self.covariance[a * d + b];
                    *c = (1.0 - r) * (*c + r * delta[a] * delta[b]);
                }
            }
            self.count = count;
        }
    }

    fn propagate_forwards_by_time(&mut self, time: f64) {
        if !time.is_finite() || time < 0.0 {
            error!(time, "bad propagation time");
            return;
        }
        self.count *= (-self.decay_rate * time).exp();
    }

    fn marginal_likelihood_mean(&self) -> Vec<f64> {
        self.mean.clone()
    }

    fn probability_of_less_likely_samples(
        &self,
        calculation: Calculation,
        weights: &[SampleWeights],
        sample: &[f64],
        coordinates: &[usize],
    ) -> Option<SmallVec<[CoordinateProbability; 2]>> {
        let d = self.dimension;
        if sample.len() != d || sample.iter().any(|x| !x.is_finite()) {
            debug!(dimension = sample.len(), expected = d, "invalid sample");
            return None;
        }
        if coordinates.iter().any(|&i| i >= d) || weights.iter().any(|w| !w.is_valid()) {
            debug!("invalid coordinates or weights");
            return None;
        }
        if self.is_non_informative() {
            return Some(
                coordinates
                    .iter()
                    .map(|_| CoordinateProbability { marginal: 1.0, conditional: 1.0, tail: Tail::Undetermined })
                    .collect(),
            );
        }
        let covariance = self.predictive_covariance(weights);
        let mut result = SmallVec::new();
        for &i in coordinates {
            let z = (sample[i] - self.mean[i]) / covariance[i * d + i].sqrt();
            let (marginal, tail) = tail_probability(calculation, normal_cdf(z), normal_sf(z));
            let (mean, variance) = self.conditional(&covariance, i, sample)?;
            let z = (sample[i] - mean) / variance.sqrt();
            let (conditional, _) = tail_probability(calculation, normal_cdf(z), normal_sf(z));
            result.push(CoordinateProbability { marginal, conditional, tail });
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn trained(mean: f64, n: usize) -> NormalPrior {
        let mut rng = StdRng::seed_from_u64(7);
        let normal = Normal::new(mean, 1.0).unwrap();
        let samples: Vec<f64> = (0..n).map(|_| normal.sample(&mut rng)).collect();
        let mut prior = NormalPrior::non_informative(0.0);
        prior.add_samples(&vec![SampleWeights::default(); n], &samples);
        prior
    }

    #[test]
    fn test_tail_probability() {
        assert_eq!(tail_probability(Calculation::TwoSided, 0.1, 0.9), (0.2, Tail::Left));
        assert_eq!(tail_probability(Calculation::TwoSided, 0.5, 0.5), (1.0, Tail::Mixed));
        assert_eq!(tail_probability(Calculation::OneSidedBelow, 0.8, 0.2), (1.0, Tail::Left));
        assert_eq!(tail_probability(Calculation::OneSidedAbove, 0.8, 0.2), (0.4, Tail::Right));
    }

    #[test]
    fn test_non_informative_is_uninformative() {
        let prior = NormalPrior::non_informative(0.01);
        assert!(prior.is_non_informative());
        let (lb, ub, tail) = prior
            .probability_of_less_likely_samples(Calculation::TwoSided, &SampleWeights::default(), 100.0)
            .unwrap();
        assert_eq!((lb, ub, tail), (1.0, 1.0, Tail::Undetermined));
    }

    #[test]
    fn test_normal_prior_learns_mean() {
        let prior = trained(10.0, 200);
        assert!((prior.marginal_likelihood_mean() - 10.0).abs() < 0.2);

        let (p, _, _) = prior
            .probability_of_less_likely_samples(Calculation::TwoSided, &SampleWeights::default(), 10.0)
            .unwrap();
        assert!(p > 0.5, "p = {}", p);

        let (p, _, tail) = prior
            .probability_of_less_likely_samples(Calculation::TwoSided, &SampleWeights::default(), 20.0)
            .unwrap();
        assert!(p < 1e-6, "p = {}", p);
        assert_eq!(tail, Tail::Right);

        let (p, _, tail) = prior
            .probability_of_less_likely_samples(Calculation::OneSidedAbove, &SampleWeights::default(), 0.0)
            .unwrap();
        assert_eq!((p, tail), (1.0, Tail::Right));
    }

    #[test]
    fn test_variance_scale_widens_predictive() {
        let prior = trained(10.0, 100);
        let narrow = SampleWeights::default();
        let wide = SampleWeights { count_variance_scale: 4.0, ..SampleWeights::default() };
        let (p1, _, _) = prior.probability_of_less_likely_samples(Calculation::TwoSided, &narrow, 13.0).unwrap();
        let (p2, _, _) = prior.probability_of_less_likely_samples(Calculation::TwoSided, &wide, 13.0).unwrap();
        assert!(p2 > p1);
    }

    #[test]
    fn test_rejects_invalid_samples() {
        let prior = trained(10.0, 20);
        let weights = SampleWeights::default();
        assert!(prior.probability_of_less_likely_samples(Calculation::TwoSided, &weights, f64::NAN).is_none());
        let bad = SampleWeights { seasonal_variance_scale: 0.0, ..SampleWeights::default() };
        assert!(prior.probability_of_less_likely_samples(Calculation::TwoSided, &bad, 1.0).is_none());
    }

    #[test]
    fn test_propagation_forgets() {
        let mut prior = trained(10.0, 50);
        prior.decay_rate = 0.5;
        let before = prior.number_samples();
        prior.propagate_forwards_by_time(2.0);
        assert!(prior.number_samples() < before);
        assert!((prior.marginal_likelihood_mean() - 10.0).abs() < 0.5);
    }

    #[test]
    fn test_multivariate_conditional_uses_correlation() {
        let mut rng = StdRng::seed_from_u64(11);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut prior = MultivariateNormalPrior::non_informative(2, 0.0);
        let samples: Vec<Vec<f64>> = (0..500)
            .map(|_| {
                let x = normal.sample(&mut rng);
                let e = 0.1 * normal.sample(&mut rng);
                vec![10.0 + x, 20.0 + x + e]
            })
            .collect();
        prior.add_samples(&vec![SampleWeights::default(); samples.len()], &samples);
        assert!(!prior.is_non_informative());

        // Marginally plausible but breaks the correlation.
        let weights = [SampleWeights::default(); 2];
        let p = prior
            .probability_of_less_likely_samples(Calculation::TwoSided, &weights, &[11.0, 19.0], &[0])
            .unwrap();
        assert!(p[0].marginal > 0.1, "marginal = {}", p[0].marginal);
        assert!(p[0].conditional < 1e-6, "conditional = {}", p[0].conditional);

        let (joint, tails) = prior
            .joint_probability_of_less_likely_samples(Calculation::TwoSided, &weights, &[11.0, 19.0])
            .unwrap();
        assert!(joint < 0.01);
        assert_eq!(tails.len(), 2);
    }

    #[test]
    fn test_solve() {
        let x = solve(vec![2.0, 1.0, 1.0, 3.0], vec![3.0, 5.0], 2).unwrap();
        assert!((x[0] - 0.8).abs() < 1e-12);
        assert!((x[1] - 1.4).abs() < 1e-12);
        assert!(solve(vec![0.0], vec![1.0], 1).is_none());
    }
}
