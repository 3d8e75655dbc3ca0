//! Probability Aggregation
//!
//! Combines many probabilities into one. Two aggregators are available:
//!
//! - `JointProbabilityOfLessLikelySamples` treats the probabilities as
//!   independent and asks how likely a collection at least this
//!   unusual is. Each probability is mapped to the squared normal
//!   deviation with the same two-sided tail, and the sum is referred
//!   to a chi-squared distribution.
//! - `ProbabilityOfExtremeSample` asks how likely the smallest of `n`
//!   uniform probabilities is to be at least this small.
//!
//! `ProbabilityAggregator` runs a set of these side by side and reduces
//! their results by minimum or by weighted mean.

use crate::stats::{SMALLEST_PROBABILITY, normal_quantile, truncate};
use serde::{Deserialize, Serialize};
use statrs::function::gamma::checked_gamma_ur;
use tracing::{error, trace};

/// Joint probability of a collection of independent samples.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct JointProbabilityOfLessLikelySamples {
    /// Set while exactly one unit weight probability has been added.
    only_probability: Option<f64>,
    distance: f64,
    number_samples: f64,
}

impl JointProbabilityOfLessLikelySamples {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, probability: f64, weight: f64) {
        if !probability.is_finite() || !weight.is_finite() || weight <= 0.0 {
            error!(probability, weight, "bad probability");
            return;
        }
        let p = truncate(probability, SMALLEST_PROBABILITY, 1.0);
        self.only_probability = if self.number_samples == 0.0 && weight == 1.0 { Some(p) } else { None };
        let deviation = normal_quantile(p / 2.0);
        self.distance += weight * deviation * deviation;
        self.number_samples += weight;
    }

    pub fn merge(&mut self, other: &JointProbabilityOfLessLikelySamples) {
        if other.number_samples == 0.0 {
            return;
        }
        self.only_probability = match (self.number_samples == 0.0, other.only_probability) {
            (true, only) => only,
            _ => None,
        };
        self.distance += other.distance;
        self.number_samples += other.number_samples;
    }

    pub fn number_samples(&self) -> f64 {
        self.number_samples
    }

    pub fn calculate(&self) -> Option<f64> {
        if self.number_samples == 0.0 {
            return Some(1.0);
        }
        if let Some(p) = self.only_probability {
            return Some(p);
        }
        if self.distance == 0.0 {
            return Some(1.0);
        }
        match checked_gamma_ur(self.number_samples / 2.0, self.distance / 2.0) {
            Ok(p) => Some(truncate(p, SMALLEST_PROBABILITY, 1.0)),
            Err(e) => {
                let (n, distance) = (self.number_samples, self.distance);
                error!(n, distance, error = %e, "failed to compute joint probability");
                None
            }
        }
    }
}

/// Probability of seeing a sample at least as extreme as the most
/// extreme of a collection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProbabilityOfExtremeSample {
    min_probability: f64,
    number_samples: f64,
}

impl Default for ProbabilityOfExtremeSample {
    fn default() -> Self {
        Self { min_probability: 1.0, number_samples: 0.0 }
    }
}

impl ProbabilityOfExtremeSample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, probability: f64, weight: f64) {
        if !probability.is_finite() || !weight.is_finite() || weight <= 0.0 {
            error!(probability, weight, "bad probability");
            return;
        }
        self.min_probability = self.min_probability.min(truncate(probability, SMALLEST_PROBABILITY, 1.0));
        self.number_samples += weight;
    }

    pub fn merge(&mut self, other: &ProbabilityOfExtremeSample) {
        self.min_probability = self.min_probability.min(other.min_probability);
        self.number_samples += other.number_samples;
    }

    pub fn number_samples(&self) -> f64 {
        self.number_samples
    }

    pub fn calculate(&self) -> Option<f64> {
        if self.number_samples == 0.0 {
            return Some(1.0);
        }
        // 1 - (1 - p)^n without cancellation for small p.
        let p = -(self.number_samples * (-self.min_probability).ln_1p()).exp_m1();
        Some(truncate(p, SMALLEST_PROBABILITY, 1.0))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum Aggregator {
    Joint(JointProbabilityOfLessLikelySamples),
    Extreme(ProbabilityOfExtremeSample),
}

impl Aggregator {
    pub fn joint() -> Self {
        Aggregator::Joint(JointProbabilityOfLessLikelySamples::new())
    }

    pub fn extreme() -> Self {
        Aggregator::Extreme(ProbabilityOfExtremeSample::new())
    }

    pub fn add(&mut self, probability: f64, weight: f64) {
        match self {
            Aggregator::Joint(joint) => joint.add(probability, weight),
            Aggregator::Extreme(extreme) => extreme.add(probability, weight),
        }
    }

    pub fn calculate(&self) -> Option<f64> {
        match self {
            Aggregator::Joint(joint) => joint.calculate(),
            Aggregator::Extreme(extreme) => extreme.calculate(),
        }
    }
}

/// How the results of the individual aggregators are reduced.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStyle {
    /// Weighted mean of the aggregated probabilities.
    Sum,
    /// The smallest aggregated probability.
    #[default]
    Min,
}

/// A weighted set of aggregators fed the same probabilities.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProbabilityAggregator {
    style: AggregationStyle,
    total_weight: f64,
    aggregators: Vec<(Aggregator, f64)>,
}

impl ProbabilityAggregator {
    pub fn new(style: AggregationStyle) -> Self {
        Self { style, total_weight: 0.0, aggregators: Vec::new() }
    }

    pub fn style(&self) -> AggregationStyle {
        self.style
    }

    /// Add an aggregator whose result counts with `weight`.
    pub fn add_aggregator(&mut self, aggregator: Aggregator, weight: f64) {
        self.aggregators.push((aggregator, weight));
    }

    pub fn empty(&self) -> bool {
        self.total_weight == 0.0
    }

    pub fn add(&mut self, probability: f64, weight: f64) {
        self.total_weight += weight;
        for (aggregator, _) in &mut self.aggregators {
            aggregator.add(probability, weight);
        }
    }

    /// The aggregate probability, or `None` if nothing was added.
    pub fn calculate(&self) -> Option<f64> {
        if self.total_weight == 0.0 {
            trace!("no probabilities to aggregate");
            return None;
        }
        if self.aggregators.is_empty() {
            error!("no aggregators configured");
            return None;
        }
        let mut result = match self.style {
            AggregationStyle::Sum => 0.0,
            AggregationStyle::Min => 1.0,
        };
        let mut n = 0.0;
        for (aggregator, weight) in &self.aggregators {
            let p = aggregator.calculate()?;
            match self.style {
                AggregationStyle::Sum => {
                    result += weight * p;
                    n += weight;
                }
                AggregationStyle::Min => result = f64::min(result, p),
            }
        }
        if self.style == AggregationStyle::Sum {
            if n <= 0.0 {
                error!(n, "non-positive aggregator weights");
                return None;
            }
            result /= n;
        }
        Some(truncate(result, SMALLEST_PROBABILITY, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joint_single_probability_is_exact() {
        let mut joint = JointProbabilityOfLessLikelySamples::new();
        assert_eq!(joint.calculate(), Some(1.0));
        joint.add(0.01, 1.0);
        assert_eq!(joint.calculate(), Some(0.01));
    }

    #[test]
    fn test_joint_of_two_matches_chi_squared() {
        let mut joint = JointProbabilityOfLessLikelySamples::new();
        joint.add(0.05, 1.0);
        joint.add(0.05, 1.0);
        // Two deviations of 1.959964 give chi-squared(2) at 7.683, i.e. exp(-7.683 / 2).
        let expected = (-(1.959964f64.powi(2))).exp();
        let p = joint.calculate().unwrap();
        assert!((p - expected).abs() < 1e-5, "p = {}", p);
        assert!(p < 0.05);
    }

    #[test]
    fn test_joint_of_ones_is_one() {
        let mut joint = JointProbabilityOfLessLikelySamples::new();
        for _ in 0..5 {
            joint.add(1.0, 1.0);
        }
        assert_eq!(joint.calculate(), Some(1.0));
    }

    #[test]
    fn test_extreme_sample() {
        let mut extreme = ProbabilityOfExtremeSample::new();
        extreme.add(0.1, 1.0);
        extreme.add(0.5, 1.0);
        let p = extreme.calculate().unwrap();
        assert!((p - 0.19).abs() < 1e-12);

        let mut weighted = ProbabilityOfExtremeSample::new();
        weighted.add(1e-10, 3.0);
        assert!((weighted.calculate().unwrap() - 3e-10).abs() < 1e-18);
    }

    #[test]
    fn test_aggregator_min_and_sum() {
        let mut min = ProbabilityAggregator::new(AggregationStyle::Min);
        min.add_aggregator(Aggregator::joint(), 1.0);
        min.add_aggregator(Aggregator::extreme(), 1.0);
        assert!(min.empty());
        assert_eq!(min.calculate(), None);

        let mut sum = min.clone();
        sum.style = AggregationStyle::Sum;
        for p in [0.1, 0.5] {
            min.add(p, 1.0);
            sum.add(p, 1.0);
        }
        let mut joint = JointProbabilityOfLessLikelySamples::new();
        joint.add(0.1, 1.0);
        joint.add(0.5, 1.0);
        let pj = joint.calculate().unwrap();

        assert!((min.calculate().unwrap() - pj.min(0.19)).abs() < 1e-12);
        assert!((sum.calculate().unwrap() - (pj + 0.19) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_aggregator_without_aggregators_fails() {
        let mut aggregator = ProbabilityAggregator::new(AggregationStyle::Min);
        aggregator.add(0.5, 1.0);
        assert_eq!(aggregator.calculate(), None);
    }
}
