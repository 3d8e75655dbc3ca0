//! Replay
//!
//! Feeds generated buckets through a decomposition and a residual prior,
//! one bucket at a time, scoring each bucket before the models learn it.

use crate::generator::Bucket;
use serde::Serialize;
use tracing::{debug, info};
use via_core::time::{DAY, Time};
use via_core::{
    CalculatorConfig, ConjugatePrior, DecompositionConfig, Feature, InfluencerValue, Interner, NormalPrior, Params,
    ProbabilityAndInfluenceCalculator, SampleWeights, SimpleAnnotatedProbability, TrendDecomposition,
};

const INFLUENCER: &str = "host";

/// Number of residuals the prior must see before buckets are scored.
const WARM_UP_SAMPLES: f64 = 48.0;

/// Score of one bucket.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub index: usize,
    pub time: Time,
    pub value: f64,
    pub baseline: f64,
    pub probability: f64,
    pub influences: Vec<(String, String, f64)>,
    pub anomalous: bool,
}

/// Baseline and actual value at one bucket.
#[derive(Debug, Clone, Serialize)]
pub struct BaselinePoint {
    pub time: Time,
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
}

pub struct Detector {
    decomposition: TrendDecomposition,
    prior: NormalPrior,
    calculator_config: CalculatorConfig,
    interner: Interner,
    bucket_length: Time,
    confidence: f64,
}

impl Detector {
    pub fn new(decomposition: &DecompositionConfig, calculator: &CalculatorConfig) -> Self {
        Self {
            decomposition: TrendDecomposition::with_config(decomposition),
            prior: NormalPrior::non_informative(decomposition.decay_rate),
            calculator_config: calculator.clone(),
            interner: Interner::new(),
            bucket_length: decomposition.bucket_length,
            confidence: 0.0,
        }
    }

    pub fn decomposition(&self) -> &TrendDecomposition {
        &self.decomposition
    }

    /// Score `bucket`, then learn it. Returns `None` while warming up or
    /// if no probability could be computed.
    pub fn process(&mut self, bucket: &Bucket) -> Option<Report> {
        let report = self.score(bucket);
        self.learn(bucket);
        report
    }

    fn weights(&self, time: Time) -> SampleWeights {
        let (_, scale) = self.decomposition.scale(time, self.decomposition.mean_variance(), self.confidence);
        SampleWeights { seasonal_variance_scale: if scale > 0.0 { scale } else { 1.0 }, ..SampleWeights::default() }
    }

    fn score(&mut self, bucket: &Bucket) -> Option<Report> {
        if self.prior.number_samples() < WARM_UP_SAMPLES {
            return None;
        }
        let time = bucket.time;
        let sample = self.decomposition.detrend(time, bucket.value, self.confidence);
        let weights = self.weights(time);

        let mut calculator = ProbabilityAndInfluenceCalculator::with_config(&self.calculator_config);
        calculator.plug_influence_calculator(Feature::Sum.influence_calculator());
        let (probability, tail) =
            calculator.add_probability(Feature::Sum, &self.prior, 0, &weights, sample, false, 0.0, 1.0)?;

        let mut params = Params::new(Feature::Sum, &self.prior);
        params.trend = Some(&self.decomposition);
        params.time = time;
        params.value = [bucket.value].into_iter().collect();
        params.count = bucket.hosts.len() as f64;
        params.sample = sample;
        params.weights = weights;
        params.probability = probability;
        params.tail = tail;
        params.confidence = self.confidence;
        let values = bucket.hosts.iter().map(|(host, value)| InfluencerValue::new(host, &[*value], 1.0)).collect();
        calculator.add_influences(&mut self.interner, INFLUENCER, values, &mut params, 1.0);

        let mut result = SimpleAnnotatedProbability::new();
        if !result.finish(&calculator, &self.interner) {
            return None;
        }
        let (lower, upper) = self.decomposition.baseline(time, self.confidence);
        Some(Report {
            index: bucket.index,
            time,
            value: bucket.value,
            baseline: (lower + upper) / 2.0,
            probability: result.probability.unwrap_or(1.0),
            influences: result.influences,
            anomalous: bucket.anomalous,
        })
    }

    fn learn(&mut self, bucket: &Bucket) {
        let time = bucket.time;
        if self.decomposition.add_point(time, bucket.value) {
            info!(time, "seasonal components changed, resetting residual model");
            debug!(description = %self.decomposition.describe(), "decomposition");
            self.prior = NormalPrior::non_informative(self.prior.decay_rate());
        }
        let sample = self.decomposition.detrend(time, bucket.value, self.confidence);
        let weights = self.weights(time);
        self.prior.add_samples(&[weights], &[sample]);
        self.prior.propagate_forwards_by_time(self.bucket_length as f64 / DAY as f64);
        self.decomposition.propagate_forwards_to(time);
    }

    pub fn baseline(&self, bucket: &Bucket, confidence: f64) -> BaselinePoint {
        let (lower, upper) = self.decomposition.baseline(bucket.time, confidence);
        BaselinePoint { time: bucket.time, value: bucket.value, lower, upper }
    }

    /// Learn `bucket` without scoring it.
    pub fn observe(&mut self, bucket: &Bucket) {
        self.learn(bucket);
    }
}

/// Score every bucket, returning those with probability below `threshold`.
pub fn replay(buckets: &[Bucket], detector: &mut Detector, threshold: f64) -> Vec<Report> {
    let mut anomalies = Vec::new();
    for bucket in buckets {
        if let Some(report) = detector.process(bucket) {
            if report.probability < threshold {
                info!(index = report.index, probability = report.probability, "anomalous bucket");
                anomalies.push(report);
            }
        }
    }
    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{Anomaly, SeriesConfig, generate, host_name};

    #[test]
    fn test_replay_finds_injected_anomaly() {
        let series = SeriesConfig {
            days: 21,
            seed: 3,
            anomaly: Some(Anomaly { bucket: 20 * 24 + 6, scale: 3.0 }),
            ..SeriesConfig::default()
        };
        let buckets = generate(&series);
        let mut detector = Detector::new(&DecompositionConfig::default(), &CalculatorConfig::default());
        let anomalies = replay(&buckets, &mut detector, 0.01);

        let report = anomalies.iter().find(|r| r.anomalous).expect("injected anomaly is reported");
        assert!(report.probability < 0.01);
        let (name, value, score) = &report.influences[0];
        assert_eq!(name, INFLUENCER);
        assert_eq!(value, &host_name(0));
        assert!(*score > 0.5);
    }

    #[test]
    fn test_warm_up_buckets_are_not_scored() {
        let buckets = generate(&SeriesConfig { days: 1, ..SeriesConfig::default() });
        let mut detector = Detector::new(&DecompositionConfig::default(), &CalculatorConfig::default());
        for bucket in &buckets {
            assert!(detector.process(bucket).is_none());
        }
    }
}
