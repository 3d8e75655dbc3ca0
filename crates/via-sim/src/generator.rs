//! Synthetic Bucket Generator
//!
//! Produces a bucketed metric with a daily cycle, a linear trend and
//! Gaussian noise, split across a set of hosts. An anomaly can be
//! injected into one bucket, in which case the first host carries all
//! of the excess so the expected top influence is known.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use via_core::time::{DAY, Time};

/// Shape of the generated series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesConfig {
    /// Unix seconds of the first bucket.
    pub start: Time,
    pub days: i64,
    pub bucket_length: Time,
    pub seed: u64,
    pub hosts: usize,
    pub base: f64,
    pub amplitude: f64,
    /// Increase in the level per day.
    pub trend_per_day: f64,
    pub noise_sd: f64,
    pub anomaly: Option<Anomaly>,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            start: 0,
            days: 14,
            bucket_length: 3600,
            seed: 0,
            hosts: 4,
            base: 100.0,
            amplitude: 30.0,
            trend_per_day: 1.0,
            noise_sd: 3.0,
            anomaly: None,
        }
    }
}

/// Scale the bucket at index `bucket` by `scale`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Anomaly {
    pub bucket: usize,
    pub scale: f64,
}

/// One bucket's total and its split across hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub index: usize,
    pub time: Time,
    pub value: f64,
    pub hosts: Vec<(String, f64)>,
    pub anomalous: bool,
}

pub fn host_name(i: usize) -> String {
    format!("host-{}", i)
}

/// The noise free value at `time`.
pub fn expected(config: &SeriesConfig, time: Time) -> f64 {
    let elapsed = (time - config.start) as f64;
    let phase = 2.0 * PI * elapsed / DAY as f64;
    config.base + config.trend_per_day * elapsed / DAY as f64 + config.amplitude * phase.sin()
}

pub fn generate(config: &SeriesConfig) -> Vec<Bucket> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let noise = Normal::new(0.0, config.noise_sd.max(0.0)).ok();
    let hosts = config.hosts.max(1);

    // Fixed shares with a little jitter per bucket.
    let shares: Vec<f64> = (0..hosts).map(|_| rng.random_range(0.5..1.5)).collect();

    let n = (config.days * DAY / config.bucket_length.max(1)).max(0) as usize;
    let mut buckets = Vec::with_capacity(n);
    for index in 0..n {
        let time = config.start + index as Time * config.bucket_length;
        let value = expected(config, time) + noise.map_or(0.0, |noise| noise.sample(&mut rng));
        let value = value.max(0.0);

        let weights: Vec<f64> = shares.iter().map(|s| s * rng.random_range(0.9..1.1)).collect();
        let total: f64 = weights.iter().sum();
        let mut split: Vec<(String, f64)> =
            weights.iter().enumerate().map(|(i, w)| (host_name(i), value * w / total)).collect();

        let anomaly = config.anomaly.filter(|a| a.bucket == index);
        let value = match anomaly {
            Some(anomaly) => {
                let excess = value * (anomaly.scale - 1.0);
                split[0].1 = (split[0].1 + excess).max(0.0);
                split.iter().map(|(_, v)| v).sum()
            }
            None => value,
        };
        buckets.push(Bucket { index, time, value, hosts: split, anomalous: anomaly.is_some() });
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_reproducible() {
        let config = SeriesConfig { days: 2, seed: 9, ..SeriesConfig::default() };
        let a = generate(&config);
        let b = generate(&config);
        assert_eq!(a.len(), 48);
        for (a, b) in a.iter().zip(&b) {
            assert_eq!(a.value, b.value);
            assert_eq!(a.hosts, b.hosts);
        }
    }

    #[test]
    fn test_hosts_split_the_value() {
        let config = SeriesConfig { days: 1, ..SeriesConfig::default() };
        for bucket in generate(&config) {
            let total: f64 = bucket.hosts.iter().map(|(_, v)| v).sum();
            assert!((total - bucket.value).abs() < 1e-9);
            assert_eq!(bucket.hosts.len(), 4);
        }
    }

    #[test]
    fn test_anomaly_goes_to_first_host() {
        let quiet = SeriesConfig { days: 1, noise_sd: 0.0, ..SeriesConfig::default() };
        let loud = SeriesConfig { anomaly: Some(Anomaly { bucket: 5, scale: 3.0 }), ..quiet.clone() };
        let (quiet, loud) = (generate(&quiet), generate(&loud));
        assert!(loud[5].anomalous);
        assert!(!loud[4].anomalous);
        assert!((loud[5].value - 3.0 * quiet[5].value).abs() < 1e-9);
        assert_eq!(loud[5].hosts[1], quiet[5].hosts[1]);
        assert!(loud[5].hosts[0].1 > quiet[5].hosts[0].1);
    }
}
