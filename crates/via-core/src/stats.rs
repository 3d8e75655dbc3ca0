//! Basic Statistics
//!
//! Weighted moment accumulators with exponential ageing, distribution
//! quantiles backed by `statrs`, and the state checksum used by every
//! persisted model.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor, Normal};
use tracing::error;
use xxhash_rust::xxh3::xxh3_64;

/// Probabilities are never reported below this.
pub const SMALLEST_PROBABILITY: f64 = f64::MIN_POSITIVE;

/// Clamp `x` into `[a, b]`.
pub fn truncate(x: f64, a: f64, b: f64) -> f64 {
    x.max(a).min(b)
}

/// Weighted sample mean.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct MeanAccumulator {
    count: f64,
    mean: f64,
}

impl MeanAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_moments(count: f64, mean: f64) -> Self {
        Self { count, mean }
    }

    pub fn add(&mut self, x: f64, weight: f64) {
        if weight <= 0.0 {
            return;
        }
        self.count += weight;
        self.mean += weight / self.count * (x - self.mean);
    }

    /// Scale the count by `factor`, which must be in `[0, 1]`.
    pub fn age(&mut self, factor: f64) {
        self.count *= factor;
    }

    pub fn merge(&mut self, other: &MeanAccumulator) {
        let count = self.count + other.count;
        if count > 0.0 {
            self.mean += other.count / count * (other.mean - self.mean);
        }
        self.count = count;
    }

    /// Undo a previous `merge` of `other`.
    pub fn remove(&mut self, other: &MeanAccumulator) {
        let count = self.count - other.count;
        if count > 0.0 {
            self.mean = (self.count * self.mean - other.count * other.mean) / count;
            self.count = count;
        } else {
            *self = Self::default();
        }
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn set_count(&mut self, count: f64) {
        self.count = count;
    }

    pub fn shift(&mut self, shift: f64) {
        self.mean += shift;
    }
}

/// Weighted sample mean and variance.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct MeanVarAccumulator {
    count: f64,
    mean: f64,
    /// Maximum likelihood variance.
    variance: f64,
}

impl MeanVarAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a count, mean and unbiased variance.
    pub fn from_moments(count: f64, mean: f64, variance: f64) -> Self {
        let ml = if count > 1.0 { variance * (count - 1.0) / count } else { variance };
        Self { count, mean, variance: ml.max(0.0) }
    }

    pub fn from_ml(count: f64, mean: f64, ml_variance: f64) -> Self {
        Self { count, mean, variance: ml_variance.max(0.0) }
    }

    pub fn add(&mut self, x: f64, weight: f64) {
        if weight <= 0.0 {
            return;
        }
        let count = self.count + weight;
        let delta = x - self.mean;
        let r = weight / count;
        self.mean += r * delta;
        self.variance = ((1.0 - r) * (self.variance + r * delta * delta)).max(0.0);
        self.count = count;
    }

    pub fn age(&mut self, factor: f64) {
        self.count *= factor;
    }

    pub fn merge(&mut self, other: &MeanVarAccumulator) {
        let count = self.count + other.count;
        if count <= 0.0 {
            self.count = count;
            return;
        }
        let r = other.count / count;
        let delta = other.mean - self.mean;
        self.mean += r * delta;
        self.variance = ((1.0 - r) * self.variance + r * other.variance + r * (1.0 - r) * delta * delta).max(0.0);
        self.count = count;
    }

    /// Undo a previous `merge` of `other`.
    pub fn remove(&mut self, other: &MeanVarAccumulator) {
        let count = self.count - other.count;
        if count <= 0.0 {
            *self = Self::default();
            return;
        }
        let mean = (self.count * self.mean - other.count * other.mean) / count;
        let variance = (self.count * self.variance
            - other.count * other.variance
            - count * (mean - self.mean).powi(2)
            - other.count * (other.mean - self.mean).powi(2))
            / count;
        *self = Self { count, mean, variance: variance.max(0.0) };
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn ml_variance(&self) -> f64 {
        self.variance
    }

    /// Unbiased variance, or zero with fewer than two values.
    pub fn variance(&self) -> f64 {
        if self.count > 1.0 {
            self.variance * self.count / (self.count - 1.0)
        } else {
            0.0
        }
    }

    pub fn shift(&mut self, shift: f64) {
        self.mean += shift;
    }
}

static STANDARD_NORMAL: Lazy<Option<Normal>> = Lazy::new(|| Normal::new(0.0, 1.0).ok());

/// Quantile of the standard normal at probability `p`.
pub fn normal_quantile(p: f64) -> f64 {
    let p = truncate(p, 1e-300, 1.0 - 1e-16);
    STANDARD_NORMAL.as_ref().map(|n| n.inverse_cdf(p)).unwrap_or(0.0)
}

pub fn normal_cdf(x: f64) -> f64 {
    STANDARD_NORMAL.as_ref().map(|n| n.cdf(x)).unwrap_or(0.5)
}

/// Upper tail of the standard normal, accurate far into the tail.
pub fn normal_sf(x: f64) -> f64 {
    STANDARD_NORMAL.as_ref().map(|n| n.sf(x)).unwrap_or(0.5)
}

/// Quantile of the chi-squared distribution with `dof` degrees of freedom.
pub fn chi_squared_quantile(dof: f64, p: f64) -> Option<f64> {
    match ChiSquared::new(dof) {
        Ok(chi) => Some(chi.inverse_cdf(truncate(p, 0.0, 1.0))),
        Err(e) => {
            error!(dof, p, error = %e, "bad chi-squared parameters");
            None
        }
    }
}

/// The F distribution's cumulative density at `x`.
pub fn f_cdf(x: f64, d1: f64, d2: f64) -> Option<f64> {
    match FisherSnedecor::new(d1, d2) {
        Ok(f) => Some(f.cdf(x.max(0.0))),
        Err(e) => {
            error!(d1, d2, error = %e, "bad F distribution parameters");
            None
        }
    }
}

pub fn f_quantile(d1: f64, d2: f64, p: f64) -> Option<f64> {
    match FisherSnedecor::new(d1, d2) {
        Ok(f) => Some(f.inverse_cdf(truncate(p, 0.0, 1.0))),
        Err(e) => {
            error!(d1, d2, error = %e, "bad F distribution parameters");
            None
        }
    }
}

/// The `percentage` quantile of the sample mean of `n` normal variables.
pub fn mean_at_percentile(mean: f64, variance: f64, n: f64, percentage: f64) -> f64 {
    if n <= 0.0 || variance <= 0.0 {
        return mean;
    }
    mean + (variance / n).sqrt() * normal_quantile(percentage / 100.0)
}

/// The `percentage` quantile of a sample variance with `n - 1` degrees of freedom.
pub fn variance_at_percentile(variance: f64, n: f64, percentage: f64) -> f64 {
    if n <= 1.0 {
        return variance;
    }
    chi_squared_quantile(n - 1.0, percentage / 100.0)
        .map(|q| q / (n - 1.0) * variance)
        .unwrap_or(variance)
}

/// The `percentage` quantile of an F(n - 1, n - 1) distributed autocorrelation.
pub fn autocorrelation_at_percentile(autocorrelation: f64, n: f64, percentage: f64) -> f64 {
    if n <= 1.0 {
        return autocorrelation;
    }
    f_quantile(n - 1.0, n - 1.0, percentage / 100.0)
        .map(|q| q * autocorrelation)
        .unwrap_or(autocorrelation)
}

/// Significance of the one-sided F-test that `v1` is smaller than `v0`.
pub fn f_test(v1: f64, d1: f64, v0: f64, d0: f64) -> f64 {
    if v0 <= 0.0 {
        return 1.0;
    }
    f_cdf(v1 / v0, d1, d0).unwrap_or(1.0)
}

/// Deterministic hash of a model's persisted state.
pub fn state_checksum<T: Serialize>(state: &T) -> u64 {
    match bincode::serialize(state) {
        Ok(bytes) => xxh3_64(&bytes),
        Err(e) => {
            error!(error = %e, "failed to encode state for checksum");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_accumulator_weighted() {
        let mut m = MeanAccumulator::new();
        m.add(1.0, 1.0);
        m.add(4.0, 2.0);
        assert!((m.mean() - 3.0).abs() < 1e-12);
        assert!((m.count() - 3.0).abs() < 1e-12);

        m.age(0.5);
        assert!((m.count() - 1.5).abs() < 1e-12);
        assert!((m.mean() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_mean_accumulator_remove_undoes_merge() {
        let mut a = MeanAccumulator::from_moments(3.0, 2.0);
        let b = MeanAccumulator::from_moments(1.0, 6.0);
        a.merge(&b);
        assert!((a.mean() - 3.0).abs() < 1e-12);
        a.remove(&b);
        assert!((a.mean() - 2.0).abs() < 1e-12);
        assert!((a.count() - 3.0).abs() < 1e-12);
        a.remove(&MeanAccumulator::from_moments(3.0, 2.0));
        assert_eq!(a, MeanAccumulator::default());
    }

    #[test]
    fn test_mean_var_merge_matches_sequential() {
        let xs = [1.0, 2.0, 4.0, 8.0, 3.0, 5.0];
        let mut all = MeanVarAccumulator::new();
        let mut a = MeanVarAccumulator::new();
        let mut b = MeanVarAccumulator::new();
        for (i, x) in xs.iter().enumerate() {
            all.add(*x, 1.0);
            if i < 3 { a.add(*x, 1.0) } else { b.add(*x, 1.0) }
        }
        a.merge(&b);
        assert!((a.mean() - all.mean()).abs() < 1e-12);
        assert!((a.variance() - all.variance()).abs() < 1e-12);

        let mean = xs.iter().sum::<f64>() / 6.0;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / 5.0;
        assert!((all.variance() - var).abs() < 1e-12);
    }

    #[test]
    fn test_mean_var_remove_undoes_merge() {
        let mut a = MeanVarAccumulator::new();
        let mut b = MeanVarAccumulator::new();
        for x in [1.0, 3.0, 2.0] {
            a.add(x, 1.0);
        }
        for x in [10.0, 12.0] {
            b.add(x, 1.0);
        }
        let original = a;
        a.merge(&b);
        a.remove(&b);
        assert!((a.count() - original.count()).abs() < 1e-12);
        assert!((a.mean() - original.mean()).abs() < 1e-12);
        assert!((a.ml_variance() - original.ml_variance()).abs() < 1e-9);
    }

    #[test]
    fn test_quantiles() {
        assert!((normal_sf(10.0) - 7.619853e-24).abs() < 1e-28);
        assert!(normal_quantile(0.5).abs() < 1e-9);
        assert!((normal_quantile(0.975) - 1.959964).abs() < 1e-5);
        let q = chi_squared_quantile(10.0, 0.5).unwrap();
        assert!((q - 9.341818).abs() < 1e-4);
        assert!(chi_squared_quantile(-1.0, 0.5).is_none());
        assert!((f_cdf(1.0, 10.0, 10.0).unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_variance_at_percentile_brackets_variance() {
        let lo = variance_at_percentile(2.0, 20.0, 10.0);
        let hi = variance_at_percentile(2.0, 20.0, 90.0);
        assert!(lo < 2.0 && 2.0 < hi);
        assert_eq!(variance_at_percentile(2.0, 1.0, 90.0), 2.0);
    }

    #[test]
    fn test_state_checksum_is_order_sensitive() {
        let a = (1.0f64, 2.0f64);
        let b = (2.0f64, 1.0f64);
        assert_eq!(state_checksum(&a), state_checksum(&a));
        assert_ne!(state_checksum(&a), state_checksum(&b));
    }
}
