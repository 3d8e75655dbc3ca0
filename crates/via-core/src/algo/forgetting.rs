//! Exponential Forgetting
//!
//! Decay-rate arithmetic shared by every ageing accumulator. A rate `r`
//! ages state by `exp(-r * t)` after `t` units of elapsed time.

use serde::{Deserialize, Serialize};
use std::f64::consts::LN_2;

/// Smallest decay rate a seasonal component will run with.
pub const MINIMUM_DECAY_RATE: f64 = 0.001;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct ExponentialForgetting {
    rate: f64,
}

impl ExponentialForgetting {
    pub fn new(rate: f64) -> Self {
        Self { rate: rate.max(0.0) }
    }

    /// The rate at which state halves every `half_life` time units.
    pub fn from_half_life(half_life: f64) -> Self {
        if half_life <= 0.0 || !half_life.is_finite() {
            return Self::new(0.0);
        }
        Self::new(LN_2 / half_life)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn set_rate(&mut self, rate: f64) {
        self.rate = rate.max(0.0);
    }

    /// The multiplicative ageing factor after `elapsed` time units.
    pub fn factor(&self, elapsed: f64) -> f64 {
        if elapsed <= 0.0 {
            return 1.0;
        }
        (-self.rate * elapsed).exp()
    }

    /// Convert a per-bucket rate into a rate for a test which accumulates
    /// over buckets of `test_length` seconds.
    pub fn rescaled(&self, bucket_length: i64, test_length: i64) -> Self {
        if bucket_length <= 0 || test_length <= 0 {
            return *self;
        }
        Self::new(self.rate * test_length as f64 / bucket_length as f64)
    }

    /// The equivalent EWMA smoothing constant per unit of time.
    pub fn alpha(&self) -> f64 {
        1.0 - (-self.rate).exp()
    }

    pub fn half_life(&self) -> f64 {
        if self.rate > 0.0 { LN_2 / self.rate } else { f64::INFINITY }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_life_halves() {
        let forgetting = ExponentialForgetting::from_half_life(10.0);
        assert!((forgetting.factor(10.0) - 0.5).abs() < 1e-12);
        assert!((forgetting.half_life() - 10.0).abs() < 1e-9);
        assert_eq!(forgetting.factor(0.0), 1.0);
        assert_eq!(forgetting.factor(-3.0), 1.0);
    }

    #[test]
    fn test_factors_compose() {
        let forgetting = ExponentialForgetting::new(0.2);
        let once = forgetting.factor(3.0);
        let twice = forgetting.factor(1.0) * forgetting.factor(2.0);
        assert!((once - twice).abs() < 1e-12);
    }

    #[test]
    fn test_rescaled() {
        let forgetting = ExponentialForgetting::new(0.01).rescaled(3600, 7200);
        assert!((forgetting.rate() - 0.02).abs() < 1e-12);
        assert_eq!(ExponentialForgetting::new(-1.0).rate(), 0.0);
    }
}
