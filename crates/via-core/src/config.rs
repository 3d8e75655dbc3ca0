//! Model Configuration
//!
//! Resolved settings for the decomposition and the probability
//! calculator. Values arrive already parsed; `from_json` exists for
//! hosts and tools which keep them in JSON.

use crate::aggregator::AggregationStyle;
use crate::time::Time;
use serde::{Deserialize, Serialize};

const DEFAULT_DECAY_RATE: f64 = 0.01;
const DEFAULT_BUCKET_LENGTH: Time = 3600;
const DEFAULT_SEASONAL_COMPONENTS_SIZE: usize = 36;
const DEFAULT_CUTOFF: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecompositionConfig {
    /// Rate at which old values are forgotten, per day.
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
    /// Seconds.
    #[serde(default = "default_bucket_length")]
    pub bucket_length: Time,
    /// Number of knots in each seasonal component.
    #[serde(default = "default_seasonal_components_size")]
    pub seasonal_components_size: usize,
}

fn default_decay_rate() -> f64 {
    DEFAULT_DECAY_RATE
}

fn default_bucket_length() -> Time {
    DEFAULT_BUCKET_LENGTH
}

fn default_seasonal_components_size() -> usize {
    DEFAULT_SEASONAL_COMPONENTS_SIZE
}

fn default_cutoff() -> f64 {
    DEFAULT_CUTOFF
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            decay_rate: DEFAULT_DECAY_RATE,
            bucket_length: DEFAULT_BUCKET_LENGTH,
            seasonal_components_size: DEFAULT_SEASONAL_COMPONENTS_SIZE,
        }
    }
}

impl DecompositionConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.decay_rate.is_finite() || self.decay_rate < 0.0 {
            return Err(ConfigError::invalid("decay_rate", "must be finite and non-negative"));
        }
        if self.bucket_length <= 0 {
            return Err(ConfigError::invalid("bucket_length", "must be positive"));
        }
        if self.seasonal_components_size < 2 {
            return Err(ConfigError::invalid("seasonal_components_size", "must be at least 2"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalculatorConfig {
    /// Smallest influence reported.
    #[serde(default = "default_cutoff")]
    pub cutoff: f64,
    #[serde(default)]
    pub aggregation: AggregationStyle,
}

impl Default for CalculatorConfig {
    fn default() -> Self {
        Self { cutoff: DEFAULT_CUTOFF, aggregation: AggregationStyle::Min }
    }
}

impl CalculatorConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.cutoff) {
            return Err(ConfigError::invalid("cutoff", "must be in [0, 1]"));
        }
        Ok(())
    }
}

/// Errors that can occur loading configuration
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Invalid { field: &'static str, reason: &'static str },
    Parse(String),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::Invalid { field, reason }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid { field, reason } => write!(f, "Invalid {}: {}", field, reason),
            Self::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DecompositionConfig::default();
        assert_eq!(config.decay_rate, 0.01);
        assert_eq!(config.bucket_length, 3600);
        assert_eq!(config.seasonal_components_size, 36);
        assert!(config.validate().is_ok());
        assert_eq!(CalculatorConfig::default().cutoff, 0.5);
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = DecompositionConfig::from_json(r#"{"bucket_length": 600}"#).unwrap();
        assert_eq!(config.bucket_length, 600);
        assert_eq!(config.decay_rate, 0.01);

        let config = CalculatorConfig::from_json(r#"{"aggregation": "sum"}"#).unwrap();
        assert_eq!(config.aggregation, AggregationStyle::Sum);
        assert_eq!(config.cutoff, 0.5);
    }

    #[test]
    fn test_validation() {
        let err = DecompositionConfig::from_json(r#"{"bucket_length": 0}"#).unwrap_err();
        assert_eq!(err, ConfigError::Invalid { field: "bucket_length", reason: "must be positive" });
        assert!(DecompositionConfig::from_json(r#"{"seasonal_components_size": 1}"#).is_err());
        assert!(DecompositionConfig::from_json(r#"{"decay_rate": -1.0}"#).is_err());
        assert!(CalculatorConfig::from_json(r#"{"cutoff": 1.5}"#).is_err());
        assert!(matches!(CalculatorConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }
}
