//! Features
//!
//! The statistics a detector can model for a series, and how each is
//! scored: which tail is anomalous, how many coordinates it has, and
//! which influence calculator attributes it to influencer values.

use crate::influence::{
    IndicatorInfluenceCalculator, InfluenceCalculator, InfluenceUnavailableCalculator,
    LogProbabilityComplementInfluenceCalculator, LogProbabilityInfluenceCalculator, MeanInfluenceCalculator,
    VarianceInfluenceCalculator,
};
use crate::prior::Calculation;
use crate::time::{Time, WEEK};
use serde::{Deserialize, Serialize};

/// Elapsed time after which probabilities are used unadjusted.
pub const ELAPSED_TIME_CUTOFF: Time = WEEK;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Count,
    NonZeroCount,
    TotalBucketCount,
    Indicator,
    LowCounts,
    HighCounts,
    LowNonZeroCount,
    HighNonZeroCount,
    UniqueCount,
    LowUniqueCount,
    HighUniqueCount,
    TimeOfDay,
    TimeOfWeek,
    Mean,
    Median,
    Min,
    Max,
    Variance,
    Sum,
    LowMean,
    HighMean,
    LowSum,
    HighSum,
    NonNullSum,
    LowNonNullSum,
    HighNonNullSum,
    MeanLatLong,
}

/// Which influence calculator scores a feature.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InfluenceKind {
    Unavailable,
    Indicator,
    LogProbabilityComplement,
    LogProbability,
    Mean,
    Variance,
}

static UNAVAILABLE: InfluenceUnavailableCalculator = InfluenceUnavailableCalculator;
static INDICATOR: IndicatorInfluenceCalculator = IndicatorInfluenceCalculator;
static LOG_PROBABILITY_COMPLEMENT: LogProbabilityComplementInfluenceCalculator =
    LogProbabilityComplementInfluenceCalculator;
static LOG_PROBABILITY: LogProbabilityInfluenceCalculator = LogProbabilityInfluenceCalculator;
static MEAN: MeanInfluenceCalculator = MeanInfluenceCalculator;
static VARIANCE: VarianceInfluenceCalculator = VarianceInfluenceCalculator;

impl InfluenceKind {
    pub fn calculator(self) -> &'static dyn InfluenceCalculator {
        match self {
            InfluenceKind::Unavailable => &UNAVAILABLE,
            InfluenceKind::Indicator => &INDICATOR,
            InfluenceKind::LogProbabilityComplement => &LOG_PROBABILITY_COMPLEMENT,
            InfluenceKind::LogProbability => &LOG_PROBABILITY,
            InfluenceKind::Mean => &MEAN,
            InfluenceKind::Variance => &VARIANCE,
        }
    }
}

/// Everything the calculator needs to know about a feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeatureInfo {
    pub calculation: Calculation,
    pub dimension: usize,
    /// Constant features never contribute probability.
    pub is_constant: bool,
    pub is_time_of_day_or_week: bool,
    pub influence: InfluenceKind,
}

impl Feature {
    pub fn info(self) -> FeatureInfo {
        use Calculation::*;
        use Feature::*;
        use InfluenceKind as I;
        let (calculation, influence) = match self {
            Count | NonZeroCount | TotalBucketCount | Sum | NonNullSum => (TwoSided, I::LogProbabilityComplement),
            HighCounts | HighNonZeroCount | HighUniqueCount | HighSum | HighNonNullSum => {
                (OneSidedAbove, I::LogProbabilityComplement)
            }
            LowCounts | LowNonZeroCount | LowUniqueCount | LowSum | LowNonNullSum => {
                (OneSidedBelow, I::LogProbability)
            }
            UniqueCount => (TwoSided, I::LogProbability),
            Min => (OneSidedBelow, I::LogProbability),
            Max => (OneSidedAbove, I::LogProbability),
            Indicator => (TwoSided, I::Indicator),
            TimeOfDay | TimeOfWeek => (TwoSided, I::Unavailable),
            Mean | Median | MeanLatLong => (TwoSided, I::Mean),
            LowMean => (OneSidedBelow, I::Mean),
            HighMean => (OneSidedAbove, I::Mean),
            Variance => (TwoSided, I::Variance),
        };
        FeatureInfo {
            calculation,
            dimension: if self == MeanLatLong { 2 } else { 1 },
            is_constant: self == Indicator,
            is_time_of_day_or_week: matches!(self, TimeOfDay | TimeOfWeek),
            influence,
        }
    }

    pub fn calculation(self) -> Calculation {
        self.info().calculation
    }

    pub fn dimension(self) -> usize {
        self.info().dimension
    }

    pub fn is_constant(self) -> bool {
        self.info().is_constant
    }

    pub fn influence_calculator(self) -> &'static dyn InfluenceCalculator {
        self.info().influence.calculator()
    }

    /// Pull probabilities of young time-of-day and time-of-week models
    /// toward one.
    pub fn adjust_probability(self, elapsed_time: Time, probability: f64) -> f64 {
        if !self.info().is_time_of_day_or_week || elapsed_time >= ELAPSED_TIME_CUTOFF {
            return probability;
        }
        let fraction = elapsed_time.max(0) as f64 / ELAPSED_TIME_CUTOFF as f64;
        probability + (1.0 - probability) * (1.0 - fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::DAY;

    #[test]
    fn test_feature_table() {
        assert_eq!(Feature::HighSum.calculation(), Calculation::OneSidedAbove);
        assert_eq!(Feature::LowCounts.info().influence, InfluenceKind::LogProbability);
        assert_eq!(Feature::Count.info().influence, InfluenceKind::LogProbabilityComplement);
        assert_eq!(Feature::Variance.info().influence, InfluenceKind::Variance);
        assert_eq!(Feature::MeanLatLong.dimension(), 2);
        assert!(Feature::Indicator.is_constant());
        assert!(!Feature::Mean.is_constant());
    }

    #[test]
    fn test_adjust_probability() {
        assert_eq!(Feature::Mean.adjust_probability(0, 0.01), 0.01);
        assert_eq!(Feature::TimeOfDay.adjust_probability(WEEK, 0.01), 0.01);
        assert!((Feature::TimeOfDay.adjust_probability(0, 0.01) - 1.0).abs() < 1e-12);
        let p = Feature::TimeOfWeek.adjust_probability(WEEK - DAY, 0.3);
        assert!((p - (0.3 + 0.7 / 7.0)).abs() < 1e-12);
    }
}
