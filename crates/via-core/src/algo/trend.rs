//! Long Term Trend Test
//!
//! Fits a cubic in weeks to the deseasonalised values and checks, with
//! an F-test, whether it explains a significant share of their variance.
//! The regression origin follows the data so the Gramian stays well
//! conditioned.

use crate::algo::regression::Regression;
use crate::stats::{MeanVarAccumulator, f_test, variance_at_percentile};
use crate::time::{self, Time, WEEK};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

/// Largest residual to total variance ratio we accept as a trend.
pub const HAS_TREND_VARIANCE_RATIO: f64 = 0.5;
/// F-test significance needed to accept a trend or a period.
pub const MAXIMUM_SIGNIFICANCE: f64 = 0.005;
/// The confidence interval, as a percentage, used for variance estimates.
pub const CONFIDENCE_INTERVAL: f64 = 80.0;

/// How often the regression origin is moved forward.
const ORIGIN_SHIFT_INTERVAL: Time = 3 * WEEK;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TrendTest {
    decay_rate: f64,
    origin: Option<Time>,
    trend: Regression,
    values: MeanVarAccumulator,
    residuals: MeanVarAccumulator,
}

impl TrendTest {
    pub fn new(decay_rate: f64) -> Self {
        Self {
            decay_rate,
            origin: None,
            trend: Regression::cubic(),
            values: MeanVarAccumulator::new(),
            residuals: MeanVarAccumulator::new(),
        }
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    pub fn set_decay_rate(&mut self, decay_rate: f64) {
        self.decay_rate = decay_rate;
    }

    /// Age by `elapsed` days.
    pub fn propagate_forwards_by_time(&mut self, elapsed: f64) {
        if !elapsed.is_finite() || elapsed < 0.0 {
            warn!(elapsed, "bad propagation time");
            return;
        }
        let factor = (-self.decay_rate * elapsed).exp();
        self.trend.age(factor);
        self.values.age(factor);
        self.residuals.age(factor);
    }

    pub fn add(&mut self, time: Time, value: f64, weight: f64) {
        let due = match self.origin {
            None => true,
            Some(origin) => time - ORIGIN_SHIFT_INTERVAL >= origin,
        };
        if due {
            if self.origin.is_some() {
                self.trend.shift_abscissa(-self.time(time));
            }
            self.origin = Some(time);
        }
        self.trend.add(self.time(time), value, weight);
    }

    /// Record the variance of `value` and of its residual from the current fit.
    pub fn capture_variance(&mut self, time: Time, value: f64, weight: f64) {
        let prediction = self.trend.predict(self.time(time));
        self.values.add(value, weight);
        self.residuals.add(value - prediction, weight);
    }

    /// Move the fit by `shift`.
    pub fn shift(&mut self, shift: f64) {
        self.trend.shift_ordinate(shift);
    }

    /// True if the fit explains significantly more variance than the mean.
    pub fn test(&self) -> bool {
        let n = self.values.count();
        let d0 = n - 1.0;
        let d1 = n - 4.0;
        let v0 = self.values.ml_variance();
        let v1 = self.residuals.ml_variance();
        if d1 <= 0.0 || v0 <= 0.0 {
            return false;
        }
        let upper = variance_at_percentile(v1, n, CONFIDENCE_INTERVAL);
        let significance = f_test(v1, d1, v0, d0);
        trace!(n, v0, v1, upper, significance, "trend test");
        upper < HAS_TREND_VARIANCE_RATIO * v0 && significance <= MAXIMUM_SIGNIFICANCE
    }

    pub fn trend(&self) -> &Regression {
        &self.trend
    }

    /// The regression origin, or zero before any value.
    pub fn origin(&self) -> Time {
        self.origin.unwrap_or(0)
    }

    /// Residual variance about the fit.
    pub fn variance(&self) -> f64 {
        self.residuals.ml_variance()
    }

    fn time(&self, time: Time) -> f64 {
        time::weeks(time - self.origin.unwrap_or(time))
    }
}
