//! Seasonal Component
//!
//! One periodic sub-model of a decomposition: a value spline and a
//! variance spline over a (possibly windowed) period, interpolated from
//! an adaptive bucketing of recent values.

use crate::algo::bucketing::{AdaptiveBucketing, InitialValue, SeasonalTime};
use crate::algo::spline::{Boundary, Spline, SplineType};
use crate::stats::{chi_squared_quantile, normal_quantile};
use crate::time::Time;
use serde::{Deserialize, Serialize};
use tracing::{error, trace};

/// The fewest buckets a component will use.
pub const MINIMUM_SPACE: usize = 2;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SeasonalComponent {
    space: usize,
    boundary: Boundary,
    bucketing: AdaptiveBucketing,
    value_spline: Spline,
    variance_spline: Spline,
    mean_value: f64,
    mean_variance: f64,
}

impl SeasonalComponent {
    pub fn new(
        time: SeasonalTime,
        space: usize,
        decay_rate: f64,
        minimum_bucket_length: f64,
        boundary: Boundary,
    ) -> Self {
        trace!(period = time.period(), window = time.window(), decay_rate, "new seasonal component");
        Self {
            space,
            boundary,
            bucketing: AdaptiveBucketing::new(time, decay_rate, minimum_bucket_length),
            value_spline: Spline::new(SplineType::Cubic),
            variance_spline: Spline::new(SplineType::Linear),
            mean_value: 0.0,
            mean_variance: 0.0,
        }
    }

    /// True once the splines have been interpolated at least once.
    pub fn initialized(&self) -> bool {
        self.value_spline.initialized()
    }

    /// Set up the buckets and seed them with values observed over `[start, end)`.
    pub fn initialize(&mut self, start: Time, end: Time, values: &[InitialValue]) -> bool {
        self.clear();
        let time = self.time();
        let b = time.window().min(time.period()) as f64;
        if !self.bucketing.initialize(0.0, b, self.space.max(MINIMUM_SPACE)) {
            error!(period = time.period(), window = time.window(), space = self.space, "bad seasonal component inputs");
            return false;
        }
        self.bucketing.initial_values(start, end, values);
        true
    }

    pub fn clear(&mut self) {
        self.value_spline.clear();
        self.variance_spline.clear();
        if self.bucketing.initialized() {
            self.bucketing.clear();
            self.mean_value = 0.0;
            self.mean_variance = 0.0;
        }
    }

    pub fn size(&self) -> usize {
        self.bucketing.size()
    }

    /// Translate the component's values by `shift`.
    pub fn shift(&mut self, shift: f64) {
        self.bucketing.shift_value(shift);
        self.value_spline.shift(shift);
        self.mean_value += shift;
    }

    pub fn add(&mut self, time: Time, value: f64, weight: f64) {
        self.bucketing.add(time, value, weight);
    }

    /// Refit the splines, optionally refining the bucketing first.
    pub fn interpolate(&mut self, time: Time, refine: bool) {
        if refine {
            self.bucketing.refine(time);
        }
        if self.bucketing.empty_bucket_count() > 0 {
            return;
        }
        let (knots, values, variances) = self.bucketing.knots(time, self.boundary);
        let mut value_spline = self.value_spline.clone();
        let mut variance_spline = self.variance_spline.clone();
        if value_spline.interpolate(&knots, &values, self.boundary)
            && variance_spline.interpolate(&knots, &variances, self.boundary)
        {
            self.value_spline = value_spline;
            self.variance_spline = variance_spline;
            self.mean_value = self.value_spline.mean();
            self.mean_variance = self.variance_spline.mean();
        }
    }

    pub fn decay_rate(&self) -> f64 {
        self.bucketing.decay_rate()
    }

    pub fn set_decay_rate(&mut self, decay_rate: f64) {
        self.bucketing.set_decay_rate(decay_rate);
    }

    /// Age by `elapsed` days.
    pub fn propagate_forwards_by_time(&mut self, elapsed: f64) {
        self.bucketing.propagate_forwards_by_time(elapsed);
    }

    pub fn time(&self) -> SeasonalTime {
        *self.bucketing.time()
    }

    /// Confidence interval for the component's value at `time`.
    pub fn value(&self, time: Time, confidence: f64) -> (f64, f64) {
        if !self.initialized() {
            return (self.mean_value, self.mean_value);
        }
        let offset = self.time().periodic(time);
        let m = self.value_spline.value(offset);
        if confidence == 0.0 {
            return (m, m);
        }
        let n = self.bucketing.count(time).max(0.01);
        let sd = (self.variance_spline.value(offset).max(0.0) / n).sqrt();
        if sd == 0.0 {
            return (m, m);
        }
        let ql = normal_quantile((100.0 - confidence) / 200.0);
        let qu = normal_quantile((100.0 + confidence) / 200.0);
        (m + sd * ql, m + sd * qu)
    }

    pub fn mean_value(&self) -> f64 {
        self.mean_value
    }

    /// Confidence interval for the residual variance at `time`.
    pub fn variance(&self, time: Time, confidence: f64) -> (f64, f64) {
        if !self.initialized() {
            return (self.mean_variance, self.mean_variance);
        }
        let n = self.bucketing.count(time).max(2.0);
        let v = self.variance_spline.value(self.time().periodic(time));
        let ql = chi_squared_quantile(n - 1.0, (100.0 - confidence) / 200.0);
        let qu = chi_squared_quantile(n - 1.0, (100.0 + confidence) / 200.0);
        match (ql, qu) {
            (Some(ql), Some(qu)) => (ql * v / (n - 1.0), qu * v / (n - 1.0)),
            _ => (v, v),
        }
    }

    pub fn mean_variance(&self) -> f64 {
        self.mean_variance
    }

    /// The component value at `time` less its mean over the enclosing
    /// cycle of the shorter `period`.
    pub fn difference_from_mean(&self, time: Time, period: Time) -> f64 {
        if !self.initialized() || period <= 0 {
            return 0.0;
        }
        const SAMPLES: Time = 24;
        let start = time - time.rem_euclid(period);
        let step = (period / SAMPLES).max(1);
        let mut total = 0.0;
        let mut count = 0.0;
        let mut t = start;
        while t < start + period {
            total += self.value(t, 0.0).0;
            count += 1.0;
            t += step;
        }
        self.value(time, 0.0).0 - total / count
    }

    pub fn value_spline(&self) -> &Spline {
        &self.value_spline
    }

    pub fn variance_spline(&self) -> &Spline {
        &self.variance_spline
    }

    pub fn bucketing(&self) -> &AdaptiveBucketing {
        &self.bucketing
    }

    pub fn describe(&self) -> String {
        let period = self.time().period();
        if !self.initialized() {
            return format!("period = {}s no seasonality", period);
        }
        format!("period = {}s mean = {:.4} mean variance = {:.4}", period, self.mean_value, self.mean_variance)
    }
}
