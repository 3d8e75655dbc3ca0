//! Adaptive Seasonal Bucketing
//!
//! Partitions one period (or window of a week) into buckets, each of
//! which keeps a linear regression of value against time in weeks and
//! a residual variance. Bucket endpoints drift daily so that buckets
//! are narrower where the seasonal profile changes fastest.

use crate::algo::forgetting::MINIMUM_DECAY_RATE;
use crate::algo::regression::Regression;
use crate::algo::spline::Boundary;
use crate::stats::{MeanAccumulator, MeanVarAccumulator, truncate};
use crate::time::{self, DAY, Time, WEEK};
use serde::{Deserialize, Serialize};
use tracing::{error, trace};

/// Weeks of history needed before bucket regressions extrapolate.
const MINIMUM_AGE_TO_PREDICT: f64 = 2.5;
const MINIMUM_RANGE_TO_PREDICT: f64 = 1.0;

/// The time scale against which refinement damping is measured.
pub const TIMESCALE: Time = DAY;

/// A value observed over `[start, end)`, used to seed buckets.
#[derive(Clone, Copy, Debug)]
pub struct InitialValue {
    pub start: Time,
    pub end: Time,
    pub moments: MeanVarAccumulator,
}

/// Maps absolute times into a component's period and window.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeasonalTime {
    start_of_week: Time,
    window_start: Time,
    window_end: Time,
    period: Time,
    regression_shift: Option<Time>,
}

impl SeasonalTime {
    pub fn new(start_of_week: Time, window_start: Time, window_end: Time, period: Time) -> Self {
        Self { start_of_week, window_start, window_end, period, regression_shift: None }
    }

    /// A component without windowing.
    pub fn unwindowed(period: Time) -> Self {
        Self::new(0, 0, WEEK.max(period), period)
    }

    /// Offset of `time` into its period, relative to the window start.
    pub fn periodic(&self, time: Time) -> f64 {
        ((time - self.start_of_window(time)) % self.window().min(self.period)) as f64
    }

    /// `time` in weeks since the regression origin.
    pub fn regression(&self, time: Time) -> f64 {
        time::weeks(time - self.regression_shift.unwrap_or(0))
    }

    /// The offset of the first week.
    pub fn week_start(&self) -> Time {
        self.start_of_week
    }

    pub fn start_of_week(&self, time: Time) -> Time {
        self.start_of_week + time::floor(time - self.start_of_week, WEEK)
    }

    pub fn in_window(&self, time: Time) -> bool {
        let offset = time - self.start_of_week(time);
        offset >= self.window_start && offset < self.window_end
    }

    pub fn window(&self) -> Time {
        self.window_end - self.window_start
    }

    pub fn window_start(&self) -> Time {
        self.window_start
    }

    pub fn window_end(&self) -> Time {
        self.window_end
    }

    pub fn start_of_window(&self, time: Time) -> Time {
        let offset = self.start_of_week + self.window_start;
        offset + time::floor(time - offset, WEEK)
    }

    pub fn period(&self) -> Time {
        self.period
    }

    pub fn regression_shift(&self) -> Option<Time> {
        self.regression_shift
    }

    pub fn set_regression_shift(&mut self, time: Time) {
        self.regression_shift = Some(time);
    }

    /// Convert a decay rate tuned for `from` periods to `to` periods.
    pub fn scale_decay_rate(decay_rate: f64, from: Time, to: Time) -> f64 {
        from as f64 / to as f64 * decay_rate
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AdaptiveBucketing {
    time: SeasonalTime,
    initial_time: Option<Time>,
    decay_rate: f64,
    minimum_bucket_length: f64,
    endpoints: Vec<f64>,
    regressions: Vec<Regression>,
    /// Maximum likelihood residual variance per bucket.
    variances: Vec<f64>,
    lp_force: MeanAccumulator,
    force: MeanAccumulator,
}

impl AdaptiveBucketing {
    pub fn new(time: SeasonalTime, decay_rate: f64, minimum_bucket_length: f64) -> Self {
        Self {
            time,
            initial_time: None,
            decay_rate: decay_rate.max(MINIMUM_DECAY_RATE),
            minimum_bucket_length,
            endpoints: Vec::new(),
            regressions: Vec::new(),
            variances: Vec::new(),
            lp_force: MeanAccumulator::new(),
            force: MeanAccumulator::new(),
        }
    }

    pub fn initialized(&self) -> bool {
        !self.endpoints.is_empty()
    }

    /// Create `n` equal buckets over `[a, b]`, fewer if the minimum
    /// bucket length would be violated.
    pub fn initialize(&mut self, a: f64, b: f64, n: usize) -> bool {
        if b <= a {
            error!(a, b, "bad bucketing interval");
            return false;
        }
        if n == 0 {
            error!("must have at least one bucket");
            return false;
        }
        let mut n = n;
        if self.minimum_bucket_length > 0.0 {
            self.minimum_bucket_length = self.minimum_bucket_length.min(b - a);
            let buckets = (b - a) / self.minimum_bucket_length;
            n = n.min((0.8 * buckets).max(7.0).min(buckets) as usize).max(1);
        }
        let h = (b - a) / n as f64;
        self.endpoints = (0..=n).map(|i| a + i as f64 * h).collect();
        self.regressions = vec![Regression::linear(); n];
        self.variances = vec![0.0; n];
        true
    }

    /// Seed the buckets from values observed over `[start, end)`.
    pub fn initial_values(&mut self, start: Time, end: Time, values: &[InitialValue]) {
        if !self.initialized() {
            return;
        }
        self.shift_regressions(start);

        let week = self.time.start_of_week(end);
        let repeat = (end - start).max(1);
        self.initial_time = Some(week);

        let n = self.endpoints.len();
        for value in values {
            let ai = self.time.periodic(value.start);
            let bi = self.time.periodic(value.end - 1) + 1.0;
            if ai < self.endpoints[0] || bi > self.endpoints[n - 1] {
                error!(ai, bi, "initial value out of bucketing range");
                return;
            }
            let ka = self.endpoints.partition_point(|x| *x <= ai);
            let kb = self.endpoints.partition_point(|x| *x < bi);
            let length = bi - ai;
            for k in ka.max(1)..=kb.min(n - 1) {
                let (xl, xr) = (self.endpoints[k - 1], self.endpoints[k]);
                let w = (bi.min(xr) - ai.max(xl)) / length;
                if w <= 0.0 {
                    continue;
                }
                let tk = start + (week + xl as Time - start).rem_euclid(repeat);
                let mut vk = value.moments;
                vk.age(w * w);
                let regression = &mut self.regressions[k - 1];
                let mut variance =
                    MeanVarAccumulator::from_ml(regression.count(), regression.mean(), self.variances[k - 1]);
                variance.merge(&vk);
                regression.add(self.time.regression(tk), vk.mean(), vk.count());
                self.variances[k - 1] = variance.ml_variance();
            }
        }
    }

    pub fn size(&self) -> usize {
        self.regressions.len()
    }

    pub fn clear(&mut self) {
        self.endpoints.clear();
        self.regressions.clear();
        self.variances.clear();
    }

    pub fn add(&mut self, time: Time, value: f64, weight: f64) {
        let Some(i) = self.bucket(time) else {
            return;
        };
        self.shift_regressions(time);
        let t = self.time.regression(time);
        let age = self.age_at(time);
        let regression = &mut self.regressions[i];
        let mut variance =
            MeanVarAccumulator::from_ml(regression.count(), predict(regression, t, age), self.variances[i]);
        regression.add(t, value, weight);
        variance.add(value, weight);
        self.variances[i] = variance.ml_variance();
    }

    pub fn time(&self) -> &SeasonalTime {
        &self.time
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    pub fn set_decay_rate(&mut self, decay_rate: f64) {
        self.decay_rate = decay_rate.max(MINIMUM_DECAY_RATE);
    }

    /// Age by `elapsed` days.
    pub fn propagate_forwards_by_time(&mut self, elapsed: f64) {
        if elapsed < 0.0 {
            error!(elapsed, "can't propagate bucketing backwards in time");
            return;
        }
        if !self.initialized() {
            return;
        }
        let alpha = (-self.decay_rate * elapsed).exp();
        for regression in &mut self.regressions {
            regression.age(alpha);
        }
        self.lp_force.age(alpha * alpha);
        self.force.age(alpha * alpha);
    }

    /// Move endpoints so each bucket carries roughly equal averaging error.
    pub fn refine(&mut self, time: Time) {
        const SMOOTHING: [f64; 3] = [0.25, 0.5, 0.25];
        const WEIGHTS: [f64; 5] = [1.0, 1.0, 1.0, 0.75, 0.5];
        const ALPHA: f64 = 0.25;

        if self.endpoints.len() < 2 {
            return;
        }
        let n = self.endpoints.len() - 1;
        let (a, b) = (self.endpoints[0], self.endpoints[n]);

        let age = self.age_at(time);
        let mut values = Vec::with_capacity(n);
        for (i, regression) in self.regressions.iter().enumerate() {
            if regression.count() > 0.0 {
                let mid = 0.5 * (self.endpoints[i] + self.endpoints[i + 1]);
                let t = self.time.regression(time + mid as Time);
                values.push(predict(regression, t, age));
            }
        }
        if values.len() < n {
            return;
        }

        let ranges: Vec<f64> = (0..n)
            .map(|i| {
                let v: Vec<f64> = (0..5).map(|j| values[(2 * n + i + j - 2) % n]).collect();
                let (mut min, mut max) = (0, 0);
                for j in 1..5 {
                    if v[j] < v[min] {
                        min = j;
                    }
                    if v[j] > v[max] {
                        max = j;
                    }
                }
                WEIGHTS[min.abs_diff(max)] * (v[max] - v[min]).powf(0.75)
            })
            .collect();

        let mut total_error = 0.0;
        let errors: Vec<f64> = (0..n)
            .map(|i| {
                let h = self.endpoints[i + 1] - self.endpoints[i];
                let smoothed: f64 = (0..SMOOTHING.len()).map(|j| SMOOTHING[j] * ranges[(n + i + j - 1) % n]).sum();
                let error = smoothed * h / (b - a);
                total_error += error;
                error
            })
            .collect();

        let n_ = n as f64;
        let step = (1.0 - n_ * f64::EPSILON) * total_error / n_;
        let old = self.endpoints.clone();

        if step == 0.0 {
            for i in 0..n {
                self.endpoints[i] = a + (b - a) * i as f64 / n_;
            }
            self.endpoints[n] = b;
        } else {
            let damping = if self.force.mean() == 0.0 { 1.0 } else { self.lp_force.mean().abs() / self.force.mean() };
            let alpha = ALPHA * (TIMESCALE as f64 / self.time.period() as f64).min(1.0) * damping;
            let mut force = 0.0;
            let mut error = 0.0;
            let mut j = 1;
            for i in 0..n {
                if j >= n {
                    break;
                }
                let (ai, h, e) = (old[i], old[i + 1] - old[i], errors[i]);
                let carried = error;
                error += e;
                let mut e_ = step - carried;
                while error >= step && j < n {
                    let x = h * e_ / e;
                    self.endpoints[j] = old[j] + alpha * (ai + x - old[j]);
                    force += ai + x - old[j];
                    j += 1;
                    e_ += step;
                    error -= step;
                }
            }
            if self.minimum_bucket_length > 0.0 {
                spread(a, b, self.minimum_bucket_length, &mut self.endpoints);
            }
            self.endpoints[0] = a;
            self.endpoints[n] = b;
            self.lp_force.add(force, 1.0);
            self.force.add(force.abs(), 1.0);
        }
        trace!(endpoints = ?self.endpoints, "refined bucketing");
        self.refresh(&old);
    }

    /// Effective count of the bucket containing `time`.
    pub fn count(&self, time: Time) -> f64 {
        self.regression(time).map_or(0.0, Regression::count)
    }

    pub fn total_count(&self) -> f64 {
        self.regressions.iter().map(Regression::count).sum()
    }

    pub fn empty_bucket_count(&self) -> usize {
        self.regressions.iter().filter(|r| r.count() == 0.0).count()
    }

    pub fn regression(&self, time: Time) -> Option<&Regression> {
        if !self.initialized() {
            return None;
        }
        let t = self.time.periodic(time);
        let i = self.endpoints.partition_point(|x| *x <= t).clamp(1, self.regressions.len()) - 1;
        self.regressions.get(i)
    }

    /// Spline knots, values and variances at `time`.
    pub fn knots(&self, time: Time, boundary: Boundary) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let n = self.regressions.len();
        let mut knots = Vec::with_capacity(4 * n / 3 + 2);
        let mut values = Vec::with_capacity(4 * n / 3 + 2);
        let mut variances = Vec::with_capacity(4 * n / 3 + 2);
        let Some(first) = self.regressions.iter().position(|r| r.count() > 0.0) else {
            return (knots, values, variances);
        };

        let wide = 3.0 * (self.endpoints[n] - self.endpoints[0]) / n as f64;
        let age = self.age_at(time);
        let value_at = |i: usize| {
            let (a, b) = (self.endpoints[i], self.endpoints[i + 1]);
            let t = self.time.regression(time + (0.5 * (a + b)) as Time);
            predict(&self.regressions[i], t, age)
        };

        knots.push(self.endpoints[0]);
        values.push(value_at(first));
        variances.push(self.variances[first]);
        for i in first..n {
            if self.regressions[i].count() == 0.0 {
                continue;
            }
            let (a, b) = (self.endpoints[i], self.endpoints[i + 1]);
            let (m, v) = (value_at(i), self.variances[i]);
            if b - a > wide {
                knots.extend([(3.0 * a + b) / 4.0, (a + 3.0 * b) / 4.0]);
                values.extend([m, m]);
                variances.extend([v, v]);
            } else {
                knots.push((a + b) / 2.0);
                values.push(m);
                variances.push(v);
            }
        }
        match boundary {
            Boundary::Natural => {
                let (m, v) = (values[values.len() - 1], variances[variances.len() - 1]);
                knots.push(self.endpoints[n]);
                values.push(m);
                variances.push(v);
            }
            Boundary::Periodic => {
                values[0] = (values[0] + values[values.len() - 1]) / 2.0;
                variances[0] = (variances[0] + variances[variances.len() - 1]) / 2.0;
                knots.push(self.endpoints[n]);
                values.push(values[0]);
                variances.push(variances[0]);
            }
        }
        (knots, values, variances)
    }

    pub fn endpoints(&self) -> &[f64] {
        &self.endpoints
    }

    /// Bucket mean values at `time`.
    pub fn values(&self, time: Time) -> Vec<f64> {
        let age = self.age_at(time);
        (0..self.regressions.len())
            .map(|i| {
                let mid = 0.5 * (self.endpoints[i] + self.endpoints[i + 1]);
                predict(&self.regressions[i], self.time.regression(time + mid as Time), age)
            })
            .collect()
    }

    pub fn variances(&self) -> &[f64] {
        &self.variances
    }

    /// Add `shift` to every bucket value.
    pub fn shift_value(&mut self, shift: f64) {
        for regression in &mut self.regressions {
            regression.shift_ordinate(shift);
        }
    }

    fn bucket(&self, time: Time) -> Option<usize> {
        if !self.initialized() {
            return None;
        }
        let t = self.time.periodic(time);
        let i = self.endpoints.partition_point(|x| *x <= t);
        if t < self.endpoints[0] || i == self.endpoints.len() {
            error!(t, "time out of bucketing range");
            return None;
        }
        Some(i - 1)
    }

    /// Keep the regression abscissa near zero.
    fn shift_regressions(&mut self, time: Time) {
        let max_regression_time = (0.5 * TIMESCALE as f64 / self.decay_rate) as Time;
        let due = match self.time.regression_shift() {
            Some(shift) => time >= shift.saturating_add(max_regression_time),
            None => true,
        };
        if due {
            let shift = self.time.start_of_window(time);
            let dx = -self.time.regression(shift);
            for regression in &mut self.regressions {
                regression.shift_abscissa(dx);
            }
            self.time.set_regression_shift(shift);
        }
    }

    /// Age of the bucketing in weeks.
    fn age_at(&self, time: Time) -> f64 {
        match self.initial_time {
            Some(initial) => (time - initial) as f64 / (7 * TIMESCALE) as f64,
            None => f64::INFINITY,
        }
    }

    /// Redistribute bucket statistics from `old` endpoints onto the current ones.
    fn refresh(&mut self, old: &[f64]) {
        let m = self.regressions.len();
        let n = old.len();
        if m + 1 != n {
            error!("inconsistent end points and regressions");
            return;
        }

        let mut regressions = Vec::with_capacity(m);
        let mut variances = Vec::with_capacity(m);
        for i in 1..n {
            let r = old.partition_point(|x| *x < self.endpoints[i]).clamp(1, n - 1);
            let mut l = old.partition_point(|x| *x <= self.endpoints[i - 1]).clamp(1, r);

            let (xl, xr) = (old[l - 1], old[l]);
            if l == r {
                let w = truncate((self.endpoints[i] - self.endpoints[i - 1]) / (xr - xl), 0.0, 1.0);
                regressions.push(self.regressions[l - 1].scaled(w * w));
                variances.push(self.variances[l - 1]);
                continue;
            }

            let moments = |k: usize, w: f64| {
                let r = &self.regressions[k];
                MeanVarAccumulator::from_ml(w * r.count(), r.mean(), self.variances[k])
            };

            let w = truncate((xr - self.endpoints[i - 1]) / (xr - xl), 0.0, 1.0);
            let mut regression = self.regressions[l - 1].scaled(w);
            let mut variance = moments(l - 1, w);
            let mut count = w * w * self.regressions[l - 1].count();
            l += 1;
            while l < r {
                regression.merge(&self.regressions[l - 1]);
                variance.merge(&moments(l - 1, 1.0));
                count += self.regressions[l - 1].count();
                l += 1;
            }
            let (xl, xr) = (old[l - 1], old[l]);
            let w = truncate((self.endpoints[i] - xl) / (xr - xl), 0.0, 1.0);
            regression.merge(&self.regressions[l - 1].scaled(w));
            variance.merge(&moments(l - 1, w));
            count += w * w * self.regressions[l - 1].count();

            if regression.count() > 0.0 {
                regression.scale(count / regression.count());
            }
            regressions.push(regression);
            variances.push(variance.ml_variance());
        }

        // Keep counts proportional to bucket length.
        let total: f64 = regressions.iter().map(Regression::count).sum();
        let density = total / (self.endpoints[m] - self.endpoints[0]);
        for (i, regression) in regressions.iter_mut().enumerate() {
            let c = regression.count();
            if c > 0.0 {
                regression.scale(density * (self.endpoints[i + 1] - self.endpoints[i]) / c);
            }
        }
        self.regressions = regressions;
        self.variances = variances;
    }
}

fn predict(regression: &Regression, t: f64, age: f64) -> f64 {
    if age < MINIMUM_AGE_TO_PREDICT || regression.range() < MINIMUM_RANGE_TO_PREDICT {
        return regression.mean();
    }
    regression.predict(t)
}

/// Move `points` the least total square distance so that neighbours are
/// at least `separation` apart within `[a, b]`.
fn spread(a: f64, b: f64, separation: f64, points: &mut [f64]) {
    let n = points.len();
    if n == 0 || b <= a {
        return;
    }
    if b - a <= separation * n as f64 {
        let last = (n - 1).max(1) as f64;
        for (i, x) in points.iter_mut().enumerate() {
            *x = a + (b - a) * i as f64 / last;
        }
        return;
    }
    points.sort_by(f64::total_cmp);

    // Pool adjacent violators on x_i - i s, then clamp into range.
    let mut blocks: Vec<(f64, usize)> = Vec::with_capacity(n);
    for (i, x) in points.iter().enumerate() {
        blocks.push((x - i as f64 * separation, 1));
        while blocks.len() > 1 {
            let (m2, c2) = blocks[blocks.len() - 1];
            let (m1, c1) = blocks[blocks.len() - 2];
            if m1 <= m2 {
                break;
            }
            blocks.pop();
            let c = c1 + c2;
            let len = blocks.len();
            blocks[len - 1] = ((m1 * c1 as f64 + m2 * c2 as f64) / c as f64, c);
        }
    }
    let hi = b - (n - 1) as f64 * separation;
    let mut i = 0;
    for (mean, count) in blocks {
        for _ in 0..count {
            points[i] = truncate(mean, a, hi) + i as f64 * separation;
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::HOUR;

    fn daily() -> AdaptiveBucketing {
        let mut bucketing = AdaptiveBucketing::new(SeasonalTime::unwindowed(DAY), 0.01, HOUR as f64);
        assert!(bucketing.initialize(0.0, DAY as f64, 12));
        bucketing
    }

    #[test]
    fn test_seasonal_time() {
        let time = SeasonalTime::new(0, time::WEEKEND, WEEK, DAY);
        assert_eq!(time.window(), time::WEEKDAYS);
        assert!(!time.in_window(HOUR));
        assert!(time.in_window(time::WEEKEND + HOUR));
        assert_eq!(time.start_of_window(WEEK + 3 * DAY), WEEK + time::WEEKEND);
        assert_eq!(time.periodic(WEEK + time::WEEKEND + DAY + 10), 10.0);
    }

    #[test]
    fn test_initialize_respects_minimum_length() {
        let mut bucketing = AdaptiveBucketing::new(SeasonalTime::unwindowed(DAY), 0.01, 4.0 * HOUR as f64);
        assert!(bucketing.initialize(0.0, DAY as f64, 24));
        assert_eq!(bucketing.size(), 6);
        assert!(!bucketing.initialize(1.0, 1.0, 3));
    }

    #[test]
    fn test_add_and_knots() {
        let mut bucketing = daily();
        for day in 0..5 {
            for hour in 0..24 {
                let t = day * DAY + hour * HOUR;
                bucketing.add(t, hour as f64, 1.0);
            }
        }
        assert_eq!(bucketing.empty_bucket_count(), 0);
        let (knots, values, variances) = bucketing.knots(5 * DAY, Boundary::Periodic);
        assert_eq!(knots.len(), values.len());
        assert_eq!(knots.len(), variances.len());
        assert!(knots.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(values[0], values[values.len() - 1]);
        // Each bucket covers two hours: mean of h and h + 1.
        assert!((values[3] - 4.5).abs() < 1e-6, "{:?}", values);
    }

    #[test]
    fn test_refine_preserves_total_count() {
        let mut bucketing = daily();
        for day in 0..10 {
            for minute in (0..DAY).step_by(600) {
                let t = day * DAY + minute;
                let x = minute as f64 / DAY as f64;
                let value = if x > 0.4 && x < 0.6 { 100.0 } else { 0.0 };
                bucketing.add(t, value, 1.0);
            }
        }
        let before = bucketing.total_count();
        bucketing.refine(10 * DAY);
        let after = bucketing.total_count();
        assert!((before - after).abs() < 1e-6 * before, "{} vs {}", before, after);
        let endpoints = bucketing.endpoints();
        assert_eq!(endpoints[0], 0.0);
        assert_eq!(endpoints[endpoints.len() - 1], DAY as f64);
        assert!(endpoints.windows(2).all(|w| w[1] - w[0] >= HOUR as f64 - 1e-6));
    }

    #[test]
    fn test_propagate_ages_counts() {
        let mut bucketing = daily();
        for hour in 0..24 {
            bucketing.add(hour * HOUR, 1.0, 1.0);
        }
        let before = bucketing.total_count();
        bucketing.propagate_forwards_by_time(1.0);
        assert!((bucketing.total_count() - before * (-0.01f64).exp()).abs() < 1e-9);
    }

    #[test]
    fn test_spread() {
        let mut points = vec![0.0, 0.1, 0.2, 5.0, 10.0];
        spread(0.0, 10.0, 1.0, &mut points);
        assert!(points.windows(2).all(|w| w[1] - w[0] >= 1.0 - 1e-12), "{:?}", points);
        assert!(points[0] >= 0.0 && points[4] <= 10.0);
        assert_eq!(points[3], 5.0);
    }
}
