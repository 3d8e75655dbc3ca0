//! Periodicity Testing
//!
//! Two tests for daily and weekly seasonality.
//!
//! `PeriodicityTest` keeps aged bucket means over a fixed window and
//! checks, for a short and a long period and for a two way partition of
//! the long period, whether a periodic trend explains a significant share
//! of the variance and leaves autocorrelated values behind. It also
//! produces the per-bucket trends used to seed new seasonal components.
//!
//! `RandomizedPeriodicity` is a cheap test for data too sparse for the
//! regular test. It compares the energy of values projected onto random
//! periodic vectors with that of the same vectors shuffled within each
//! period.

use crate::algo::bucketing::InitialValue;
use crate::algo::trend::{CONFIDENCE_INTERVAL, MAXIMUM_SIGNIFICANCE};
use crate::stats::{
    MeanAccumulator, MeanVarAccumulator, autocorrelation_at_percentile, f_cdf, f_test, truncate,
    variance_at_percentile,
};
use crate::time::{self, DAY, HOUR, Time, WEEK, WEEKDAYS, WEEKEND};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, error, trace};

/// Fraction of buckets which must be populated for an accurate test.
pub const ACCURATE_TEST_POPULATED_FRACTION: f64 = 0.9;
/// Below this coefficient of variation the data is treated as constant.
pub const MINIMUM_COEFFICIENT_OF_VARIATION: f64 = 1e-4;
/// Residual to total variance ratio at which a period is accepted.
pub const HAS_PERIOD_VARIANCE_RATIO: f64 = 0.7;
/// Residual to total variance ratio at which a partition is accepted.
pub const HAS_PARTITION_VARIANCE_RATIO: f64 = 0.5;
/// Amplitude, in standard deviations per bucket, at which a period is accepted.
pub const HAS_PERIOD_AMPLITUDE_IN_SDS: f64 = 1.0;
pub const MINIMUM_AUTOCORRELATION: f64 = 0.5;

/// Bucket lengths the daily and weekly test supports.
pub const PERMITTED_BUCKET_LENGTHS: [Time; 12] =
    [60, 300, 1800, 3600, 7200, 10800, 14400, 21600, 28800, 43200, 86400, 172800];

/// A window of the long period.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interval {
    /// The whole long period.
    Full = 0,
    /// The first partition, i.e. the weekend.
    First = 1,
    /// The second partition, i.e. the weekdays.
    Second = 2,
}

/// A set of the tested periods.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Period {
    None = 0,
    Short = 1,
    Long = 2,
    Both = 3,
}

impl Period {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            1 => Period::Short,
            2 => Period::Long,
            3 => Period::Both,
            _ => Period::None,
        }
    }

    /// True if this set includes any of `other`.
    pub fn contains(self, other: Period) -> bool {
        (self as u32) & (other as u32) != 0
    }
}

/// The periods found in each interval, packed two bits per interval.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeriodicityResult {
    start_of_partition: Time,
    periods: u32,
}

impl PeriodicityResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_if(&mut self, has_period: bool, interval: Interval, period: Period) {
        if has_period {
            self.periods |= (period as u32) << (2 * interval as u32);
        }
    }

    /// Union with `other` if they share a partition.
    pub fn merge(&mut self, other: &PeriodicityResult) {
        if self.start_of_partition == other.start_of_partition {
            self.periods |= other.periods;
        }
    }

    pub fn set_start_of_partition(&mut self, time: Time) {
        self.start_of_partition = time;
    }

    pub fn start_of_partition(&self) -> Time {
        self.start_of_partition
    }

    pub fn periodic(&self) -> bool {
        self.periods != 0
    }

    pub fn periods(&self, interval: Interval) -> Period {
        Period::from_bits(self.periods >> (2 * interval as u32))
    }

    /// Index of the trend for `period` in `interval` in `PeriodicityTest::trends`.
    pub fn index(interval: Interval, period: Period) -> usize {
        (2 * interval as usize + period as usize).saturating_sub(1)
    }

    pub fn print(&self, intervals: [&str; 2], periods: [&str; 2]) -> String {
        let mut result = String::from("{");
        let full = self.periods(Interval::Full);
        let first = self.periods(Interval::First);
        let second = self.periods(Interval::Second);
        for (period, name) in [(Period::Short, periods[0]), (Period::Long, periods[1])] {
            if full.contains(period) {
                result.push_str(&format!(" '{}'", name));
            }
        }
        for (set, interval) in [(first, intervals[0]), (second, intervals[1])] {
            for (period, name) in [(Period::Short, periods[0]), (Period::Long, periods[1])] {
                if set.contains(period) {
                    result.push_str(&format!(" '{} {}'", interval, name));
                }
            }
        }
        result.push_str(" }");
        result
    }

    /// Describe a result of the daily and weekly test.
    pub fn describe(&self) -> String {
        self.print(["weekend", "weekdays"], ["daily", "weekly"])
    }
}

/// Per-bucket moments read by the trend calculations.
trait TrendBucket {
    fn bucket_count(&self) -> f64;
    fn bucket_mean(&self) -> f64;
    fn add_value(&mut self, value: f64, weight: f64);
}

impl TrendBucket for MeanAccumulator {
    fn bucket_count(&self) -> f64 {
        self.count()
    }
    fn bucket_mean(&self) -> f64 {
        self.mean()
    }
    fn add_value(&mut self, value: f64, weight: f64) {
        self.add(value, weight);
    }
}

impl TrendBucket for MeanVarAccumulator {
    fn bucket_count(&self) -> f64 {
        self.count()
    }
    fn bucket_mean(&self) -> f64 {
        self.mean()
    }
    fn add_value(&mut self, value: f64, weight: f64) {
        self.add(value, weight);
    }
}

impl TrendBucket for InitialValue {
    fn bucket_count(&self) -> f64 {
        self.moments.count()
    }
    fn bucket_mean(&self) -> f64 {
        self.moments.mean()
    }
    fn add_value(&mut self, value: f64, weight: f64) {
        self.moments.add(value, weight);
    }
}

type Window = (Time, Time);

/// Working statistics for one run of the regular test.
#[derive(Clone, Debug, Default)]
struct Statistics {
    periods: [Time; 2],
    buckets_per_short: f64,
    buckets_per_long: f64,
    populated_buckets: f64,
    values_per_bucket: f64,
    unexplained_variance: f64,
    degrees_of_freedom: f64,
    candidate_unexplained_variance: f64,
    candidate_degrees_of_freedom: f64,
    start_of_partition: Time,
    shortest_interval: Time,
}

impl Statistics {
    fn new(
        values: &[MeanAccumulator],
        bucket_length: Time,
        windows: &[Window],
        periods: &[Time],
        partition: &[Time],
        populated: f64,
        count: f64,
    ) -> Option<Self> {
        let window = windows.first().map(|w| w.1 - w.0)?;
        let mut result = Statistics {
            periods: [periods[0], periods[1]],
            buckets_per_short: (periods[0] / bucket_length) as f64,
            buckets_per_long: (periods[1] / bucket_length) as f64,
            populated_buckets: (window / bucket_length) as f64 * populated,
            ..Default::default()
        };
        result.values_per_bucket = count / result.populated_buckets;
        if result.populated_buckets <= 2.0 {
            return None;
        }

        let mut trend = vec![MeanVarAccumulator::new(); 1];
        periodic_trend(values, windows, bucket_length, &mut trend);
        let mean = trend[0].mean();
        let variance = trend[0].variance();
        if variance <= MINIMUM_COEFFICIENT_OF_VARIATION * mean {
            return None;
        }
        result.unexplained_variance =
            variance_at_percentile(variance, result.populated_buckets - 1.0, 50.0 + CONFIDENCE_INTERVAL / 2.0);
        result.degrees_of_freedom = result.populated_buckets - 1.0;
        result.shortest_interval = partition.iter().copied().min().unwrap_or(0);
        Some(result)
    }

    fn commit_candidates(&mut self, commit: bool) {
        if commit {
            self.unexplained_variance = self.candidate_unexplained_variance;
            self.degrees_of_freedom = self.candidate_degrees_of_freedom;
        }
    }

    fn can_test_for_short(&self, bucket_length: Time) -> bool {
        bucket_length <= self.periods[0] / 4 && self.populated_buckets > 2.9 * self.buckets_per_short
    }

    fn can_test_for_partition(&self, bucket_length: Time) -> bool {
        bucket_length <= self.shortest_interval / 2 && self.populated_buckets > 1.8 * self.buckets_per_long
    }

    fn can_test_for_long(&self, bucket_length: Time) -> bool {
        bucket_length <= self.periods[1] / 4 && self.populated_buckets > 1.8 * self.buckets_per_long
    }

    fn significance(&self) -> f64 {
        f_test(
            self.candidate_unexplained_variance,
            self.candidate_degrees_of_freedom,
            self.unexplained_variance,
            self.degrees_of_freedom,
        )
    }

    fn amplitude_threshold(&self) -> f64 {
        HAS_PERIOD_AMPLITUDE_IN_SDS * (self.values_per_bucket * self.unexplained_variance).sqrt()
    }

    fn variance_threshold(&self) -> f64 {
        HAS_PERIOD_VARIANCE_RATIO * self.unexplained_variance
    }
}

/// The regular test for a short and long period and a partition of the long one.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PeriodicityTest {
    decay_rate: f64,
    bucket_length: Time,
    window: Time,
    periods: Vec<Time>,
    partition: Vec<Time>,
    bucket_values: Vec<MeanAccumulator>,
}

impl PeriodicityTest {
    pub fn new(decay_rate: f64) -> Self {
        Self {
            decay_rate,
            bucket_length: 0,
            window: 0,
            periods: Vec::new(),
            partition: Vec::new(),
            bucket_values: Vec::new(),
        }
    }

    /// The test for daily and weekly periods with a weekend/weekday
    /// partition, or `None` if `bucket_length` is too long to test.
    pub fn daily_and_weekly(bucket_length: Time, decay_rate: f64) -> Option<Self> {
        let permitted = PERMITTED_BUCKET_LENGTHS.iter().copied().find(|b| *b >= bucket_length)?;
        let bucket_length = permitted.max(HOUR);
        let window = 2 * WEEK * (bucket_length / HOUR);
        let mut result = Self::new(decay_rate);
        if !result.initialize(bucket_length, window, &[DAY, WEEK], &[WEEKEND, WEEKDAYS], &[]) {
            debug!(bucket_length, "can't test daily and weekly periodicity");
            return None;
        }
        Some(result)
    }

    /// Configure the test. Fails if the periods, partition and window
    /// are inconsistent with one another or with `bucket_length`.
    pub fn initialize(
        &mut self,
        bucket_length: Time,
        window: Time,
        periods: &[Time],
        partition: &[Time],
        initial: &[MeanAccumulator],
    ) -> bool {
        let mut periods = periods.to_vec();
        periods.sort_unstable();
        let valid = periods.len() == 2
            && (partition.is_empty() || partition.len() == 2)
            && bucket_length > 0
            && window > periods[1]
            && !(window > 2 * periods[1] && window % periods[1] != 0)
            && periods[0] % bucket_length == 0
            && periods[1] % bucket_length == 0
            && periods[0] > 0
            && periods[1] % periods[0] == 0
            && (partition.is_empty() || partition.iter().sum::<Time>() == periods[1]);
        if !valid {
            error!(bucket_length, window, ?periods, ?partition, "invalid periodicity test");
            self.periods.clear();
            return false;
        }
        self.window = window;
        self.periods = periods;
        self.partition = partition.to_vec();
        self.bucket_length = bucket_length;
        let n = (window / bucket_length) as usize;
        self.bucket_values = vec![MeanAccumulator::new(); n];
        let m = initial.len().min(n);
        self.bucket_values[..m].copy_from_slice(&initial[..m]);
        true
    }

    pub fn initialized(&self) -> bool {
        !self.bucket_values.is_empty()
    }

    pub fn set_decay_rate(&mut self, decay_rate: f64) {
        self.decay_rate = decay_rate;
    }

    /// Age by `elapsed` days.
    pub fn propagate_forwards_by_time(&mut self, elapsed: f64) {
        if elapsed < 0.0 {
            error!(elapsed, "can't propagate periodicity test backwards in time");
            return;
        }
        let factor = (-self.decay_rate * elapsed).exp();
        for value in &mut self.bucket_values {
            value.age(factor);
        }
    }

    pub fn add(&mut self, time: Time, value: f64, weight: f64) {
        if self.bucket_values.is_empty() {
            return;
        }
        let i = (time.rem_euclid(self.window) / self.bucket_length) as usize;
        self.bucket_values[i].add(value, weight);
    }

    pub fn periods(&self) -> &[Time] {
        &self.periods
    }

    pub fn bucket_length(&self) -> Time {
        self.bucket_length
    }

    pub fn window(&self) -> Time {
        self.window
    }

    /// Fraction of buckets with a value.
    pub fn populated_ratio(&self) -> f64 {
        if self.bucket_values.is_empty() {
            return 0.0;
        }
        let populated = self.bucket_values.iter().filter(|v| v.count() > 0.0).count();
        populated as f64 / self.bucket_values.len() as f64
    }

    pub fn seen_sufficient_data(&self) -> bool {
        if self.bucket_length == 0 {
            return false;
        }
        self.bucket_values.len() as f64 * self.populated_ratio()
            > ACCURATE_TEST_POPULATED_FRACTION * (self.window / self.bucket_length) as f64
    }

    fn count(&self) -> f64 {
        self.bucket_values.iter().map(|v| v.count()).sum()
    }

    /// Run the test.
    pub fn test(&self) -> PeriodicityResult {
        let mut result = PeriodicityResult::new();
        if self.periods.len() != 2 {
            return result;
        }
        let b = self.bucket_length;
        let Some(mut statistics) = Statistics::new(
            &self.bucket_values,
            b,
            &self.windows(Interval::Full, 0),
            &self.periods,
            &self.partition,
            self.populated_ratio(),
            self.count(),
        ) else {
            return result;
        };

        let period = (self.periods[0] / b) as usize;
        let has_short = statistics.can_test_for_short(b)
            && (self.test_component_using_unexplained_variance(period, &mut statistics)
                || (self.seen_sufficient_data() && self.test_component_using_amplitude(period, &statistics)))
            && self.test_autocorrelation(period, &statistics);
        statistics.commit_candidates(has_short);

        let has_partition = statistics.can_test_for_partition(b)
            && self.test_for_partition_using_unexplained_variance(&mut statistics);
        statistics.commit_candidates(has_partition);

        let period = (self.periods[1] / b) as usize;
        let has_long = statistics.can_test_for_long(b)
            && (self.test_component_using_unexplained_variance(period, &mut statistics)
                || (!has_short && self.test_component_using_amplitude(period, &statistics)))
            && self.test_autocorrelation(period, &statistics);
        trace!(has_short, has_partition, has_long, "periodicity candidates");

        if !has_partition && !has_long {
            result.add_if(has_short, Interval::Full, Period::Short);
            return result;
        }
        statistics.commit_candidates(has_long);

        let mut candidate = PeriodicityResult::new();
        candidate.add_if(true, Interval::Full, Period::Both);
        candidate.add_if(has_partition, Interval::First, Period::Both);
        candidate.add_if(has_partition, Interval::Second, Period::Both);
        candidate.set_start_of_partition(statistics.start_of_partition);
        let trends = self.trends(&candidate);

        if has_partition {
            for interval in [Interval::First, Interval::Second] {
                let short = &trends[PeriodicityResult::index(interval, Period::Short)];
                let long = &trends[PeriodicityResult::index(interval, Period::Long)];
                let windows = self.windows(interval, candidate.start_of_partition());
                result.add_if(
                    self.test_component_using_explained_variance(short, long, &windows, &statistics),
                    interval,
                    Period::Short,
                );
                result.add_if(
                    self.test_component_using_explained_variance(long, short, &windows, &statistics),
                    interval,
                    Period::Long,
                );
            }
            if result.periods(Interval::First).contains(Period::Short)
                || result.periods(Interval::Second).contains(Period::Short)
            {
                result.set_start_of_partition(candidate.start_of_partition());
                result.add_if(result.periods(Interval::First) == Period::None, Interval::First, Period::Long);
                result.add_if(result.periods(Interval::Second) == Period::None, Interval::Second, Period::Long);
                return result;
            }
        }

        let short = &trends[PeriodicityResult::index(Interval::Full, Period::Short)];
        let long = &trends[PeriodicityResult::index(Interval::Full, Period::Long)];
        let windows = self.windows(Interval::Full, 0);
        let mut result = PeriodicityResult::new();
        result.add_if(
            self.test_component_using_explained_variance(short, long, &windows, &statistics),
            Interval::Full,
            Period::Short,
        );
        result.add_if(
            self.test_component_using_explained_variance(long, short, &windows, &statistics),
            Interval::Full,
            Period::Long,
        );
        result
    }

    /// The per-bucket trends of each period in each interval of `periods`,
    /// indexed by `PeriodicityResult::index`.
    pub fn trends(&self, periods: &PeriodicityResult) -> [Vec<InitialValue>; 6] {
        let mut result: [Vec<InitialValue>; 6] = Default::default();
        for interval in [Interval::First, Interval::Second, Interval::Full] {
            let selected = periods.periods(interval);
            if selected == Period::None {
                continue;
            }
            let windows = self.windows(interval, periods.start_of_partition());
            let short_index = PeriodicityResult::index(interval, Period::Short);
            let long_index = PeriodicityResult::index(interval, Period::Long);
            let (head, tail) = result.split_at_mut(long_index);
            let short = &mut head[short_index];
            let long = &mut tail[0];
            match selected {
                Period::Short => self.periodic_bucketing(self.periods[0], &windows, short),
                Period::Long => self.periodic_bucketing(self.periods[1], &windows, long),
                Period::Both => self.periodic_bucketing_both(&windows, short, long),
                Period::None => {}
            }
        }
        result
    }

    fn windows(&self, interval: Interval, start: Time) -> Vec<Window> {
        match (interval, self.partition.as_slice()) {
            (Interval::Full, _) => vec![(0, self.window)],
            (Interval::First, [first, _]) => compute_windows(start, start + self.window, *first, self.periods[1]),
            (Interval::Second, [first, second]) => {
                compute_windows(start + first, start + self.window, *second, self.periods[1])
            }
            _ => Vec::new(),
        }
    }

    fn test_component_using_unexplained_variance(&self, period: usize, statistics: &mut Statistics) -> bool {
        let degrees_of_freedom = statistics.populated_buckets - period as f64;
        let scale = 1.0 / statistics.values_per_bucket;
        let mut trend = vec![MeanVarAccumulator::new(); period];
        periodic_trend(&self.bucket_values, &self.windows(Interval::Full, 0), self.bucket_length, &mut trend);
        statistics.candidate_unexplained_variance = variance_at_percentile(
            residual_variance_value(&residual_variance(&trend, scale)),
            degrees_of_freedom,
            50.0 + CONFIDENCE_INTERVAL / 2.0,
        );
        statistics.candidate_degrees_of_freedom = degrees_of_freedom;
        statistics.candidate_unexplained_variance <= statistics.variance_threshold()
            && statistics.significance() <= MAXIMUM_SIGNIFICANCE
    }

    fn test_component_using_explained_variance(
        &self,
        trend: &[InitialValue],
        remainder: &[InitialValue],
        windows: &[Window],
        statistics: &Statistics,
    ) -> bool {
        if windows.is_empty() || trend.is_empty() {
            return false;
        }
        let variance_threshold = 0.75
            * statistics.values_per_bucket
            * (1.0 - HAS_PERIOD_VARIANCE_RATIO)
            * statistics.unexplained_variance;
        let amplitude_threshold = 0.75 * statistics.amplitude_threshold();
        let populated: Time = windows.iter().map(|w| (w.1 - w.0) / self.bucket_length).sum();
        let period = trend.len();
        let variance = variance_at_percentile(
            trend_variance(trend),
            populated as f64 - period as f64,
            50.0 + CONFIDENCE_INTERVAL / 2.0,
        );
        if variance >= variance_threshold || trend_amplitude(trend) >= amplitude_threshold {
            let autocorrelation = autocorrelation_at_percentile(
                remainder_autocorrelation(period, self.bucket_length, &self.bucket_values, remainder, windows),
                statistics.populated_buckets,
                50.0 - CONFIDENCE_INTERVAL / 2.0,
            );
            return autocorrelation
                > minimum_autocorrelation(variance, variance_threshold, MINIMUM_AUTOCORRELATION);
        }
        false
    }

    fn test_component_using_amplitude(&self, period: usize, statistics: &Statistics) -> bool {
        let mut trend = vec![MeanVarAccumulator::new(); period];
        periodic_trend(&self.bucket_values, &self.windows(Interval::Full, 0), self.bucket_length, &mut trend);
        trend_amplitude(&trend) > statistics.amplitude_threshold()
    }

    fn test_for_partition_using_unexplained_variance(&self, statistics: &mut Statistics) -> bool {
        let shortest = self.partition.iter().copied().min().unwrap_or(0);
        let degrees_of_freedom = statistics.populated_buckets - (shortest / self.bucket_length) as f64;
        let (variance, start) = self.partition_variance(statistics.values_per_bucket);
        statistics.start_of_partition = start;
        statistics.candidate_unexplained_variance =
            variance_at_percentile(variance, degrees_of_freedom, 50.0 + CONFIDENCE_INTERVAL / 2.0);
        statistics.candidate_degrees_of_freedom = degrees_of_freedom;
        statistics.candidate_unexplained_variance
            <= HAS_PARTITION_VARIANCE_RATIO * statistics.unexplained_variance
            && statistics.significance() <= MAXIMUM_SIGNIFICANCE
    }

    fn test_autocorrelation(&self, period: usize, statistics: &Statistics) -> bool {
        let autocorrelation = autocorrelation_at_percentile(
            autocorrelation(period, &self.bucket_values),
            statistics.populated_buckets,
            50.0 - CONFIDENCE_INTERVAL / 2.0,
        );
        autocorrelation
            > minimum_autocorrelation(
                statistics.variance_threshold(),
                statistics.candidate_unexplained_variance,
                MINIMUM_AUTOCORRELATION,
            )
    }

    /// The smallest mean residual variance of the two partitions with a
    /// daily trend over all offsets of the partition, and that offset.
    fn partition_variance(&self, mean_count: f64) -> (f64, Time) {
        let b = self.bucket_length;
        let short = self.periods[0];
        let long = self.periods[1];
        let length = self.bucket_values.len();
        let windows = [self.windows(Interval::First, 0), self.windows(Interval::Second, 0)];

        let mut deltas: [Vec<Time>; 2] = Default::default();
        for (i, windows) in windows.iter().enumerate() {
            for &(start, end) in windows {
                let mut t = start + short;
                while t <= end {
                    deltas[i].push(t - b);
                    t += short;
                }
            }
        }

        let n = (short / b) as usize;
        let mut trends = [
            VecDeque::from(vec![MeanVarAccumulator::new(); n]),
            VecDeque::from(vec![MeanVarAccumulator::new(); n]),
        ];
        periodic_trend(&self.bucket_values, &windows[0], b, trends[0].make_contiguous());
        periodic_trend(&self.bucket_values, &windows[1], b, trends[1].make_contiguous());

        let scale = 1.0 / mean_count;
        let mut variances = [
            residual_variance(trends[0].make_contiguous(), scale),
            residual_variance(trends[1].make_contiguous(), scale),
        ];
        let mean_variance = |variances: &[MeanAccumulator; 2]| {
            (residual_variance_value(&variances[0]) + residual_variance_value(&variances[1])) / 2.0
        };

        let mut minimum = (mean_variance(&variances), 0);
        let mut candidates = Vec::with_capacity(n);
        let mut time = b;
        while time < long {
            for i in 0..2 {
                for delta in deltas[i].iter_mut() {
                    let t = *delta + b;
                    *delta = if t == self.window { 0 } else { t };
                }
                let old = trends[i].pop_front().unwrap_or_default();
                let mut new = MeanVarAccumulator::new();
                for delta in &deltas[i] {
                    let bucket = &self.bucket_values[(delta / b) as usize % length];
                    new.add(bucket.mean(), bucket.count());
                }
                trends[i].push_back(new);
                variances[i].remove(&bucket_residual_variance(&old, scale));
                variances[i].merge(&bucket_residual_variance(&new, scale));
            }
            let variance = mean_variance(&variances);
            if variance < minimum.0 {
                minimum = (variance, time);
            }
            if variance < 1.05 * minimum.0 {
                candidates.push((variance, time));
            }
            time += b;
        }

        let mut lowest: Option<(f64, Time)> = None;
        for (variance, time) in candidates {
            if variance < 1.05 * minimum.0 {
                let level = self.bucket_values[(time / b) as usize % length].mean().abs();
                if lowest.is_none_or(|(l, t)| (level, time) < (l, t)) {
                    lowest = Some((level, time));
                }
            }
        }
        (minimum.0, lowest.map_or(minimum.1, |(_, time)| time))
    }

    fn initialize_buckets(&self, period: usize, windows: &[Window], trend: &mut Vec<InitialValue>) {
        trend.clear();
        let mut bucket = windows[0].0;
        for _ in 0..period {
            let end = bucket + self.bucket_length;
            trend.push(InitialValue { start: bucket, end, moments: MeanVarAccumulator::new() });
            bucket += self.bucket_length;
        }
    }

    /// Bucket the values in `windows` into one trend of `period`.
    fn periodic_bucketing(&self, period: Time, windows: &[Window], trend: &mut Vec<InitialValue>) {
        trend.clear();
        if windows.is_empty() {
            return;
        }
        let b = self.bucket_length;
        let period = (period.min(windows[0].1 - windows[0].0) / b) as usize;
        if period == 0 {
            return;
        }
        self.initialize_buckets(period, windows, trend);
        let mut scales = vec![MeanAccumulator::new(); period];
        let length = self.bucket_values.len();
        let mut j = 0;
        for &(start, end) in windows {
            for k in (start / b)..(end / b) {
                let bucket = &self.bucket_values[k as usize % length];
                if bucket.count() > 0.0 {
                    trend[j % period].moments.add(bucket.mean(), bucket.count());
                    scales[j % period].add(1.0 / bucket.count(), 1.0);
                }
                j += 1;
            }
        }
        rescale_variances(trend, &scales);
    }

    /// Bucket the values in `windows` into a short and a long trend which
    /// jointly explain them, the long trend only carrying what the short
    /// one can't.
    fn periodic_bucketing_both(&self, windows: &[Window], short: &mut Vec<InitialValue>, long: &mut Vec<InitialValue>) {
        short.clear();
        long.clear();
        if windows.is_empty() {
            return;
        }
        let b = self.bucket_length;
        let window: Time = windows.iter().map(|w| w.1 - w.0).sum();
        let w0 = windows[0].1 - windows[0].0;
        let short_length = self.periods[0].min(w0);
        let long_length = self.periods[1].min(w0);
        let short_period = (short_length / b) as usize;
        let long_period = (long_length / b) as usize;
        if short_period == 0 || long_period == 0 {
            return;
        }
        let length = self.bucket_values.len();
        let s = (window / short_length) as f64;
        let l = (window / long_length) as f64;
        let scale = s / (s + l);

        let mut short_trend = vec![MeanAccumulator::new(); short_period];
        let mut long_trend = vec![MeanAccumulator::new(); long_period];
        periodic_trend(&self.bucket_values, windows, b, &mut short_trend);
        periodic_trend(&self.bucket_values, windows, b, &mut long_trend);
        for bucket in &mut short_trend {
            *bucket = MeanAccumulator::from_moments(bucket.count(), scale * bucket.mean());
        }
        for (i, bucket) in long_trend.iter_mut().enumerate() {
            if bucket.count() > 0.0 {
                bucket.shift(-short_trend[i % short_period].mean());
            }
        }

        let mut shifts = vec![MeanAccumulator::new(); short_period];
        for (i, bucket) in long_trend.iter().enumerate() {
            if bucket.count() > 0.0 {
                shifts[i % short_period].add(bucket.mean(), 1.0);
            }
        }
        for (i, shift) in shifts.iter().enumerate() {
            let shift = shift.mean();
            if shift != 0.0 {
                short_trend[i].shift(shift);
                let mut j = i;
                while j < long_period {
                    if long_trend[j].count() > 0.0 {
                        long_trend[j].shift(-shift);
                    }
                    j += short_period;
                }
            }
        }

        self.initialize_buckets(short_period, windows, short);
        self.initialize_buckets(long_period, windows, long);
        let mut scales = vec![MeanAccumulator::new(); short_period];
        let mut j = 0;
        for &(start, end) in windows {
            for l in (start / b)..(end / b) {
                let bucket = &self.bucket_values[l as usize % length];
                if bucket.count() > 0.0 {
                    let residual = bucket.mean() - long_trend[j % long_period].mean();
                    short[j % short_period].moments.add(residual, bucket.count());
                    scales[j % short_period].add(1.0 / bucket.count(), 1.0);
                }
                j += 1;
            }
        }
        rescale_variances(short, &scales);
        for (value, bucket) in long.iter_mut().zip(&long_trend) {
            value.moments.add(bucket.mean(), 1.0);
        }
    }
}

/// Convert bucket mean variances into per-value variances.
fn rescale_variances(trend: &mut [InitialValue], scales: &[MeanAccumulator]) {
    for (value, scale) in trend.iter_mut().zip(scales) {
        if scale.count() > 0.0 && scale.mean() > 0.0 {
            let m = &value.moments;
            value.moments = MeanVarAccumulator::from_ml(m.count(), m.mean(), m.ml_variance() / scale.mean());
        }
    }
}

fn compute_windows(start: Time, end: Time, length: Time, long_period: Time) -> Vec<Window> {
    let mut result = Vec::new();
    let mut time = start;
    while time < end {
        result.push((time, time + length));
        time += long_period;
    }
    result
}

/// Add the values in `windows` to `trend`, wrapping at its length.
fn periodic_trend<T: TrendBucket>(
    values: &[MeanAccumulator],
    windows: &[Window],
    bucket_length: Time,
    trend: &mut [T],
) {
    if trend.is_empty() || values.is_empty() {
        return;
    }
    let length = values.len();
    let period = trend.len();
    let mut j = 0;
    for &(start, end) in windows {
        for k in (start / bucket_length)..(end / bucket_length) {
            let value = &values[k as usize % length];
            trend[j % period].add_value(value.mean(), value.count());
            j += 1;
        }
    }
}

fn trend_variance<T: TrendBucket>(trend: &[T]) -> f64 {
    let mut result = MeanVarAccumulator::new();
    for bucket in trend {
        result.add(bucket.bucket_mean(), bucket.bucket_count());
    }
    result.variance()
}

fn trend_amplitude<T: TrendBucket>(trend: &[T]) -> f64 {
    let mut level = MeanAccumulator::new();
    for bucket in trend {
        level.add(bucket.bucket_mean(), bucket.bucket_count());
    }
    trend
        .iter()
        .filter(|bucket| bucket.bucket_count() > 0.0)
        .map(|bucket| (bucket.bucket_mean() - level.mean()).abs())
        .fold(0.0, f64::max)
}

fn residual_variance_value(mean: &MeanAccumulator) -> f64 {
    let n = mean.count();
    if n <= 1.0 {
        return mean.mean();
    }
    n / (n - 1.0) * mean.mean()
}

fn bucket_residual_variance(bucket: &MeanVarAccumulator, scale: f64) -> MeanAccumulator {
    MeanAccumulator::from_moments(scale * bucket.count(), bucket.ml_variance())
}

fn residual_variance(trend: &[MeanVarAccumulator], scale: f64) -> MeanAccumulator {
    let mut result = MeanAccumulator::new();
    for bucket in trend {
        result.add(bucket.ml_variance(), bucket.count());
    }
    result.set_count(result.count() * scale);
    result
}

fn minimum_autocorrelation(variance: f64, variance_threshold: f64, autocorrelation_threshold: f64) -> f64 {
    if variance_threshold <= 0.0 {
        return autocorrelation_threshold;
    }
    truncate(1.0 - 0.5 * (variance - variance_threshold) / variance_threshold, 0.8, 1.0) * autocorrelation_threshold
}

/// Autocorrelation at `offset` of the values in `windows` less `trend`.
fn remainder_autocorrelation(
    offset: usize,
    bucket_length: Time,
    values: &[MeanAccumulator],
    trend: &[InitialValue],
    windows: &[Window],
) -> f64 {
    if windows.is_empty() {
        return 0.0;
    }
    let n: Time = windows.iter().map(|w| w.1 / bucket_length - w.0 / bucket_length).sum();
    let mut residuals = vec![MeanAccumulator::new(); n.max(0) as usize];
    periodic_trend(values, windows, bucket_length, &mut residuals);
    if !trend.is_empty() {
        for (i, residual) in residuals.iter_mut().enumerate() {
            if residual.count() > 0.0 {
                residual.shift(-trend[i % trend.len()].bucket_mean());
            }
        }
    }
    autocorrelation(offset, &residuals)
}

/// Circular autocorrelation of the populated bucket means at `offset`.
pub fn autocorrelation(offset: usize, values: &[MeanAccumulator]) -> f64 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    let mut moments = MeanVarAccumulator::new();
    for value in values.iter().filter(|v| v.count() > 0.0) {
        moments.add(value.mean(), 1.0);
    }
    let mean = moments.mean();
    let variance = moments.variance();
    if variance <= 0.0 {
        return 0.0;
    }
    let mut result = MeanAccumulator::new();
    for (i, value) in values.iter().enumerate() {
        let other = &values[(i + offset) % n];
        if value.count() > 0.0 && other.count() > 0.0 {
            result.add((value.mean() - mean) * (other.mean() - mean), 1.0);
        }
    }
    result.mean() / variance
}

const PROJECTIONS: usize = 5;
const SAMPLE_INTERVAL: Time = HOUR;
const DAY_RESAMPLE_INTERVAL: Time = 1_209_600;
const WEEK_RESAMPLE_INTERVAL: Time = 2_419_200;
const SMALL_TEST_SIGNIFICANCE: f64 = 1e-3;

/// Random periodic projections for one period and their shuffled copies.
#[derive(Clone, Debug, Default)]
struct Projections {
    periodic: Vec<Vec<f64>>,
    random: Vec<Vec<f64>>,
}

impl Projections {
    fn generate(seed: u64, period: Time, resample_interval: Time) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = (period / SAMPLE_INTERVAL) as usize;
        let p = (resample_interval / period) as usize;
        let mut result =
            Projections { periodic: Vec::with_capacity(PROJECTIONS), random: Vec::with_capacity(PROJECTIONS) };
        for _ in 0..PROJECTIONS {
            let mut periodic: Vec<f64> = (0..n).map(|_| rng.random_range(-1.0..1.0)).collect();
            let mean = periodic.iter().sum::<f64>() / n as f64;
            periodic.iter_mut().for_each(|x| *x -= mean);
            let mut random = Vec::with_capacity(n * p);
            for _ in 0..p {
                let mut block = periodic.clone();
                block.shuffle(&mut rng);
                random.extend(block);
            }
            result.periodic.push(periodic);
            result.random.push(random);
        }
        result
    }
}

/// Running means of projected values plus the test statistics built from them.
#[derive(Serialize, Deserialize, Clone, Debug)]
struct ProjectionStatistics {
    period: Time,
    resample_interval: Time,
    resampled: Time,
    refreshed: Time,
    projections: Vec<MeanAccumulator>,
    /// Mean squared random and periodic projections.
    statistics: [MeanAccumulator; 2],
    #[serde(skip)]
    cache: Option<Projections>,
}

impl ProjectionStatistics {
    fn new(period: Time, resample_interval: Time) -> Self {
        Self {
            period,
            resample_interval,
            resampled: -resample_interval,
            refreshed: -resample_interval,
            projections: vec![MeanAccumulator::new(); 2 * PROJECTIONS],
            statistics: [MeanAccumulator::new(); 2],
            cache: None,
        }
    }

    fn add(&mut self, seed: u64, time: Time, value: f64) {
        if time >= self.resampled + self.resample_interval {
            self.resampled = time::floor(time, self.resample_interval);
            self.cache = None;
        }
        if time >= self.refreshed + self.resample_interval {
            self.update_statistics();
            self.refreshed = time::floor(time, self.resample_interval);
        }
        let (period, interval, resampled) = (self.period, self.resample_interval, self.resampled);
        let projections = self
            .cache
            .get_or_insert_with(|| Projections::generate(seed ^ resampled as u64, period, interval));
        let t = (time.rem_euclid(interval) / SAMPLE_INTERVAL) as usize;
        let p = (time.rem_euclid(period) / SAMPLE_INTERVAL) as usize;
        for i in 0..PROJECTIONS {
            self.projections[2 * i].add(projections.random[i][t] * value, 1.0);
            self.projections[2 * i + 1].add(projections.periodic[i][p] * value, 1.0);
        }
    }

    fn update_statistics(&mut self) {
        const ALPHA: f64 = 0.1;
        if self.projections[0].count() > 0.0 {
            let mut statistic = [MeanAccumulator::new(); 2];
            for i in 0..PROJECTIONS {
                statistic[0].add(self.projections[2 * i].mean().powi(2), 1.0);
                statistic[1].add(self.projections[2 * i + 1].mean().powi(2), 1.0);
            }
            for (s, t) in self.statistics.iter_mut().zip(&statistic) {
                s.merge(t);
                s.age(1.0 - ALPHA);
            }
        }
        self.projections = vec![MeanAccumulator::new(); 2 * PROJECTIONS];
    }

    fn test(&self) -> bool {
        let n = self.statistics[0].count();
        if n < 1.0 {
            return false;
        }
        let (s0, s1) = (self.statistics[0].mean(), self.statistics[1].mean());
        let ratio = if s0 == s1 {
            1.0
        } else if s0 == 0.0 {
            f64::MAX
        } else {
            s1 / s0
        };
        match f_cdf(ratio, n, n) {
            Some(p) => 1.0 - p < SMALL_TEST_SIGNIFICANCE,
            None => false,
        }
    }
}

/// The small daily and weekly test on random projections.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RandomizedPeriodicity {
    seed: u64,
    day: ProjectionStatistics,
    week: ProjectionStatistics,
}

impl Default for RandomizedPeriodicity {
    fn default() -> Self {
        Self::new(0)
    }
}

impl RandomizedPeriodicity {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            day: ProjectionStatistics::new(DAY, DAY_RESAMPLE_INTERVAL),
            week: ProjectionStatistics::new(WEEK, WEEK_RESAMPLE_INTERVAL),
        }
    }

    pub fn add(&mut self, time: Time, value: f64) {
        self.day.add(self.seed, time, value);
        self.week.add(self.seed.rotate_left(32), time, value);
    }

    /// True if either the daily or weekly projections are significantly
    /// more energetic than their shuffled counterparts.
    pub fn test(&self) -> bool {
        self.day.test() || self.week.test()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_distr::{Distribution, Normal};
    use std::f64::consts::PI;

    fn hourly_test<F: Fn(Time) -> f64>(f: F, seed: u64) -> PeriodicityTest {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let mut test = PeriodicityTest::daily_and_weekly(HOUR, 0.01).unwrap();
        for t in (0..2 * WEEK).step_by(HOUR as usize) {
            test.add(t, f(t) + noise.sample(&mut rng), 1.0);
        }
        test
    }

    #[test]
    fn test_result_bitfield() {
        let mut result = PeriodicityResult::new();
        assert!(!result.periodic());
        result.add_if(true, Interval::Full, Period::Short);
        result.add_if(false, Interval::Full, Period::Long);
        result.add_if(true, Interval::Second, Period::Long);
        assert!(result.periodic());
        assert_eq!(result.periods(Interval::Full), Period::Short);
        assert_eq!(result.periods(Interval::First), Period::None);
        assert_eq!(result.periods(Interval::Second), Period::Long);
        assert_eq!(PeriodicityResult::index(Interval::Full, Period::Short), 0);
        assert_eq!(PeriodicityResult::index(Interval::Second, Period::Long), 5);
        assert_eq!(result.describe(), "{ 'daily' 'weekdays weekly' }");

        let mut other = PeriodicityResult::new();
        other.add_if(true, Interval::Full, Period::Long);
        result.merge(&other);
        assert_eq!(result.periods(Interval::Full), Period::Both);
        other.set_start_of_partition(DAY);
        other.add_if(true, Interval::First, Period::Short);
        result.merge(&other);
        assert_eq!(result.periods(Interval::First), Period::None);
    }

    #[test]
    fn test_initialize_validates_inputs() {
        let mut test = PeriodicityTest::new(0.01);
        assert!(!test.initialize(HOUR, WEEK, &[DAY, WEEK], &[], &[]));
        assert!(!test.initialize(HOUR, 2 * WEEK, &[DAY, WEEK], &[DAY], &[]));
        assert!(!test.initialize(HOUR, 2 * WEEK, &[DAY, WEEK], &[DAY, DAY], &[]));
        assert!(!test.initialize(7 * HOUR, 2 * WEEK, &[DAY, WEEK], &[], &[]));
        assert!(test.periods().is_empty());
        assert!(test.initialize(HOUR, 2 * WEEK, &[WEEK, DAY], &[WEEKEND, WEEKDAYS], &[]));
        assert_eq!(test.periods(), &[DAY, WEEK]);
        assert!(test.initialized());
    }

    #[test]
    fn test_daily_and_weekly_bucket_lengths() {
        assert!(PeriodicityTest::daily_and_weekly(3 * DAY, 0.01).is_none());
        assert!(PeriodicityTest::daily_and_weekly(2 * DAY, 0.01).is_none());
        let test = PeriodicityTest::daily_and_weekly(600, 0.01).unwrap();
        assert_eq!(test.bucket_length(), HOUR);
        assert_eq!(test.window(), 2 * WEEK);
        let test = PeriodicityTest::daily_and_weekly(5000, 0.01).unwrap();
        assert_eq!(test.bucket_length(), 7200);
        assert_eq!(test.window(), 4 * WEEK);
    }

    #[test]
    fn test_detects_daily_period() {
        let test = hourly_test(|t| 20.0 + 10.0 * (2.0 * PI * t as f64 / DAY as f64).sin(), 3);
        assert!(test.seen_sufficient_data());
        let result = test.test();
        assert!(result.periods(Interval::Full).contains(Period::Short), "{}", result.describe());

        let trends = test.trends(&result);
        let daily = &trends[PeriodicityResult::index(Interval::Full, Period::Short)];
        assert_eq!(daily.len(), 24);
        assert_eq!(daily[1].start, HOUR);
        assert!((daily[6].moments.mean() - 30.0).abs() < 1.5, "{}", daily[6].moments.mean());
    }

    #[test]
    fn test_noise_is_not_periodic() {
        let test = hourly_test(|_| 5.0, 11);
        let result = test.test();
        assert!(!result.periodic(), "{}", result.describe());
    }

    #[test]
    fn test_sparse_data_is_not_tested() {
        let mut test = PeriodicityTest::daily_and_weekly(HOUR, 0.01).unwrap();
        test.add(0, 1.0, 1.0);
        test.add(HOUR, 2.0, 1.0);
        assert!(!test.seen_sufficient_data());
        assert!(!test.test().periodic());
    }

    #[test]
    fn test_propagate_ages_buckets() {
        let mut test = hourly_test(|_| 1.0, 5);
        let before = test.populated_ratio();
        test.propagate_forwards_by_time(10.0);
        assert_eq!(test.populated_ratio(), before);
        let total: f64 = test.bucket_values.iter().map(|v| v.count()).sum();
        assert!((total - 336.0 * (-0.1f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn test_autocorrelation_of_periodic_values() {
        let values: Vec<MeanAccumulator> = (0..48)
            .map(|i| MeanAccumulator::from_moments(1.0, (2.0 * PI * i as f64 / 24.0).sin()))
            .collect();
        assert!((autocorrelation(24, &values) - 47.0 / 48.0).abs() < 1e-9);
        assert!(autocorrelation(12, &values) < -0.9);
    }

    #[test]
    fn test_small_test_detects_daily_period() {
        let mut test = RandomizedPeriodicity::new(42);
        for t in (0..12 * WEEK).step_by(HOUR as usize) {
            test.add(t, 100.0 + 50.0 * (2.0 * PI * t as f64 / DAY as f64).sin());
        }
        assert!(test.test());
    }

    #[test]
    fn test_small_test_ignores_noise() {
        let mut rng = StdRng::seed_from_u64(9);
        let noise = Normal::new(100.0, 5.0).unwrap();
        let mut test = RandomizedPeriodicity::new(42);
        for t in (0..12 * WEEK).step_by(HOUR as usize) {
            test.add(t, noise.sample(&mut rng));
        }
        assert!(!test.test());
    }
}
