//! Time Series Decomposition
//!
//! Splits a series online into a long term trend plus seasonal
//! components. Three handlers cooperate by exchanging messages:
//!
//! - `LongTermTrendTest` looks for a trend in the deseasonalised values.
//! - `DailyWeeklyTest` looks for daily and weekly periodicity in the
//!   detrended values, falling back to a cheap randomized test when the
//!   data is too sparse for the regular one.
//! - `Components` owns the trend regression and the seasonal components,
//!   rebuilding them when a test detects something and splitting every
//!   new value between them.
//!
//! Handlers never call one another directly. Anything one of them
//! detects is queued as a `Message` and delivered to all three.

use crate::algo::bucketing::{InitialValue, SeasonalTime, TIMESCALE};
use crate::algo::forgetting::ExponentialForgetting;
use crate::algo::periodicity::{Interval, Period, PeriodicityResult, PeriodicityTest, RandomizedPeriodicity};
use crate::algo::regression::Regression;
use crate::algo::seasonal::SeasonalComponent;
use crate::algo::spline::Boundary;
use crate::algo::trend::TrendTest;
use crate::config::DecompositionConfig;
use crate::stats::{MeanAccumulator, MeanVarAccumulator, normal_quantile, state_checksum};
use crate::time::{self, DAY, HOUR, Time, WEEK, WEEKEND};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, error, trace, warn};

/// Width of the blend applied either side of a window boundary.
pub const SMOOTHING_INTERVAL: Time = HOUR;
/// Default number of buckets in a seasonal component.
pub const DEFAULT_COMPONENT_SIZE: usize = 36;

const FORECASTING_INTERVAL: Time = HOUR;
const TREND_ORIGIN_SHIFT_INTERVAL: Time = 3 * WEEK;
const FOREVER: Time = Time::MAX;

/// Which parts of the decomposition a baseline includes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Part {
    Trend,
    Seasonal,
    All,
}

impl Part {
    fn trend(self) -> bool {
        matches!(self, Part::Trend | Part::All)
    }

    fn seasonal(self) -> bool {
        matches!(self, Part::Seasonal | Part::All)
    }
}

/// Messages passed between the handlers.
#[derive(Clone, Debug)]
pub enum Message {
    /// A new value with the current trend and seasonal baselines.
    AddValue { time: Time, value: f64, weight: f64, trend: f64, seasonal: f64 },
    DetectedTrend { time: Time, test: TrendTest },
    /// New periodic components and the bucket values to seed them with,
    /// indexed by `PeriodicityResult::index`.
    DetectedPeriodic { time: Time, result: PeriodicityResult, trends: Box<[Vec<InitialValue>; 6]> },
    /// Drop the components with these periods.
    DiscardPeriodic { time: Time, periods: Vec<Time> },
}

impl Message {
    pub fn time(&self) -> Time {
        match self {
            Message::AddValue { time, .. }
            | Message::DetectedTrend { time, .. }
            | Message::DetectedPeriodic { time, .. }
            | Message::DiscardPeriodic { time, .. } => *time,
        }
    }
}

/// Messages queued by handlers and whether the components changed.
#[derive(Default)]
pub struct Outbox {
    messages: VecDeque<Message>,
    changed: bool,
}

impl Outbox {
    pub fn forward(&mut self, message: Message) {
        self.messages.push_back(message);
    }

    pub fn changed(&self) -> bool {
        self.changed
    }
}

pub trait Handler {
    fn handle(&mut self, message: &Message, outbox: &mut Outbox);
}

/// Schedule a test every `interval`, returning true when one is due.
fn should_test(time: Time, interval: Time, next_test_time: &mut Time) -> bool {
    if time >= *next_test_time {
        *next_test_time = time::ceil(time.saturating_add(1), interval);
        return true;
    }
    false
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
enum TrendState {
    Initial,
    Learn,
    Test,
    NotTesting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TrendSymbol {
    NewValue,
    StartTest,
    FinishTest,
    Reset,
}

impl TrendState {
    fn transition(self, symbol: TrendSymbol) -> Option<Self> {
        use TrendState::*;
        match (symbol, self) {
            (TrendSymbol::NewValue, NotTesting) => Some(NotTesting),
            (TrendSymbol::NewValue, Test) => Some(Test),
            (TrendSymbol::NewValue, _) => Some(Learn),
            (TrendSymbol::StartTest, Initial) => None,
            (TrendSymbol::StartTest, NotTesting) => Some(NotTesting),
            (TrendSymbol::StartTest, _) => Some(Test),
            (TrendSymbol::FinishTest, _) => Some(NotTesting),
            (TrendSymbol::Reset, _) => Some(Initial),
        }
    }
}

/// Tests the deseasonalised values for a long term trend.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LongTermTrendTest {
    state: TrendState,
    maximum_decay_rate: f64,
    next_test_time: Time,
    test: Option<TrendTest>,
}

impl LongTermTrendTest {
    pub fn new(decay_rate: f64) -> Self {
        Self {
            state: TrendState::Initial,
            maximum_decay_rate: decay_rate,
            next_test_time: 0,
            test: Some(TrendTest::new(decay_rate)),
        }
    }

    pub fn set_decay_rate(&mut self, decay_rate: f64) {
        if let Some(test) = self.test.as_mut() {
            test.set_decay_rate(decay_rate.max(self.maximum_decay_rate));
        }
    }

    pub fn propagate_forwards_by_time(&mut self, elapsed: f64) {
        if let Some(test) = self.test.as_mut() {
            test.propagate_forwards_by_time(elapsed);
        }
    }

    pub fn skip_time(&mut self, skip: Time) {
        self.next_test_time = time::floor(self.next_test_time + skip + TIMESCALE, TIMESCALE);
    }

    /// Run the trend test if one is due.
    pub fn test(&mut self, time: Time, outbox: &mut Outbox) {
        if !should_test(time, TIMESCALE, &mut self.next_test_time) {
            return;
        }
        match self.state {
            TrendState::NotTesting | TrendState::Initial => {}
            TrendState::Learn => {
                self.apply(TrendSymbol::StartTest, time);
                self.test(time, outbox);
            }
            TrendState::Test => {
                if let Some(test) = self.test.as_ref().filter(|test| test.test()) {
                    outbox.forward(Message::DetectedTrend { time, test: test.clone() });
                    self.apply(TrendSymbol::FinishTest, time);
                }
            }
        }
    }

    fn add(&mut self, time: Time, value: f64, weight: f64, outbox: &mut Outbox) {
        self.test(time, outbox);
        match self.state {
            TrendState::NotTesting => {}
            TrendState::Test | TrendState::Learn => {
                let capture = self.state == TrendState::Test;
                let Some(test) = self.test.as_mut() else {
                    error!(state = ?self.state, "trend test missing");
                    self.apply(TrendSymbol::Reset, time);
                    return;
                };
                test.add(time, value, weight);
                if capture {
                    test.capture_variance(time, value, weight);
                }
            }
            TrendState::Initial => {
                self.apply(TrendSymbol::NewValue, time);
                self.add(time, value, weight, outbox);
            }
        }
    }

    fn apply(&mut self, symbol: TrendSymbol, time: Time) {
        let old = self.state;
        let Some(state) = old.transition(symbol) else {
            error!(?old, ?symbol, "illegal trend test transition");
            return;
        };
        self.state = state;
        if state == old {
            return;
        }
        trace!(?old, ?symbol, ?state, "trend test transition");
        if old == TrendState::Initial {
            self.next_test_time = time + 2 * WEEK;
        }
        match state {
            TrendState::Learn | TrendState::Test => {}
            TrendState::NotTesting => {
                self.next_test_time = 0;
                self.test = None;
            }
            TrendState::Initial => {
                self.next_test_time = 0;
                self.test = Some(TrendTest::new(self.maximum_decay_rate));
            }
        }
    }
}

impl Handler for LongTermTrendTest {
    fn handle(&mut self, message: &Message, outbox: &mut Outbox) {
        match message {
            Message::AddValue { time, value, weight, seasonal, .. } => {
                self.add(*time, value - seasonal, *weight, outbox)
            }
            Message::DetectedPeriodic { time, .. } if self.state != TrendState::NotTesting => {
                self.apply(TrendSymbol::Reset, *time)
            }
            _ => {}
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
enum PeriodicState {
    Initial,
    SmallTest,
    RegularTest,
    NotTesting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PeriodicSymbol {
    NewValue,
    SmallTestTrue,
    RegularTestTimedOut,
    FinishTest,
    DetectedIncompatiblePeriod,
    Reset,
}

impl PeriodicState {
    fn transition(self, symbol: PeriodicSymbol) -> Option<Self> {
        use PeriodicState::*;
        match (symbol, self) {
            (_, NotTesting) => Some(NotTesting),
            (PeriodicSymbol::NewValue, SmallTest) => Some(SmallTest),
            (PeriodicSymbol::NewValue, _) => Some(RegularTest),
            (PeriodicSymbol::SmallTestTrue, SmallTest) => Some(RegularTest),
            (PeriodicSymbol::RegularTestTimedOut, RegularTest) => Some(SmallTest),
            (PeriodicSymbol::FinishTest, RegularTest) => Some(NotTesting),
            (PeriodicSymbol::DetectedIncompatiblePeriod, _) => Some(NotTesting),
            (PeriodicSymbol::Reset, _) => Some(Initial),
            _ => None,
        }
    }
}

/// Tests the detrended values for daily and weekly periodicity.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DailyWeeklyTest {
    state: PeriodicState,
    decay_rate: f64,
    bucket_length: Time,
    next_test_time: Time,
    started_regular_test: Time,
    time_out_regular_test: Time,
    regular_test: Option<PeriodicityTest>,
    small_test: Option<RandomizedPeriodicity>,
    periods: PeriodicityResult,
}

impl DailyWeeklyTest {
    pub fn new(decay_rate: f64, bucket_length: Time) -> Self {
        Self {
            state: PeriodicState::Initial,
            decay_rate,
            bucket_length,
            next_test_time: 0,
            started_regular_test: 0,
            time_out_regular_test: 0,
            regular_test: None,
            small_test: None,
            periods: PeriodicityResult::new(),
        }
    }

    /// The last periodic result.
    pub fn periods(&self) -> &PeriodicityResult {
        &self.periods
    }

    pub fn propagate_forwards_by_time(&mut self, elapsed: f64) {
        if let Some(test) = self.regular_test.as_mut() {
            test.propagate_forwards_by_time(elapsed);
        }
    }

    pub fn skip_time(&mut self, skip: Time) {
        let interval = self.test_interval();
        if interval != FOREVER {
            self.next_test_time = time::floor(self.next_test_time + skip + interval, interval);
        }
        self.time_out_regular_test += skip;
    }

    /// Run the current test if one is due.
    pub fn test(&mut self, time: Time, outbox: &mut Outbox) {
        match self.state {
            PeriodicState::NotTesting | PeriodicState::Initial => {}
            PeriodicState::SmallTest => {
                let interval = self.test_interval();
                if should_test(time, interval, &mut self.next_test_time)
                    && self.small_test.as_ref().is_some_and(RandomizedPeriodicity::test)
                {
                    trace!(time, "switching to regular periodicity test");
                    self.apply(PeriodicSymbol::SmallTestTrue, time);
                }
            }
            PeriodicState::RegularTest => {
                let interval = self.test_interval();
                if !should_test(time, interval, &mut self.next_test_time) {
                    return;
                }
                let Some(test) = self.regular_test.as_ref() else {
                    self.apply(PeriodicSymbol::Reset, time);
                    return;
                };
                let result = test.test();
                trace!(time, result = %result.describe(), "regular periodicity test");
                if result.periodic() && result != self.periods {
                    debug!(time, periods = %result.describe(), "detected periodic components");
                    outbox.forward(Message::DetectedPeriodic {
                        time,
                        result,
                        trends: Box::new(test.trends(&result)),
                    });
                    self.periods = result;
                }
                if result.periodic() {
                    if test.seen_sufficient_data() {
                        trace!(time, "finished periodicity testing");
                        self.apply(PeriodicSymbol::FinishTest, time);
                    } else {
                        self.next_test_time = time::ceil(self.started_regular_test + 2 * WEEK, self.test_interval());
                    }
                }
            }
        }
    }

    fn add(&mut self, time: Time, value: f64, weight: f64, outbox: &mut Outbox) {
        self.test(time, outbox);
        match self.state {
            PeriodicState::NotTesting => {}
            PeriodicState::SmallTest => {
                if let Some(test) = self.small_test.as_mut() {
                    test.add(time, value);
                }
            }
            PeriodicState::RegularTest => {
                let time_out = self.time_out();
                match self.regular_test.as_mut() {
                    Some(test) if time < time_out => test.add(time, value, weight),
                    Some(test) => {
                        trace!(time, "switching to small periodicity test");
                        outbox.forward(Message::DiscardPeriodic { time, periods: test.periods().to_vec() });
                        self.apply(PeriodicSymbol::RegularTestTimedOut, time);
                        self.add(time, value, weight, outbox);
                    }
                    None => self.apply(PeriodicSymbol::Reset, time),
                }
            }
            PeriodicState::Initial => {
                self.apply(PeriodicSymbol::NewValue, time);
                self.add(time, value, weight, outbox);
            }
        }
    }

    fn apply(&mut self, symbol: PeriodicSymbol, time: Time) {
        let old = self.state;
        let Some(state) = old.transition(symbol) else {
            error!(?old, ?symbol, "illegal periodicity test transition");
            return;
        };
        self.state = state;
        if state == old {
            return;
        }
        trace!(?old, ?symbol, ?state, "periodicity test transition");
        if old == PeriodicState::Initial {
            self.next_test_time = time;
            self.time_out_regular_test = time + self.scale(5 * WEEK);
        }
        match state {
            PeriodicState::SmallTest => {
                self.regular_test = None;
                if self.small_test.is_none() {
                    self.small_test = Some(RandomizedPeriodicity::new(time as u64));
                }
            }
            PeriodicState::RegularTest => {
                if self.small_test.take().is_some() {
                    self.time_out_regular_test = time + self.scale(9 * WEEK);
                }
                if self.regular_test.is_none() {
                    self.started_regular_test = time;
                    let decay_rate = SeasonalTime::scale_decay_rate(self.decay_rate, TIMESCALE, WEEK);
                    self.regular_test = PeriodicityTest::daily_and_weekly(self.bucket_length, decay_rate);
                    if self.regular_test.is_none() {
                        self.apply(PeriodicSymbol::DetectedIncompatiblePeriod, time);
                    }
                }
            }
            PeriodicState::NotTesting | PeriodicState::Initial => {
                self.next_test_time = 0;
                self.time_out_regular_test = 0;
                self.small_test = None;
                self.regular_test = None;
            }
        }
    }

    fn test_interval(&self) -> Time {
        match (self.state, self.regular_test.as_ref()) {
            (PeriodicState::SmallTest, _) => DAY,
            (PeriodicState::RegularTest, Some(test)) if test.seen_sufficient_data() => 2 * WEEK,
            (PeriodicState::RegularTest, _) => DAY,
            _ => FOREVER,
        }
    }

    /// The regular test times out later the fewer buckets it has populated.
    fn time_out(&self) -> Time {
        let unpopulated = 1.0 - self.regular_test.as_ref().map_or(0.0, PeriodicityTest::populated_ratio);
        self.time_out_regular_test + (6.0 * WEEK as f64 * unpopulated) as Time
    }

    fn scale(&self, interval: Time) -> Time {
        interval * (self.bucket_length / HOUR).max(1)
    }
}

impl Handler for DailyWeeklyTest {
    fn handle(&mut self, message: &Message, outbox: &mut Outbox) {
        match message {
            Message::AddValue { time, value, weight, trend, .. } => self.add(*time, value - trend, *weight, outbox),
            Message::DetectedTrend { time, .. } if self.state != PeriodicState::NotTesting => {
                self.apply(PeriodicSymbol::Reset, *time)
            }
            _ => {}
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
enum ComponentsState {
    NewComponents,
    Normal,
    Forecasting,
    Disabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ComponentsSymbol {
    Added,
    Interpolated,
    Forecast,
    Reset,
}

impl ComponentsState {
    fn transition(self, symbol: ComponentsSymbol) -> Option<Self> {
        use ComponentsState::*;
        match (symbol, self) {
            (ComponentsSymbol::Reset, _) => Some(Normal),
            (_, Disabled) => Some(Disabled),
            (ComponentsSymbol::Added, Forecasting) => None,
            (ComponentsSymbol::Added, _) => Some(NewComponents),
            (ComponentsSymbol::Interpolated, Forecasting) => Some(Forecasting),
            (ComponentsSymbol::Interpolated, _) => Some(Normal),
            (ComponentsSymbol::Forecast, NewComponents) => None,
            (ComponentsSymbol::Forecast, _) => Some(Forecasting),
        }
    }
}

/// The long term trend regression, in weeks since `origin`.
#[derive(Serialize, Deserialize, Clone, Debug)]
struct TrendComponent {
    regression: Regression,
    /// Maximum likelihood residual variance.
    variance: f64,
    origin: Time,
}

impl TrendComponent {
    fn time(&self, time: Time) -> f64 {
        time::weeks(time - self.origin)
    }

    fn shift_time(&mut self, time: Time) {
        if time - TREND_ORIGIN_SHIFT_INTERVAL >= self.origin {
            self.regression.shift_abscissa(-self.time(time));
            self.origin = time;
        }
    }
}

/// Owns the trend and seasonal components and keeps them up to date.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Components {
    state: ComponentsState,
    decay_rate: f64,
    bucket_length: Time,
    longest_period: Time,
    size: usize,
    last_interpolated_time: Time,
    next_interpolate_time: Time,
    trend: Option<TrendComponent>,
    seasonal: Vec<SeasonalComponent>,
}

impl Components {
    pub fn new(decay_rate: f64, bucket_length: Time, size: usize) -> Self {
        Self {
            state: ComponentsState::Normal,
            decay_rate,
            bucket_length,
            longest_period: 0,
            size,
            last_interpolated_time: 0,
            next_interpolate_time: 0,
            trend: None,
            seasonal: Vec::new(),
        }
    }

    pub fn seasonal(&self) -> &[SeasonalComponent] {
        &self.seasonal
    }

    pub fn forecasting(&self) -> bool {
        self.state == ComponentsState::Forecasting
    }

    pub fn forecast(&mut self) {
        self.apply(ComponentsSymbol::Forecast, self.last_interpolated_time);
    }

    pub fn initialized(&self) -> bool {
        self.trend.is_some() || self.seasonal.iter().any(SeasonalComponent::initialized)
    }

    pub fn set_decay_rate(&mut self, decay_rate: f64) {
        self.decay_rate = decay_rate;
        for component in &mut self.seasonal {
            component.set_decay_rate(decay_rate);
        }
    }

    pub fn interpolate_interval(&self) -> Time {
        if self.forecasting() { FORECASTING_INTERVAL } else { TIMESCALE }
    }

    pub fn propagation_interval(&self) -> Time {
        if self.forecasting() { FORECASTING_INTERVAL } else { TIMESCALE }
    }

    /// Age the components over `[start, end]`.
    pub fn propagate_forwards(&mut self, start: Time, end: Time) {
        let elapsed = (end - start) as f64 / self.propagation_interval() as f64;
        if let Some(trend) = self.trend.as_mut() {
            trend.regression.age(ExponentialForgetting::new(self.decay_rate).factor(elapsed));
        }
        for component in &mut self.seasonal {
            component.propagate_forwards_by_time(elapsed);
        }
    }

    pub fn skip_time(&mut self, skip: Time) {
        let interval = self.interpolate_interval();
        self.next_interpolate_time = time::floor(self.next_interpolate_time + skip + interval, interval);
    }

    /// Refit the components if an interpolation is due.
    pub fn interpolate(&mut self, time: Time) {
        if self.state == ComponentsState::Disabled || !self.should_interpolate(time) {
            return;
        }
        trace!(time, "interpolating components");
        self.last_interpolated_time = time::floor(time, self.interpolate_interval());
        if let Some(trend) = self.trend.as_mut() {
            trend.shift_time(self.next_interpolate_time);
        }
        let refine = !self.forecasting();
        for component in &mut self.seasonal {
            component.interpolate(self.last_interpolated_time, refine);
        }
        self.apply(ComponentsSymbol::Interpolated, time);
    }

    /// Confidence interval for the trend at `time`.
    pub fn trend_prediction(&self, time: Time, confidence: f64) -> (f64, f64) {
        let Some(trend) = self.trend.as_ref() else {
            return (0.0, 0.0);
        };
        let time = time.min(self.horizon());
        let m = trend.regression.predict(trend.time(time));
        let sd = trend.variance.sqrt();
        if confidence > 0.0 && sd > 0.0 {
            let ql = normal_quantile((100.0 - confidence) / 200.0);
            let qu = normal_quantile((100.0 + confidence) / 200.0);
            return (m + sd * ql, m + sd * qu);
        }
        (m, m)
    }

    /// Mean of the trend over `[a, b]`.
    pub fn trend_mean(&self, a: Time, b: Time) -> f64 {
        let horizon = self.horizon();
        self.trend
            .as_ref()
            .map_or(0.0, |trend| trend.regression.mean_over(trend.time(a.min(horizon)), trend.time(b.min(horizon))))
    }

    pub fn trend_variance(&self) -> f64 {
        self.trend.as_ref().map_or(0.0, |trend| trend.variance)
    }

    pub fn mean_value(&self) -> f64 {
        if !self.initialized() {
            return 0.0;
        }
        let interval = self.interpolate_interval();
        self.trend_mean(self.last_interpolated_time, self.last_interpolated_time + interval)
            + mean_of(&self.seasonal, SeasonalComponent::mean_value)
    }

    pub fn mean_variance(&self) -> f64 {
        if !self.initialized() {
            return 0.0;
        }
        self.trend_variance() + mean_of(&self.seasonal, SeasonalComponent::mean_variance)
    }

    fn horizon(&self) -> Time {
        if self.forecasting() {
            FOREVER
        } else {
            self.last_interpolated_time + self.interpolate_interval()
        }
    }

    fn should_interpolate(&mut self, time: Time) -> bool {
        let interval = self.interpolate_interval();
        if self.state == ComponentsState::NewComponents || time >= self.next_interpolate_time {
            self.next_interpolate_time = time::ceil(time + 1, interval);
            return true;
        }
        false
    }

    fn apply(&mut self, symbol: ComponentsSymbol, time: Time) {
        if symbol == ComponentsSymbol::Reset {
            self.trend = None;
            self.seasonal.clear();
        }
        let old = self.state;
        let Some(state) = old.transition(symbol) else {
            error!(?old, ?symbol, "illegal components transition");
            return;
        };
        self.state = state;
        if state == old {
            return;
        }
        trace!(?old, ?symbol, ?state, "components transition");
        match state {
            ComponentsState::Normal | ComponentsState::Forecasting | ComponentsState::NewComponents => {
                self.interpolate(time)
            }
            ComponentsState::Disabled => {
                self.trend = None;
                self.seasonal.clear();
            }
        }
    }

    fn add(&mut self, time: Time, value: f64, weight: f64) {
        if !matches!(self.state, ComponentsState::Normal | ComponentsState::NewComponents)
            || (self.trend.is_none() && self.seasonal.is_empty())
        {
            return;
        }
        self.interpolate(time);

        let active: Vec<usize> =
            (0..self.seasonal.len()).filter(|&i| self.seasonal[i].time().in_window(time)).collect();
        let mut deltas = vec![0.0; active.len()];
        for k in 1..active.len() {
            let period = self.seasonal[active[k - 1]].time().period();
            deltas[k - 1] = 0.2 * self.seasonal[active[k]].difference_from_mean(time, period);
        }
        let x0 = self.trend_prediction(time, 0.0).0;
        let x: Vec<f64> = active.iter().map(|&i| self.seasonal[i].value(time, 0.0).0).collect();
        let values = decompose(x0, &x, &deltas, value);

        if let Some(trend) = self.trend.as_mut() {
            let mut moments = MeanVarAccumulator::from_ml(trend.regression.count(), x0, trend.variance);
            moments.add(values[0], weight);
            trend.regression.add(trend.time(time), values[0], weight);
            trend.variance = moments.ml_variance();
        }
        let longest_period = self.longest_period as f64;
        for (k, &i) in active.iter().enumerate() {
            let component = &mut self.seasonal[i];
            let window = component.time().window().max(1) as f64;
            component.add(time, values[k + 1], weight * longest_period / window);
        }
    }

    fn add_trend(&mut self, time: Time, test: &TrendTest, outbox: &mut Outbox) {
        if !matches!(self.state, ComponentsState::Normal | ComponentsState::NewComponents) {
            return;
        }
        debug!(time, "detected long term trend");
        outbox.changed |= self.seasonal.is_empty();
        self.trend = Some(TrendComponent {
            regression: if self.seasonal.is_empty() { test.trend().clone() } else { Regression::cubic() },
            variance: test.variance(),
            origin: test.origin(),
        });
        self.apply(ComponentsSymbol::Added, time);
    }

    fn add_seasonal(
        &mut self,
        time: Time,
        result: &PeriodicityResult,
        trends: &[Vec<InitialValue>; 6],
        outbox: &mut Outbox,
    ) {
        const PERIODS: [(Time, Period); 2] = [(DAY, Period::Short), (WEEK, Period::Long)];
        const WINDOWS: [(Interval, Time, Time); 3] =
            [(Interval::Second, WEEKEND, WEEK), (Interval::First, 0, WEEKEND), (Interval::Full, 0, WEEK)];

        if !matches!(self.state, ComponentsState::Normal | ComponentsState::NewComponents) {
            return;
        }
        outbox.changed = true;
        let start_of_week = result.start_of_partition();
        debug!(time, start_of_week, periods = %result.describe(), "creating seasonal components");

        let s = self.size;
        let sizes = [[s, s], [s, s / 2], [s, 2 * s]];
        let starts = [[time - WEEK, time - WEEK], [time - WEEK, time - WEEK], [time - DAY, time - WEEK]];
        self.seasonal.clear();
        for (i, &(period, selector)) in PERIODS.iter().enumerate() {
            for (j, &(interval, window_start, window_end)) in WINDOWS.iter().enumerate() {
                if !result.periods(interval).contains(selector) {
                    continue;
                }
                let index = PeriodicityResult::index(interval, selector);
                let mut component = SeasonalComponent::new(
                    SeasonalTime::new(start_of_week, window_start, window_end, period),
                    sizes[j][i],
                    self.decay_rate,
                    self.bucket_length as f64,
                    Boundary::Natural,
                );
                if component.initialize(starts[j][i], time, &trends[index]) {
                    self.seasonal.push(component);
                    self.longest_period = self.longest_period.max(period);
                }
            }
        }
        self.apply(ComponentsSymbol::Added, time);
    }

    fn discard_seasonal(&mut self, time: Time, periods: &[Time], outbox: &mut Outbox) {
        if self.seasonal.is_empty() {
            return;
        }
        let before = self.seasonal.len();
        let mut shift = 0.0;
        self.seasonal.retain(|component| {
            let discard = periods.contains(&component.time().period());
            if discard {
                shift += component.mean_value();
            }
            !discard
        });
        outbox.changed |= self.seasonal.len() < before;
        debug!(time, shift, remaining = self.seasonal.len(), "discarded seasonal components");
        if let Some(trend) = self.trend.as_mut() {
            trend.regression.shift_ordinate(shift);
        } else {
            let mut shifted = Vec::new();
            for component in &mut self.seasonal {
                let window = (component.time().window_start(), component.time().window_end());
                if !shifted.contains(&window) {
                    shifted.push(window);
                    component.shift(shift);
                }
            }
        }
    }
}

impl Handler for Components {
    fn handle(&mut self, message: &Message, outbox: &mut Outbox) {
        match message {
            Message::AddValue { time, value, weight, .. } => self.add(*time, *value, *weight),
            Message::DetectedTrend { time, test } => self.add_trend(*time, test, outbox),
            Message::DetectedPeriodic { time, result, trends } => self.add_seasonal(*time, result, trends, outbox),
            Message::DiscardPeriodic { time, periods } => self.discard_seasonal(*time, periods, outbox),
        }
    }
}

/// Split `value` between the trend, with prediction `x0`, and the
/// components with values `x`, proportionally to their magnitudes.
/// `deltas` move the difference between nested periods into the shorter one.
fn decompose(x0: f64, x: &[f64], deltas: &[f64], value: f64) -> Vec<f64> {
    let n = x.len();
    let xhat = x0 + x.iter().sum::<f64>();
    let z = x0.abs() + x.iter().map(|xi| xi.abs()).sum::<f64>();
    let mut result = Vec::with_capacity(n + 1);
    let mut last_delta = 0.0;
    if z == 0.0 {
        let z = (n + 1) as f64;
        result.push((value - xhat) / z);
        for delta in deltas {
            result.push((value - xhat) / z + delta - last_delta);
            last_delta = *delta;
        }
    } else {
        result.push(x0 + (value - xhat) * x0.abs() / z);
        for (xi, delta) in x.iter().zip(deltas) {
            result.push(xi + (value - xhat) * xi.abs() / z + delta - last_delta);
            last_delta = *delta;
        }
    }
    result
}

/// Mean of `mean` over the initialized components, summing within a
/// window and weighting windows by their length.
fn mean_of(components: &[SeasonalComponent], mean: fn(&SeasonalComponent) -> f64) -> f64 {
    let mut means: BTreeMap<(Time, Time), f64> = BTreeMap::new();
    for component in components.iter().filter(|c| c.initialized()) {
        let time = component.time();
        *means.entry((time.window_start(), time.window_end())).or_default() += mean(component);
    }
    let mut result = MeanAccumulator::new();
    for ((start, end), value) in means {
        result.add(value, (end - start) as f64);
    }
    result.mean()
}

/// Online decomposition of one series into trend and seasonal components.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TrendDecomposition {
    decay_rate: f64,
    last_value_time: Option<Time>,
    last_propagation_time: Time,
    trend_test: LongTermTrendTest,
    daily_weekly_test: DailyWeeklyTest,
    components: Components,
}

impl TrendDecomposition {
    pub fn new(decay_rate: f64, bucket_length: Time, seasonal_component_size: usize) -> Self {
        Self {
            decay_rate,
            last_value_time: None,
            last_propagation_time: 0,
            trend_test: LongTermTrendTest::new(decay_rate),
            daily_weekly_test: DailyWeeklyTest::new(decay_rate, bucket_length),
            components: Components::new(decay_rate, bucket_length, seasonal_component_size),
        }
    }

    pub fn with_config(config: &DecompositionConfig) -> Self {
        Self::new(config.decay_rate, config.bucket_length, config.seasonal_components_size)
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    pub fn set_decay_rate(&mut self, decay_rate: f64) {
        self.decay_rate = decay_rate;
        self.trend_test.set_decay_rate(decay_rate);
        self.components.set_decay_rate(decay_rate);
    }

    /// Stop refining the components and extrapolate the trend indefinitely.
    pub fn forecast(&mut self) {
        self.components.forecast();
    }

    pub fn initialized(&self) -> bool {
        self.components.initialized()
    }

    pub fn start_of_week(&self) -> Time {
        self.components.seasonal().first().map_or(0, |c| c.time().week_start())
    }

    /// The shortest detected period, or `Time::MAX` if there is none.
    pub fn period(&self) -> Time {
        let periods = self.daily_weekly_test.periods();
        if !periods.periodic() {
            return Time::MAX;
        }
        if periods.periods(Interval::Full) == Period::Short { DAY } else { WEEK }
    }

    pub fn periods(&self) -> &PeriodicityResult {
        self.daily_weekly_test.periods()
    }

    pub fn add_point(&mut self, time: Time, value: f64) -> bool {
        self.add_weighted_point(time, value, 1.0)
    }

    /// Update with `value` at `time`. Returns true if components were
    /// added or removed, in which case models of the residuals should
    /// be reset.
    pub fn add_weighted_point(&mut self, time: Time, value: f64, weight: f64) -> bool {
        if !value.is_finite() || !weight.is_finite() || weight < 0.0 {
            warn!(time, value, weight, "rejecting non-finite value");
            return false;
        }
        self.last_value_time = Some(self.last_value_time.map_or(time, |last| last.max(time)));

        let message = Message::AddValue {
            time,
            value,
            weight,
            trend: mid(self.baseline_of(time, 0.0, Part::Trend, true)),
            seasonal: mid(self.baseline_of(time, 0.0, Part::Seasonal, true)),
        };
        let mut outbox = Outbox::default();
        self.components.handle(&message, &mut outbox);
        self.flush(&mut outbox);
        self.trend_test.handle(&message, &mut outbox);
        self.flush(&mut outbox);
        self.daily_weekly_test.handle(&message, &mut outbox);
        self.flush(&mut outbox);
        outbox.changed()
    }

    /// Run any due tests and interpolations without adding a value.
    pub fn test_and_interpolate(&mut self, time: Time) -> bool {
        let mut outbox = Outbox::default();
        self.trend_test.test(time, &mut outbox);
        self.flush(&mut outbox);
        self.daily_weekly_test.test(time, &mut outbox);
        self.flush(&mut outbox);
        self.components.interpolate(time);
        outbox.changed()
    }

    fn flush(&mut self, outbox: &mut Outbox) {
        while let Some(message) = outbox.messages.pop_front() {
            trace!(time = message.time(), "forwarding message");
            self.trend_test.handle(&message, outbox);
            self.daily_weekly_test.handle(&message, outbox);
            self.components.handle(&message, outbox);
        }
    }

    /// Mean of the baseline over the current interpolation interval.
    pub fn mean(&self) -> f64 {
        self.components.mean_value()
    }

    /// Confidence interval for the expected value at `time`.
    pub fn baseline(&self, time: Time, confidence: f64) -> (f64, f64) {
        self.baseline_of(time, confidence, Part::All, true)
    }

    pub fn baseline_of(&self, time: Time, confidence: f64, part: Part, smooth: bool) -> (f64, f64) {
        if !self.initialized() {
            return (0.0, 0.0);
        }
        let mut baseline = (0.0, 0.0);
        if part.trend() {
            let (l, u) = self.components.trend_prediction(time, confidence);
            baseline.0 += l;
            baseline.1 += u;
        }
        if part.seasonal() {
            for component in self.components.seasonal() {
                if component.initialized() && component.time().in_window(time) {
                    let (l, u) = component.value(time, confidence);
                    baseline.0 += l;
                    baseline.1 += u;
                }
            }
        }
        if smooth {
            let (l, u) = self.smoothing(time, confidence);
            baseline.0 += l;
            baseline.1 += u;
        }
        baseline
    }

    /// `value` less the nearest edge of the baseline interval, zero inside it.
    pub fn detrend(&self, time: Time, value: f64, confidence: f64) -> f64 {
        if !self.initialized() {
            return value;
        }
        let (lower, upper) = self.baseline(time, confidence);
        (value - lower).min(0.0) + (value - upper).max(0.0)
    }

    pub fn mean_variance(&self) -> f64 {
        self.components.mean_variance()
    }

    /// Ratio of the variance at `time` to the mean variance, damped when
    /// the residual `variance` is large compared to the mean.
    pub fn scale(&self, time: Time, variance: f64, confidence: f64) -> (f64, f64) {
        if !self.initialized() {
            return (1.0, 1.0);
        }
        let mean = self.mean_variance();
        if mean == 0.0 {
            return (1.0, 1.0);
        }
        let mut scale = (0.0, 0.0);
        for component in self.components.seasonal() {
            if component.initialized() && component.time().in_window(time) {
                let (l, u) = component.variance(time, confidence);
                scale.0 += l;
                scale.1 += u;
            }
        }
        let bias = if variance > 0.0 { (2.0 * mean / variance).min(1.0) } else { 1.0 };
        (1.0 + bias * (scale.0 / mean - 1.0), 1.0 + bias * (scale.1 / mean - 1.0))
    }

    /// Age the state up to `time`. Repeated calls for the same time are no-ops.
    pub fn propagate_forwards_to(&mut self, time: Time) {
        if time < self.last_propagation_time {
            return;
        }
        let interval = self.components.propagation_interval();
        let time = time::floor(time, interval);
        if time > self.last_propagation_time {
            let elapsed = (time - self.last_propagation_time) as f64 / interval as f64;
            self.trend_test.propagate_forwards_by_time(elapsed);
            self.daily_weekly_test.propagate_forwards_by_time(elapsed);
            self.components.propagate_forwards(self.last_propagation_time, time);
            self.last_propagation_time = time;
        }
    }

    /// Advance all schedules by `skip` without ageing.
    pub fn skip_time(&mut self, skip: Time) {
        let interval = self.components.propagation_interval();
        self.last_propagation_time = time::floor(self.last_propagation_time + skip, interval);
        self.trend_test.skip_time(skip);
        self.daily_weekly_test.skip_time(skip);
        self.components.skip_time(skip);
    }

    pub fn seasonal_components(&self) -> &[SeasonalComponent] {
        self.components.seasonal()
    }

    pub fn swap(&mut self, other: &mut TrendDecomposition) {
        std::mem::swap(self, other);
    }

    pub fn checksum(&self) -> u64 {
        state_checksum(self)
    }

    pub fn describe(&self) -> String {
        let components = self.components.seasonal();
        if components.is_empty() {
            return "decomposition no components".to_string();
        }
        let mut result = String::from("decomposition: sum of seasonal components");
        for component in components {
            result.push_str("\n ");
            result.push_str(&component.describe());
        }
        result
    }

    /// Blend with the neighbouring window near a window boundary.
    fn smoothing(&self, time: Time, confidence: f64) -> (f64, f64) {
        let interval = SMOOTHING_INTERVAL as f64;
        for component in self.components.seasonal() {
            let times = component.time();
            if !component.initialized() || times.in_window(time) {
                continue;
            }
            if times.in_window(time - SMOOTHING_INTERVAL) {
                let discontinuity = times.start_of_window(time - SMOOTHING_INTERVAL) + times.window();
                let before = self.baseline_of(discontinuity - 1, confidence, Part::All, false);
                let after = self.baseline_of(discontinuity + 1, confidence, Part::All, false);
                let scale = 0.5 * (1.0 - (time - discontinuity) as f64 / interval);
                return (scale * (before.0 - after.0), scale * (before.1 - after.1));
            }
            if times.in_window(time + SMOOTHING_INTERVAL) {
                let discontinuity = times.start_of_window(time + SMOOTHING_INTERVAL);
                let before = self.baseline_of(discontinuity - 1, confidence, Part::All, false);
                let after = self.baseline_of(discontinuity + 1, confidence, Part::All, false);
                let scale = 0.5 * (1.0 - (discontinuity - time) as f64 / interval);
                return (scale * (after.0 - before.0), scale * (after.1 - before.1));
            }
        }
        (0.0, 0.0)
    }
}

fn mid(interval: (f64, f64)) -> f64 {
    (interval.0 + interval.1) / 2.0
}
