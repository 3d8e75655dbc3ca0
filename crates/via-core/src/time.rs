//! Time Constants and Interval Arithmetic
//!
//! Times are integer seconds. Every periodic calculation in the
//! decomposition aligns to these intervals.

/// Seconds.
pub type Time = i64;

pub const HOUR: Time = 3600;
pub const DAY: Time = 86_400;
pub const WEEK: Time = 604_800;
/// The weekend window length (Saturday and Sunday).
pub const WEEKEND: Time = 172_800;
/// The weekday window length (Monday through Friday).
pub const WEEKDAYS: Time = 432_000;

/// Largest multiple of `interval` not greater than `time`.
pub fn floor(time: Time, interval: Time) -> Time {
    let result = (time / interval) * interval;
    if result > time { result - interval } else { result }
}

/// Smallest multiple of `interval` not less than `time`.
pub fn ceil(time: Time, interval: Time) -> Time {
    let result = floor(time, interval);
    if result < time { result + interval } else { result }
}

/// Time expressed in fractional days.
pub fn days(time: Time) -> f64 {
    time as f64 / DAY as f64
}

/// Time expressed in fractional weeks.
pub fn weeks(time: Time) -> f64 {
    time as f64 / WEEK as f64
}
