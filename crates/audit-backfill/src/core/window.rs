//! Time windows and calendar arithmetic for partitioning a tenant's history.

use chrono::{DateTime, Duration, DurationRound, Utc};
use std::fmt;

/// A half-open interval `[start, up_to)` with its point-in-time record count.
///
/// The count is an estimate taken before dispatch; the source may change
/// concurrently, so the number actually streamed can differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub up_to: DateTime<Utc>,
    pub expected_record_count: u64,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, up_to: DateTime<Utc>, expected_record_count: u64) -> Self {
        Self {
            start,
            up_to,
            expected_record_count,
        }
    }

    pub fn start_millis(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn up_to_millis(&self) -> i64 {
        self.up_to.timestamp_millis()
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} -> {})",
            self.start.format("%Y-%m-%dT%H:%M:%SZ"),
            self.up_to.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

/// Truncate a timestamp to UTC midnight.
pub fn truncate_to_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::days(1)).unwrap_or(ts)
}

/// Split `[day_start, day_start + 1 day)` into contiguous windows of `window` length.
///
/// The last window is clipped to the end of the day when `window` does not
/// divide a day evenly.
pub fn day_windows(day_start: DateTime<Utc>, window: Duration) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let day_end = day_start + Duration::days(1);
    if window <= Duration::zero() {
        return vec![(day_start, day_end)];
    }

    let mut windows = Vec::new();
    let mut start = day_start;
    while start < day_end {
        let up_to = (start + window).min(day_end);
        windows.push((start, up_to));
        start = up_to;
    }
    windows
}

/// Day starts from `earliest` (truncated) up to, but excluding, `cutover`.
pub fn days_until(earliest: DateTime<Utc>, cutover: DateTime<Utc>) -> impl Iterator<Item = DateTime<Utc>> {
    let first = truncate_to_day(earliest);
    std::iter::successors(Some(first), |day| Some(*day + Duration::days(1)))
        .take_while(move |day| *day < cutover)
}
