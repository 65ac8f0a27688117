//! Thread-safe outcome counters for a day or a whole tenant run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Outcome of one dispatched record id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    MissingFromSource,
    AlreadyExisted,
    NewlyCreated,
    Exception,
}

/// Aggregate counters shared by every task working on the same day.
///
/// All counters only grow. Resolutions wake waiters in
/// [`RunStatistics::wait_for_resolved`].
#[derive(Debug)]
pub struct RunStatistics {
    submitted_to_queue: AtomicU64,
    adopted_by_worker: AtomicU64,
    missing_from_source: AtomicU64,
    already_existed_in_target: AtomicU64,
    newly_created_in_target: AtomicU64,
    exceptions: AtomicU64,
    start_time: DateTime<Utc>,
    resolved: Notify,
}

impl Default for RunStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStatistics {
    pub fn new() -> Self {
        Self {
            submitted_to_queue: AtomicU64::new(0),
            adopted_by_worker: AtomicU64::new(0),
            missing_from_source: AtomicU64::new(0),
            already_existed_in_target: AtomicU64::new(0),
            newly_created_in_target: AtomicU64::new(0),
            exceptions: AtomicU64::new(0),
            start_time: Utc::now(),
            resolved: Notify::new(),
        }
    }

    pub fn add_submitted(&self, n: u64) {
        self.submitted_to_queue.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_adopted(&self, n: u64) {
        self.adopted_by_worker.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_missing(&self, n: u64) {
        self.missing_from_source.fetch_add(n, Ordering::Relaxed);
        self.resolved.notify_waiters();
    }

    pub fn add_exceptions(&self, n: u64) {
        self.exceptions.fetch_add(n, Ordering::Relaxed);
        self.resolved.notify_waiters();
    }

    /// Count one resolved record.
    pub fn record(&self, outcome: RecordOutcome) {
        let counter = match outcome {
            RecordOutcome::MissingFromSource => &self.missing_from_source,
            RecordOutcome::AlreadyExisted => &self.already_existed_in_target,
            RecordOutcome::NewlyCreated => &self.newly_created_in_target,
            RecordOutcome::Exception => &self.exceptions,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.resolved.notify_waiters();
    }

    pub fn submitted_to_queue(&self) -> u64 {
        self.submitted_to_queue.load(Ordering::Relaxed)
    }

    pub fn adopted_by_worker(&self) -> u64 {
        self.adopted_by_worker.load(Ordering::Relaxed)
    }

    pub fn missing_from_source(&self) -> u64 {
        self.missing_from_source.load(Ordering::Relaxed)
    }

    pub fn already_existed_in_target(&self) -> u64 {
        self.already_existed_in_target.load(Ordering::Relaxed)
    }

    pub fn newly_created_in_target(&self) -> u64 {
        self.newly_created_in_target.load(Ordering::Relaxed)
    }

    pub fn exceptions(&self) -> u64 {
        self.exceptions.load(Ordering::Relaxed)
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Records resolved without error: missing + already existed + newly created.
    pub fn sum_results_count(&self) -> u64 {
        self.missing_from_source() + self.already_existed_in_target() + self.newly_created_in_target()
    }

    /// Every resolution, including exceptions.
    pub fn resolved_count(&self) -> u64 {
        self.sum_results_count() + self.exceptions()
    }

    /// Every submitted record was adopted and landed in the target.
    ///
    /// Missing records are accounted for but leave the run incomplete, so a
    /// later pass can pick up rows that moved between count and fetch.
    pub fn is_complete_success(&self) -> bool {
        let submitted = self.submitted_to_queue();
        self.exceptions() == 0
            && self.missing_from_source() == 0
            && submitted == self.adopted_by_worker()
            && submitted == self.already_existed_in_target() + self.newly_created_in_target()
    }

    /// Add another instance's counters into this one.
    pub fn merge(&self, other: &RunStatistics) -> &Self {
        self.add_submitted(other.submitted_to_queue());
        self.add_adopted(other.adopted_by_worker());
        self.missing_from_source
            .fetch_add(other.missing_from_source(), Ordering::Relaxed);
        self.already_existed_in_target
            .fetch_add(other.already_existed_in_target(), Ordering::Relaxed);
        self.newly_created_in_target
            .fetch_add(other.newly_created_in_target(), Ordering::Relaxed);
        self.exceptions.fetch_add(other.exceptions(), Ordering::Relaxed);
        self.resolved.notify_waiters();
        self
    }

    /// Wait until at least `expected` records are resolved.
    ///
    /// Re-checks on every resolution and at least every `poll_interval`.
    /// Returns `false` if `ceiling` elapses first.
    pub async fn wait_for_resolved(&self, expected: u64, poll_interval: Duration, ceiling: Duration) -> bool {
        let deadline = Instant::now() + ceiling;
        loop {
            let notified = self.resolved.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.resolved_count() >= expected {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }

            let tick = poll_interval.min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted_to_queue: self.submitted_to_queue(),
            adopted_by_worker: self.adopted_by_worker(),
            missing_from_source: self.missing_from_source(),
            already_existed_in_target: self.already_existed_in_target(),
            newly_created_in_target: self.newly_created_in_target(),
            exceptions: self.exceptions(),
            start_time: self.start_time,
        }
    }

    /// Counters as a single JSON object for log lines.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_default()
    }
}

/// Serializable copy of [`RunStatistics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub submitted_to_queue: u64,
    pub adopted_by_worker: u64,
    pub missing_from_source: u64,
    pub already_existed_in_target: u64,
    pub newly_created_in_target: u64,
    pub exceptions: u64,
    pub start_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_sum_and_complete_success() {
        let stats = RunStatistics::new();
        stats.add_submitted(3);
        stats.add_adopted(3);
        stats.record(RecordOutcome::NewlyCreated);
        stats.record(RecordOutcome::AlreadyExisted);
        assert!(!stats.is_complete_success());

        stats.record(RecordOutcome::NewlyCreated);
        assert_eq!(stats.sum_results_count(), 3);
        assert!(stats.is_complete_success());

        stats.record(RecordOutcome::Exception);
        assert_eq!(stats.resolved_count(), 4);
        assert!(!stats.is_complete_success());
    }

    #[test]
    fn test_missing_records_leave_run_incomplete() {
        let stats = RunStatistics::new();
        stats.add_submitted(3);
        stats.add_adopted(3);
        stats.record(RecordOutcome::NewlyCreated);
        stats.record(RecordOutcome::AlreadyExisted);
        stats.record(RecordOutcome::MissingFromSource);

        assert_eq!(stats.sum_results_count(), 3);
        assert_eq!(stats.exceptions(), 0);
        assert!(!stats.is_complete_success());
    }

    #[test]
    fn test_empty_run_is_complete() {
        assert!(RunStatistics::new().is_complete_success());
    }

    #[test]
    fn test_merge_adds_all_counters() {
        let total = RunStatistics::new();
        let day = RunStatistics::new();
        day.add_submitted(2);
        day.add_adopted(2);
        day.record(RecordOutcome::NewlyCreated);
        day.record(RecordOutcome::Exception);

        total.merge(&day).merge(&day);
        let snap = total.snapshot();
        assert_eq!(snap.submitted_to_queue, 4);
        assert_eq!(snap.adopted_by_worker, 4);
        assert_eq!(snap.newly_created_in_target, 2);
        assert_eq!(snap.exceptions, 2);
        assert_eq!(snap.start_time, total.start_time());
    }

    #[test]
    fn test_json_field_names() {
        let json = RunStatistics::new().to_json();
        assert!(json.contains("\"newly_created_in_target\":0"));
        assert!(json.contains("\"start_time\""));
    }

    #[tokio::test]
    async fn test_wait_for_resolved_wakes_on_progress() {
        let stats = Arc::new(RunStatistics::new());
        let worker = stats.clone();
        tokio::spawn(async move {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                worker.record(RecordOutcome::NewlyCreated);
            }
        });

        let done = stats
            .wait_for_resolved(5, Duration::from_secs(10), Duration::from_secs(30))
            .await;
        assert!(done);
        assert_eq!(stats.newly_created_in_target(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_resolved_hits_ceiling() {
        let stats = RunStatistics::new();
        stats.record(RecordOutcome::NewlyCreated);
        let done = stats
            .wait_for_resolved(2, Duration::from_millis(500), Duration::from_secs(3))
            .await;
        assert!(!done);
    }
}
