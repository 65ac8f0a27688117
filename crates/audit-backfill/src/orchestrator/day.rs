//! Splits one calendar day into copy windows.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::BackfillConfig;
use crate::core::{day_windows, TenantDescriptor, TimeWindow};
use crate::source::TimeRangeCounter;
use crate::transfer::{log_window, CopyPipeline, RunStatistics, WindowReport};

/// Runs one day of a tenant's history through the copy pipeline.
///
/// Windows are counted and dispatched in chronological order; empty windows
/// are skipped. With `strict_window_order` each window resolves before the
/// next is dispatched. Otherwise up to `stream_workers` windows overlap, and
/// they still start in order.
pub struct DayPartitioner {
    tenant: Arc<TenantDescriptor>,
    counter: TimeRangeCounter,
    pipeline: CopyPipeline,
    window: ChronoDuration,
    poll_interval: Duration,
    day_timeout: Duration,
    strict_window_order: bool,
    cancel: CancellationToken,
}

impl DayPartitioner {
    pub fn new(
        tenant: Arc<TenantDescriptor>,
        counter: TimeRangeCounter,
        pipeline: CopyPipeline,
        config: &BackfillConfig,
    ) -> Self {
        Self {
            tenant,
            counter,
            pipeline,
            window: config.window(),
            poll_interval: config.poll_interval(),
            day_timeout: config.day_timeout(),
            strict_window_order: config.strict_window_order,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Copy `[day_start, day_start + 1 day)` and return the day's statistics.
    ///
    /// Waits until every expected record is resolved or the day timeout
    /// elapses; a timeout is logged and the partial statistics are returned.
    pub async fn run_day(&self, day_start: DateTime<Utc>) -> Arc<RunStatistics> {
        let stats = Arc::new(RunStatistics::new());
        let mut records_expected = 0u64;
        let mut in_flight: Vec<JoinHandle<WindowReport>> = Vec::new();
        let mut count_failed = false;

        for (start, up_to) in day_windows(day_start, self.window) {
            if self.cancel.is_cancelled() {
                warn!("{}: cancellation requested, not dispatching {}", self.tenant, start);
                break;
            }

            let count = match self.counter.count(start, up_to).await {
                Ok(count) => count,
                Err(e) => {
                    error!(
                        "{}: failed to count records from {} to {}: {}",
                        self.tenant, start, up_to, e
                    );
                    count_failed = true;
                    break;
                }
            };
            if count == 0 {
                continue;
            }

            let window = TimeWindow::new(start, up_to, count);
            debug!("{}: dispatching {} records for {}", self.tenant, count, window);
            records_expected += count;

            let permit = match self.pipeline.pools().stream_permit().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("{}: no stream worker for {}: {}", self.tenant, window, e);
                    stats.add_submitted(count);
                    stats.add_adopted(count);
                    stats.add_exceptions(count);
                    continue;
                }
            };

            if self.strict_window_order {
                let report = self
                    .pipeline
                    .copy_window_with_permit(window, stats.clone(), permit)
                    .await;
                log_window(&self.tenant, &window, &report);
            } else {
                let pipeline = self.pipeline.clone();
                let tenant = self.tenant.clone();
                let stats = stats.clone();
                in_flight.push(tokio::spawn(
                    async move {
                        let report = pipeline.copy_window_with_permit(window, stats, permit).await;
                        log_window(&tenant, &window, &report);
                        report
                    }
                    .in_current_span(),
                ));
            }
        }

        let resolved = tokio::select! {
            biased;
            done = stats.wait_for_resolved(records_expected, self.poll_interval, self.day_timeout) => done,
            _ = self.cancel.cancelled() => false,
        };

        if !resolved {
            error!(
                "{}: day {} did not resolve: {} of {} records accounted for",
                self.tenant,
                day_start.date_naive(),
                stats.resolved_count(),
                records_expected
            );
        }

        // windows still running keep their permits until their own barriers clear
        drop(in_flight);

        if count_failed {
            stats.add_exceptions(1);
        }

        info!(
            "{}: day {} finished: {}",
            self.tenant,
            day_start.date_naive(),
            stats.to_json()
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AuditRecord;
    use crate::sink::ObjectStoreSink;
    use crate::source::MemoryRecordStore;
    use crate::transfer::WorkerPools;
    use chrono::TimeZone;

    fn day() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 11, 5, 0, 0, 0).unwrap()
    }

    fn partitioner(store: Arc<MemoryRecordStore>, config: &BackfillConfig) -> DayPartitioner {
        let tenant = Arc::new(TenantDescriptor::new("acme", "pod-1", "t-1"));
        let pipeline = CopyPipeline::new(
            tenant.clone(),
            store.clone(),
            Arc::new(ObjectStoreSink::in_memory()),
            WorkerPools::from_config(config),
        );
        let counter = TimeRangeCounter::new(store, config.epoch_floor);
        DayPartitioner::new(tenant, counter, pipeline, config)
    }

    fn store_with_hours(hours: &[u32]) -> Arc<MemoryRecordStore> {
        let store = MemoryRecordStore::with_archive();
        for (i, hour) in hours.iter().enumerate() {
            let created = day() + ChronoDuration::hours(i64::from(*hour)) + ChronoDuration::seconds(i as i64);
            store.insert(AuditRecord::new(format!("r{}", i), created.timestamp_millis()));
        }
        // outside the day
        store.insert(AuditRecord::new(
            "tomorrow",
            (day() + ChronoDuration::days(1)).timestamp_millis(),
        ));
        store
    }

    #[tokio::test]
    async fn test_run_day_copies_only_that_day() {
        let config = BackfillConfig {
            stream_workers: Some(1),
            ..Default::default()
        };
        let store = store_with_hours(&[0, 0, 3, 12, 23, 23, 23]);
        let stats = partitioner(store.clone(), &config).run_day(day()).await;

        assert_eq!(stats.submitted_to_queue(), 7);
        assert_eq!(stats.newly_created_in_target(), 7);
        assert!(stats.is_complete_success());
        assert_eq!(store.peak_open_streams(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_windows_resolve() {
        let config = BackfillConfig {
            strict_window_order: false,
            stream_workers: Some(3),
            window_minutes: 30,
            ..Default::default()
        };
        let hours: Vec<u32> = (0..24).collect();
        let store = store_with_hours(&hours);
        let stats = partitioner(store.clone(), &config).run_day(day()).await;

        assert_eq!(stats.newly_created_in_target(), 24);
        assert!(store.peak_open_streams() <= 3);
    }

    #[tokio::test]
    async fn test_empty_day_resolves_immediately() {
        let config = BackfillConfig::default();
        let stats = partitioner(MemoryRecordStore::new(), &config).run_day(day()).await;
        assert_eq!(stats.submitted_to_queue(), 0);
        assert!(stats.is_complete_success());
    }

    #[tokio::test]
    async fn test_cancelled_day_dispatches_nothing() {
        let config = BackfillConfig::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = partitioner(store_with_hours(&[1, 2]), &config)
            .with_cancellation(cancel)
            .run_day(day())
            .await;
        assert_eq!(stats.submitted_to_queue(), 0);
    }
}
