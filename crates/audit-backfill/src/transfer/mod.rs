//! Three-stage copy pipeline for one time window.
//!
//! For a window, the pipeline:
//! - streams `(id, created)` pairs over one stream session
//! - fans each id out to a lookup task with its own lookup session
//! - hands each found record to a sink task for an idempotent upsert
//!
//! A [`CompletionBarrier`] sized to the window's expected count tracks
//! outstanding ids. Every id carries a [`CompletionToken`], so each one is
//! resolved exactly once as missing, existing, created or failed, and the
//! barrier always reaches zero.

pub mod barrier;
pub mod pools;
pub mod stats;

pub use barrier::{CompletionBarrier, CompletionToken};
pub use pools::WorkerPools;
pub use stats::{RecordOutcome, RunStatistics, StatsSnapshot};

use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::core::{
    AuditRecord, RecordSink, RecordSource, SessionKind, TenantDescriptor, TimeWindow,
};
use crate::error::{BackfillError, Result};
use crate::source::{present_tables, RecordFetcher};

/// Summary of one window copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReport {
    /// Records counted before dispatch.
    pub expected: u64,
    /// Ids actually streamed from the source.
    pub streamed: u64,
    /// Expected ids that never arrived.
    pub shortfall: u64,
    /// False if the wait was abandoned on cancellation.
    pub completed: bool,
    pub elapsed: Duration,
}

/// Copies one tenant's windows from the source to the sink.
#[derive(Clone)]
pub struct CopyPipeline {
    tenant: Arc<TenantDescriptor>,
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn RecordSink>,
    pools: WorkerPools,
    cancel: CancellationToken,
}

impl CopyPipeline {
    pub fn new(
        tenant: Arc<TenantDescriptor>,
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn RecordSink>,
        pools: WorkerPools,
    ) -> Self {
        Self {
            tenant,
            source,
            sink,
            pools,
            cancel: CancellationToken::new(),
        }
    }

    /// Abandon barrier waits when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn pools(&self) -> &WorkerPools {
        &self.pools
    }

    /// Copy one window, waiting for a stream permit first.
    pub async fn copy_window(&self, window: TimeWindow, stats: Arc<RunStatistics>) -> WindowReport {
        match self.pools.stream_permit().await {
            Ok(permit) => self.copy_window_with_permit(window, stats, permit).await,
            Err(e) => {
                error!("{}: cannot copy window {}: {}", self.tenant, window, e);
                let expected = window.expected_record_count;
                stats.add_submitted(expected);
                stats.add_adopted(expected);
                stats.add_exceptions(expected);
                WindowReport {
                    expected,
                    streamed: 0,
                    shortfall: expected,
                    completed: true,
                    elapsed: Duration::ZERO,
                }
            }
        }
    }

    /// Copy one window while holding an already-acquired stream permit.
    ///
    /// Returns once every dispatched id is resolved, or when cancelled.
    pub async fn copy_window_with_permit(
        &self,
        window: TimeWindow,
        stats: Arc<RunStatistics>,
        _permit: OwnedSemaphorePermit,
    ) -> WindowReport {
        let start = Instant::now();
        let expected = window.expected_record_count;
        stats.add_submitted(expected);
        let barrier = CompletionBarrier::new(expected);

        let (streamed, failure) = self.stream_and_dispatch(&window, &barrier, &stats).await;

        let shortfall = expected.saturating_sub(streamed);
        if shortfall > 0 {
            stats.add_adopted(shortfall);
            match &failure {
                Some(e) => {
                    error!(
                        "{}: id stream for {} failed after {} of {} records: {}",
                        self.tenant, window, streamed, expected, e
                    );
                    stats.add_exceptions(shortfall);
                }
                None => {
                    warn!(
                        "{}: streamed {} records for {} but expected {}, counting {} as missing",
                        self.tenant, streamed, window, expected, shortfall
                    );
                    stats.add_missing(shortfall);
                }
            }
            barrier.release(shortfall);
        } else if let Some(e) = &failure {
            error!(
                "{}: id stream for {} failed after {} records: {}",
                self.tenant, window, streamed, e
            );
            stats.add_exceptions(1);
        }

        let completed = tokio::select! {
            biased;
            _ = barrier.wait() => true,
            _ = self.cancel.cancelled() => {
                warn!(
                    "{}: abandoning wait for {} with {} records outstanding",
                    self.tenant, window, barrier.remaining()
                );
                false
            }
        };

        let elapsed = start.elapsed();
        debug!(
            "{}: window {} resolved {} streamed records in {:?}",
            self.tenant, window, streamed, elapsed
        );

        WindowReport {
            expected,
            streamed,
            shortfall,
            completed,
            elapsed,
        }
    }

    /// Stream ids for the window and dispatch a lookup per id.
    ///
    /// Returns the number of ids streamed and the error that stopped the
    /// stream early, if any.
    async fn stream_and_dispatch(
        &self,
        window: &TimeWindow,
        barrier: &Arc<CompletionBarrier>,
        stats: &Arc<RunStatistics>,
    ) -> (u64, Option<BackfillError>) {
        let mut session = match self.source.open_session(SessionKind::Stream).await {
            Ok(session) => session,
            Err(e) => return (0, Some(e)),
        };
        let tables = match present_tables(session.as_mut()).await {
            Ok(tables) => tables,
            Err(e) => return (0, Some(e)),
        };

        let expected = window.expected_record_count;
        let mut streamed = 0u64;
        let mut ids = session.stream_range(&tables, window.start_millis(), window.up_to_millis());

        while let Some(item) = ids.next().await {
            let pair = match item {
                Ok(pair) => pair,
                Err(e) => return (streamed, Some(e)),
            };

            streamed += 1;
            stats.add_adopted(1);
            if streamed > expected {
                // rows inserted after the window was counted
                barrier.extend(1);
                stats.add_submitted(1);
            }

            let token = CompletionToken::new(barrier.clone(), stats.clone());
            if let Err(e) = self.dispatch_lookup(pair.id, token).await {
                return (streamed, Some(e));
            }
        }

        (streamed, None)
    }

    /// Spawn a lookup task for one id, waiting for a lookup permit.
    ///
    /// The lookup permit is held until the record has a sink permit, so at
    /// most `lookup + sink` fetched records are in memory at once.
    async fn dispatch_lookup(&self, id: String, token: CompletionToken) -> Result<()> {
        let permit = self.pools.lookup_permit().await?;
        let source = self.source.clone();
        let sink = self.sink.clone();
        let tenant = self.tenant.clone();
        let pools = self.pools.clone();

        tokio::spawn(
            async move {
                let fetched = RecordFetcher::fetch_from_source(source.as_ref(), &id).await;

                match fetched {
                    Ok(Some(record)) => match pools.sink_permit().await {
                        Ok(sink_permit) => {
                            drop(permit);
                            tokio::spawn(
                                persist(sink, tenant, record, token, sink_permit).in_current_span(),
                            );
                        }
                        Err(e) => {
                            // dropping the token counts the exception
                            error!("Cannot schedule upsert of record {}: {}", id, e);
                        }
                    },
                    Ok(None) => {
                        warn!("Unable to find record {} to copy", id);
                        token.resolve(RecordOutcome::MissingFromSource);
                    }
                    Err(e) => {
                        error!("Lookup of record {} failed: {}", id, e);
                        token.resolve(RecordOutcome::Exception);
                    }
                }
            }
            .in_current_span(),
        );

        Ok(())
    }
}

/// Upsert one record and resolve its token.
async fn persist(
    sink: Arc<dyn RecordSink>,
    tenant: Arc<TenantDescriptor>,
    record: AuditRecord,
    token: CompletionToken,
    _permit: OwnedSemaphorePermit,
) {
    match sink.upsert(&tenant, &record).await {
        Ok(outcome) if outcome.already_existed() => token.resolve(RecordOutcome::AlreadyExisted),
        Ok(_) => token.resolve(RecordOutcome::NewlyCreated),
        Err(e) => {
            error!("Failed to persist record {}: {}", record.id, e);
            token.resolve(RecordOutcome::Exception);
        }
    }
}

/// Log a one-line summary for a finished window.
pub fn log_window(tenant: &TenantDescriptor, window: &TimeWindow, report: &WindowReport) {
    info!(
        "{}: window {} copied {} of {} expected records in {:?}",
        tenant, window, report.streamed, report.expected, report.elapsed
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::UpsertOutcome;
    use crate::sink::ObjectStoreSink;
    use crate::source::MemoryRecordStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use std::collections::HashSet;
    use tokio::sync::Notify;

    /// Sink that fails for chosen ids.
    struct FailingSink {
        inner: ObjectStoreSink,
        fail: HashSet<String>,
    }

    #[async_trait]
    impl RecordSink for FailingSink {
        async fn upsert(&self, tenant: &TenantDescriptor, record: &AuditRecord) -> Result<UpsertOutcome> {
            if self.fail.contains(&record.id) {
                return Err(BackfillError::sink(&record.id, "injected failure"));
            }
            self.inner.upsert(tenant, record).await
        }

        fn sink_type(&self) -> &str {
            "failing"
        }
    }

    /// Sink that never finishes.
    struct StallingSink(Notify);

    #[async_trait]
    impl RecordSink for StallingSink {
        async fn upsert(&self, _: &TenantDescriptor, _: &AuditRecord) -> Result<UpsertOutcome> {
            self.0.notified().await;
            Ok(UpsertOutcome::Created)
        }

        fn sink_type(&self) -> &str {
            "stalling"
        }
    }

    fn hour() -> (DateTime<Utc>, DateTime<Utc>) {
        let start = Utc.with_ymd_and_hms(2020, 6, 1, 10, 0, 0).unwrap();
        (start, start + ChronoDuration::hours(1))
    }

    fn seeded_store(n: usize) -> Arc<MemoryRecordStore> {
        let store = MemoryRecordStore::with_archive();
        let (start, _) = hour();
        for i in 0..n {
            let created = start.timestamp_millis() + (i as i64) * 1000;
            let record = AuditRecord::new(format!("r{}", i), created);
            if i % 3 == 0 {
                store.insert_archived(record);
            } else {
                store.insert(record);
            }
        }
        store
    }

    fn pipeline(store: Arc<MemoryRecordStore>, sink: Arc<dyn RecordSink>) -> CopyPipeline {
        CopyPipeline::new(
            Arc::new(TenantDescriptor::new("acme", "pod-1", "t-1")),
            store,
            sink,
            WorkerPools::new(2, 4, 8),
        )
    }

    fn window(expected: u64) -> TimeWindow {
        let (start, up_to) = hour();
        TimeWindow::new(start, up_to, expected)
    }

    #[tokio::test]
    async fn test_copies_every_record_in_window() {
        let pipeline = pipeline(seeded_store(25), Arc::new(ObjectStoreSink::in_memory()));
        let stats = Arc::new(RunStatistics::new());

        let report = pipeline.copy_window(window(25), stats.clone()).await;

        assert!(report.completed);
        assert_eq!(report.streamed, 25);
        assert_eq!(stats.newly_created_in_target(), 25);
        assert_eq!(stats.missing_from_source(), 0);
        assert!(stats.is_complete_success());
    }

    #[tokio::test]
    async fn test_shortfall_is_counted_missing() {
        let pipeline = pipeline(seeded_store(2), Arc::new(ObjectStoreSink::in_memory()));
        let stats = Arc::new(RunStatistics::new());

        let report = pipeline.copy_window(window(5), stats.clone()).await;

        assert_eq!(report.shortfall, 3);
        assert_eq!(stats.missing_from_source(), 3);
        assert_eq!(stats.newly_created_in_target(), 2);
        assert_eq!(stats.adopted_by_worker(), 5);
        assert!(!stats.is_complete_success());
    }

    #[tokio::test]
    async fn test_vanished_record_is_missing() {
        let store = seeded_store(4);
        store.vanish_on_fetch("r1");
        let pipeline = pipeline(store, Arc::new(ObjectStoreSink::in_memory()));
        let stats = Arc::new(RunStatistics::new());

        pipeline.copy_window(window(4), stats.clone()).await;

        assert_eq!(stats.missing_from_source(), 1);
        assert_eq!(stats.newly_created_in_target(), 3);
        assert!(!stats.is_complete_success());
    }

    #[tokio::test]
    async fn test_extra_streamed_records_extend_barrier() {
        let pipeline = pipeline(seeded_store(6), Arc::new(ObjectStoreSink::in_memory()));
        let stats = Arc::new(RunStatistics::new());

        let report = pipeline.copy_window(window(2), stats.clone()).await;

        assert_eq!(report.streamed, 6);
        assert_eq!(stats.submitted_to_queue(), 6);
        assert_eq!(stats.newly_created_in_target(), 6);
        assert!(stats.is_complete_success());
    }

    #[tokio::test]
    async fn test_sink_failure_counts_exception() {
        let sink = FailingSink {
            inner: ObjectStoreSink::in_memory(),
            fail: HashSet::from(["r2".to_string()]),
        };
        let pipeline = pipeline(seeded_store(5), Arc::new(sink));
        let stats = Arc::new(RunStatistics::new());

        let report = pipeline.copy_window(window(5), stats.clone()).await;

        assert!(report.completed);
        assert_eq!(stats.exceptions(), 1);
        assert_eq!(stats.newly_created_in_target(), 4);
        assert!(!stats.is_complete_success());
    }

    #[tokio::test]
    async fn test_lookup_failure_counts_exception() {
        let store = seeded_store(3);
        store.fail_fetch("r0");
        let pipeline = pipeline(store, Arc::new(ObjectStoreSink::in_memory()));
        let stats = Arc::new(RunStatistics::new());

        pipeline.copy_window(window(3), stats.clone()).await;

        assert_eq!(stats.exceptions(), 1);
        assert_eq!(stats.resolved_count(), 3);
    }

    #[tokio::test]
    async fn test_second_copy_finds_existing_records() {
        let store = seeded_store(10);
        let pipeline = pipeline(store, Arc::new(ObjectStoreSink::in_memory()));

        let first = Arc::new(RunStatistics::new());
        pipeline.copy_window(window(10), first.clone()).await;
        let second = Arc::new(RunStatistics::new());
        pipeline.copy_window(window(10), second.clone()).await;

        assert_eq!(second.newly_created_in_target(), 0);
        assert_eq!(second.already_existed_in_target(), 10);
    }

    #[tokio::test]
    async fn test_slow_sink_backpressures_lookups() {
        let pipeline = CopyPipeline::new(
            Arc::new(TenantDescriptor::new("acme", "pod-1", "t-1")),
            seeded_store(40),
            Arc::new(StallingSink(Notify::new())),
            WorkerPools::new(1, 2, 3),
        );
        let stats = Arc::new(RunStatistics::new());

        let copy = tokio::spawn({
            let stats = stats.clone();
            async move { pipeline.copy_window(window(40), stats).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        // 3 stalled upserts, 2 lookups waiting on the sink, 1 id waiting on a lookup
        assert_eq!(stats.adopted_by_worker(), 6);
        assert_eq!(stats.resolved_count(), 0);
        copy.abort();
    }

    #[tokio::test]
    async fn test_cancellation_abandons_wait() {
        let cancel = CancellationToken::new();
        let pipeline = pipeline(seeded_store(3), Arc::new(StallingSink(Notify::new())))
            .with_cancellation(cancel.clone());
        let stats = Arc::new(RunStatistics::new());

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            pipeline.copy_window(window(3), stats.clone()),
        )
        .await
        .expect("cancelled window must return");
        assert!(!report.completed);
        assert_eq!(stats.newly_created_in_target(), 0);
    }
}
