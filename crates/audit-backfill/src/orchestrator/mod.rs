//! Per-tenant backfill orchestration.
//!
//! [`TenantMigrationJob`] walks a tenant's history a day at a time from the
//! earliest stored record up to the cutover instant. Each non-empty day goes
//! through a [`DayPartitioner`]. Incomplete runs ask their [`Requeuer`] for
//! another attempt.

mod day;

pub use day::DayPartitioner;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BackfillConfig;
use crate::core::{
    days_until, RecordSink, RecordSource, RequeueOutcome, Requeuer, SourceConnector,
    TenantDescriptor,
};
use crate::error::Result;
use crate::source::TimeRangeCounter;
use crate::transfer::{CopyPipeline, RunStatistics, StatsSnapshot, WorkerPools};

/// Result of one tenant run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRunReport {
    /// Unique run identifier.
    pub run_id: String,

    /// Tenant routing key.
    pub org: String,

    /// Tenant pod.
    pub pod: String,

    /// First day walked.
    pub earliest_date: DateTime<Utc>,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run finished.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Days between the earliest date and the cutover that were checked.
    pub days_scanned: u64,

    /// Days that held records and were copied.
    pub days_copied: u64,

    /// Merged statistics across all days.
    pub stats: StatsSnapshot,

    /// Every record accounted for without exceptions.
    pub complete: bool,

    /// Stopped early on cancellation.
    pub cancelled: bool,

    /// Another attempt was scheduled.
    pub requeued: bool,
}

impl TenantRunReport {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Shared dependencies for building tenant jobs.
#[derive(Clone)]
pub struct MigrationEngine {
    connector: Arc<dyn SourceConnector>,
    sink: Arc<dyn RecordSink>,
    pools: WorkerPools,
    config: BackfillConfig,
    cancel: CancellationToken,
}

impl MigrationEngine {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        sink: Arc<dyn RecordSink>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            connector,
            sink,
            pools: WorkerPools::from_config(&config),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop runs cooperatively when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Connect to a tenant's source without running a job.
    pub async fn connect(&self, tenant: &TenantDescriptor) -> Result<Arc<dyn RecordSource>> {
        self.connector.connect(tenant).await
    }

    /// Build a job for one tenant.
    pub fn job(&self, tenant: TenantDescriptor, requeuer: Option<Arc<dyn Requeuer>>) -> TenantMigrationJob {
        TenantMigrationJob {
            tenant: Arc::new(tenant),
            engine: self.clone(),
            requeuer,
        }
    }
}

/// Walk counters for one run.
#[derive(Debug, Default)]
struct Walk {
    earliest_date: Option<DateTime<Utc>>,
    days_scanned: u64,
    days_copied: u64,
    cancelled: bool,
}

/// Backfills one tenant from its earliest record up to the cutover.
pub struct TenantMigrationJob {
    tenant: Arc<TenantDescriptor>,
    engine: MigrationEngine,
    requeuer: Option<Arc<dyn Requeuer>>,
}

impl TenantMigrationJob {
    pub fn tenant(&self) -> &TenantDescriptor {
        &self.tenant
    }

    /// Run the backfill.
    ///
    /// Incomplete runs are re-queued. A run that fails outright is re-queued
    /// before the error is returned.
    pub async fn run(&self) -> Result<TenantRunReport> {
        self.tenant.validate()?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let start = Instant::now();
        let total = RunStatistics::new();
        info!("{}: starting backfill run {}", self.tenant, run_id);

        let walk = match self.execute(&total).await {
            Ok(walk) => walk,
            Err(e) => {
                error!("{}: backfill run {} failed: {}", self.tenant, run_id, e);
                self.retry().await;
                return Err(e);
            }
        };

        let complete = total.is_complete_success() && !walk.cancelled;
        let elapsed = start.elapsed();
        info!(
            "{}: backfill finished in {:?} ({} of {} days copied): {}",
            self.tenant,
            elapsed,
            walk.days_copied,
            walk.days_scanned,
            total.to_json()
        );

        let requeued = if complete {
            if let Some(requeuer) = &self.requeuer {
                if let Err(e) = requeuer.reset(&self.tenant).await {
                    warn!("{}: failed to reset retry count: {}", self.tenant, e);
                }
            }
            false
        } else {
            self.retry().await
        };

        Ok(TenantRunReport {
            run_id,
            org: self.tenant.org.clone(),
            pod: self.tenant.pod.clone(),
            earliest_date: walk.earliest_date.unwrap_or(self.engine.config.epoch_floor),
            started_at,
            completed_at: Utc::now(),
            duration_seconds: elapsed.as_secs_f64(),
            days_scanned: walk.days_scanned,
            days_copied: walk.days_copied,
            stats: total.snapshot(),
            complete,
            cancelled: walk.cancelled,
            requeued,
        })
    }

    async fn execute(&self, total: &RunStatistics) -> Result<Walk> {
        let source = self.engine.connector.connect(&self.tenant).await?;
        let result = self.walk(source.clone(), total).await;
        source.close().await;
        result
    }

    async fn walk(&self, source: Arc<dyn RecordSource>, total: &RunStatistics) -> Result<Walk> {
        let config = &self.engine.config;
        let cancel = &self.engine.cancel;

        let counter = TimeRangeCounter::new(source.clone(), config.epoch_floor);
        let pipeline = CopyPipeline::new(
            self.tenant.clone(),
            source,
            self.engine.sink.clone(),
            self.engine.pools.clone(),
        )
        .with_cancellation(cancel.clone());
        let partitioner = DayPartitioner::new(self.tenant.clone(), counter.clone(), pipeline, config)
            .with_cancellation(cancel.clone());

        let earliest = counter.earliest_record_date().await?;
        info!(
            "{}: using earliest date {} (cutover {})",
            self.tenant,
            earliest.date_naive(),
            config.cutover
        );

        let mut walk = Walk {
            earliest_date: Some(earliest),
            ..Default::default()
        };

        for day in days_until(earliest, config.cutover) {
            if cancel.is_cancelled() {
                warn!("{}: cancellation requested, stopping at {}", self.tenant, day.date_naive());
                walk.cancelled = true;
                break;
            }
            walk.days_scanned += 1;

            let count = match counter.count(day, day + ChronoDuration::days(1)).await {
                Ok(count) => count,
                Err(e) => {
                    error!("{}: failed to count day {}: {}", self.tenant, day.date_naive(), e);
                    total.add_exceptions(1);
                    continue;
                }
            };
            if count == 0 {
                debug!("{}: no records on {}", self.tenant, day.date_naive());
                continue;
            }

            info!("{}: copying {} records for {}", self.tenant, count, day.date_naive());
            let day_stats = partitioner.run_day(day).await;
            total.merge(&day_stats);
            walk.days_copied += 1;
        }

        if cancel.is_cancelled() {
            walk.cancelled = true;
        }
        Ok(walk)
    }

    /// Ask the requeuer for another attempt; returns whether one was scheduled.
    async fn retry(&self) -> bool {
        let Some(requeuer) = &self.requeuer else {
            error!(
                "{}: run incomplete and no queue is available, retry opportunity lost",
                self.tenant
            );
            return false;
        };

        match requeuer.requeue(&self.tenant).await {
            Ok(RequeueOutcome::Scheduled { attempt, delay_secs }) => {
                warn!(
                    "{}: run incomplete, re-queued (attempt {}, delay {}s)",
                    self.tenant, attempt, delay_secs
                );
                true
            }
            Ok(RequeueOutcome::GaveUp { attempts }) => {
                error!(
                    "{}: run still incomplete after {} re-queues, giving up",
                    self.tenant, attempts
                );
                false
            }
            Err(e) => {
                error!(
                    "{}: failed to re-queue incomplete run, retry opportunity lost: {}",
                    self.tenant, e
                );
                false
            }
        }
    }
}
