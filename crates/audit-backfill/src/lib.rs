//! # audit-backfill
//!
//! Per-tenant backfill of historical audit records into a content-addressed
//! object store.
//!
//! Each tenant's history is walked a day at a time from its earliest record
//! up to a cutover instant, after which records are already dual-written.
//! Days are split into fixed windows that flow through a three-stage copy
//! pipeline:
//!
//! - **Stream**: `(id, created)` pairs from the active table and, when present,
//!   the archive table
//! - **Lookup**: each full record fetched by id on its own session
//! - **Persist**: an idempotent upsert keyed by tenant, creation minute and id
//!
//! Tenants arrive through a distributed queue and are drained one at a time
//! per process. Incomplete runs are re-queued with a capped backoff.
//!
//! ## Example
//!
//! ```rust,no_run
//! use audit_backfill::{Config, MigrationQueueService, TenantDescriptor};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> audit_backfill::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let service = MigrationQueueService::from_config(&config, CancellationToken::new()).await?;
//!     service.enqueue(&TenantDescriptor::new("acme", "pod-1", "t-1")).await?;
//!     let summary = service.drain().await;
//!     println!("Completed {} tenants", summary.completed);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod service;
pub mod sink;
pub mod source;
pub mod transfer;

// Re-exports for convenient access
pub use config::{BackfillConfig, Config, QueueConfig, SinkConfig, SourceConfig};
pub use self::core::{AuditRecord, RecordIdTimestamp, TenantDescriptor, TimeWindow};
pub use error::{BackfillError, Result};
pub use orchestrator::{DayPartitioner, MigrationEngine, TenantMigrationJob, TenantRunReport};
pub use service::{DrainSummary, MigrationQueueService, QueueRequeuer, StaticTenantDirectory};
pub use sink::ObjectStoreSink;
pub use source::{RecordFetcher, TimeRangeCounter};
pub use transfer::{CopyPipeline, RunStatistics, StatsSnapshot, WorkerPools};
