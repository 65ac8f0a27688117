//! Core traits for the backfill engine's external collaborators.
//!
//! This module defines the seams between the engine and its backends:
//!
//! - [`SourceConnector`] / [`RecordSource`] / [`SourceSession`]: the legacy
//!   relational record store, split into an active and an optional archive table
//! - [`RecordSink`]: the idempotent destination store
//! - [`TenantQueue`]: the distributed set used for admission and retry
//! - [`TenantDirectory`]: resolves queue entries back into tenant descriptors
//! - [`Requeuer`]: the retry policy applied to incomplete tenant runs
//!
//! # Design Pattern
//!
//! Strategy: the engine works with `Arc<dyn Trait>` handles, so MySQL, object
//! store and Redis backends can be swapped for in-memory ones in tests.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

use crate::error::Result;

use super::record::{AuditRecord, RecordIdTimestamp};
use super::tenant::TenantDescriptor;

/// Which of the two source tables a query addresses.
///
/// The archive table, when present, has a schema identical to the active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceTable {
    Active,
    Archive,
}

/// The kind of work a session is opened for.
///
/// Sessions come from separate pools per kind: a connection with an open
/// streaming result set cannot serve point lookups at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Long-running id/timestamp scans.
    Stream,
    /// Point lookups and counts.
    Lookup,
}

/// Opens a [`RecordSource`] bound to one tenant's data.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Connect to the tenant's source database.
    async fn connect(&self, tenant: &TenantDescriptor) -> Result<Arc<dyn RecordSource>>;
}

/// A tenant-bound source record store.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Open an exclusive session of the given kind.
    ///
    /// A session must never be shared between concurrent tasks.
    async fn open_session(&self, kind: SessionKind) -> Result<Box<dyn SourceSession>>;

    /// Get the source type identifier (e.g., "mysql", "memory").
    fn source_type(&self) -> &str;

    /// Release pooled connections.
    async fn close(&self);
}

/// One exclusive session against the source store.
#[async_trait]
pub trait SourceSession: Send {
    /// Whether the given table exists for this tenant.
    async fn table_exists(&mut self, table: SourceTable) -> Result<bool>;

    /// Count records with `from_ms <= created < to_ms` summed across `tables`.
    async fn count_range(&mut self, tables: &[SourceTable], from_ms: i64, to_ms: i64) -> Result<i64>;

    /// Stream `(id, created)` pairs with `from_ms <= created < to_ms` from the union of `tables`.
    ///
    /// The session is borrowed for the lifetime of the stream.
    fn stream_range<'a>(
        &'a mut self,
        tables: &'a [SourceTable],
        from_ms: i64,
        to_ms: i64,
    ) -> BoxStream<'a, Result<RecordIdTimestamp>>;

    /// Fetch one full record by id from a single table.
    async fn fetch_from(&mut self, table: SourceTable, id: &str) -> Result<Option<AuditRecord>>;

    /// Minimum `created` value in a table, or `None` if it is empty.
    async fn min_created(&mut self, table: SourceTable) -> Result<Option<i64>>;
}

/// Result of an idempotent upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No object existed under the record's key; it was written.
    Created,
    /// An identical object already existed; nothing was written.
    AlreadyExisted,
    /// An object with different content existed and was overwritten.
    Replaced,
}

impl UpsertOutcome {
    pub fn already_existed(&self) -> bool {
        matches!(self, UpsertOutcome::AlreadyExisted)
    }
}

/// Idempotent destination for audit records.
///
/// Implementations must be safe to call concurrently with high fan-out and
/// idempotent under the record's identifier.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Persist a record for a tenant.
    async fn upsert(&self, tenant: &TenantDescriptor, record: &AuditRecord) -> Result<UpsertOutcome>;

    /// Get the sink type identifier (e.g., "s3", "local", "memory").
    fn sink_type(&self) -> &str;
}

/// Distributed set-backed queue of tenant routing keys.
///
/// Used only for admission control and retry; it is not a record of progress.
#[async_trait]
pub trait TenantQueue: Send + Sync {
    /// Add a member; returns `true` if it was not already present.
    async fn add(&self, key: &str) -> Result<bool>;

    /// Atomically remove and return an arbitrary member.
    async fn pop_any(&self) -> Result<Option<String>>;

    /// Number of pending members.
    async fn len(&self) -> Result<u64>;

    /// Increment and return the re-queue attempt count for a member.
    async fn record_attempt(&self, key: &str) -> Result<u32>;

    /// Forget the re-queue attempt count for a member.
    async fn clear_attempts(&self, key: &str) -> Result<()>;

    /// Get the queue type identifier (e.g., "redis", "memory").
    fn queue_type(&self) -> &str;
}

/// Resolves queue entries back into tenant descriptors.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Look up a tenant by its routing key.
    async fn find(&self, org: &str) -> Result<Option<TenantDescriptor>>;
}

/// What happened when an incomplete run asked to be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// The tenant was (or will shortly be) re-added to the queue.
    Scheduled { attempt: u32, delay_secs: u64 },
    /// The retry cap was reached; the tenant was not re-added.
    GaveUp { attempts: u32 },
}

/// Retry policy for tenants whose run was not a complete success.
#[async_trait]
pub trait Requeuer: Send + Sync {
    /// Schedule another attempt for the tenant.
    async fn requeue(&self, tenant: &TenantDescriptor) -> Result<RequeueOutcome>;

    /// Reset retry bookkeeping after a complete run.
    async fn reset(&self, tenant: &TenantDescriptor) -> Result<()>;
}
