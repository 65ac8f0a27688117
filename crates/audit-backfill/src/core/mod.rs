//! Core domain types and backend abstractions.
//!
//! - [`TenantDescriptor`]: who is being backfilled
//! - [`AuditRecord`] / [`RecordIdTimestamp`]: what is copied
//! - [`TimeWindow`]: the unit of copy work
//! - [`traits`]: the source, sink, queue and retry seams

pub mod record;
pub mod tenant;
pub mod traits;
pub mod window;

pub use record::{AuditRecord, RecordIdTimestamp};
pub use tenant::TenantDescriptor;
pub use traits::{
    RecordSink, RecordSource, RequeueOutcome, Requeuer, SessionKind, SourceConnector,
    SourceSession, SourceTable, TenantDirectory, TenantQueue, UpsertOutcome,
};
pub use window::{day_windows, days_until, truncate_to_day, TimeWindow};
