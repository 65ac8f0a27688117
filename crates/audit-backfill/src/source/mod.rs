//! Source record store access.
//!
//! [`TimeRangeCounter`] and [`RecordFetcher`] implement the archive-aware
//! query logic on top of any [`SourceSession`]; the backends only answer
//! single-table or explicit-union questions.
//!
//! - [`mysql`]: sqlx-backed MySQL store with one schema per tenant
//! - [`memory`]: in-process store for tests and dry runs

pub mod memory;
pub mod mysql;

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::{
    truncate_to_day, AuditRecord, RecordSource, SessionKind, SourceSession, SourceTable,
};
use crate::error::Result;

pub use memory::{MemoryRecordStore, MemorySourceConnector};
pub use mysql::{MysqlConnector, MysqlSource};

/// Tables to query in this session: the active table, plus the archive if it exists.
pub async fn present_tables(session: &mut dyn SourceSession) -> Result<Vec<SourceTable>> {
    let mut tables = vec![SourceTable::Active];
    if session.table_exists(SourceTable::Archive).await? {
        tables.push(SourceTable::Archive);
    }
    Ok(tables)
}

/// Counts records in time ranges across the active and archive tables.
#[derive(Clone)]
pub struct TimeRangeCounter {
    source: Arc<dyn RecordSource>,
    epoch_floor: DateTime<Utc>,
}

impl TimeRangeCounter {
    pub fn new(source: Arc<dyn RecordSource>, epoch_floor: DateTime<Utc>) -> Self {
        Self {
            source,
            epoch_floor,
        }
    }

    /// Count records with `from <= created < to_exclusive`.
    ///
    /// An inverted range is rejected with a warning and counts as zero.
    pub async fn count(&self, from: DateTime<Utc>, to_exclusive: DateTime<Utc>) -> Result<u64> {
        if from > to_exclusive {
            warn!(
                "Rejecting count for inverted range {} -> {}",
                from, to_exclusive
            );
            return Ok(0);
        }

        let mut session = self.source.open_session(SessionKind::Lookup).await?;
        let tables = present_tables(session.as_mut()).await?;
        let count = session
            .count_range(&tables, from.timestamp_millis(), to_exclusive.timestamp_millis())
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Earliest record creation date, truncated to UTC midnight.
    ///
    /// Falls back to the epoch floor when both tables are empty.
    pub async fn earliest_record_date(&self) -> Result<DateTime<Utc>> {
        let mut session = self.source.open_session(SessionKind::Lookup).await?;
        let tables = present_tables(session.as_mut()).await?;

        let mut earliest: Option<i64> = None;
        for table in tables {
            if let Some(min) = session.min_created(table).await? {
                debug!("Earliest created in {:?}: {}", table, min);
                earliest = Some(earliest.map_or(min, |e| e.min(min)));
            }
        }

        let date = earliest
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or(self.epoch_floor);
        Ok(truncate_to_day(date))
    }
}

/// Fetches full records, active table first, then the archive.
pub struct RecordFetcher;

impl RecordFetcher {
    /// Fetch a record by id using the caller's session.
    ///
    /// The session must not have an open stream.
    pub async fn fetch(session: &mut dyn SourceSession, id: &str) -> Result<Option<AuditRecord>> {
        if let Some(record) = session.fetch_from(SourceTable::Active, id).await? {
            return Ok(Some(record));
        }
        if session.table_exists(SourceTable::Archive).await? {
            return session.fetch_from(SourceTable::Archive, id).await;
        }
        Ok(None)
    }

    /// Open a lookup session on `source` and fetch one record.
    pub async fn fetch_from_source(source: &dyn RecordSource, id: &str) -> Result<Option<AuditRecord>> {
        let mut session = source.open_session(SessionKind::Lookup).await?;
        Self::fetch(session.as_mut(), id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ts(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn floor() -> DateTime<Utc> {
        ts(2014, 1, 1, 0)
    }

    #[tokio::test]
    async fn test_count_sums_active_and_archive() {
        let store = MemoryRecordStore::with_archive();
        store.insert(AuditRecord::new("a", ts(2020, 5, 1, 3).timestamp_millis()));
        store.insert(AuditRecord::new("b", ts(2020, 5, 1, 4).timestamp_millis()));
        store.insert_archived(AuditRecord::new("c", ts(2020, 5, 1, 5).timestamp_millis()));
        store.insert_archived(AuditRecord::new("d", ts(2020, 5, 2, 5).timestamp_millis()));

        let counter = TimeRangeCounter::new(store.clone(), floor());
        let day = ts(2020, 5, 1, 0);
        assert_eq!(counter.count(day, day + Duration::days(1)).await.unwrap(), 3);
        assert_eq!(counter.count(ts(2020, 5, 1, 4), ts(2020, 5, 1, 5)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_count_ignores_archive_rows_without_archive_table() {
        let store = MemoryRecordStore::new();
        store.insert(AuditRecord::new("a", ts(2020, 5, 1, 3).timestamp_millis()));

        let counter = TimeRangeCounter::new(store, floor());
        assert_eq!(counter.count(ts(2020, 5, 1, 0), ts(2020, 5, 2, 0)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_inverted_range_counts_zero() {
        let store = MemoryRecordStore::new();
        store.insert(AuditRecord::new("a", ts(2020, 5, 1, 3).timestamp_millis()));
        let counter = TimeRangeCounter::new(store, floor());
        assert_eq!(counter.count(ts(2020, 5, 2, 0), ts(2020, 5, 1, 0)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_earliest_date_spans_tables_and_truncates() {
        let store = MemoryRecordStore::with_archive();
        store.insert(AuditRecord::new("a", ts(2019, 6, 1, 13).timestamp_millis()));
        store.insert_archived(AuditRecord::new("b", ts(2017, 2, 3, 22).timestamp_millis()));

        let counter = TimeRangeCounter::new(store, floor());
        assert_eq!(counter.earliest_record_date().await.unwrap(), ts(2017, 2, 3, 0));
    }

    #[tokio::test]
    async fn test_earliest_date_defaults_to_floor() {
        let counter = TimeRangeCounter::new(MemoryRecordStore::with_archive(), floor());
        assert_eq!(counter.earliest_record_date().await.unwrap(), floor());
    }

    #[tokio::test]
    async fn test_fetch_falls_back_to_archive() {
        let store = MemoryRecordStore::with_archive();
        store.insert(AuditRecord::new("active", 10));
        store.insert_archived(AuditRecord::new("archived", 20));

        let found = RecordFetcher::fetch_from_source(store.as_ref(), "archived")
            .await
            .unwrap();
        assert_eq!(found.map(|r| r.created), Some(20));

        let found = RecordFetcher::fetch_from_source(store.as_ref(), "active").await.unwrap();
        assert_eq!(found.map(|r| r.created), Some(10));

        let missing = RecordFetcher::fetch_from_source(store.as_ref(), "nope").await.unwrap();
        assert!(missing.is_none());
    }
}
