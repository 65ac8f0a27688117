//! In-memory source record store.
//!
//! Holds an active and an optional archive table per store. Used by tests
//! and by dry runs that do not need a database.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::{
    AuditRecord, RecordIdTimestamp, RecordSource, SessionKind, SourceConnector, SourceSession,
    SourceTable, TenantDescriptor,
};
use crate::error::{BackfillError, Result};

#[derive(Debug, Default)]
struct Tables {
    active: BTreeMap<String, AuditRecord>,
    archive: Option<BTreeMap<String, AuditRecord>>,
    /// Ids that streams still return but lookups no longer find.
    vanished: HashSet<String>,
    /// Ids whose lookup fails with an error.
    failing: HashSet<String>,
}

impl Tables {
    fn table(&self, table: SourceTable) -> Option<&BTreeMap<String, AuditRecord>> {
        match table {
            SourceTable::Active => Some(&self.active),
            SourceTable::Archive => self.archive.as_ref(),
        }
    }
}

/// Shared in-memory store; clones of the `Arc` see the same data.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    tables: Arc<Mutex<Tables>>,
    open_streams: Arc<AtomicUsize>,
    peak_streams: Arc<AtomicUsize>,
}

impl MemoryRecordStore {
    /// Store without an archive table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store with an (initially empty) archive table.
    pub fn with_archive() -> Arc<Self> {
        let store = Self::default();
        store.lock().archive = Some(BTreeMap::new());
        Arc::new(store)
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, record: AuditRecord) {
        self.lock().active.insert(record.id.clone(), record);
    }

    /// Insert into the archive table, creating it if needed.
    pub fn insert_archived(&self, record: AuditRecord) {
        self.lock()
            .archive
            .get_or_insert_with(BTreeMap::new)
            .insert(record.id.clone(), record);
    }

    /// Move every active record into the archive table.
    pub fn archive_all(&self) {
        let mut tables = self.lock();
        let moved = std::mem::take(&mut tables.active);
        tables.archive.get_or_insert_with(BTreeMap::new).extend(moved);
    }

    pub fn remove(&self, id: &str) {
        let mut tables = self.lock();
        tables.active.remove(id);
        if let Some(archive) = tables.archive.as_mut() {
            archive.remove(id);
        }
    }

    /// Keep `id` visible to streams but hide it from lookups.
    pub fn vanish_on_fetch(&self, id: &str) {
        self.lock().vanished.insert(id.to_string());
    }

    /// Make lookups of `id` fail.
    pub fn fail_fetch(&self, id: &str) {
        self.lock().failing.insert(id.to_string());
    }

    /// Records across both tables.
    pub fn len(&self) -> usize {
        let tables = self.lock();
        tables.active.len() + tables.archive.as_ref().map_or(0, |a| a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest number of stream sessions open at the same time.
    pub fn peak_open_streams(&self) -> usize {
        self.peak_streams.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSource for MemoryRecordStore {
    async fn open_session(&self, kind: SessionKind) -> Result<Box<dyn SourceSession>> {
        if kind == SessionKind::Stream {
            let open = self.open_streams.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_streams.fetch_max(open, Ordering::SeqCst);
        }
        Ok(Box::new(MemorySession {
            tables: self.tables.clone(),
            open_streams: (kind == SessionKind::Stream).then(|| self.open_streams.clone()),
        }))
    }

    fn source_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) {}
}

struct MemorySession {
    tables: Arc<Mutex<Tables>>,
    open_streams: Option<Arc<AtomicUsize>>,
}

impl MemorySession {
    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn matching(&self, tables: &[SourceTable], from_ms: i64, to_ms: i64) -> Vec<RecordIdTimestamp> {
        let guard = self.lock();
        let mut rows: Vec<RecordIdTimestamp> = tables
            .iter()
            .filter_map(|t| guard.table(*t))
            .flat_map(|t| t.values())
            .filter(|r| r.created >= from_ms && r.created < to_ms)
            .map(AuditRecord::id_timestamp)
            .collect();
        rows.sort_by_key(|r| r.created);
        rows
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if let Some(open) = &self.open_streams {
            open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl SourceSession for MemorySession {
    async fn table_exists(&mut self, table: SourceTable) -> Result<bool> {
        Ok(self.lock().table(table).is_some())
    }

    async fn count_range(&mut self, tables: &[SourceTable], from_ms: i64, to_ms: i64) -> Result<i64> {
        Ok(self.matching(tables, from_ms, to_ms).len() as i64)
    }

    fn stream_range<'a>(
        &'a mut self,
        tables: &'a [SourceTable],
        from_ms: i64,
        to_ms: i64,
    ) -> BoxStream<'a, Result<RecordIdTimestamp>> {
        let rows = self.matching(tables, from_ms, to_ms);
        stream::iter(rows.into_iter().map(Ok)).boxed()
    }

    async fn fetch_from(&mut self, table: SourceTable, id: &str) -> Result<Option<AuditRecord>> {
        let guard = self.lock();
        if guard.failing.contains(id) {
            return Err(BackfillError::source_error(
                format!("lookup of {} failed", id),
                "memory store",
            ));
        }
        if guard.vanished.contains(id) {
            return Ok(None);
        }
        Ok(guard.table(table).and_then(|t| t.get(id)).cloned())
    }

    async fn min_created(&mut self, table: SourceTable) -> Result<Option<i64>> {
        Ok(self
            .lock()
            .table(table)
            .and_then(|t| t.values().map(|r| r.created).min()))
    }
}

/// Connector serving in-memory stores by org name.
#[derive(Debug, Default, Clone)]
pub struct MemorySourceConnector {
    stores: HashMap<String, Arc<MemoryRecordStore>>,
    fallback: Option<Arc<MemoryRecordStore>>,
}

impl MemorySourceConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve the same store for every tenant.
    pub fn single(store: Arc<MemoryRecordStore>) -> Self {
        Self {
            stores: HashMap::new(),
            fallback: Some(store),
        }
    }

    pub fn with_tenant(mut self, org: impl Into<String>, store: Arc<MemoryRecordStore>) -> Self {
        self.stores.insert(org.into(), store);
        self
    }
}

#[async_trait]
impl SourceConnector for MemorySourceConnector {
    async fn connect(&self, tenant: &TenantDescriptor) -> Result<Arc<dyn RecordSource>> {
        let store = self
            .stores
            .get(&tenant.org)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| {
                BackfillError::source_error(
                    format!("no source for org '{}'", tenant.org),
                    "memory connector",
                )
            })?;
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_is_half_open_and_sorted() {
        let store = MemoryRecordStore::with_archive();
        store.insert(AuditRecord::new("late", 30));
        store.insert(AuditRecord::new("early", 10));
        store.insert_archived(AuditRecord::new("mid", 20));
        store.insert(AuditRecord::new("edge", 40));

        let mut session = store.open_session(SessionKind::Stream).await.unwrap();
        let tables = [SourceTable::Active, SourceTable::Archive];
        let ids: Vec<String> = session
            .stream_range(&tables, 10, 40)
            .map(|r| r.unwrap().id)
            .collect()
            .await;
        assert_eq!(ids, vec!["early", "mid", "late"]);
    }

    #[tokio::test]
    async fn test_archive_all_moves_rows() {
        let store = MemoryRecordStore::new();
        store.insert(AuditRecord::new("a", 1));
        store.insert(AuditRecord::new("b", 2));
        store.archive_all();

        let mut session = store.open_session(SessionKind::Lookup).await.unwrap();
        assert!(session.table_exists(SourceTable::Archive).await.unwrap());
        assert_eq!(session.count_range(&[SourceTable::Active], 0, 10).await.unwrap(), 0);
        assert_eq!(session.count_range(&[SourceTable::Archive], 0, 10).await.unwrap(), 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_stream_gauge_tracks_open_sessions() {
        let store = MemoryRecordStore::new();
        let first = store.open_session(SessionKind::Stream).await.unwrap();
        let second = store.open_session(SessionKind::Stream).await.unwrap();
        let _lookup = store.open_session(SessionKind::Lookup).await.unwrap();
        drop(first);
        drop(second);
        let _third = store.open_session(SessionKind::Stream).await.unwrap();
        assert_eq!(store.peak_open_streams(), 2);
    }

    #[tokio::test]
    async fn test_connector_routes_by_org() {
        let acme = MemoryRecordStore::new();
        acme.insert(AuditRecord::new("a", 1));
        let connector = MemorySourceConnector::new().with_tenant("acme", acme);

        let tenant = TenantDescriptor::new("acme", "pod-1", "t-1");
        assert!(connector.connect(&tenant).await.is_ok());

        let other = TenantDescriptor::new("globex", "pod-1", "t-2");
        assert!(connector.connect(&other).await.is_err());
    }
}
