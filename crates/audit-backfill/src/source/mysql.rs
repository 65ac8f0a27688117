//! MySQL/MariaDB source record store.
//!
//! Each tenant's audit tables live in their own schema. A connected
//! [`MysqlSource`] holds two SQLx pools: one for long-running id streams and
//! one for point lookups and counts. A connection with an open streaming
//! result set cannot run a second query, so the two kinds never share one.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use sqlx::mysql::{MySql, MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::pool::PoolConnection;
use sqlx::Row;
use tracing::{debug, info};

use crate::config::{BackfillConfig, SourceConfig};
use crate::core::{
    AuditRecord, RecordIdTimestamp, RecordSource, SessionKind, SourceConnector, SourceSession,
    SourceTable, TenantDescriptor,
};
use crate::error::{BackfillError, Result};

/// Columns read for a full record, in row order.
const RECORD_COLUMNS: &str = "id, created, action, source, target, application, tracking_id, \
                              string1, string2, string3, string4, attributes";

/// Quote a MySQL identifier.
fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// SQL text for one tenant's table pair.
#[derive(Debug)]
struct MysqlQueries {
    active_table: String,
    archive_table: String,
    stream_active: String,
    stream_union: String,
}

impl MysqlQueries {
    fn new(active_table: &str, archive_table: &str) -> Self {
        let active = quote_ident(active_table);
        let archive = quote_ident(archive_table);
        let select = |table: &str| {
            format!(
                "SELECT id, created FROM {} WHERE created >= ? AND created < ?",
                table
            )
        };

        Self {
            active_table: active_table.to_string(),
            archive_table: archive_table.to_string(),
            stream_active: select(&active),
            stream_union: format!("{} UNION ALL {}", select(&active), select(&archive)),
        }
    }

    fn table_name(&self, table: SourceTable) -> &str {
        match table {
            SourceTable::Active => &self.active_table,
            SourceTable::Archive => &self.archive_table,
        }
    }

    fn stream_sql(&self, tables: &[SourceTable]) -> &str {
        if tables.contains(&SourceTable::Archive) {
            &self.stream_union
        } else {
            &self.stream_active
        }
    }

    fn count_sql(&self, tables: &[SourceTable]) -> String {
        let parts: Vec<String> = tables
            .iter()
            .map(|t| {
                format!(
                    "SELECT COUNT(*) AS n FROM {} WHERE created >= ? AND created < ?",
                    quote_ident(self.table_name(*t))
                )
            })
            .collect();
        format!(
            "SELECT CAST(COALESCE(SUM(n), 0) AS SIGNED) FROM ({}) AS counts",
            parts.join(" UNION ALL ")
        )
    }
}

/// Opens per-tenant MySQL sources from the `source` config section.
#[derive(Debug, Clone)]
pub struct MysqlConnector {
    config: SourceConfig,
    stream_connections: usize,
    lookup_connections: usize,
}

impl MysqlConnector {
    pub fn new(config: SourceConfig, backfill: &BackfillConfig) -> Self {
        Self {
            config,
            stream_connections: backfill.get_stream_workers(),
            // counts and earliest-date queries share the lookup pool
            lookup_connections: backfill.get_lookup_workers() + 2,
        }
    }

    fn connect_options(&self, tenant: &TenantDescriptor) -> Result<MySqlConnectOptions> {
        if let Some(url) = &tenant.source_url {
            return MySqlConnectOptions::from_str(url).map_err(|e| {
                BackfillError::source_error(e.to_string(), format!("parsing source url for {}", tenant.org))
            });
        }

        Ok(MySqlConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .database(&self.config.database_for(tenant))
            .username(&self.config.user)
            .password(&self.config.password)
            .ssl_mode(MySqlSslMode::Preferred))
    }
}

#[async_trait]
impl SourceConnector for MysqlConnector {
    async fn connect(&self, tenant: &TenantDescriptor) -> Result<Arc<dyn RecordSource>> {
        let options = self.connect_options(tenant)?;
        let timeout = Duration::from_secs(self.config.acquire_timeout_secs);

        let stream_pool = MySqlPoolOptions::new()
            .max_connections(self.stream_connections as u32)
            .acquire_timeout(timeout)
            .connect_with(options.clone())
            .await
            .map_err(|e| BackfillError::source_error(e.to_string(), "creating MySQL stream pool"))?;

        let lookup_pool = MySqlPoolOptions::new()
            .max_connections(self.lookup_connections as u32)
            .acquire_timeout(timeout)
            .connect_with(options)
            .await
            .map_err(|e| BackfillError::source_error(e.to_string(), "creating MySQL lookup pool"))?;

        // Test connection
        sqlx::query("SELECT 1")
            .fetch_one(&lookup_pool)
            .await
            .map_err(|e| BackfillError::source_error(e.to_string(), "testing MySQL source connection"))?;

        info!(
            "Connected to MySQL source for {} (stream conns: {}, lookup conns: {})",
            tenant, self.stream_connections, self.lookup_connections
        );

        Ok(Arc::new(MysqlSource {
            stream_pool,
            lookup_pool,
            queries: Arc::new(MysqlQueries::new(
                &self.config.active_table,
                &self.config.archive_table,
            )),
        }))
    }
}

/// A tenant-bound MySQL source.
pub struct MysqlSource {
    stream_pool: MySqlPool,
    lookup_pool: MySqlPool,
    queries: Arc<MysqlQueries>,
}

#[async_trait]
impl RecordSource for MysqlSource {
    async fn open_session(&self, kind: SessionKind) -> Result<Box<dyn SourceSession>> {
        let (pool, context) = match kind {
            SessionKind::Stream => (&self.stream_pool, "acquiring MySQL stream connection"),
            SessionKind::Lookup => (&self.lookup_pool, "acquiring MySQL lookup connection"),
        };
        let conn = pool
            .acquire()
            .await
            .map_err(|e| BackfillError::source_error(e.to_string(), context))?;

        Ok(Box::new(MysqlSession {
            conn,
            queries: self.queries.clone(),
            archive_exists: None,
        }))
    }

    fn source_type(&self) -> &str {
        "mysql"
    }

    async fn close(&self) {
        self.stream_pool.close().await;
        self.lookup_pool.close().await;
    }
}

/// One pooled connection, exclusive to its task.
struct MysqlSession {
    conn: PoolConnection<MySql>,
    queries: Arc<MysqlQueries>,
    /// Archive presence, checked once per session.
    archive_exists: Option<bool>,
}

fn record_from_row(row: &MySqlRow) -> Result<AuditRecord> {
    Ok(AuditRecord {
        id: row.try_get("id")?,
        created: row.try_get("created")?,
        action: row.try_get("action")?,
        source: row.try_get("source")?,
        target: row.try_get("target")?,
        application: row.try_get("application")?,
        tracking_id: row.try_get("tracking_id")?,
        string1: row.try_get("string1")?,
        string2: row.try_get("string2")?,
        string3: row.try_get("string3")?,
        string4: row.try_get("string4")?,
        attributes: row.try_get("attributes")?,
    })
}

#[async_trait]
impl SourceSession for MysqlSession {
    async fn table_exists(&mut self, table: SourceTable) -> Result<bool> {
        if table == SourceTable::Archive {
            if let Some(exists) = self.archive_exists {
                return Ok(exists);
            }
        }

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(self.queries.table_name(table))
        .fetch_one(&mut *self.conn)
        .await?;

        let exists = count > 0;
        if table == SourceTable::Archive {
            debug!("Archive table present: {}", exists);
            self.archive_exists = Some(exists);
        }
        Ok(exists)
    }

    async fn count_range(&mut self, tables: &[SourceTable], from_ms: i64, to_ms: i64) -> Result<i64> {
        let sql = self.queries.count_sql(tables);
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for _ in tables {
            query = query.bind(from_ms).bind(to_ms);
        }
        Ok(query.fetch_one(&mut *self.conn).await?)
    }

    fn stream_range<'a>(
        &'a mut self,
        tables: &'a [SourceTable],
        from_ms: i64,
        to_ms: i64,
    ) -> BoxStream<'a, Result<RecordIdTimestamp>> {
        let sql = self.queries.stream_sql(tables);
        let mut query = sqlx::query(sql);
        for _ in tables {
            query = query.bind(from_ms).bind(to_ms);
        }

        query
            .fetch(&mut *self.conn)
            .map(|row| -> Result<RecordIdTimestamp> {
                let row = row?;
                Ok(RecordIdTimestamp::new(
                    row.try_get::<String, _>("id")?,
                    row.try_get::<i64, _>("created")?,
                ))
            })
            .boxed()
    }

    async fn fetch_from(&mut self, table: SourceTable, id: &str) -> Result<Option<AuditRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?",
            RECORD_COLUMNS,
            quote_ident(self.queries.table_name(table))
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn min_created(&mut self, table: SourceTable) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT MIN(created) FROM {}",
            quote_ident(self.queries.table_name(table))
        );
        let min: Option<i64> = sqlx::query_scalar(&sql).fetch_one(&mut *self.conn).await?;
        Ok(min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_backticks() {
        assert_eq!(quote_ident("audit_event"), "`audit_event`");
        assert_eq!(quote_ident("odd`name"), "`odd``name`");
    }

    #[test]
    fn test_stream_sql_unions_archive() {
        let queries = MysqlQueries::new("audit_event", "audit_event_archive");
        assert_eq!(
            queries.stream_sql(&[SourceTable::Active]),
            "SELECT id, created FROM `audit_event` WHERE created >= ? AND created < ?"
        );
        let union = queries.stream_sql(&[SourceTable::Active, SourceTable::Archive]);
        assert!(union.contains(" UNION ALL "));
        assert!(union.contains("`audit_event_archive`"));
        assert_eq!(union.matches('?').count(), 4);
    }

    #[test]
    fn test_count_sql_sums_tables() {
        let queries = MysqlQueries::new("audit_event", "audit_event_archive");
        let sql = queries.count_sql(&[SourceTable::Active, SourceTable::Archive]);
        assert!(sql.starts_with("SELECT CAST(COALESCE(SUM(n), 0) AS SIGNED) FROM ("));
        assert_eq!(sql.matches("COUNT(*)").count(), 2);
        assert_eq!(sql.matches('?').count(), 4);
    }

    #[test]
    fn test_connect_options_prefers_tenant_url() {
        let config = SourceConfig {
            r#type: "mysql".into(),
            host: "db".into(),
            port: 3306,
            user: "backfill".into(),
            password: "pw".into(),
            database_template: "{org}".into(),
            active_table: "audit_event".into(),
            archive_table: "audit_event_archive".into(),
            acquire_timeout_secs: 30,
        };
        let connector = MysqlConnector::new(config, &BackfillConfig::default());

        let mut tenant = TenantDescriptor::new("acme", "pod-1", "t-1");
        assert!(connector.connect_options(&tenant).is_ok());

        tenant.source_url = Some("not a url".into());
        assert!(connector.connect_options(&tenant).is_err());
    }
}
