//! Configuration type definitions with auto-tuning based on system resources.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use sysinfo::System;
use tracing::info;

use crate::core::TenantDescriptor;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in bytes.
    pub total_memory_bytes: u64,
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_bytes = sys.total_memory();
        let total_memory_gb = total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_bytes,
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source record store (MySQL).
    pub source: SourceConfig,

    /// Destination object store.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Distributed tenant queue.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Partitioning, pool and retry behavior.
    #[serde(default)]
    pub backfill: BackfillConfig,

    /// Tenants known to the static directory.
    #[serde(default)]
    pub tenants: Vec<TenantDescriptor>,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.backfill = self.backfill.with_auto_tuning(&resources);
        self
    }
}

/// Source record store (MySQL) configuration.
///
/// Each tenant lives in its own schema, named by `database_template`.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database type (always "mysql" for now).
    #[serde(default = "default_mysql")]
    pub r#type: String,

    /// Database host.
    pub host: String,

    /// Database port (default: 3306).
    #[serde(default = "default_mysql_port")]
    pub port: u16,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Per-tenant schema name; `{org}` and `{tenant_id}` are substituted.
    #[serde(default = "default_database_template")]
    pub database_template: String,

    /// Table holding recent records.
    #[serde(default = "default_active_table")]
    pub active_table: String,

    /// Table holding archived records, if the tenant has one.
    #[serde(default = "default_archive_table")]
    pub archive_table: String,

    /// Seconds to wait for a pooled connection (default: 30).
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("database_template", &self.database_template)
            .field("active_table", &self.active_table)
            .field("archive_table", &self.archive_table)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .finish()
    }
}

/// Destination object store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Store type: "s3", "local" or "memory" (default: "s3").
    #[serde(default = "default_s3")]
    pub r#type: String,

    /// Bucket name (s3).
    #[serde(default)]
    pub bucket: Option<String>,

    /// Region (s3); falls back to the AWS environment.
    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint (s3-compatible stores).
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Root directory (local).
    #[serde(default)]
    pub root: Option<String>,

    /// Key prefix prepended to every object.
    #[serde(default)]
    pub prefix: Option<String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            r#type: default_s3(),
            bucket: None,
            region: None,
            endpoint: None,
            root: None,
            prefix: None,
        }
    }
}

/// Distributed queue configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue type: "redis" or "memory" (default: "redis").
    #[serde(default = "default_redis")]
    pub r#type: String,

    /// Connection URL (redis).
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Set holding pending tenant routing keys.
    #[serde(default = "default_set_key")]
    pub set_key: String,

    /// Hash holding per-tenant re-queue attempt counts.
    #[serde(default = "default_attempts_key")]
    pub attempts_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            r#type: default_redis(),
            url: default_redis_url(),
            set_key: default_set_key(),
            attempts_key: default_attempts_key(),
        }
    }
}

impl fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConfig")
            .field("type", &self.r#type)
            .field("url", &"[REDACTED]")
            .field("set_key", &self.set_key)
            .field("attempts_key", &self.attempts_key)
            .finish()
    }
}

/// Backfill behavior configuration.
/// Pool sizes use Option<T> to distinguish between "not set" (use auto-tuned
/// default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Instant after which records are already dual-written.
    #[serde(default = "default_cutover")]
    pub cutover: DateTime<Utc>,

    /// Start date used for tenants with no records at all.
    #[serde(default = "default_epoch_floor")]
    pub epoch_floor: DateTime<Utc>,

    /// Copy window length in minutes (default: 60).
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u32,

    /// Interval between day completion checks (default: 500ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Ceiling on waiting for one day to resolve (default: 24h).
    #[serde(default = "default_day_timeout_secs")]
    pub day_timeout_secs: u64,

    /// Concurrent id streams (source sessions held for a whole window).
    #[serde(default)]
    pub stream_workers: Option<usize>,

    /// Concurrent point lookups against the source.
    #[serde(default)]
    pub lookup_workers: Option<usize>,

    /// Concurrent sink upserts.
    #[serde(default)]
    pub sink_workers: Option<usize>,

    /// Wait for each window to resolve before dispatching the next (default: true).
    #[serde(default = "default_true")]
    pub strict_window_order: bool,

    /// Re-queues allowed per tenant before giving up (default: 5).
    #[serde(default = "default_max_requeue_attempts")]
    pub max_requeue_attempts: u32,

    /// Base delay before re-adding an incomplete tenant (default: 30s).
    #[serde(default = "default_requeue_backoff_secs")]
    pub requeue_backoff_secs: u64,

    /// Upper bound on the re-queue delay (default: 15m).
    #[serde(default = "default_requeue_backoff_max_secs")]
    pub requeue_backoff_max_secs: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            cutover: default_cutover(),
            epoch_floor: default_epoch_floor(),
            window_minutes: default_window_minutes(),
            poll_interval_ms: default_poll_interval_ms(),
            day_timeout_secs: default_day_timeout_secs(),
            stream_workers: None,
            lookup_workers: None,
            sink_workers: None,
            strict_window_order: true,
            max_requeue_attempts: default_max_requeue_attempts(),
            requeue_backoff_secs: default_requeue_backoff_secs(),
            requeue_backoff_max_secs: default_requeue_backoff_max_secs(),
        }
    }
}

impl BackfillConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let cores = resources.cpu_cores;

        // Streams hold a source connection for a whole window: keep it small
        if self.stream_workers.is_none() {
            self.stream_workers = Some((cores / 4).clamp(2, 8));
        }

        // Lookups are short queries: tens of sessions
        if self.lookup_workers.is_none() {
            self.lookup_workers = Some((cores * 4).clamp(16, 64));
        }

        // The object store tolerates wide fan-out
        if self.sink_workers.is_none() {
            self.sink_workers = Some((cores * 16).clamp(64, 256));
        }

        info!(
            "Auto-tuned config: stream_workers={}, lookup_workers={}, sink_workers={}",
            self.get_stream_workers(),
            self.get_lookup_workers(),
            self.get_sink_workers(),
        );

        self
    }

    // Accessor methods that return the effective value (with fallback defaults)
    // These are used when the config hasn't been auto-tuned yet

    pub fn get_stream_workers(&self) -> usize {
        self.stream_workers.unwrap_or(4)
    }

    pub fn get_lookup_workers(&self) -> usize {
        self.lookup_workers.unwrap_or(32)
    }

    pub fn get_sink_workers(&self) -> usize {
        self.sink_workers.unwrap_or(128)
    }

    pub fn window(&self) -> Duration {
        Duration::minutes(i64::from(self.window_minutes))
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    pub fn day_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.day_timeout_secs)
    }

    /// Delay before the given (1-based) re-queue attempt.
    pub fn requeue_delay(&self, attempt: u32) -> std::time::Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let secs = self
            .requeue_backoff_secs
            .saturating_mul(1u64 << exponent)
            .min(self.requeue_backoff_max_secs);
        std::time::Duration::from_secs(secs)
    }
}

// Default value functions for serde
fn default_mysql() -> String {
    "mysql".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_database_template() -> String {
    "{org}".to_string()
}

fn default_active_table() -> String {
    "audit_event".to_string()
}

fn default_archive_table() -> String {
    "audit_event_archive".to_string()
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_s3() -> String {
    "s3".to_string()
}

fn default_redis() -> String {
    "redis".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_set_key() -> String {
    "audit-backfill:tenants".to_string()
}

fn default_attempts_key() -> String {
    "audit-backfill:attempts".to_string()
}

fn default_cutover() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 10, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn default_epoch_floor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn default_window_minutes() -> u32 {
    60
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_day_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_requeue_attempts() -> u32 {
    5
}

fn default_requeue_backoff_secs() -> u64 {
    30
}

fn default_requeue_backoff_max_secs() -> u64 {
    15 * 60
}

fn default_true() -> bool {
    true
}
