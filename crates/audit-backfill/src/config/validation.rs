//! Configuration validation.

use super::Config;
use crate::error::{BackfillError, Result};

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.r#type != "mysql" {
        return Err(BackfillError::Config(format!(
            "source.type must be 'mysql', got '{}'",
            config.source.r#type
        )));
    }
    if config.source.host.is_empty() {
        return Err(BackfillError::Config("source.host is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(BackfillError::Config("source.user is required".into()));
    }
    if config.source.database_template.is_empty() {
        return Err(BackfillError::Config(
            "source.database_template is required".into(),
        ));
    }
    if config.source.active_table.is_empty() {
        return Err(BackfillError::Config("source.active_table is required".into()));
    }
    if config.source.archive_table == config.source.active_table {
        return Err(BackfillError::Config(
            "source.archive_table must differ from source.active_table".into(),
        ));
    }

    // Sink validation
    match config.sink.r#type.as_str() {
        "s3" => {
            if config.sink.bucket.as_deref().unwrap_or_default().is_empty() {
                return Err(BackfillError::Config("sink.bucket is required for s3".into()));
            }
        }
        "local" => {
            if config.sink.root.as_deref().unwrap_or_default().is_empty() {
                return Err(BackfillError::Config("sink.root is required for local".into()));
            }
        }
        "memory" => {}
        other => {
            return Err(BackfillError::Config(format!(
                "sink.type must be 's3', 'local' or 'memory', got '{}'",
                other
            )))
        }
    }

    // Queue validation
    match config.queue.r#type.as_str() {
        "redis" => {
            if config.queue.url.is_empty() {
                return Err(BackfillError::Config("queue.url is required for redis".into()));
            }
        }
        "memory" => {}
        other => {
            return Err(BackfillError::Config(format!(
                "queue.type must be 'redis' or 'memory', got '{}'",
                other
            )))
        }
    }
    if config.queue.set_key.is_empty() || config.queue.attempts_key.is_empty() {
        return Err(BackfillError::Config(
            "queue.set_key and queue.attempts_key are required".into(),
        ));
    }
    if config.queue.set_key == config.queue.attempts_key {
        return Err(BackfillError::Config(
            "queue.set_key and queue.attempts_key must differ".into(),
        ));
    }

    // Backfill validation - pool sizes only checked if explicitly set
    let backfill = &config.backfill;
    if backfill.epoch_floor >= backfill.cutover {
        return Err(BackfillError::Config(
            "backfill.epoch_floor must be before backfill.cutover".into(),
        ));
    }
    if backfill.window_minutes == 0 || MINUTES_PER_DAY % backfill.window_minutes != 0 {
        return Err(BackfillError::Config(format!(
            "backfill.window_minutes must evenly divide a day, got {}",
            backfill.window_minutes
        )));
    }
    if backfill.poll_interval_ms == 0 {
        return Err(BackfillError::Config(
            "backfill.poll_interval_ms must be at least 1".into(),
        ));
    }
    if backfill.day_timeout_secs == 0 {
        return Err(BackfillError::Config(
            "backfill.day_timeout_secs must be at least 1".into(),
        ));
    }
    if let Some(0) = backfill.stream_workers {
        return Err(BackfillError::Config(
            "backfill.stream_workers must be at least 1".into(),
        ));
    }
    if let Some(0) = backfill.lookup_workers {
        return Err(BackfillError::Config(
            "backfill.lookup_workers must be at least 1".into(),
        ));
    }
    if let Some(0) = backfill.sink_workers {
        return Err(BackfillError::Config(
            "backfill.sink_workers must be at least 1".into(),
        ));
    }
    if backfill.requeue_backoff_max_secs < backfill.requeue_backoff_secs {
        return Err(BackfillError::Config(
            "backfill.requeue_backoff_max_secs must not be below requeue_backoff_secs".into(),
        ));
    }

    // Tenants
    for tenant in &config.tenants {
        tenant
            .validate()
            .map_err(|e| BackfillError::Config(format!("tenants: {}", e)))?;
    }

    Ok(())
}
