//! Distributed tenant queue backends.
//!
//! The queue is a set of tenant routing keys: adding a present member is a
//! no-op, and popping removes and returns one member atomically, so two
//! worker processes never claim the same tenant.
//!
//! - [`redis`]: `SADD`/`SPOP` on a Redis set, attempts in a Redis hash
//! - [`memory`]: single-process set for tests and local runs

pub mod memory;
pub mod redis;

use std::sync::Arc;

use crate::config::QueueConfig;
use crate::core::TenantQueue;
use crate::error::{BackfillError, Result};

pub use self::memory::MemoryTenantQueue;
pub use self::redis::RedisTenantQueue;

/// Build the queue described by the `queue` config section.
pub async fn from_config(config: &QueueConfig) -> Result<Arc<dyn TenantQueue>> {
    match config.r#type.as_str() {
        "redis" => Ok(Arc::new(RedisTenantQueue::connect(config).await?)),
        "memory" => Ok(Arc::new(MemoryTenantQueue::new())),
        other => Err(BackfillError::Config(format!(
            "unsupported queue.type '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_memory() {
        let config = QueueConfig {
            r#type: "memory".into(),
            ..Default::default()
        };
        let queue = from_config(&config).await.unwrap();
        assert_eq!(queue.queue_type(), "memory");
    }

    #[tokio::test]
    async fn test_from_config_rejects_unknown() {
        let config = QueueConfig {
            r#type: "sqs".into(),
            ..Default::default()
        };
        assert!(from_config(&config).await.is_err());
    }
}
