//! Redis-backed tenant queue.
//!
//! Pending tenants live in a Redis set (`SADD` / `SPOP`), which gives
//! cross-process dedup on admission and an atomic claim on pop. Re-queue
//! attempt counts live in a companion hash (`HINCRBY` / `HDEL`).

use async_trait::async_trait;
use ::redis::aio::MultiplexedConnection;
use ::redis::AsyncCommands;
use tracing::info;

use crate::config::QueueConfig;
use crate::core::TenantQueue;
use crate::error::Result;

/// Tenant queue stored in Redis.
#[derive(Clone)]
pub struct RedisTenantQueue {
    conn: MultiplexedConnection,
    set_key: String,
    attempts_key: String,
}

impl RedisTenantQueue {
    /// Connect using the `queue` config section.
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let client = ::redis::Client::open(config.url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis queue (set: {})", config.set_key);

        Ok(Self {
            conn,
            set_key: config.set_key.clone(),
            attempts_key: config.attempts_key.clone(),
        })
    }
}

#[async_trait]
impl TenantQueue for RedisTenantQueue {
    async fn add(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = conn.sadd(&self.set_key, key).await?;
        Ok(added > 0)
    }

    async fn pop_any(&self) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let popped: Option<String> = conn.spop(&self.set_key).await?;
        Ok(popped)
    }

    async fn len(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.scard(&self.set_key).await?;
        Ok(len)
    }

    async fn record_attempt(&self, key: &str) -> Result<u32> {
        let mut conn = self.conn.clone();
        let attempts: i64 = conn.hincr(&self.attempts_key, key, 1).await?;
        Ok(u32::try_from(attempts).unwrap_or(u32::MAX))
    }

    async fn clear_attempts(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.hdel(&self.attempts_key, key).await?;
        Ok(())
    }

    fn queue_type(&self) -> &str {
        "redis"
    }
}
