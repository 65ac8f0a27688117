//! Bounded worker pools for the three copy stages.
//!
//! Each stage is bounded by its own semaphore, sized for the resource it
//! consumes: source sessions for streams and lookups, sink connections for
//! upserts. Tasks run on the tokio runtime and never block shutdown.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::BackfillConfig;
use crate::error::{BackfillError, Result};

/// Semaphores bounding each copy stage.
#[derive(Debug, Clone)]
pub struct WorkerPools {
    stream: Arc<Semaphore>,
    lookup: Arc<Semaphore>,
    sink: Arc<Semaphore>,
}

impl WorkerPools {
    pub fn new(stream_workers: usize, lookup_workers: usize, sink_workers: usize) -> Self {
        Self {
            stream: Arc::new(Semaphore::new(stream_workers.max(1))),
            lookup: Arc::new(Semaphore::new(lookup_workers.max(1))),
            sink: Arc::new(Semaphore::new(sink_workers.max(1))),
        }
    }

    pub fn from_config(config: &BackfillConfig) -> Self {
        Self::new(
            config.get_stream_workers(),
            config.get_lookup_workers(),
            config.get_sink_workers(),
        )
    }

    /// Permit to run one id stream. Waiters are served in FIFO order.
    pub async fn stream_permit(&self) -> Result<OwnedSemaphorePermit> {
        acquire(&self.stream, "stream").await
    }

    pub async fn lookup_permit(&self) -> Result<OwnedSemaphorePermit> {
        acquire(&self.lookup, "lookup").await
    }

    pub async fn sink_permit(&self) -> Result<OwnedSemaphorePermit> {
        acquire(&self.sink, "sink").await
    }

    /// Free permits per pool as `(stream, lookup, sink)`.
    pub fn available(&self) -> (usize, usize, usize) {
        (
            self.stream.available_permits(),
            self.lookup.available_permits(),
            self.sink.available_permits(),
        )
    }
}

async fn acquire(pool: &Arc<Semaphore>, name: &str) -> Result<OwnedSemaphorePermit> {
    pool.clone()
        .acquire_owned()
        .await
        .map_err(|_| BackfillError::Task(format!("{} pool is closed", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permits_are_bounded() {
        let pools = WorkerPools::new(1, 2, 3);
        let held = pools.stream_permit().await.unwrap();
        assert_eq!(pools.available(), (0, 2, 3));

        let waiting = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            pools.stream_permit(),
        )
        .await;
        assert!(waiting.is_err(), "second stream permit should wait");

        drop(held);
        assert_eq!(pools.available(), (1, 2, 3));
    }

    #[test]
    fn test_zero_sizes_are_raised() {
        let pools = WorkerPools::new(0, 0, 0);
        assert_eq!(pools.available(), (1, 1, 1));
    }
}
