//! In-process tenant queue.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;

use crate::core::TenantQueue;
use crate::error::Result;

#[derive(Debug, Default)]
struct QueueState {
    members: BTreeSet<String>,
    attempts: HashMap<String, u32>,
}

/// Set-backed queue living in this process only.
///
/// Members pop in sorted order, which keeps tests deterministic.
#[derive(Debug, Default)]
pub struct MemoryTenantQueue {
    state: Mutex<QueueState>,
}

impl MemoryTenantQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.state.lock().await.members.contains(key)
    }

    pub async fn attempts(&self, key: &str) -> u32 {
        self.state.lock().await.attempts.get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl TenantQueue for MemoryTenantQueue {
    async fn add(&self, key: &str) -> Result<bool> {
        Ok(self.state.lock().await.members.insert(key.to_string()))
    }

    async fn pop_any(&self) -> Result<Option<String>> {
        Ok(self.state.lock().await.members.pop_first())
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.state.lock().await.members.len() as u64)
    }

    async fn record_attempt(&self, key: &str) -> Result<u32> {
        let mut state = self.state.lock().await;
        let attempts = state.attempts.entry(key.to_string()).or_insert(0);
        *attempts += 1;
        Ok(*attempts)
    }

    async fn clear_attempts(&self, key: &str) -> Result<()> {
        self.state.lock().await.attempts.remove(key);
        Ok(())
    }

    fn queue_type(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_deduplicates() {
        let queue = MemoryTenantQueue::new();
        assert!(queue.add("acme").await.unwrap());
        assert!(!queue.add("acme").await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pop_removes_member() {
        let queue = MemoryTenantQueue::new();
        queue.add("globex").await.unwrap();
        queue.add("acme").await.unwrap();

        assert_eq!(queue.pop_any().await.unwrap().as_deref(), Some("acme"));
        assert!(!queue.contains("acme").await);
        assert_eq!(queue.pop_any().await.unwrap().as_deref(), Some("globex"));
        assert_eq!(queue.pop_any().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_attempts_count_and_clear() {
        let queue = MemoryTenantQueue::new();
        assert_eq!(queue.record_attempt("acme").await.unwrap(), 1);
        assert_eq!(queue.record_attempt("acme").await.unwrap(), 2);
        queue.clear_attempts("acme").await.unwrap();
        assert_eq!(queue.attempts("acme").await, 0);
    }
}
