//! Completion barrier for one copy window.
//!
//! The barrier starts at the window's expected record count and must reach
//! zero before the window is resolved. Each dispatched record id carries a
//! [`CompletionToken`]; dropping the token releases exactly one count, so a
//! task that fails or panics still clears its share of the barrier.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::stats::{RecordOutcome, RunStatistics};

/// Countdown latch with an async wait.
#[derive(Debug)]
pub struct CompletionBarrier {
    remaining: AtomicU64,
    cleared: Notify,
}

impl CompletionBarrier {
    pub fn new(count: u64) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicU64::new(count),
            cleared: Notify::new(),
        })
    }

    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Raise the count for work discovered after the barrier was sized.
    pub fn extend(&self, n: u64) {
        self.remaining.fetch_add(n, Ordering::AcqRel);
    }

    /// Lower the count, saturating at zero.
    pub fn release(&self, n: u64) {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| Some(r.saturating_sub(n)))
            .unwrap_or(0);
        if previous <= n {
            self.cleared.notify_waiters();
        }
    }

    /// Wait until the count reaches zero.
    pub async fn wait(&self) {
        loop {
            let notified = self.cleared.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// One unit of barrier count, tied to one record id.
///
/// Resolving the token records the outcome before releasing the barrier.
/// A token dropped without being resolved is counted as an exception.
#[derive(Debug)]
pub struct CompletionToken {
    barrier: Arc<CompletionBarrier>,
    stats: Arc<RunStatistics>,
    resolved: bool,
}

impl CompletionToken {
    pub fn new(barrier: Arc<CompletionBarrier>, stats: Arc<RunStatistics>) -> Self {
        Self {
            barrier,
            stats,
            resolved: false,
        }
    }

    /// Record the outcome and release the barrier.
    pub fn resolve(mut self, outcome: RecordOutcome) {
        self.stats.record(outcome);
        self.resolved = true;
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        if !self.resolved {
            self.stats.record(RecordOutcome::Exception);
        }
        self.barrier.release(1);
    }
}
