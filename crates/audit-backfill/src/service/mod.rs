//! Queue-driven entry point for tenant backfills.
//!
//! [`MigrationQueueService::enqueue`] validates a tenant, adds its routing
//! key to the distributed queue and wakes the drain lane. The lane is a
//! single task per process that pops one tenant at a time and runs its
//! [`TenantMigrationJob`](crate::orchestrator::TenantMigrationJob) to
//! completion before popping the next. Scaling out means running more
//! processes against the same queue; the atomic pop keeps them from
//! claiming the same tenant.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{BackfillConfig, Config};
use crate::core::{
    RequeueOutcome, Requeuer, TenantDescriptor, TenantDirectory, TenantQueue,
};
use crate::error::{BackfillError, Result};
use crate::orchestrator::{MigrationEngine, TenantRunReport};
use crate::sink::ObjectStoreSink;
use crate::source::MysqlConnector;

/// Tenants listed in the configuration file.
#[derive(Debug, Default, Clone)]
pub struct StaticTenantDirectory {
    tenants: HashMap<String, TenantDescriptor>,
}

impl StaticTenantDirectory {
    pub fn new(tenants: impl IntoIterator<Item = TenantDescriptor>) -> Self {
        Self {
            tenants: tenants.into_iter().map(|t| (t.org.clone(), t)).collect(),
        }
    }
}

#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn find(&self, org: &str) -> Result<Option<TenantDescriptor>> {
        Ok(self.tenants.get(org).cloned())
    }
}

/// Re-queues incomplete tenants with a capped, exponentially growing delay.
pub struct QueueRequeuer {
    queue: Arc<dyn TenantQueue>,
    backoff: BackfillConfig,
    wake: Option<mpsc::Sender<()>>,
    delayed: TaskTracker,
}

impl QueueRequeuer {
    pub fn new(queue: Arc<dyn TenantQueue>, config: &BackfillConfig) -> Self {
        Self {
            queue,
            backoff: config.clone(),
            wake: None,
            delayed: TaskTracker::new(),
        }
    }

    /// Nudge a drain lane after each delayed re-add.
    pub fn with_wake(mut self, wake: mpsc::Sender<()>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Re-adds still waiting out their backoff.
    pub fn scheduled(&self) -> usize {
        self.delayed.len()
    }

    /// Wait until every delayed re-add has reached the queue.
    pub async fn flush(&self) {
        self.delayed.close();
        self.delayed.wait().await;
        self.delayed.reopen();
    }
}

#[async_trait]
impl Requeuer for QueueRequeuer {
    async fn requeue(&self, tenant: &TenantDescriptor) -> Result<RequeueOutcome> {
        let key = tenant.org.as_str();
        let attempt = self.queue.record_attempt(key).await?;
        if attempt > self.backoff.max_requeue_attempts {
            self.queue.clear_attempts(key).await?;
            return Ok(RequeueOutcome::GaveUp {
                attempts: attempt - 1,
            });
        }

        let delay = self.backoff.requeue_delay(attempt);
        if delay.is_zero() {
            self.queue.add(key).await?;
            if let Some(wake) = &self.wake {
                let _ = wake.try_send(());
            }
        } else {
            let queue = self.queue.clone();
            let wake = self.wake.clone();
            let key = key.to_string();
            self.delayed.spawn(
                async move {
                    tokio::time::sleep(delay).await;
                    match queue.add(&key).await {
                        Ok(_) => {
                            if let Some(wake) = wake {
                                let _ = wake.try_send(());
                            }
                        }
                        Err(e) => error!(
                            "Failed to re-queue {} after backoff, retry opportunity lost: {}",
                            key, e
                        ),
                    }
                }
                .in_current_span(),
            );
        }

        Ok(RequeueOutcome::Scheduled {
            attempt,
            delay_secs: delay.as_secs(),
        })
    }

    async fn reset(&self, tenant: &TenantDescriptor) -> Result<()> {
        self.queue.clear_attempts(&tenant.org).await
    }
}

/// Counts from one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainSummary {
    /// Tenants popped and run.
    pub popped: u64,
    /// Runs that completed successfully.
    pub completed: u64,
    /// Runs that finished incomplete.
    pub incomplete: u64,
    /// Runs that failed outright.
    pub failed: u64,
    /// Entries that did not resolve to a tenant.
    pub skipped: u64,
}

struct ServiceInner {
    queue: Arc<dyn TenantQueue>,
    directory: Arc<dyn TenantDirectory>,
    engine: MigrationEngine,
    requeuer: Arc<QueueRequeuer>,
    /// Tenants enqueued through this process, consulted before the directory.
    registered: Mutex<HashMap<String, TenantDescriptor>>,
    lane: tokio::sync::Mutex<()>,
    wake: mpsc::Sender<()>,
}

/// Admits tenants to the distributed queue and drains it on one lane.
#[derive(Clone)]
pub struct MigrationQueueService {
    inner: Arc<ServiceInner>,
}

impl MigrationQueueService {
    /// Create the service and start its drain lane.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        queue: Arc<dyn TenantQueue>,
        directory: Arc<dyn TenantDirectory>,
        engine: MigrationEngine,
    ) -> Self {
        let (service, wake_rx) = Self::build(queue, directory, engine);
        tokio::spawn(drain_lane(Arc::downgrade(&service.inner), wake_rx));
        service
    }

    /// Create the service without a drain lane.
    ///
    /// Re-queued tenants stay in the queue for other processes; nothing is
    /// popped unless [`drain`](Self::drain) is called.
    pub fn without_lane(
        queue: Arc<dyn TenantQueue>,
        directory: Arc<dyn TenantDirectory>,
        engine: MigrationEngine,
    ) -> Self {
        Self::build(queue, directory, engine).0
    }

    fn build(
        queue: Arc<dyn TenantQueue>,
        directory: Arc<dyn TenantDirectory>,
        engine: MigrationEngine,
    ) -> (Self, mpsc::Receiver<()>) {
        let (wake, wake_rx) = mpsc::channel(1);
        let requeuer =
            Arc::new(QueueRequeuer::new(queue.clone(), engine.config()).with_wake(wake.clone()));

        let inner = Arc::new(ServiceInner {
            queue,
            directory,
            engine,
            requeuer,
            registered: Mutex::new(HashMap::new()),
            lane: tokio::sync::Mutex::new(()),
            wake,
        });
        (Self { inner }, wake_rx)
    }

    /// Wire MySQL, the object store and the queue from configuration.
    pub async fn from_config(config: &Config, cancel: CancellationToken) -> Result<Self> {
        let (queue, directory, engine) = wire(config, cancel).await?;
        Ok(Self::new(queue, directory, engine))
    }

    /// Like [`from_config`](Self::from_config), for one-shot runs that must
    /// not claim tenants from the queue.
    pub async fn from_config_without_lane(config: &Config, cancel: CancellationToken) -> Result<Self> {
        let (queue, directory, engine) = wire(config, cancel).await?;
        Ok(Self::without_lane(queue, directory, engine))
    }

    /// Queue a tenant for backfill and make sure the lane is draining.
    ///
    /// Returns `false` if the tenant was already queued.
    pub async fn enqueue(&self, tenant: &TenantDescriptor) -> Result<bool> {
        if let Err(e) = tenant.validate() {
            warn!(
                "Rejecting backfill request for {}: {}",
                tenant.redacted_json(),
                e
            );
            return Err(e);
        }

        self.inner
            .registered
            .lock()
            .map_err(|_| BackfillError::Task("tenant registry poisoned".into()))?
            .insert(tenant.org.clone(), tenant.clone());

        let added = self.inner.queue.add(&tenant.org).await?;
        if added {
            info!("{}: queued for backfill", tenant);
        } else {
            info!("{}: already queued for backfill", tenant);
        }
        self.wake();
        Ok(added)
    }

    /// Ask the lane to run a drain pass.
    pub fn wake(&self) {
        // a full channel means a pass is already pending
        let _ = self.inner.wake.try_send(());
    }

    /// Drain the queue on the calling task until it is empty.
    ///
    /// Shares the lane lock with the background lane, so passes never overlap.
    pub async fn drain(&self) -> DrainSummary {
        self.inner.drain_pass().await
    }

    /// Run one tenant on the calling task, re-queueing it if incomplete.
    pub async fn run_tenant(&self, tenant: TenantDescriptor) -> Result<TenantRunReport> {
        let span = info_span!("tenant", org = %tenant.org, pod = %tenant.pod);
        self.inner
            .engine
            .job(tenant, Some(self.inner.requeuer()))
            .run()
            .instrument(span)
            .await
    }

    /// Tenants waiting in the queue.
    pub async fn pending(&self) -> Result<u64> {
        self.inner.queue.len().await
    }

    /// Re-adds still waiting out their backoff.
    pub fn scheduled_requeues(&self) -> usize {
        self.inner.requeuer.scheduled()
    }

    /// Wait for every delayed re-add to reach the queue.
    pub async fn flush_requeues(&self) {
        self.inner.requeuer.flush().await;
    }

    pub fn engine(&self) -> &MigrationEngine {
        &self.inner.engine
    }
}

async fn wire(
    config: &Config,
    cancel: CancellationToken,
) -> Result<(Arc<dyn TenantQueue>, Arc<dyn TenantDirectory>, MigrationEngine)> {
    let queue = crate::queue::from_config(&config.queue).await?;
    let sink = Arc::new(ObjectStoreSink::from_config(&config.sink)?);
    let connector = Arc::new(MysqlConnector::new(config.source.clone(), &config.backfill));
    let directory: Arc<dyn TenantDirectory> =
        Arc::new(StaticTenantDirectory::new(config.tenants.clone()));
    let engine =
        MigrationEngine::new(connector, sink, config.backfill.clone()).with_cancellation(cancel);

    info!(
        "Backfill service ready (queue: {}, sink: {}, {} known tenants)",
        queue.queue_type(),
        config.sink.r#type,
        config.tenants.len()
    );
    Ok((queue, directory, engine))
}

async fn drain_lane(inner: Weak<ServiceInner>, mut wake: mpsc::Receiver<()>) {
    while wake.recv().await.is_some() {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.drain_pass().await;
    }
    debug!("Drain lane stopped");
}

impl ServiceInner {
    fn requeuer(&self) -> Arc<dyn Requeuer> {
        self.requeuer.clone()
    }

    async fn drain_pass(&self) -> DrainSummary {
        let _lane = self.lane.lock().await;
        let mut summary = DrainSummary::default();

        loop {
            if self.engine.cancellation().is_cancelled() {
                info!("Cancellation requested, drain lane stopping");
                break;
            }

            let entry = match self.queue.pop_any().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to pop from tenant queue: {}", e);
                    break;
                }
            };

            let Some(tenant) = self.resolve(&entry).await else {
                summary.skipped += 1;
                continue;
            };
            summary.popped += 1;

            let span = info_span!("tenant", org = %tenant.org, pod = %tenant.pod);
            let job = self.engine.job(tenant.clone(), Some(self.requeuer()));
            match tokio::spawn(async move { job.run().await }.instrument(span)).await {
                Ok(Ok(report)) if report.complete => summary.completed += 1,
                Ok(Ok(_)) => summary.incomplete += 1,
                Ok(Err(e)) => {
                    summary.failed += 1;
                    error!(
                        "Failure processing backfill, redacted tenant: {}: {}",
                        tenant.redacted_json(),
                        e
                    );
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(
                        "Backfill task aborted, redacted tenant: {}: {}",
                        tenant.redacted_json(),
                        e
                    );
                }
            }
        }

        if summary.popped > 0 || summary.skipped > 0 {
            info!(
                "Drain pass finished: {} tenants ({} complete, {} incomplete, {} failed, {} skipped)",
                summary.popped, summary.completed, summary.incomplete, summary.failed, summary.skipped
            );
        }
        summary
    }

    /// Turn a queue entry back into a tenant.
    ///
    /// Entries are org names; JSON objects are accepted as full descriptors.
    async fn resolve(&self, entry: &str) -> Option<TenantDescriptor> {
        if entry.trim_start().starts_with('{') {
            return match serde_json::from_str::<TenantDescriptor>(entry) {
                Ok(tenant) => {
                    if let Ok(mut registered) = self.registered.lock() {
                        registered.insert(tenant.org.clone(), tenant.clone());
                    }
                    Some(tenant)
                }
                Err(e) => {
                    warn!("Skipping unreadable queue entry: {}", e);
                    None
                }
            };
        }

        let known = self
            .registered
            .lock()
            .ok()
            .and_then(|registered| registered.get(entry).cloned());
        if known.is_some() {
            return known;
        }

        match self.directory.find(entry).await {
            Ok(Some(tenant)) => Some(tenant),
            Ok(None) => {
                warn!("No tenant found for queued org '{}', skipping", entry);
                None
            }
            Err(e) => {
                error!("Tenant lookup for '{}' failed: {}", entry, e);
                None
            }
        }
    }
}
