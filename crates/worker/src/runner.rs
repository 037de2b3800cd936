//! Claim loop: pulls invocations off the durable queue and hands them to
//! the task processor, at most `concurrency` at a time.
//!
//! Each claimed entry is completed once its invocation returns, whatever
//! the task outcome. Redelivered or withdrawn invocations are harmless
//! because the executor only starts tasks that are still `QUEUED`.
//!
//! A claim is held as a lease, renewed while the invocation runs. With
//! [`Maintenance`] configured the runtime also sweeps the shared queue:
//! claims of dead workers are released and their tasks recovered, and old
//! completed entries are pruned.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quantimage_core::types::DbId;
use quantimage_pipeline::pg_queue::{ClaimedInvocation, PgQueue};
use quantimage_pipeline::processor::TaskProcessor;
use quantimage_pipeline::{JobDispatcher, QueueError};
use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Lease used when no [`Maintenance`] is configured.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

/// Queue side of the worker: claim an entry, hold its lease, mark it done.
#[async_trait]
pub trait ClaimQueue: Send + Sync {
    async fn claim_next(&self, worker_name: &str) -> Result<Option<ClaimedInvocation>, QueueError>;

    async fn complete(&self, entry_id: DbId) -> Result<(), QueueError>;

    /// Extend the lease on a claim. `false` if the claim was released.
    async fn renew(&self, entry_id: DbId, worker_name: &str) -> Result<bool, QueueError>;

    /// Close claims not renewed within `lease` and return them.
    async fn release_stale(&self, lease: Duration) -> Result<Vec<ClaimedInvocation>, QueueError>;

    /// Delete entries completed more than `retention` ago.
    async fn prune_completed(&self, retention: Duration) -> Result<u64, QueueError>;
}

#[async_trait]
impl ClaimQueue for PgQueue {
    async fn claim_next(&self, worker_name: &str) -> Result<Option<ClaimedInvocation>, QueueError> {
        PgQueue::claim_next(self, worker_name).await
    }

    async fn complete(&self, entry_id: DbId) -> Result<(), QueueError> {
        PgQueue::complete(self, entry_id).await
    }

    async fn renew(&self, entry_id: DbId, worker_name: &str) -> Result<bool, QueueError> {
        PgQueue::renew(self, entry_id, worker_name).await
    }

    async fn release_stale(&self, lease: Duration) -> Result<Vec<ClaimedInvocation>, QueueError> {
        PgQueue::release_stale(self, lease).await
    }

    async fn prune_completed(&self, retention: Duration) -> Result<u64, QueueError> {
        PgQueue::prune_completed(self, retention).await
    }
}

/// Housekeeping of the shared queue.
#[derive(Clone)]
pub struct Maintenance {
    /// Recovers the tasks of released claims.
    pub dispatcher: Arc<JobDispatcher>,
    /// Claims not renewed for this long belong to dead workers.
    pub lease: Duration,
    /// Completed entries are kept this long.
    pub retention: Duration,
    /// Time between sweeps; the first runs at startup.
    pub interval: Duration,
}

pub struct WorkerRuntime {
    queue: Arc<dyn ClaimQueue>,
    processor: Arc<TaskProcessor>,
    worker_name: String,
    concurrency: usize,
    poll_interval: Duration,
    lease: Duration,
    maintenance: Option<Maintenance>,
}

impl WorkerRuntime {
    pub fn new(
        queue: Arc<dyn ClaimQueue>,
        processor: Arc<TaskProcessor>,
        worker_name: impl Into<String>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            processor,
            worker_name: worker_name.into(),
            concurrency: concurrency.max(1),
            poll_interval,
            lease: DEFAULT_LEASE,
            maintenance: None,
        }
    }

    /// Sweep the queue periodically, renewing claims within its lease.
    pub fn with_maintenance(mut self, maintenance: Maintenance) -> Self {
        self.lease = maintenance.lease;
        self.maintenance = Some(maintenance);
        self
    }

    /// Run until `cancel` fires, then wait for in-flight invocations.
    pub async fn run(self, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let tracker = TaskTracker::new();

        tracing::info!(
            worker = %self.worker_name,
            concurrency = self.concurrency,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Worker claim loop started",
        );

        if let Some(maintenance) = self.maintenance.clone() {
            tracker.spawn(Self::maintain(
                Arc::clone(&self.queue),
                maintenance,
                cancel.clone(),
            ));
        }
        // Renew well before the lease runs out.
        let renew_every = (self.lease / 3).max(Duration::from_millis(10));

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let claimed = match self.queue.claim_next(&self.worker_name).await {
                Ok(Some(claimed)) => claimed,
                Ok(None) => {
                    drop(permit);
                    if self.idle(&cancel).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::error!(worker = %self.worker_name, error = %e, "Failed to claim work");
                    drop(permit);
                    if self.idle(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            tracing::debug!(
                entry_id = claimed.entry_id,
                task_id = claimed.invocation.task_id,
                "Claimed invocation",
            );

            let queue = Arc::clone(&self.queue);
            let processor = Arc::clone(&self.processor);
            let worker_name = self.worker_name.clone();
            tracker.spawn(async move {
                let task_id = claimed.invocation.task_id;
                let run = processor.process(task_id);
                tokio::pin!(run);
                let mut renewal = tokio::time::interval_at(Instant::now() + renew_every, renew_every);
                loop {
                    tokio::select! {
                        _ = &mut run => break,
                        _ = renewal.tick() => {
                            match queue.renew(claimed.entry_id, &worker_name).await {
                                Ok(true) => {}
                                Ok(false) => tracing::warn!(
                                    entry_id = claimed.entry_id,
                                    task_id,
                                    "Queue claim was released while the task ran",
                                ),
                                Err(e) => tracing::warn!(
                                    entry_id = claimed.entry_id,
                                    task_id,
                                    error = %e,
                                    "Failed to renew queue claim",
                                ),
                            }
                        }
                    }
                }
                if let Err(e) = queue.complete(claimed.entry_id).await {
                    tracing::warn!(
                        entry_id = claimed.entry_id,
                        task_id,
                        error = %e,
                        "Failed to complete queue entry",
                    );
                }
                drop(permit);
            });
        }

        tracing::info!(worker = %self.worker_name, "Worker claim loop stopping");
        tracker.close();
        tracker.wait().await;
        tracing::info!(worker = %self.worker_name, "In-flight tasks drained");
    }

    async fn maintain(
        queue: Arc<dyn ClaimQueue>,
        maintenance: Maintenance,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(maintenance.interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => sweep(queue.as_ref(), &maintenance).await,
            }
        }
    }

    /// Sleep one poll interval. Returns `true` if cancelled meanwhile.
    async fn idle(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.poll_interval) => false,
        }
    }
}

/// One housekeeping pass over the shared queue.
pub async fn sweep(queue: &dyn ClaimQueue, maintenance: &Maintenance) {
    match queue.release_stale(maintenance.lease).await {
        Ok(stale) => {
            for claimed in stale {
                let task_id = claimed.invocation.task_id;
                tracing::warn!(entry_id = claimed.entry_id, task_id, "Released expired queue claim");
                if let Err(e) = maintenance.dispatcher.recover_task(task_id).await {
                    tracing::error!(task_id, error = %e, "Failed to recover task");
                }
            }
        }
        Err(e) => tracing::error!(error = %e, "Failed to release expired queue claims"),
    }

    match queue.prune_completed(maintenance.retention).await {
        Ok(0) => {}
        Ok(pruned) => tracing::info!(pruned, "Pruned completed queue entries"),
        Err(e) => tracing::error!(error = %e, "Failed to prune completed queue entries"),
    }
}
