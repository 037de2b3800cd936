//! Work queue port and the in-process worker pool.
//!
//! The dispatcher records a token on the task before submitting, so an
//! executor picking the invocation up immediately always finds the task
//! `QUEUED`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use quantimage_core::types::DbId;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::processor::TaskProcessor;

/// One executor invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInvocation {
    pub task_id: DbId,
    /// External job token, also recorded on the task.
    pub token: String,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Work queue is shut down")]
    Closed,

    #[error("Work queue rejected the task: {0}")]
    Rejected(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to encode invocation: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn submit(&self, invocation: TaskInvocation) -> Result<(), QueueError>;

    /// Best-effort removal of not-yet-started invocations of a task.
    /// Returns `true` if something was removed.
    async fn withdraw(&self, task_id: DbId) -> Result<bool, QueueError>;

    /// Whether the queue still holds an unfinished invocation of a task.
    /// A `QUEUED` task without one will never run unless resubmitted.
    async fn is_pending(&self, task_id: DbId) -> Result<bool, QueueError>;
}

// ---------------------------------------------------------------------------
// LocalQueue
// ---------------------------------------------------------------------------

/// In-process queue: an mpsc channel drained by a pool of tokio tasks,
/// bounded by a semaphore.
///
/// Nothing survives the process. Invocations still in the channel at
/// shutdown are dropped; the dispatcher resubmits their tasks on reuse or
/// through recovery at the next start.
pub struct LocalQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<TaskInvocation>>>,
    /// Tasks submitted whose invocation has not returned yet.
    pending: Arc<Mutex<HashSet<DbId>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl LocalQueue {
    /// Start the pool. At most `concurrency` invocations run at once.
    pub fn start(processor: Arc<TaskProcessor>, concurrency: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(HashSet::new()));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(Self::run(
            processor,
            receiver,
            Arc::new(Semaphore::new(concurrency.max(1))),
            Arc::clone(&pending),
            tracker.clone(),
            cancel.clone(),
        ));

        tracing::info!(concurrency, "Local worker pool started");

        Self {
            sender: Mutex::new(Some(sender)),
            pending,
            cancel,
            tracker,
        }
    }

    async fn run(
        processor: Arc<TaskProcessor>,
        mut receiver: mpsc::UnboundedReceiver<TaskInvocation>,
        permits: Arc<Semaphore>,
        pending: Arc<Mutex<HashSet<DbId>>>,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) {
        loop {
            let invocation = tokio::select! {
                _ = cancel.cancelled() => break,
                received = receiver.recv() => match received {
                    Some(invocation) => invocation,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let processor = Arc::clone(&processor);
            let pending = Arc::clone(&pending);
            tracker.spawn(async move {
                processor.process(invocation.task_id).await;
                pending.lock().await.remove(&invocation.task_id);
                drop(permit);
            });
        }
        tracing::info!("Local worker pool stopped accepting work");
    }

    /// Stop accepting work and wait for running invocations to finish.
    /// Invocations still waiting in the channel are dropped; their tasks
    /// stay `QUEUED` until resubmitted.
    pub async fn shutdown(&self) {
        self.sender.lock().await.take();
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            tracing::warn!(dropped = pending.len(), "Local worker pool dropped queued invocations");
            pending.clear();
        }
    }
}

#[async_trait]
impl WorkQueue for LocalQueue {
    async fn submit(&self, invocation: TaskInvocation) -> Result<(), QueueError> {
        let guard = self.sender.lock().await;
        let sender = guard.as_ref().ok_or(QueueError::Closed)?;
        let task_id = invocation.task_id;
        // Recorded first: the pool may finish the invocation before `send`
        // returns.
        self.pending.lock().await.insert(task_id);
        if sender.send(invocation).is_err() {
            self.pending.lock().await.remove(&task_id);
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    /// Channel entries cannot be removed; the executor's start guard turns
    /// withdrawn invocations into no-ops instead.
    async fn withdraw(&self, _task_id: DbId) -> Result<bool, QueueError> {
        Ok(false)
    }

    async fn is_pending(&self, task_id: DbId) -> Result<bool, QueueError> {
        Ok(self.pending.lock().await.contains(&task_id))
    }
}
