//! Job dispatcher: turns an extraction request into a job with one task
//! per study and submits every task to the work queue. Also hosts job
//! cancellation, which runs in the same request tier.

use std::collections::HashSet;
use std::sync::Arc;

use quantimage_core::error::CoreError;
use quantimage_core::extraction::{
    Extraction, ExtractionScope, ExtractionTask, FeatureConfig, ReusePolicy, TaskError,
    TaskErrorKind,
};
use quantimage_core::job_events::ExtractionEvent;
use quantimage_core::status::TaskStatus;
use quantimage_core::types::DbId;
use quantimage_db::models::task::TaskTransition;
use quantimage_events::{publish_or_log, EventPublisher};

use crate::catalog::{Catalog, CatalogError};
use crate::finalize::Finalizer;
use crate::queue::{QueueError, TaskInvocation, WorkQueue};
use crate::store::{ExtractionStore, NewExtraction, StoreError, TaskStateStore};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The scope could not be turned into a non-empty list of studies.
#[derive(Debug, thiserror::Error)]
pub enum ScopeResolutionError {
    #[error("Failed to resolve album '{album_id}'")]
    Catalog {
        album_id: String,
        #[source]
        source: CatalogError,
    },

    #[error("{0} contains no studies")]
    Empty(String),
}

/// Submission of a single task failed. The task is marked
/// `FAILED/SUBMISSION`; siblings are unaffected.
#[derive(Debug, thiserror::Error)]
#[error("Failed to submit task {task_id}")]
pub struct DispatchError {
    pub task_id: DbId,
    #[source]
    pub source: QueueError,
}

/// Job creation failed; nothing was created.
#[derive(Debug, thiserror::Error)]
pub enum CreateJobError {
    #[error(transparent)]
    Invalid(#[from] CoreError),

    #[error(transparent)]
    Scope(#[from] ScopeResolutionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Request / outcome types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub owner: String,
    pub scope: ExtractionScope,
    pub config: FeatureConfig,
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub extraction: Extraction,
    /// Task records as they stand after submission.
    pub tasks: Vec<ExtractionTask>,
    /// `true` when an in-flight extraction was returned instead.
    pub reused: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CancelOutcome {
    /// Tasks moved straight to `FAILED/CANCELLED`.
    pub cancelled: usize,
    /// Running tasks whose cancellation flag was raised.
    pub signalled: usize,
    /// Tasks that were already terminal.
    pub untouched: usize,
}

/// What a recovery pass did with tasks left behind by a dead executor or
/// a work queue that lost its entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RecoveryOutcome {
    /// Tasks handed to the work queue again.
    pub resubmitted: usize,
    /// Interrupted `RUNNING` tasks failed with kind `INTERNAL`, plus
    /// resubmissions the queue refused.
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct JobDispatcher {
    extractions: Arc<dyn ExtractionStore>,
    states: Arc<dyn TaskStateStore>,
    queue: Arc<dyn WorkQueue>,
    catalog: Arc<dyn Catalog>,
    publisher: Arc<dyn EventPublisher>,
    finalizer: Arc<Finalizer>,
    policy: ReusePolicy,
}

impl JobDispatcher {
    pub fn new(
        extractions: Arc<dyn ExtractionStore>,
        states: Arc<dyn TaskStateStore>,
        queue: Arc<dyn WorkQueue>,
        catalog: Arc<dyn Catalog>,
        publisher: Arc<dyn EventPublisher>,
        finalizer: Arc<Finalizer>,
        policy: ReusePolicy,
    ) -> Self {
        Self {
            extractions,
            states,
            queue,
            catalog,
            publisher,
            finalizer,
            policy,
        }
    }

    pub fn policy(&self) -> ReusePolicy {
        self.policy
    }

    /// Create (or reuse) an extraction and submit its tasks.
    ///
    /// Never waits for executors.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutcome, CreateJobError> {
        request.scope.validate()?;
        request.config.validate()?;

        if self.policy == ReusePolicy::ReuseActive {
            if let Some(existing) = self
                .extractions
                .find_active(&request.owner, &request.scope, &request.config)
                .await?
            {
                tracing::info!(
                    job_id = existing.id,
                    owner = %request.owner,
                    "Reusing in-flight extraction",
                );
                let tasks = self.extractions.list_tasks(existing.id).await?;
                self.submit_all(&existing, tasks).await?;
                let tasks = self.extractions.list_tasks(existing.id).await?;
                return Ok(DispatchOutcome {
                    extraction: existing,
                    tasks,
                    reused: true,
                });
            }
        }

        let study_uids = self.resolve_scope(&request.scope, &request.owner).await?;

        let (extraction, tasks) = self
            .extractions
            .create_with_tasks(NewExtraction {
                owner: request.owner,
                scope: request.scope,
                config: request.config,
                study_uids,
            })
            .await?;

        tracing::info!(
            job_id = extraction.id,
            owner = %extraction.owner,
            scope = extraction.scope.kind(),
            task_count = tasks.len(),
            "Extraction created",
        );

        self.submit_all(&extraction, tasks).await?;
        let tasks = self.extractions.list_tasks(extraction.id).await?;

        Ok(DispatchOutcome {
            extraction,
            tasks,
            reused: false,
        })
    }

    /// Expand a scope to its de-duplicated list of study UIDs.
    async fn resolve_scope(
        &self,
        scope: &ExtractionScope,
        owner: &str,
    ) -> Result<Vec<String>, ScopeResolutionError> {
        let studies = match scope {
            ExtractionScope::Study { study_uid } => vec![study_uid.clone()],
            ExtractionScope::Album { album_id } => self
                .catalog
                .resolve_album(album_id, owner)
                .await
                .map_err(|source| ScopeResolutionError::Catalog {
                    album_id: album_id.clone(),
                    source,
                })?,
        };

        let mut seen = HashSet::new();
        let studies: Vec<String> = studies
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .filter(|s| seen.insert(s.clone()))
            .collect();

        if studies.is_empty() {
            return Err(ScopeResolutionError::Empty(format!(
                "{} '{}'",
                scope.kind(),
                scope.reference()
            )));
        }
        Ok(studies)
    }

    /// Submit every `CREATED` task of `extraction`, and every `QUEUED` one
    /// the work queue no longer holds.
    async fn submit_all(
        &self,
        extraction: &Extraction,
        tasks: Vec<ExtractionTask>,
    ) -> Result<(), StoreError> {
        for task in tasks {
            let result = match task.state.status {
                TaskStatus::Created => self.submit(extraction.id, task.id).await,
                TaskStatus::Queued => self.resume_queued(extraction.id, &task).await.map(|_| ()),
                _ => continue,
            };
            match result {
                Ok(()) => {}
                Err(SubmitError::Dispatch(e)) => tracing::error!(
                    job_id = extraction.id,
                    task_id = task.id,
                    error = %e.source,
                    "Task submission failed",
                ),
                Err(SubmitError::Store(e)) => return Err(e),
            }
        }
        Ok(())
    }

    /// Submit one `CREATED` task. A queue failure is recorded on the task
    /// and returned as a [`DispatchError`] for logging; store failures are
    /// returned as-is.
    async fn submit(&self, job_id: DbId, task_id: DbId) -> Result<(), SubmitError> {
        // Re-read: the task may have been cancelled during fan-out.
        match self.states.get(task_id).await? {
            Some(state) if state.status == TaskStatus::Created => {}
            _ => return Ok(()),
        }

        // The token is recorded before the queue sees the invocation, so an
        // executor picking it up at once finds the task QUEUED.
        let token = new_token();
        let Some(queued) = self.states.mark_queued(task_id, &token).await? else {
            return Ok(());
        };
        publish_or_log(
            self.publisher.as_ref(),
            ExtractionEvent::task(task_id, job_id, &queued),
        )
        .await;

        self.enqueue(job_id, task_id, token).await
    }

    /// Resubmit a `QUEUED` task unless the work queue still holds an
    /// invocation for it. Returns `true` if it was resubmitted.
    async fn resume_queued(&self, job_id: DbId, task: &ExtractionTask) -> Result<bool, SubmitError> {
        match self.queue.is_pending(task.id).await {
            Ok(true) => return Ok(false),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(task_id = task.id, error = %e, "Could not inspect the work queue");
                return Ok(false);
            }
        }

        tracing::info!(job_id, task_id = task.id, "Resubmitting queued task lost by the work queue");
        let token = task.external_job_token.clone().unwrap_or_else(new_token);
        self.enqueue(job_id, task.id, token).await?;
        Ok(true)
    }

    /// Hand a `QUEUED` task to the work queue. If the queue refuses it the
    /// task fails with kind `SUBMISSION` and its token is released.
    async fn enqueue(&self, job_id: DbId, task_id: DbId, token: String) -> Result<(), SubmitError> {
        let invocation = TaskInvocation { task_id, token };
        let Err(source) = self.queue.submit(invocation).await else {
            return Ok(());
        };
        let err = DispatchError { task_id, source };

        let failure = TaskError::capture(TaskErrorKind::Submission, "DispatchError", &err);
        if let Some(state) = self
            .states
            .transition(task_id, &[TaskStatus::Queued], TaskTransition::rejected(failure))
            .await?
        {
            self.finalizer.task_finished(job_id, task_id, &state).await?;
        }
        Err(err.into())
    }

    /// Recover every unfinished task in the store.
    ///
    /// Only call this when no executor can still be running a task, such as
    /// at startup of the process owning the in-process pool: `RUNNING`
    /// tasks are treated as interrupted.
    pub async fn recover_orphans(&self) -> Result<RecoveryOutcome, StoreError> {
        let tasks = self.extractions.list_unfinished_tasks().await?;
        let mut outcome = RecoveryOutcome::default();
        for task in &tasks {
            self.recover(task, &mut outcome).await?;
        }
        if outcome != RecoveryOutcome::default() {
            tracing::info!(
                resubmitted = outcome.resubmitted,
                failed = outcome.failed,
                "Recovered orphaned extraction tasks",
            );
        }
        Ok(outcome)
    }

    /// Recover one task whose executor is known to be gone, for example
    /// after its queue claim expired.
    pub async fn recover_task(&self, task_id: DbId) -> Result<RecoveryOutcome, StoreError> {
        let mut outcome = RecoveryOutcome::default();
        if let Some(task) = self.extractions.find_task(task_id).await? {
            self.recover(&task, &mut outcome).await?;
        }
        Ok(outcome)
    }

    async fn recover(
        &self,
        task: &ExtractionTask,
        outcome: &mut RecoveryOutcome,
    ) -> Result<(), StoreError> {
        let job_id = task.extraction_id;
        let result = match task.state.status {
            TaskStatus::Created => self.submit(job_id, task.id).await.map(|()| true),
            TaskStatus::Queued => self.resume_queued(job_id, task).await,
            TaskStatus::Running => {
                let failure = TaskError::new(
                    TaskErrorKind::Internal,
                    "ExecutorLost",
                    "The executor running this task stopped before it finished",
                );
                let failed = self
                    .states
                    .transition(task.id, &[TaskStatus::Running], TaskTransition::failed(failure))
                    .await?;
                if let Some(state) = failed {
                    tracing::warn!(job_id, task_id = task.id, "Failed interrupted task");
                    outcome.failed += 1;
                    self.finalizer.task_finished(job_id, task.id, &state).await?;
                }
                return Ok(());
            }
            TaskStatus::Succeeded | TaskStatus::Failed => return Ok(()),
        };

        match result {
            Ok(true) => outcome.resubmitted += 1,
            Ok(false) => {}
            Err(SubmitError::Dispatch(e)) => {
                tracing::error!(job_id, task_id = task.id, error = %e.source, "Task resubmission failed");
                outcome.failed += 1;
            }
            Err(SubmitError::Store(e)) => return Err(e),
        }
        Ok(())
    }

    /// Cancel every non-terminal task of a job.
    ///
    /// `CREATED`/`QUEUED` tasks fail immediately with kind `CANCELLED`;
    /// `RUNNING` tasks get their cancellation flag raised and stop at the
    /// next stage boundary.
    pub async fn cancel(&self, job_id: DbId) -> Result<CancelOutcome, StoreError> {
        let tasks = self.extractions.list_tasks(job_id).await?;
        let mut outcome = CancelOutcome::default();

        for task in tasks {
            let failed = self
                .states
                .transition(
                    task.id,
                    &[TaskStatus::Created, TaskStatus::Queued],
                    TaskTransition::failed(TaskError::cancelled()),
                )
                .await?;

            if let Some(state) = failed {
                outcome.cancelled += 1;
                match self.queue.withdraw(task.id).await {
                    Ok(removed) => tracing::debug!(task_id = task.id, removed, "Withdrew queued task"),
                    Err(e) => tracing::warn!(task_id = task.id, error = %e, "Failed to withdraw queued task"),
                }
                self.finalizer.task_finished(job_id, task.id, &state).await?;
            } else if self.states.request_cancel(task.id).await?.is_some() {
                outcome.signalled += 1;
            } else {
                outcome.untouched += 1;
            }
        }

        tracing::info!(
            job_id,
            cancelled = outcome.cancelled,
            signalled = outcome.signalled,
            "Extraction cancellation requested",
        );
        Ok(outcome)
    }
}

fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Internal result of one submission.
#[derive(Debug, thiserror::Error)]
enum SubmitError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
