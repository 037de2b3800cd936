//! Task unit executor: runs one study's extraction pipeline.
//!
//! Stages: fetch the study's DICOM files, pre-process them, compute every
//! selected feature family. The executor is the single writer of a task
//! while it is `RUNNING`; it checks the cancellation flag before each stage
//! and writes a progress checkpoint after each one.

use std::sync::Arc;

use quantimage_core::extraction::{
    Extraction, ExtractionTask, TaskError, TaskErrorKind, TaskProgress, TaskState,
};
use quantimage_core::features::{merge_features, strip_diagnostics, FeatureMap};
use quantimage_core::job_events::ExtractionEvent;
use quantimage_core::status::TaskStatus;
use quantimage_core::types::DbId;
use quantimage_db::models::task::TaskTransition;
use quantimage_events::{publish_or_log, EventPublisher};

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::catalog::{Catalog, CatalogError};
use crate::compute::{ComputeError, FeatureComputer};
use crate::source::{ImagingSource, SourceError};
use crate::store::{ExtractionStore, StoreError, TaskStateStore};

/// Stage labels, in execution order.
pub const STAGES: [&str; 3] = [
    "Fetching DICOM files",
    "Pre-processing data",
    "Extracting features",
];

/// Progress message written when the task starts.
pub const STARTING_MESSAGE: &str = "starting";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Cancellation observed at a stage boundary.
#[derive(Debug, thiserror::Error)]
#[error("Extraction task {task_id} was cancelled before '{stage}'")]
pub struct CancellationError {
    pub task_id: DbId,
    pub stage: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Cancelled(#[from] CancellationError),

    #[error("Failed to obtain access token")]
    Token(#[source] CatalogError),

    #[error("Failed to fetch study {study_uid}")]
    Fetch {
        study_uid: String,
        #[source]
        source: SourceError,
    },

    #[error("Study {0} has no instances of a supported modality")]
    EmptyStudy(String),

    #[error("Failed to create the study workspace")]
    Workspace(#[source] std::io::Error),

    #[error("Pre-processing failed")]
    Preprocess(#[source] ComputeError),

    #[error("Feature family '{family}' failed")]
    Compute {
        family: String,
        #[source]
        source: ComputeError,
    },

    #[error("Failed to store features")]
    Artifact(#[from] ArtifactError),

    #[error("Task state store failed")]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn kind(&self) -> TaskErrorKind {
        match self {
            PipelineError::Cancelled(_) => TaskErrorKind::Cancelled,
            PipelineError::Store(_) => TaskErrorKind::Internal,
            _ => TaskErrorKind::Pipeline,
        }
    }

    /// Stable error type name recorded on the task.
    pub fn error_type(&self) -> &'static str {
        match self {
            PipelineError::Cancelled(_) => "CancellationError",
            PipelineError::Token(_) => "TokenError",
            PipelineError::Fetch { .. } => "FetchError",
            PipelineError::EmptyStudy(_) => "EmptyStudyError",
            PipelineError::Workspace(_) => "WorkspaceError",
            PipelineError::Preprocess(_) => "PreprocessError",
            PipelineError::Compute { .. } => "ComputeError",
            PipelineError::Artifact(_) => "ArtifactError",
            PipelineError::Store(_) => "StoreError",
        }
    }

    pub fn to_task_error(&self) -> TaskError {
        TaskError::capture(self.kind(), self.error_type(), self)
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What one executor invocation did.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The task was not `QUEUED` (already terminal, cancelled, or unknown).
    Skipped,
    /// The task ran and is now terminal.
    Finished {
        job_id: DbId,
        task_id: DbId,
        state: TaskState,
    },
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct TaskExecutor {
    extractions: Arc<dyn ExtractionStore>,
    states: Arc<dyn TaskStateStore>,
    catalog: Arc<dyn Catalog>,
    source: Arc<dyn ImagingSource>,
    computer: Arc<dyn FeatureComputer>,
    artifacts: ArtifactStore,
    publisher: Arc<dyn EventPublisher>,
}

impl TaskExecutor {
    pub fn new(
        extractions: Arc<dyn ExtractionStore>,
        states: Arc<dyn TaskStateStore>,
        catalog: Arc<dyn Catalog>,
        source: Arc<dyn ImagingSource>,
        computer: Arc<dyn FeatureComputer>,
        artifacts: ArtifactStore,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            extractions,
            states,
            catalog,
            source,
            computer,
            artifacts,
            publisher,
        }
    }

    /// Run the task. Never retries.
    ///
    /// Errors are only returned when the task could not be loaded or its
    /// terminal state could not be written; pipeline failures end up on
    /// the task itself.
    pub async fn execute(&self, task_id: DbId) -> Result<ExecutionOutcome, StoreError> {
        let Some(task) = self.extractions.find_task(task_id).await? else {
            tracing::warn!(task_id, "Invocation for unknown task ignored");
            return Ok(ExecutionOutcome::Skipped);
        };
        let extraction = self
            .extractions
            .find(task.extraction_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "Extraction",
                id: task.extraction_id,
            })?;

        let start = TaskTransition::running(TaskProgress::new(
            0,
            STAGES.len() as u32,
            STARTING_MESSAGE,
        ));
        let Some(running) = self
            .states
            .transition(task_id, &[TaskStatus::Queued], start)
            .await?
        else {
            tracing::info!(task_id, "Task is not queued, skipping invocation");
            return Ok(ExecutionOutcome::Skipped);
        };
        self.publish(&task, &running).await;

        tracing::info!(
            job_id = extraction.id,
            task_id,
            study_uid = %task.study_uid,
            "Extraction task started",
        );

        let terminal = match self.run_stages(&extraction, &task).await {
            Ok(result_ref) => TaskTransition::succeeded(result_ref),
            Err(e) => {
                tracing::error!(
                    job_id = extraction.id,
                    task_id,
                    study_uid = %task.study_uid,
                    error = %e,
                    kind = ?e.kind(),
                    "Extraction task failed",
                );
                TaskTransition::failed(e.to_task_error())
            }
        };

        match self
            .states
            .transition(task_id, &[TaskStatus::Running], terminal)
            .await?
        {
            Some(state) => Ok(ExecutionOutcome::Finished {
                job_id: extraction.id,
                task_id,
                state,
            }),
            None => {
                // Only this executor writes a running task; reaching here
                // means the row was changed out from under it.
                tracing::warn!(task_id, "Task left RUNNING before its result was written");
                Ok(ExecutionOutcome::Skipped)
            }
        }
    }

    async fn run_stages(
        &self,
        extraction: &Extraction,
        task: &ExtractionTask,
    ) -> Result<String, PipelineError> {
        // Removed on drop, whatever the outcome.
        let workspace = tempfile::Builder::new()
            .prefix("quantimage-")
            .tempdir()
            .map_err(PipelineError::Workspace)?;

        // Stage 1: fetch.
        self.checkpoint_before(task, 0).await?;
        let token = self
            .catalog
            .delegated_token(&extraction.owner)
            .await
            .map_err(PipelineError::Token)?;
        let file_count = self
            .source
            .fetch(&task.study_uid, &token, workspace.path())
            .await
            .map_err(|source| PipelineError::Fetch {
                study_uid: task.study_uid.clone(),
                source,
            })?;
        if file_count == 0 {
            return Err(PipelineError::EmptyStudy(task.study_uid.clone()));
        }
        self.checkpoint_after(task, 0).await?;

        // Stage 2: pre-process.
        self.checkpoint_before(task, 1).await?;
        let input = self
            .computer
            .preprocess(workspace.path())
            .await
            .map_err(PipelineError::Preprocess)?;
        self.checkpoint_after(task, 1).await?;

        // Stage 3: compute every selected family.
        self.checkpoint_before(task, 2).await?;
        let mut features = FeatureMap::new();
        for (family, config) in &extraction.config.families {
            let computed = self
                .computer
                .compute(&input, family, config)
                .await
                .map_err(|source| PipelineError::Compute {
                    family: family.clone(),
                    source,
                })?;
            merge_features(&mut features, computed);
        }
        let features = strip_diagnostics(features);
        let result_ref = self
            .artifacts
            .write(&extraction.owner, &task.study_uid, task.id, &features)
            .await?;
        self.checkpoint_after(task, 2).await?;

        Ok(result_ref)
    }

    async fn checkpoint_before(
        &self,
        task: &ExtractionTask,
        stage: usize,
    ) -> Result<(), PipelineError> {
        if self.states.is_cancel_requested(task.id).await? {
            tracing::info!(task_id = task.id, stage = STAGES[stage], "Cancellation observed");
            return Err(CancellationError {
                task_id: task.id,
                stage: STAGES[stage],
            }
            .into());
        }
        Ok(())
    }

    async fn checkpoint_after(
        &self,
        task: &ExtractionTask,
        stage: usize,
    ) -> Result<(), PipelineError> {
        let progress = TaskProgress::new(stage as u32 + 1, STAGES.len() as u32, STAGES[stage]);
        let state = self
            .states
            .transition(task.id, &[TaskStatus::Running], TaskTransition::running(progress))
            .await?
            .ok_or(StoreError::NotFound {
                entity: "Running task",
                id: task.id,
            })?;
        self.publish(task, &state).await;
        Ok(())
    }

    async fn publish(&self, task: &ExtractionTask, state: &TaskState) {
        publish_or_log(
            self.publisher.as_ref(),
            ExtractionEvent::task(task.id, task.extraction_id, state),
        )
        .await;
    }
}
