//! Executor invocation followed by completion handling, shared by the
//! in-process pool and the worker runtime.

use std::sync::Arc;

use quantimage_core::types::DbId;

use crate::executor::{ExecutionOutcome, TaskExecutor};
use crate::finalize::Finalizer;

pub struct TaskProcessor {
    executor: Arc<TaskExecutor>,
    finalizer: Arc<Finalizer>,
}

impl TaskProcessor {
    pub fn new(executor: Arc<TaskExecutor>, finalizer: Arc<Finalizer>) -> Self {
        Self {
            executor,
            finalizer,
        }
    }

    /// Run one invocation and finalize the task if it ended terminal.
    /// Failures are logged; nothing propagates to sibling tasks.
    pub async fn process(&self, task_id: DbId) -> ExecutionOutcome {
        let outcome = match self.executor.execute(task_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(task_id, error = %e, "Executor invocation failed");
                return ExecutionOutcome::Skipped;
            }
        };

        if let ExecutionOutcome::Finished {
            job_id,
            task_id,
            state,
        } = &outcome
        {
            if let Err(e) = self.finalizer.task_finished(*job_id, *task_id, state).await {
                tracing::error!(job_id, task_id, error = %e, "Finalize failed");
            }
        }
        outcome
    }
}
