//! Job-level status aggregation.
//!
//! A job's status is never stored. [`aggregate`] derives it from the
//! current state of every task the job owns, so it can be called from any
//! number of readers at any time and always reflects the latest writes.

use serde::{Deserialize, Serialize};

use crate::extraction::{TaskErrorKind, TaskState};
use crate::status::TaskStatus;
use crate::types::DbId;

/// Derived status of a whole extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    InProgress,
    Complete,
    CompleteWithErrors,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Complete => "COMPLETE",
            JobStatus::CompleteWithErrors => "COMPLETE_WITH_ERRORS",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One task's identity plus its current state, as read for aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: DbId,
    pub study_uid: String,
    pub state: TaskState,
}

/// A failed study surfaced in the aggregated report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStudy {
    pub task_id: DbId,
    pub study_uid: String,
    pub kind: TaskErrorKind,
    pub message: String,
}

/// Aggregated status of an extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: DbId,
    pub status: JobStatus,
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Completion percentage in `0.0..=100.0`.
    pub percent: f64,
    pub successful_studies: Vec<String>,
    pub errors: Vec<FailedStudy>,
}

impl JobStatusReport {
    /// One-line summary used as the job event message.
    pub fn summary(&self) -> String {
        match self.status {
            JobStatus::InProgress => format!(
                "{}/{} studies complete ({:.0}%)",
                self.completed, self.total, self.percent
            ),
            JobStatus::Complete => format!("All {} studies extracted", self.total),
            JobStatus::CompleteWithErrors => format!(
                "{} of {} studies extracted, {} failed",
                self.succeeded, self.total, self.failed
            ),
            JobStatus::Failed => format!("All {} studies failed", self.total),
        }
    }
}

/// Reduce the tasks of one job to its overall status.
///
/// Terminal tasks contribute 1.0 to the percentage, non-terminal tasks
/// their progress fraction. Once every task is terminal the outcome is
/// `COMPLETE`, `COMPLETE_WITH_ERRORS` (some failed) or `FAILED` (all
/// failed), and the percentage is 100.
pub fn aggregate(job_id: DbId, tasks: &[TaskSnapshot]) -> JobStatusReport {
    let total = tasks.len();
    let mut succeeded = 0usize;
    let mut failed = 0usize;
    let mut fraction_sum = 0.0f64;
    let mut successful_studies = Vec::new();
    let mut errors = Vec::new();

    for task in tasks {
        fraction_sum += task.state.completion_fraction();
        match task.state.status {
            TaskStatus::Succeeded => {
                succeeded += 1;
                successful_studies.push(task.study_uid.clone());
            }
            TaskStatus::Failed => {
                failed += 1;
                let (kind, message) = task.state.error.as_ref().map_or(
                    (TaskErrorKind::Internal, "Unknown error".to_string()),
                    |e| (e.kind, e.message.clone()),
                );
                errors.push(FailedStudy {
                    task_id: task.task_id,
                    study_uid: task.study_uid.clone(),
                    kind,
                    message,
                });
            }
            _ => {}
        }
    }

    let completed = succeeded + failed;
    let (status, percent) = if total == 0 || completed < total {
        let percent = if total == 0 {
            0.0
        } else {
            100.0 * fraction_sum / total as f64
        };
        (JobStatus::InProgress, percent)
    } else if failed == 0 {
        (JobStatus::Complete, 100.0)
    } else if failed < total {
        (JobStatus::CompleteWithErrors, 100.0)
    } else {
        (JobStatus::Failed, 100.0)
    };

    JobStatusReport {
        job_id,
        status,
        total,
        completed,
        succeeded,
        failed,
        percent,
        successful_studies,
        errors,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
