//! Extraction event envelope and subscription topics.
//!
//! Events are hints: subscribers re-query status on receipt and must
//! tolerate duplicates and stale deliveries (see [`crate::event_model`]).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::aggregation::JobStatusReport;
use crate::error::CoreError;
use crate::extraction::{TaskProgress, TaskState};
use crate::types::{DbId, Timestamp};

/// WebSocket message type for task transitions.
pub const MSG_TYPE_TASK_STATUS: &str = "feature_task_status";

/// WebSocket message type for aggregated extraction status.
pub const MSG_TYPE_EXTRACTION_STATUS: &str = "extraction_status";

/// Which entity an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Task,
    Job,
}

/// A status change notification for a task or a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionEvent {
    pub entity_type: EntityType,
    pub entity_id: DbId,
    /// Owning job (equal to `entity_id` for job events).
    pub job_id: DbId,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TaskProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    pub message: String,
    pub timestamp: Timestamp,
}

impl ExtractionEvent {
    /// Event for a task transition, stamped with the task's `updated_at`.
    pub fn task(task_id: DbId, job_id: DbId, state: &TaskState) -> Self {
        Self {
            entity_type: EntityType::Task,
            entity_id: task_id,
            job_id,
            status: state.status.as_str().to_string(),
            progress: state.progress.clone(),
            percent: None,
            message: state.status_message(),
            timestamp: state.updated_at,
        }
    }

    /// Event carrying a job's aggregated status.
    pub fn job(report: &JobStatusReport, timestamp: Timestamp) -> Self {
        Self {
            entity_type: EntityType::Job,
            entity_id: report.job_id,
            job_id: report.job_id,
            status: report.status.as_str().to_string(),
            progress: None,
            percent: Some(report.percent),
            message: report.summary(),
            timestamp,
        }
    }

    /// WebSocket message type for this event.
    pub fn message_type(&self) -> &'static str {
        match self.entity_type {
            EntityType::Task => MSG_TYPE_TASK_STATUS,
            EntityType::Job => MSG_TYPE_EXTRACTION_STATUS,
        }
    }

    /// Whether a subscriber on `topic` should receive this event.
    ///
    /// Task events are also delivered to their parent job's topic.
    pub fn matches(&self, topic: &Topic) -> bool {
        match (topic, self.entity_type) {
            (Topic::Task(id), EntityType::Task) => *id == self.entity_id,
            (Topic::Task(_), EntityType::Job) => false,
            (Topic::Job(id), _) => *id == self.job_id,
        }
    }
}

/// Subscription topic: `task:{id}` or `job:{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Topic {
    Task(DbId),
    Job(DbId),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Task(id) => write!(f, "task:{id}"),
            Topic::Job(id) => write!(f, "job:{id}"),
        }
    }
}

impl FromStr for Topic {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| CoreError::Validation(format!("Invalid topic '{s}'")))?;
        let id: DbId = id
            .parse()
            .map_err(|_| CoreError::Validation(format!("Invalid topic id in '{s}'")))?;
        match kind {
            "task" => Ok(Topic::Task(id)),
            "job" => Ok(Topic::Job(id)),
            _ => Err(CoreError::Validation(format!("Unknown topic kind '{kind}'"))),
        }
    }
}

impl TryFrom<String> for Topic {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.to_string()
    }
}
