//! Extraction domain types: scope, feature configuration, task progress,
//! task failure detail and the per-task state record.
//!
//! Pure data and validation only; persistence lives in `quantimage-db` and
//! orchestration in `quantimage-pipeline`.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::status::TaskStatus;
use crate::types::{DbId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Feature families a configuration may select.
pub const KNOWN_FEATURE_FAMILIES: &[&str] = &["pyradiomics", "riesz"];

/// Scope kind label for a single study.
pub const SCOPE_STUDY: &str = "study";

/// Scope kind label for an album.
pub const SCOPE_ALBUM: &str = "album";

/// Maximum length of a study UID or album identifier.
const MAX_REFERENCE_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// What an extraction covers: one study, or every study of an album.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionScope {
    Study { study_uid: String },
    Album { album_id: String },
}

impl ExtractionScope {
    /// Rebuild a scope from its persisted `(kind, reference)` pair.
    pub fn from_parts(kind: &str, reference: &str) -> Result<Self, CoreError> {
        match kind {
            SCOPE_STUDY => Ok(Self::Study {
                study_uid: reference.to_string(),
            }),
            SCOPE_ALBUM => Ok(Self::Album {
                album_id: reference.to_string(),
            }),
            other => Err(CoreError::Validation(format!("Unknown scope kind '{other}'"))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Study { .. } => SCOPE_STUDY,
            Self::Album { .. } => SCOPE_ALBUM,
        }
    }

    /// The study UID or album identifier.
    pub fn reference(&self) -> &str {
        match self {
            Self::Study { study_uid } => study_uid,
            Self::Album { album_id } => album_id,
        }
    }

    /// Reject empty or oversized references.
    pub fn validate(&self) -> Result<(), CoreError> {
        let reference = self.reference().trim();
        if reference.is_empty() {
            return Err(CoreError::Validation(format!(
                "{} reference must not be empty",
                self.kind()
            )));
        }
        if reference.len() > MAX_REFERENCE_LEN {
            return Err(CoreError::Validation(format!(
                "{} reference must not exceed {MAX_REFERENCE_LEN} characters",
                self.kind()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Feature configuration
// ---------------------------------------------------------------------------

/// Feature-family selection for one extraction.
///
/// Maps a family name to that family's backend configuration. Immutable
/// once the extraction is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub families: BTreeMap<String, serde_json::Value>,
}

impl FeatureConfig {
    /// Require at least one family and only known family names.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.families.is_empty() {
            return Err(CoreError::Validation(
                "At least one feature family must be selected".to_string(),
            ));
        }
        for family in self.families.keys() {
            if !KNOWN_FEATURE_FAMILIES.contains(&family.as_str()) {
                return Err(CoreError::Validation(format!(
                    "Unknown feature family '{family}'"
                )));
            }
        }
        Ok(())
    }

    /// Names of the selected families, in stable order.
    pub fn family_names(&self) -> Vec<&str> {
        self.families.keys().map(String::as_str).collect()
    }
}

// ---------------------------------------------------------------------------
// Reuse policy
// ---------------------------------------------------------------------------

/// What the dispatcher does when the same owner re-submits a scope that
/// already has an in-flight extraction with an identical configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReusePolicy {
    /// Always create a fresh extraction.
    AlwaysCreate,
    /// Return the in-flight extraction and re-submit its undispatched tasks.
    #[default]
    ReuseActive,
}

impl FromStr for ReusePolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "always_create" => Ok(Self::AlwaysCreate),
            "reuse_active" => Ok(Self::ReuseActive),
            other => Err(CoreError::Validation(format!(
                "Unknown reuse policy '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Checkpoint reported by a running task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub current_step: u32,
    pub total_steps: u32,
    pub message: String,
}

impl TaskProgress {
    pub fn new(current_step: u32, total_steps: u32, message: impl Into<String>) -> Self {
        Self {
            current_step,
            total_steps,
            message: message.into(),
        }
    }

    /// Completed share in `0.0..=1.0`; zero when `total_steps` is zero.
    pub fn fraction(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        (f64::from(self.current_step) / f64::from(self.total_steps)).clamp(0.0, 1.0)
    }

    /// Human readable `"current/total - message"` line.
    pub fn status_line(&self) -> String {
        format!("{}/{} - {}", self.current_step, self.total_steps, self.message)
    }
}

// ---------------------------------------------------------------------------
// Failure detail
// ---------------------------------------------------------------------------

/// Why a task ended in `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskErrorKind {
    /// The work queue refused the task.
    Submission,
    /// Fetch, preprocessing or feature computation failed.
    Pipeline,
    /// Cooperative cancellation was observed.
    Cancelled,
    /// Anything else (store failures while running, missing records).
    Internal,
}

/// Structured failure detail captured for operator inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub error_type: String,
    pub message: String,
    /// Error source chain, outermost first.
    #[serde(default)]
    pub details: Vec<String>,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            error_type: error_type.into(),
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Capture an error and its full `source()` chain.
    pub fn capture(
        kind: TaskErrorKind,
        error_type: impl Into<String>,
        err: &(dyn std::error::Error + 'static),
    ) -> Self {
        Self {
            kind,
            error_type: error_type.into(),
            message: err.to_string(),
            details: error_chain(err),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(
            TaskErrorKind::Cancelled,
            "Cancelled",
            "Extraction was cancelled",
        )
    }
}

/// Collect `err` and each of its sources as display strings.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut chain = vec![err.to_string()];
    let mut current = err.source();
    while let Some(source) = current {
        chain.push(source.to_string());
        current = source.source();
    }
    chain
}

// ---------------------------------------------------------------------------
// Task state
// ---------------------------------------------------------------------------

/// Latest reported state of one task, as held by the task state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    pub progress: Option<TaskProgress>,
    pub result_ref: Option<String>,
    pub error: Option<TaskError>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub updated_at: Timestamp,
}

impl TaskState {
    /// Initial state of a freshly created task.
    pub fn created(now: Timestamp) -> Self {
        Self {
            status: TaskStatus::Created,
            progress: None,
            result_ref: None,
            error: None,
            cancel_requested: false,
            updated_at: now,
        }
    }

    /// Contribution of this task to its job's completion percentage.
    ///
    /// Terminal tasks count as done; others contribute their progress
    /// fraction, or nothing when no checkpoint has been reported.
    pub fn completion_fraction(&self) -> f64 {
        if self.status.is_terminal() {
            return 1.0;
        }
        self.progress.as_ref().map_or(0.0, TaskProgress::fraction)
    }

    /// Short status message for events and listings.
    pub fn status_message(&self) -> String {
        match self.status {
            TaskStatus::Created => "Created".to_string(),
            TaskStatus::Queued => "Queued".to_string(),
            TaskStatus::Running => self
                .progress
                .as_ref()
                .map_or_else(|| "Running".to_string(), TaskProgress::status_line),
            TaskStatus::Succeeded => "Extraction Complete".to_string(),
            TaskStatus::Failed => self
                .error
                .as_ref()
                .map_or_else(|| "Failure!".to_string(), |e| e.message.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One logical extraction request (the parent "job").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub id: DbId,
    pub owner: String,
    pub scope: ExtractionScope,
    pub config: FeatureConfig,
    pub created_at: Timestamp,
    /// Set once by the job-level finalize.
    pub finalized_at: Option<Timestamp>,
}

/// One study's unit of work within an extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionTask {
    pub id: DbId,
    pub extraction_id: DbId,
    pub study_uid: String,
    /// Work-queue identifier, unset until dispatch succeeds.
    pub external_job_token: Option<String>,
    #[serde(flatten)]
    pub state: TaskState,
    pub created_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn config(families: &[&str]) -> FeatureConfig {
        FeatureConfig {
            families: families
                .iter()
                .map(|f| (f.to_string(), serde_json::json!({})))
                .collect(),
        }
    }

    #[test]
    fn empty_config_is_rejected() {
        assert_matches!(config(&[]).validate(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn unknown_family_is_rejected() {
        let err = config(&["pyradiomics", "bogus"]).validate().unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn known_families_pass() {
        assert!(config(&["pyradiomics", "riesz"]).validate().is_ok());
    }

    #[test]
    fn scope_round_trips_through_parts() {
        let scope = ExtractionScope::Album {
            album_id: "alb-1".into(),
        };
        let rebuilt = ExtractionScope::from_parts(scope.kind(), scope.reference()).unwrap();
        assert_eq!(rebuilt, scope);
        assert_matches!(
            ExtractionScope::from_parts("series", "x"),
            Err(CoreError::Validation(_))
        );
    }

    #[test]
    fn blank_scope_reference_is_rejected() {
        let scope = ExtractionScope::Study {
            study_uid: "   ".into(),
        };
        assert_matches!(scope.validate(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn progress_fraction_handles_zero_total() {
        assert_eq!(TaskProgress::new(1, 0, "x").fraction(), 0.0);
        assert_eq!(TaskProgress::new(1, 4, "x").fraction(), 0.25);
        assert_eq!(TaskProgress::new(9, 3, "x").fraction(), 1.0);
    }

    #[test]
    fn reuse_policy_parses() {
        assert_eq!("always_create".parse::<ReusePolicy>().unwrap(), ReusePolicy::AlwaysCreate);
        assert_eq!("reuse_active".parse::<ReusePolicy>().unwrap(), ReusePolicy::ReuseActive);
        assert!("sometimes".parse::<ReusePolicy>().is_err());
    }

    #[test]
    fn error_chain_walks_sources() {
        #[derive(Debug, thiserror::Error)]
        #[error("outer")]
        struct Outer(#[source] std::io::Error);

        let err = Outer(std::io::Error::other("inner"));
        let captured = TaskError::capture(TaskErrorKind::Pipeline, "Outer", &err);
        assert_eq!(captured.message, "outer");
        assert_eq!(captured.details, vec!["outer".to_string(), "inner".to_string()]);
    }

    #[test]
    fn running_message_uses_progress_line() {
        let mut state = TaskState::created(chrono::Utc::now());
        state.status = TaskStatus::Running;
        state.progress = Some(TaskProgress::new(2, 3, "Pre-processing data"));
        assert_eq!(state.status_message(), "2/3 - Pre-processing data");
    }
}
