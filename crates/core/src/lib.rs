//! Pure domain logic for feature-extraction orchestration.
//!
//! No I/O lives here: status enums and the task lifecycle, extraction
//! scope and feature configuration, failure detail, job status aggregation,
//! the event envelope and the client-side event model.

pub mod aggregation;
pub mod error;
pub mod event_model;
pub mod extraction;
pub mod features;
pub mod job_events;
pub mod status;
pub mod types;
