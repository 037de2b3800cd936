//! Row model for the `task_queue` table.

use quantimage_core::types::{DbId, Timestamp};
use sqlx::FromRow;

/// A row from the `task_queue` table.
#[derive(Debug, Clone, FromRow)]
pub struct QueueEntry {
    pub id: DbId,
    pub token: String,
    pub task_id: DbId,
    pub payload: serde_json::Value,
    pub enqueued_at: Timestamp,
    pub claimed_at: Option<Timestamp>,
    pub claimed_by: Option<String>,
    pub completed_at: Option<Timestamp>,
}
