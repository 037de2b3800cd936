//! Client-side view built from extraction events.
//!
//! Delivery is at-least-once and unordered across tasks, so the model keys
//! entries by `(entity_type, entity_id)` and only accepts an event that is
//! strictly newer than what it already holds. Re-applying an event is a
//! no-op.

use std::collections::HashMap;

use crate::extraction::TaskProgress;
use crate::job_events::{EntityType, ExtractionEvent};
use crate::types::{DbId, Timestamp};

/// Latest known state of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEntry {
    pub status: String,
    pub progress: Option<TaskProgress>,
    pub percent: Option<f64>,
    pub message: String,
    pub updated_at: Timestamp,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct EventModel {
    entries: HashMap<(EntityType, DbId), ModelEntry>,
}

impl EventModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an event. Returns `true` if the model changed.
    ///
    /// Duplicates (same timestamp) and stale events (older timestamp) are
    /// discarded.
    pub fn apply(&mut self, event: &ExtractionEvent) -> bool {
        let key = (event.entity_type, event.entity_id);
        if let Some(existing) = self.entries.get(&key) {
            if event.timestamp <= existing.updated_at {
                return false;
            }
        }
        self.entries.insert(
            key,
            ModelEntry {
                status: event.status.clone(),
                progress: event.progress.clone(),
                percent: event.percent,
                message: event.message.clone(),
                updated_at: event.timestamp,
            },
        );
        true
    }

    pub fn get(&self, entity_type: EntityType, entity_id: DbId) -> Option<&ModelEntry> {
        self.entries.get(&(entity_type, entity_id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::extraction::TaskState;
    use crate::status::TaskStatus;

    fn event(status: TaskStatus, at: Timestamp) -> ExtractionEvent {
        let mut state = TaskState::created(at);
        state.status = status;
        ExtractionEvent::task(1, 1, &state)
    }

    #[test]
    fn applying_twice_equals_applying_once() {
        let e = event(TaskStatus::Queued, Utc::now());

        let mut once = EventModel::new();
        once.apply(&e);

        let mut twice = EventModel::new();
        assert!(twice.apply(&e));
        assert!(!twice.apply(&e));

        assert_eq!(once, twice);
    }

    #[test]
    fn stale_event_is_discarded() {
        let now = Utc::now();
        let newer = event(TaskStatus::Running, now);
        let older = event(TaskStatus::Queued, now - Duration::seconds(1));

        let mut model = EventModel::new();
        model.apply(&newer);
        assert!(!model.apply(&older));
        assert_eq!(model.get(EntityType::Task, 1).unwrap().status, "RUNNING");
    }

    #[test]
    fn out_of_order_delivery_converges() {
        let now = Utc::now();
        let events = [
            event(TaskStatus::Queued, now),
            event(TaskStatus::Running, now + Duration::milliseconds(5)),
            event(TaskStatus::Succeeded, now + Duration::milliseconds(9)),
        ];

        let mut forward = EventModel::new();
        events.iter().for_each(|e| {
            forward.apply(e);
        });
        let mut reversed = EventModel::new();
        events.iter().rev().for_each(|e| {
            reversed.apply(e);
        });

        assert_eq!(forward, reversed);
        assert_eq!(forward.get(EntityType::Task, 1).unwrap().status, "SUCCEEDED");
    }
}
