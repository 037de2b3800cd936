//! Event publishing backends.
//!
//! [`EventPublisher`] is the seam the pipeline writes events through. The
//! API process publishes straight onto its [`EventBus`]; worker processes
//! publish with `pg_notify` and the API relays those notifications onto its
//! bus (see [`crate::relay`]).

use std::sync::Arc;

use async_trait::async_trait;
use quantimage_core::job_events::ExtractionEvent;
use sqlx::PgPool;

use crate::bus::EventBus;

/// PostgreSQL channel carrying serialized [`ExtractionEvent`]s.
pub const EXTRACTION_EVENTS_CHANNEL: &str = "extraction_events";

/// `pg_notify` payloads must stay below 8000 bytes.
const MAX_NOTIFY_PAYLOAD: usize = 7900;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Failure to hand an event to its transport.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Event payload of {0} bytes exceeds the notify limit")]
    PayloadTooLarge(usize),

    #[error("Database notify failed: {0}")]
    Database(#[from] sqlx::Error),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: ExtractionEvent) -> Result<(), PublishError>;
}

/// Publish and log failures. Event delivery never fails the caller.
pub async fn publish_or_log(publisher: &dyn EventPublisher, event: ExtractionEvent) {
    let entity_id = event.entity_id;
    let entity_type = event.entity_type;
    if let Err(e) = publisher.publish(event).await {
        tracing::warn!(
            error = %e,
            entity_id,
            entity_type = ?entity_type,
            "Failed to publish extraction event"
        );
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Publishes onto an in-process [`EventBus`].
pub struct BusPublisher {
    bus: Arc<EventBus>,
}

impl BusPublisher {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl EventPublisher for BusPublisher {
    async fn publish(&self, event: ExtractionEvent) -> Result<(), PublishError> {
        self.bus.publish(event);
        Ok(())
    }
}

/// Publishes via `pg_notify` on [`EXTRACTION_EVENTS_CHANNEL`].
pub struct PgNotifyPublisher {
    pool: PgPool,
}

impl PgNotifyPublisher {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventPublisher for PgNotifyPublisher {
    async fn publish(&self, event: ExtractionEvent) -> Result<(), PublishError> {
        let payload = encode_notify_payload(&event)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(EXTRACTION_EVENTS_CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Serialize an event for a notify payload, enforcing the size limit.
pub fn encode_notify_payload(event: &ExtractionEvent) -> Result<String, PublishError> {
    let payload = serde_json::to_string(event)?;
    if payload.len() > MAX_NOTIFY_PAYLOAD {
        return Err(PublishError::PayloadTooLarge(payload.len()));
    }
    Ok(payload)
}
