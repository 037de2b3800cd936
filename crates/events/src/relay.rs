//! Cross-process event relay.
//!
//! [`PgEventRelay`] LISTENs on [`EXTRACTION_EVENTS_CHANNEL`] and republishes
//! every decoded notification onto the local [`EventBus`], so WebSocket and
//! follow subscribers in the API see events produced by worker processes.

use std::sync::Arc;
use std::time::Duration;

use quantimage_core::job_events::ExtractionEvent;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::publisher::EXTRACTION_EVENTS_CHANNEL;

/// Back-off after a listener error before polling again.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Background service bridging `pg_notify` into the in-process bus.
pub struct PgEventRelay {
    pool: PgPool,
    bus: Arc<EventBus>,
}

impl PgEventRelay {
    pub fn new(pool: PgPool, bus: Arc<EventBus>) -> Self {
        Self { pool, bus }
    }

    /// Run until `cancel` fires.
    ///
    /// The listener reconnects on its own after connection loss; payloads
    /// that fail to decode are logged and skipped.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(EXTRACTION_EVENTS_CHANNEL).await?;

        tracing::info!(channel = EXTRACTION_EVENTS_CHANNEL, "Event relay listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Event relay shutting down");
                    break;
                }
                received = listener.recv() => match received {
                    Ok(notification) => self.forward(notification.payload()),
                    Err(e) => {
                        tracing::error!(error = %e, "Event relay receive failed");
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                },
            }
        }

        Ok(())
    }

    fn forward(&self, payload: &str) {
        match decode_payload(payload) {
            Ok(event) => self.bus.publish(event),
            Err(e) => tracing::warn!(error = %e, "Dropping malformed event notification"),
        }
    }
}

fn decode_payload(payload: &str) -> Result<ExtractionEvent, serde_json::Error> {
    serde_json::from_str(payload)
}
