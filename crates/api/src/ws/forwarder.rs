//! Bus-to-WebSocket event forwarding.
//!
//! One forwarder per process drains the event bus and hands every event to
//! the [`WsManager`], which routes it to the connections subscribed to a
//! matching topic.

use std::sync::Arc;

use axum::extract::ws::Message;
use quantimage_core::job_events::ExtractionEvent;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::ws::manager::WsManager;

/// Outbound frame: `{ "type": "...", "data": event }`.
#[derive(Debug, Serialize)]
struct EventFrame<'a> {
    r#type: &'static str,
    data: &'a ExtractionEvent,
}

/// Encode an event as a WebSocket text frame.
pub fn event_message(event: &ExtractionEvent) -> Result<Message, serde_json::Error> {
    let frame = EventFrame {
        r#type: event.message_type(),
        data: event,
    };
    Ok(Message::Text(serde_json::to_string(&frame)?.into()))
}

/// Forward bus events to subscribed sockets until `cancel` fires or the
/// bus closes.
pub async fn run(
    ws_manager: Arc<WsManager>,
    mut events: broadcast::Receiver<ExtractionEvent>,
    cancel: CancellationToken,
) {
    tracing::info!("WebSocket event forwarder started");

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => received,
        };

        match received {
            Ok(event) => {
                let message = match event_message(&event) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode event frame");
                        continue;
                    }
                };
                let delivered = ws_manager.dispatch(&event, message).await;
                tracing::trace!(
                    job_id = event.job_id,
                    entity_id = event.entity_id,
                    delivered,
                    "Forwarded event",
                );
            }
            Err(RecvError::Lagged(skipped)) => {
                // Clients re-read status on reconnect; dropped hints are safe.
                tracing::warn!(skipped, "WebSocket forwarder lagged behind the event bus");
            }
            Err(RecvError::Closed) => break,
        }
    }

    tracing::info!("WebSocket event forwarder stopped");
}
