use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use quantimage_core::error::CoreError;
use quantimage_core::job_events::Topic;
use quantimage_pipeline::ExtractionContext;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::handlers::access::authorize_topic;
use crate::middleware::auth::{AuthUser, USER_ID_HEADER};
use crate::state::AppState;
use crate::ws::manager::WsManager;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Topic to subscribe to right after the upgrade.
    pub topic: Option<String>,
    /// Caller identity for browsers, which cannot set upgrade headers.
    pub user_id: Option<String>,
}

/// Inbound control frame.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "action")]
enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

/// Reply to a control frame.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlReply {
    Subscribed { topic: String },
    Unsubscribed { topic: String },
    Error { error: String },
}

/// GET /api/v1/ws?topic=job:{id}
///
/// Identity comes from `X-User-Id` or the `user_id` query parameter. The
/// initial topic, if any, is authorized before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> AppResult<impl IntoResponse> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.user_id)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Core(CoreError::Unauthorized("Missing user identity".into())))?;
    let auth = AuthUser { user_id };

    let initial = match query.topic.as_deref() {
        Some(raw) => {
            let topic: Topic = raw.parse()?;
            authorize_topic(&state.ctx, topic, &auth).await?;
            Some(topic)
        }
        None => None,
    };

    Ok(ws.on_upgrade(move |socket| {
        handle_socket(socket, state.ws_manager, state.ctx, auth, initial)
    }))
}

/// Manage a single WebSocket connection after upgrade.
///
/// Registers the connection, spawns a sender task draining the manager
/// channel into the sink, and processes control frames until the client
/// goes away.
async fn handle_socket(
    socket: WebSocket,
    ws_manager: Arc<WsManager>,
    ctx: Arc<ExtractionContext>,
    auth: AuthUser,
    initial: Option<Topic>,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, user_id = %auth.user_id, "WebSocket connected");

    let mut rx = ws_manager.add(conn_id.clone(), Some(auth.user_id.clone())).await;
    if let Some(topic) = initial {
        ws_manager.subscribe(&conn_id, topic).await;
    }

    let (mut sink, mut stream) = socket.split();

    let sender_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {
                tracing::trace!(conn_id = %conn_id, "Pong received");
            }
            Ok(Message::Text(text)) => {
                let reply = handle_frame(&ws_manager, &ctx, &auth, &conn_id, text.as_str()).await;
                match serde_json::to_string(&reply) {
                    Ok(json) => {
                        ws_manager.send_to(&conn_id, Message::Text(json.into())).await;
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to encode control reply"),
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    ws_manager.remove(&conn_id).await;
    send_task.abort();
    tracing::info!(conn_id = %conn_id, "WebSocket disconnected");
}

async fn handle_frame(
    ws_manager: &WsManager,
    ctx: &ExtractionContext,
    auth: &AuthUser,
    conn_id: &str,
    text: &str,
) -> ControlReply {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            return ControlReply::Error {
                error: format!("Invalid frame: {e}"),
            }
        }
    };

    let (raw, subscribe) = match frame {
        ClientFrame::Subscribe { topic } => (topic, true),
        ClientFrame::Unsubscribe { topic } => (topic, false),
    };
    let topic: Topic = match raw.parse() {
        Ok(topic) => topic,
        Err(e) => return ControlReply::Error { error: e.to_string() },
    };

    if !subscribe {
        ws_manager.unsubscribe(conn_id, topic).await;
        return ControlReply::Unsubscribed {
            topic: topic.to_string(),
        };
    }

    match authorize_topic(ctx, topic, auth).await {
        Ok(()) => {
            ws_manager.subscribe(conn_id, topic).await;
            ControlReply::Subscribed {
                topic: topic.to_string(),
            }
        }
        Err(e) => {
            tracing::debug!(conn_id, topic = %topic, error = %e, "Subscription refused");
            ControlReply::Error {
                error: format!("Cannot subscribe to {topic}"),
            }
        }
    }
}
