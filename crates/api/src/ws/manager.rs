use std::collections::{HashMap, HashSet};

use axum::body::Bytes;
use axum::extract::ws::Message;
use quantimage_core::job_events::{ExtractionEvent, Topic};
use quantimage_core::types::Timestamp;
use tokio::sync::{mpsc, RwLock};

/// Channel sender half for pushing messages to a WebSocket connection.
pub type WsSender = mpsc::UnboundedSender<Message>;

/// Metadata for a single WebSocket connection.
pub struct WsConnection {
    /// Caller identity supplied at upgrade time.
    pub user_id: Option<String>,
    /// Channel sender for outbound messages to this connection.
    pub sender: WsSender,
    pub connected_at: Timestamp,
    /// Topics this connection receives events for.
    pub topics: HashSet<Topic>,
}

/// Manages all active WebSocket connections and their subscriptions.
///
/// Thread-safe via interior `RwLock`; wrapped in `Arc` and shared across
/// the application.
pub struct WsManager {
    connections: RwLock<HashMap<String, WsConnection>>,
}

impl WsManager {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new connection.
    ///
    /// Returns the receiver half of the message channel so the caller can
    /// forward messages to the WebSocket sink.
    pub async fn add(
        &self,
        conn_id: String,
        user_id: Option<String>,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = WsConnection {
            user_id,
            sender: tx,
            connected_at: chrono::Utc::now(),
            topics: HashSet::new(),
        };
        self.connections.write().await.insert(conn_id, conn);
        rx
    }

    pub async fn remove(&self, conn_id: &str) {
        self.connections.write().await.remove(conn_id);
    }

    /// Add `topic` to a connection. Returns `false` for unknown connections.
    pub async fn subscribe(&self, conn_id: &str, topic: Topic) -> bool {
        match self.connections.write().await.get_mut(conn_id) {
            Some(conn) => {
                conn.topics.insert(topic);
                true
            }
            None => false,
        }
    }

    /// Remove `topic` from a connection. Returns `true` if it was subscribed.
    pub async fn unsubscribe(&self, conn_id: &str, topic: Topic) -> bool {
        self.connections
            .write()
            .await
            .get_mut(conn_id)
            .is_some_and(|conn| conn.topics.remove(&topic))
    }

    pub async fn topics(&self, conn_id: &str) -> Vec<Topic> {
        self.connections
            .read()
            .await
            .get(conn_id)
            .map(|conn| conn.topics.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Send `message` to one connection. Returns `false` if it is gone.
    pub async fn send_to(&self, conn_id: &str, message: Message) -> bool {
        self.connections
            .read()
            .await
            .get(conn_id)
            .is_some_and(|conn| conn.sender.send(message).is_ok())
    }

    /// Deliver `message` to every connection subscribed to a topic that
    /// `event` matches. Each connection receives it at most once.
    ///
    /// Returns the number of connections the message was sent to.
    pub async fn dispatch(&self, event: &ExtractionEvent, message: Message) -> usize {
        let conns = self.connections.read().await;
        let mut count = 0;
        for conn in conns.values() {
            if conn.topics.iter().any(|topic| event.matches(topic)) {
                let _ = conn.sender.send(message.clone());
                count += 1;
            }
        }
        count
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send a Close frame to every connection, then clear the map.
    pub async fn shutdown_all(&self) {
        let mut conns = self.connections.write().await;
        let count = conns.len();
        for conn in conns.values() {
            let _ = conn.sender.send(Message::Close(None));
        }
        conns.clear();
        tracing::info!(count, "Closed all WebSocket connections");
    }

    /// Send a Ping frame to every connected client.
    pub async fn ping_all(&self) {
        let conns = self.connections.read().await;
        for conn in conns.values() {
            let _ = conn.sender.send(Message::Ping(Bytes::new()));
        }
    }
}

impl Default for WsManager {
    fn default() -> Self {
        Self::new()
    }
}
