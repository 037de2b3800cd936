//! WebSocket infrastructure for live extraction updates.
//!
//! Provides connection management with per-connection topic
//! subscriptions, heartbeat monitoring, the bus-to-socket event forwarder
//! and the HTTP upgrade handler.

pub mod forwarder;
mod handler;
mod heartbeat;
pub mod manager;

pub use handler::ws_handler;
pub use heartbeat::start_heartbeat;
pub use manager::WsManager;
