use std::sync::Arc;

use quantimage_db::DbPool;
use quantimage_pipeline::ExtractionContext;

use crate::config::ServerConfig;
use crate::ws::WsManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable: everything is behind `Arc` or already `Clone`.
#[derive(Clone)]
pub struct AppState {
    /// Extraction runtime: stores, dispatcher, aggregator, bus.
    pub ctx: Arc<ExtractionContext>,
    pub config: Arc<ServerConfig>,
    /// WebSocket connection manager (browser clients).
    pub ws_manager: Arc<WsManager>,
    /// Database pool, absent when running on in-memory stores.
    pub pool: Option<DbPool>,
}
