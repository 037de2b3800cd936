#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use quantimage_api::config::ServerConfig;
use quantimage_api::router::build_app_router;
use quantimage_api::state::AppState;
use quantimage_api::ws::WsManager;
use quantimage_core::features::FeatureMap;
use quantimage_pipeline::catalog::{AccessToken, StaticCatalog};
use quantimage_pipeline::compute::{ComputeError, FeatureComputer, PreparedInput};
use quantimage_pipeline::source::{ImagingSource, SourceError};
use quantimage_pipeline::{
    ExtractionContext, MemoryStore, PipelineConfig, QueueError, TaskInvocation, WorkQueue,
};

pub const OWNER: &str = "alice";
pub const INTRUDER: &str = "mallory";

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
        follow_timeout_secs: 5,
        database_url: "postgres://unused".to_string(),
        json_logs: false,
        pipeline: PipelineConfig::default(),
    }
}

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

struct FakeSource;

#[async_trait]
impl ImagingSource for FakeSource {
    async fn fetch(
        &self,
        _study_uid: &str,
        _token: &AccessToken,
        dest: &Path,
    ) -> Result<usize, SourceError> {
        tokio::fs::write(dest.join("ct.dcm"), b"CT").await?;
        Ok(1)
    }
}

struct FakeComputer;

#[async_trait]
impl FeatureComputer for FakeComputer {
    async fn preprocess(&self, dir: &Path) -> Result<PreparedInput, ComputeError> {
        Ok(PreparedInput {
            dir: dir.to_path_buf(),
            file_count: 1,
        })
    }

    async fn compute(
        &self,
        _input: &PreparedInput,
        family: &str,
        _config: &serde_json::Value,
    ) -> Result<FeatureMap, ComputeError> {
        let mut map = FeatureMap::new();
        map.insert(format!("{family}_mean"), serde_json::json!(2.5));
        Ok(map)
    }
}

/// Accepts every submission and never runs it, so tasks stay `QUEUED`.
#[derive(Default)]
pub struct ParkedQueue;

#[async_trait]
impl WorkQueue for ParkedQueue {
    async fn submit(&self, _invocation: TaskInvocation) -> Result<(), QueueError> {
        Ok(())
    }

    async fn withdraw(&self, _task_id: quantimage_core::types::DbId) -> Result<bool, QueueError> {
        Ok(true)
    }

    async fn is_pending(&self, _task_id: quantimage_core::types::DbId) -> Result<bool, QueueError> {
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

pub struct TestApp {
    pub router: Router,
    pub ctx: Arc<ExtractionContext>,
    _features: TempDir,
}

/// How dispatched tasks are handled in a test app.
pub enum Execution {
    /// Tasks run on the in-process pool.
    Local,
    /// Tasks are accepted and left queued.
    Parked,
}

/// Build the full application router over in-memory stores.
pub fn build_test_app(execution: Execution) -> TestApp {
    let features = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let catalog = StaticCatalog::new()
        .with_token("service-token")
        .with_album("lung", &["1.1", "1.2", "1.3"])
        .with_album("empty", &[]);

    let mut builder = ExtractionContext::builder()
        .extraction_store(store.clone())
        .state_store(store)
        .catalog(Arc::new(catalog))
        .source(Arc::new(FakeSource))
        .computer(Arc::new(FakeComputer))
        .artifacts_dir(features.path())
        .worker_concurrency(2);
    if let Execution::Parked = execution {
        builder = builder.queue(Arc::new(ParkedQueue));
    }
    let ctx = Arc::new(builder.build().unwrap());

    let config = test_config();
    let state = AppState {
        ctx: Arc::clone(&ctx),
        config: Arc::new(config.clone()),
        ws_manager: Arc::new(WsManager::new()),
        pool: None,
    };

    TestApp {
        router: build_app_router(state, &config),
        ctx,
        _features: features,
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

/// Collect a response body as JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Send an unauthenticated GET.
pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

/// Send a GET as `user`.
pub async fn get_as(app: Router, uri: &str, user: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header("x-user-id", user)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

/// Send a POST with a JSON body as `user`.
pub async fn post_json_as(
    app: Router,
    uri: &str,
    body: serde_json::Value,
    user: &str,
) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-user-id", user)
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub fn pyradiomics() -> serde_json::Value {
    serde_json::json!({ "families": { "pyradiomics": { "binWidth": 25 } } })
}
