//! Read-only task state backend served by a remote status service.
//!
//! The service answers `GET {base}/tasks/{id}/state` with a JSON
//! [`TaskState`], or 404 for unknown tasks.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use quantimage_core::extraction::TaskState;
use quantimage_core::types::DbId;

use crate::store::{StoreError, TaskStateReader};

/// HTTP request timeout for a single state lookup.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpTaskStateReader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTaskStateReader {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn state_url(&self, task_id: DbId) -> String {
        format!("{}/tasks/{task_id}/state", self.base_url)
    }
}

#[async_trait]
impl TaskStateReader for HttpTaskStateReader {
    async fn get(&self, task_id: DbId) -> Result<Option<TaskState>, StoreError> {
        let response = self.client.get(self.state_url(task_id)).send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Some(response.json::<TaskState>().await?))
    }

    async fn get_many(&self, task_ids: &[DbId]) -> Result<HashMap<DbId, TaskState>, StoreError> {
        let lookups = task_ids.iter().map(|id| async move {
            self.get(*id).await.map(|state| state.map(|s| (*id, s)))
        });
        Ok(try_join_all(lookups).await?.into_iter().flatten().collect())
    }
}
