//! Study catalog and identity collaborator.
//!
//! Resolves an album to the studies it contains and hands out access
//! tokens the executor uses to download a user's studies.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

/// DICOM tag holding the StudyInstanceUID.
pub const TAG_STUDY_INSTANCE_UID: &str = "0020000D";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// Bearer token used against the imaging archive. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Catalog returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Album '{0}' not found")]
    UnknownAlbum(String),

    #[error("No credentials available for user '{0}'")]
    NoCredentials(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Study UIDs contained in `album_id`, as visible to `owner`.
    async fn resolve_album(&self, album_id: &str, owner: &str)
        -> Result<Vec<String>, CatalogError>;

    /// Token granting access to `owner`'s studies.
    async fn delegated_token(&self, owner: &str) -> Result<AccessToken, CatalogError>;
}

// ---------------------------------------------------------------------------
// HttpCatalog
// ---------------------------------------------------------------------------

/// DICOMweb catalog: `GET {base}/studies?album={id}`.
///
/// Authenticates with a service token and forwards the owner in
/// `X-User-Id`; the same service token is delegated to executors.
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
    service_token: Option<AccessToken>,
}

#[derive(Debug, Deserialize)]
struct DicomAttribute {
    #[serde(rename = "Value", default)]
    value: Vec<serde_json::Value>,
}

impl HttpCatalog {
    pub fn new(
        base_url: impl Into<String>,
        service_token: Option<String>,
    ) -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_token: service_token.map(AccessToken::new),
        })
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn resolve_album(
        &self,
        album_id: &str,
        owner: &str,
    ) -> Result<Vec<String>, CatalogError> {
        let mut request = self
            .client
            .get(format!("{}/studies", self.base_url))
            .query(&[("album", album_id)])
            .header("X-User-Id", owner);
        if let Some(token) = &self.service_token {
            request = request.bearer_auth(token.secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CatalogError::UnknownAlbum(album_id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::Api {
                status: status.as_u16(),
                body,
            });
        }

        // DICOMweb returns 204 for an empty result set.
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }

        let studies: Vec<HashMap<String, DicomAttribute>> = response.json().await?;
        Ok(study_uids(&studies))
    }

    async fn delegated_token(&self, owner: &str) -> Result<AccessToken, CatalogError> {
        self.service_token
            .clone()
            .ok_or_else(|| CatalogError::NoCredentials(owner.to_string()))
    }
}

fn study_uids(studies: &[HashMap<String, DicomAttribute>]) -> Vec<String> {
    studies
        .iter()
        .filter_map(|study| study.get(TAG_STUDY_INSTANCE_UID))
        .filter_map(|attr| attr.value.first())
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

// ---------------------------------------------------------------------------
// StaticCatalog
// ---------------------------------------------------------------------------

/// Fixed album map with a single shared token, for local runs and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    albums: HashMap<String, Vec<String>>,
    token: Option<AccessToken>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_album(mut self, album_id: impl Into<String>, studies: &[&str]) -> Self {
        self.albums.insert(
            album_id.into(),
            studies.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(AccessToken::new(token));
        self
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn resolve_album(
        &self,
        album_id: &str,
        _owner: &str,
    ) -> Result<Vec<String>, CatalogError> {
        self.albums
            .get(album_id)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownAlbum(album_id.to_string()))
    }

    async fn delegated_token(&self, owner: &str) -> Result<AccessToken, CatalogError> {
        self.token
            .clone()
            .ok_or_else(|| CatalogError::NoCredentials(owner.to_string()))
    }
}
