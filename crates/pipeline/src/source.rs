//! Imaging source collaborator: downloads a study's DICOM instances.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::catalog::AccessToken;

/// DICOM tag: Modality.
const TAG_MODALITY: &str = "00080060";
/// DICOM tag: SeriesInstanceUID.
const TAG_SERIES_UID: &str = "0020000E";
/// DICOM tag: SOPInstanceUID.
const TAG_INSTANCE_UID: &str = "00080018";

/// Modalities the feature backends consume.
pub const SUPPORTED_MODALITIES: &[&str] = &["PT", "CT", "MR", "RTSTRUCT"];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Archive returned HTTP {status} for {url}")]
    Api { status: u16, url: String },

    #[error("Malformed multipart response: {0}")]
    Multipart(String),

    #[error("Failed to write instance: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ImagingSource: Send + Sync {
    /// Download every supported instance of `study_uid` into `dest`.
    /// Returns the number of files written.
    async fn fetch(
        &self,
        study_uid: &str,
        token: &AccessToken,
        dest: &Path,
    ) -> Result<usize, SourceError>;
}

// ---------------------------------------------------------------------------
// DICOMweb
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DicomAttribute {
    #[serde(rename = "Value", default)]
    value: Vec<serde_json::Value>,
}

type InstanceMetadata = HashMap<String, DicomAttribute>;

fn first_string<'a>(entry: &'a InstanceMetadata, tag: &str) -> Option<&'a str> {
    entry.get(tag)?.value.first()?.as_str()
}

/// WADO-RS client: reads study metadata, then retrieves each instance.
pub struct DicomWebSource {
    client: reqwest::Client,
    base_url: String,
}

impl DicomWebSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Instance URLs of the supported modalities, from study metadata.
    fn instance_urls(&self, study_uid: &str, metadata: &[InstanceMetadata]) -> Vec<(String, String)> {
        metadata
            .iter()
            .filter(|entry| {
                first_string(entry, TAG_MODALITY).is_some_and(|m| SUPPORTED_MODALITIES.contains(&m))
            })
            .filter_map(|entry| {
                let series = first_string(entry, TAG_SERIES_UID)?;
                let instance = first_string(entry, TAG_INSTANCE_UID)?;
                Some((
                    instance.to_string(),
                    format!(
                        "{}/studies/{study_uid}/series/{series}/instances/{instance}",
                        self.base_url
                    ),
                ))
            })
            .collect()
    }

    async fn get(&self, url: &str, token: &AccessToken) -> Result<reqwest::Response, SourceError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(token.secret())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SourceError::Api {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ImagingSource for DicomWebSource {
    async fn fetch(
        &self,
        study_uid: &str,
        token: &AccessToken,
        dest: &Path,
    ) -> Result<usize, SourceError> {
        let metadata_url = format!("{}/studies/{study_uid}/metadata", self.base_url);
        let metadata: Vec<InstanceMetadata> = self.get(&metadata_url, token).await?.json().await?;

        let urls = self.instance_urls(study_uid, &metadata);
        tracing::debug!(study_uid, instances = urls.len(), "Downloading study instances");

        for (instance_uid, url) in &urls {
            let response = self.get(url, token).await?;
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let body = response.bytes().await?;
            let content = first_multipart_part(&content_type, &body)?;
            tokio::fs::write(dest.join(instance_uid.replace('/', "_")), content).await?;
        }

        Ok(urls.len())
    }
}

// ---------------------------------------------------------------------------
// Local directory
// ---------------------------------------------------------------------------

/// Copies `{root}/{study_uid}/*` into the workspace. For local runs
/// without an imaging archive.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ImagingSource for DirectorySource {
    async fn fetch(
        &self,
        study_uid: &str,
        _token: &AccessToken,
        dest: &Path,
    ) -> Result<usize, SourceError> {
        if study_uid.contains(['/', '\\']) || study_uid.starts_with('.') {
            return Err(SourceError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid study UID '{study_uid}'"),
            )));
        }
        let mut entries = tokio::fs::read_dir(self.root.join(study_uid)).await?;
        let mut copied = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                tokio::fs::copy(entry.path(), dest.join(entry.file_name())).await?;
                copied += 1;
            }
        }
        Ok(copied)
    }
}

/// Body of the first part of a `multipart/related` response.
///
/// Non-multipart responses are returned unchanged.
pub(crate) fn first_multipart_part<'a>(
    content_type: &str,
    body: &'a [u8],
) -> Result<&'a [u8], SourceError> {
    if !content_type.starts_with("multipart/") {
        return Ok(body);
    }

    let boundary = content_type
        .split(';')
        .map(str::trim)
        .find_map(|p| p.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"'))
        .ok_or_else(|| SourceError::Multipart("missing boundary".to_string()))?;
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let start = find(body, delimiter)
        .ok_or_else(|| SourceError::Multipart("opening delimiter not found".to_string()))?
        + delimiter.len();
    let headers_end = find(&body[start..], b"\r\n\r\n")
        .ok_or_else(|| SourceError::Multipart("part headers not terminated".to_string()))?
        + start
        + 4;
    let end = find(&body[headers_end..], delimiter)
        .ok_or_else(|| SourceError::Multipart("closing delimiter not found".to_string()))?
        + headers_end;

    let part = &body[headers_end..end];
    Ok(part.strip_suffix(b"\r\n").unwrap_or(part))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
