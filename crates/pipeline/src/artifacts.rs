//! Feature artifact storage on the local filesystem.
//!
//! Layout: `{root}/{owner}/{study_uid}/{task_id}.json`. The returned
//! result reference is the path relative to `root`.

use std::path::{Component, Path, PathBuf};

use quantimage_core::features::FeatureMap;
use quantimage_core::types::DbId;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Invalid path component '{0}'")]
    InvalidComponent(String),

    #[error("Invalid result reference '{0}'")]
    InvalidReference(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed feature file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write the features of one task and return its result reference.
    ///
    /// The file is written under a temporary name and renamed into place,
    /// so readers never observe a partial file.
    pub async fn write(
        &self,
        owner: &str,
        study_uid: &str,
        task_id: DbId,
        features: &FeatureMap,
    ) -> Result<String, ArtifactError> {
        let relative = PathBuf::from(safe_component(owner)?)
            .join(safe_component(study_uid)?)
            .join(format!("{task_id}.json"));
        let path = self.root.join(&relative);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(features)?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        Ok(relative.to_string_lossy().into_owned())
    }

    /// Read back the features behind a result reference.
    pub async fn read(&self, result_ref: &str) -> Result<FeatureMap, ArtifactError> {
        let relative = Path::new(result_ref);
        let is_contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if result_ref.is_empty() || !is_contained {
            return Err(ArtifactError::InvalidReference(result_ref.to_string()));
        }
        let bytes = tokio::fs::read(self.root.join(relative)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn safe_component(value: &str) -> Result<&str, ArtifactError> {
    let invalid = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0']);
    if invalid {
        return Err(ArtifactError::InvalidComponent(value.to_string()));
    }
    Ok(value)
}
