//! Environment-driven configuration shared by the API and worker binaries.
//!
//! Values are read through a lookup function so tests can supply a map
//! instead of mutating the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::context::{PipelineConfig, QueueBackend};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is required")]
    Missing { name: &'static str },

    #[error("{name} has an invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Read a variable; blank values count as unset.
pub fn var<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a variable, falling back to `default` when it is unset.
pub fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(lookup, name) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}

/// A variable that must be present.
pub fn required<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    var(lookup, name).ok_or(ConfigError::Missing { name })
}

impl PipelineConfig {
    /// Load from the process environment.
    ///
    /// | Env Var                | Default           |
    /// |------------------------|-------------------|
    /// | `FEATURES_DIR`         | `./data/features` |
    /// | `FEATURE_BACKEND_DIR`  | `./backends`      |
    /// | `FEATURE_TIMEOUT_SECS` | `1800`            |
    /// | `CATALOG_URL`          | unset             |
    /// | `CATALOG_TOKEN`        | unset             |
    /// | `STUDIES_DIR`          | `./data/studies`  |
    /// | `STATUS_SERVICE_URL`   | unset             |
    /// | `QUEUE_BACKEND`        | `local`           |
    /// | `WORKER_CONCURRENCY`   | `4`               |
    /// | `REUSE_POLICY`         | `reuse_active`    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let worker_concurrency: usize =
            parse_or(&lookup, "WORKER_CONCURRENCY", defaults.worker_concurrency)?;
        if worker_concurrency == 0 {
            return Err(ConfigError::Invalid {
                name: "WORKER_CONCURRENCY",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            features_dir: parse_or(&lookup, "FEATURES_DIR", defaults.features_dir)?,
            feature_backend_dir: parse_or(
                &lookup,
                "FEATURE_BACKEND_DIR",
                defaults.feature_backend_dir,
            )?,
            feature_timeout: Duration::from_secs(parse_or(
                &lookup,
                "FEATURE_TIMEOUT_SECS",
                defaults.feature_timeout.as_secs(),
            )?),
            catalog_url: var(&lookup, "CATALOG_URL"),
            catalog_token: var(&lookup, "CATALOG_TOKEN"),
            studies_dir: parse_or::<_, PathBuf>(&lookup, "STUDIES_DIR", defaults.studies_dir)?,
            status_service_url: var(&lookup, "STATUS_SERVICE_URL"),
            queue_backend: parse_or::<_, QueueBackend>(
                &lookup,
                "QUEUE_BACKEND",
                defaults.queue_backend,
            )?,
            worker_concurrency,
            reuse_policy: parse_or(&lookup, "REUSE_POLICY", defaults.reuse_policy)?,
        })
    }
}
