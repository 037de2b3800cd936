use quantimage_pipeline::config::{parse_or, required, var};
use quantimage_pipeline::{ConfigError, PipelineConfig};

/// Server configuration loaded from environment variables.
///
/// All fields except the database URL have defaults suitable for local
/// development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`). Follow requests
    /// and WebSocket upgrades are exempt.
    pub request_timeout_secs: u64,
    /// Grace period for background services on shutdown (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// Upper bound for `GET /extractions/{id}/follow` (default: `600`).
    pub follow_timeout_secs: u64,
    pub database_url: String,
    /// Emit JSON log lines (`LOG_FORMAT=json`).
    pub json_logs: bool,
    pub pipeline: PipelineConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default                 |
    /// |-------------------------|-------------------------|
    /// | `HOST`                  | `0.0.0.0`               |
    /// | `PORT`                  | `3000`                  |
    /// | `CORS_ORIGINS`          | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS`  | `30`                    |
    /// | `SHUTDOWN_TIMEOUT_SECS` | `30`                    |
    /// | `FOLLOW_TIMEOUT_SECS`   | `600`                   |
    /// | `DATABASE_URL`          | required                |
    /// | `LOG_FORMAT`            | `text`                  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cors_origins = var(&lookup, "CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            host: var(&lookup, "HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "PORT", 3000)?,
            cors_origins,
            request_timeout_secs: parse_or(&lookup, "REQUEST_TIMEOUT_SECS", 30)?,
            shutdown_timeout_secs: parse_or(&lookup, "SHUTDOWN_TIMEOUT_SECS", 30)?,
            follow_timeout_secs: parse_or(&lookup, "FOLLOW_TIMEOUT_SECS", 600)?,
            database_url: required(&lookup, "DATABASE_URL")?,
            json_logs: var(&lookup, "LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
            pipeline: PipelineConfig::from_lookup(&lookup)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;
    use quantimage_pipeline::QueueBackend;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        ServerConfig::from_lookup(|name| map.get(name).map(|v| v.to_string()))
    }

    #[test]
    fn defaults() {
        let config = load(&[("DATABASE_URL", "postgres://localhost/q")]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.cors_origins, vec!["http://localhost:5173".to_string()]);
        assert_eq!(config.follow_timeout_secs, 600);
        assert_eq!(config.pipeline.queue_backend, QueueBackend::Local);
        assert!(!config.json_logs);
    }

    #[test]
    fn cors_origins_are_split_and_trimmed() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/q"),
            ("CORS_ORIGINS", "http://a.test, http://b.test,,"),
        ])
        .unwrap();
        assert_eq!(config.cors_origins, vec!["http://a.test", "http://b.test"]);
    }

    #[test]
    fn invalid_port_is_rejected() {
        assert_matches!(
            load(&[("DATABASE_URL", "postgres://localhost/q"), ("PORT", "http")]),
            Err(ConfigError::Invalid { name: "PORT", .. })
        );
    }
}
