use std::time::Duration;

use quantimage_pipeline::config::{parse_or, required, var};
use quantimage_pipeline::{ConfigError, PipelineConfig, QueueBackend};

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    /// Recorded on claimed queue entries.
    pub worker_name: String,
    /// Pause between claim attempts when the queue is empty.
    pub poll_interval: Duration,
    /// Claims not renewed for this long are released and recovered.
    pub lease: Duration,
    /// How long completed queue entries are kept.
    pub queue_retention: Duration,
    /// Time between queue housekeeping sweeps.
    pub sweep_interval: Duration,
    /// Emit JSON log lines (`LOG_FORMAT=json`).
    pub json_logs: bool,
    pub pipeline: PipelineConfig,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var                   | Default          |
    /// |---------------------------|------------------|
    /// | `DATABASE_URL`            | required         |
    /// | `WORKER_NAME`             | `worker-{pid}`   |
    /// | `WORKER_POLL_INTERVAL_MS` | `500`            |
    /// | `WORKER_LEASE_SECS`       | `300`            |
    /// | `QUEUE_RETENTION_HOURS`   | `24`             |
    /// | `QUEUE_SWEEP_SECS`        | `60`             |
    /// | `LOG_FORMAT`              | `text`           |
    ///
    /// plus everything [`PipelineConfig::from_env`] reads. The queue
    /// backend is always PostgreSQL here.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut pipeline = PipelineConfig::from_lookup(&lookup)?;
        pipeline.queue_backend = QueueBackend::Postgres;

        Ok(Self {
            database_url: required(&lookup, "DATABASE_URL")?,
            worker_name: var(&lookup, "WORKER_NAME")
                .unwrap_or_else(|| format!("worker-{}", std::process::id())),
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "WORKER_POLL_INTERVAL_MS",
                500u64,
            )?),
            lease: Duration::from_secs(parse_or(&lookup, "WORKER_LEASE_SECS", 300u64)?),
            queue_retention: Duration::from_secs(
                parse_or(&lookup, "QUEUE_RETENTION_HOURS", 24u64)?.saturating_mul(3600),
            ),
            sweep_interval: Duration::from_secs(parse_or(&lookup, "QUEUE_SWEEP_SECS", 60u64)?),
            json_logs: var(&lookup, "LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
            pipeline,
        })
    }
}
