//! Feature computation collaborator.
//!
//! [`CommandFeatureComputer`] runs one executable per feature family from
//! a backend directory. Each backend receives the prepared input directory
//! and the family configuration as JSON, and prints its feature map as a
//! JSON object on the last line of stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use quantimage_core::features::FeatureMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Maximum stdout or stderr size captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Characters of stderr kept in error messages.
const STDERR_TAIL_CHARS: usize = 2000;

/// Input ready for feature computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedInput {
    pub dir: PathBuf,
    pub file_count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("Input directory contains no files")]
    NoInput,

    #[error("No backend installed for feature family '{0}'")]
    UnknownBackend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Backend exited with code {exit_code}: {stderr}")]
    Failed { exit_code: i32, stderr: String },

    #[error("Backend output is not a JSON object: {0}")]
    Output(String),
}

#[async_trait]
pub trait FeatureComputer: Send + Sync {
    async fn preprocess(&self, dir: &Path) -> Result<PreparedInput, ComputeError>;

    async fn compute(
        &self,
        input: &PreparedInput,
        family: &str,
        config: &serde_json::Value,
    ) -> Result<FeatureMap, ComputeError>;
}

// ---------------------------------------------------------------------------
// CommandFeatureComputer
// ---------------------------------------------------------------------------

pub struct CommandFeatureComputer {
    backend_dir: PathBuf,
    timeout: Duration,
}

impl CommandFeatureComputer {
    pub fn new(backend_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            backend_dir: backend_dir.into(),
            timeout,
        }
    }

    fn backend_path(&self, family: &str) -> Result<PathBuf, ComputeError> {
        if family.is_empty() || family.contains(['/', '\\', '.']) {
            return Err(ComputeError::UnknownBackend(family.to_string()));
        }
        let path = self.backend_dir.join(family);
        if !path.is_file() {
            return Err(ComputeError::UnknownBackend(family.to_string()));
        }
        Ok(path)
    }
}

#[async_trait]
impl FeatureComputer for CommandFeatureComputer {
    async fn preprocess(&self, dir: &Path) -> Result<PreparedInput, ComputeError> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut file_count = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                file_count += 1;
            }
        }
        if file_count == 0 {
            return Err(ComputeError::NoInput);
        }
        Ok(PreparedInput {
            dir: dir.to_path_buf(),
            file_count,
        })
    }

    async fn compute(
        &self,
        input: &PreparedInput,
        family: &str,
        config: &serde_json::Value,
    ) -> Result<FeatureMap, ComputeError> {
        let program = self.backend_path(family)?;
        let mut cmd = Command::new(program);
        cmd.arg(&input.dir).arg(config.to_string());

        let stdout = run_backend(&mut cmd, self.timeout).await?;
        parse_last_line(&stdout)
    }
}

/// Spawn the backend, capture its output and enforce the timeout.
///
/// `kill_on_drop(true)` kills the child when the timeout drops it.
async fn run_backend(cmd: &mut Command, timeout: Duration) -> Result<String, ComputeError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = cmd.spawn()?;

    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();
    let stdout_task = tokio::spawn(async move { read_stream(stdout_handle).await });
    let stderr_task = tokio::spawn(async move { read_stream(stderr_handle).await });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(result) => result?,
        Err(_elapsed) => {
            return Err(ComputeError::Timeout {
                elapsed_ms: start.elapsed().as_millis() as u64,
            })
        }
    };

    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

    if !status.success() {
        return Err(ComputeError::Failed {
            exit_code: status.code().unwrap_or(-1),
            stderr: tail(&stderr, STDERR_TAIL_CHARS),
        });
    }
    Ok(stdout)
}

/// Read an entire output stream, keeping at most [`MAX_OUTPUT_BYTES`].
///
/// The rest is read and discarded so the child never blocks on a full
/// pipe.
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
        if let Ok(discarded) = tokio::io::copy(&mut h, &mut tokio::io::sink()).await {
            if discarded > 0 {
                tracing::warn!(discarded, "Feature backend output exceeded the capture limit");
            }
        }
    }
    buf
}

fn tail(s: &str, max_chars: usize) -> String {
    let trimmed = s.trim();
    let count = trimmed.chars().count();
    trimmed.chars().skip(count.saturating_sub(max_chars)).collect()
}

/// Parse the last non-empty stdout line as a JSON object.
fn parse_last_line(stdout: &str) -> Result<FeatureMap, ComputeError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| ComputeError::Output("empty output".to_string()))?;
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(ComputeError::Output(format!("expected object, got {other}"))),
        Err(e) => Err(ComputeError::Output(e.to_string())),
    }
}
