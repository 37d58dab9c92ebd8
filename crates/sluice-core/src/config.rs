use serde::{Deserialize, Serialize};

use crate::error::{Result, SluiceError};

/// Default chunk size: 2 MiB, matching the usual server-side hint.
pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;
/// Default number of simultaneously in-flight chunk uploads per task.
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SluiceConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Directory for the local resume cache.
    /// Default: platform cache dir + "sluice" (e.g. ~/.cache/sluice/).
    #[serde(default)]
    pub cache_dir: Option<String>,
}

impl SluiceConfig {
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.transfer.validate()?;
        self.pool.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the upload service, e.g. "https://files.example.com/api".
    pub base_url: String,
    /// Bearer token attached to every request, if any.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    /// Timeout for metadata calls (check, verify, merge, ...).
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Timeout for chunk-body transfers; longer than metadata calls.
    #[serde(default = "default_chunk_timeout_seconds")]
    pub chunk_timeout_seconds: u64,
}

impl ServerConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            access_token: None,
            connect_timeout_seconds: default_connect_timeout_seconds(),
            request_timeout_seconds: default_request_timeout_seconds(),
            chunk_timeout_seconds: default_chunk_timeout_seconds(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(SluiceError::Config("server.base_url must be set".into()));
        }
        if self.chunk_timeout_seconds == 0 || self.request_timeout_seconds == 0 {
            return Err(SluiceError::Config(
                "server timeouts must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Upload chunk size in bytes. Also the hash streaming granularity.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Max simultaneously in-flight chunk uploads per task (1-16).
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
    /// Adopt the server's chunk-size hint from `upload/config` when the
    /// caller did not pin one explicitly.
    #[serde(default = "default_honor_server_chunk_size")]
    pub honor_server_chunk_size: bool,
    /// Run `upload/validate` after a successful merge.
    #[serde(default = "default_validate_after_merge")]
    pub validate_after_merge: bool,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            honor_server_chunk_size: default_honor_server_chunk_size(),
            validate_after_merge: default_validate_after_merge(),
            retry: RetryConfig::default(),
        }
    }
}

impl TransferConfig {
    fn validate(&self) -> Result<()> {
        if !(4 * 1024..=256 * 1024 * 1024).contains(&self.chunk_size) {
            return Err(SluiceError::Config(format!(
                "transfer.chunk_size must be in [4 KiB, 256 MiB], got {}",
                self.chunk_size
            )));
        }
        if !(1..=16).contains(&self.max_concurrent_uploads) {
            return Err(SluiceError::Config(format!(
                "transfer.max_concurrent_uploads must be in [1, 16], got {}",
                self.max_concurrent_uploads
            )));
        }
        self.retry.validate()
    }
}

/// Retry budget for transiently-failing chunk uploads: exponential
/// backoff with jitter, doubling from `retry_delay_ms` up to
/// `retry_max_delay_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_retries > 10 {
            return Err(SluiceError::Config(format!(
                "transfer.retry.max_retries must be at most 10, got {}",
                self.max_retries
            )));
        }
        if self.retry_delay_ms == 0 {
            return Err(SluiceError::Config(
                "transfer.retry.retry_delay_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Max hash worker threads (0 = host's available parallelism, min 2).
    #[serde(default)]
    pub max_workers: usize,
    /// Max outstanding tasks per worker before overflow queueing.
    #[serde(default = "default_max_tasks_per_worker")]
    pub max_tasks_per_worker: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            max_tasks_per_worker: default_max_tasks_per_worker(),
        }
    }
}

impl PoolConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_workers > 64 {
            return Err(SluiceError::Config(format!(
                "pool.max_workers must be at most 64, got {}",
                self.max_workers
            )));
        }
        if !(1..=64).contains(&self.max_tasks_per_worker) {
            return Err(SluiceError::Config(format!(
                "pool.max_tasks_per_worker must be in [1, 64], got {}",
                self.max_tasks_per_worker
            )));
        }
        Ok(())
    }

    /// Resolve `max_workers == 0` to the host's reported parallelism.
    pub fn effective_max_workers(&self) -> usize {
        if self.max_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        } else {
            self.max_workers
        }
    }
}

/// Load and validate a config file (YAML).
pub fn load_config(path: &std::path::Path) -> Result<SluiceConfig> {
    let raw = std::fs::read_to_string(path).map_err(SluiceError::Io)?;
    let config: SluiceConfig = serde_yaml::from_str(&raw)
        .map_err(|e| SluiceError::Config(format!("{}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

fn default_connect_timeout_seconds() -> u64 {
    30
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_chunk_timeout_seconds() -> u64 {
    60
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_max_concurrent_uploads() -> usize {
    DEFAULT_UPLOAD_CONCURRENCY
}

fn default_honor_server_chunk_size() -> bool {
    true
}

fn default_validate_after_merge() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_max_tasks_per_worker() -> usize {
    5
}
