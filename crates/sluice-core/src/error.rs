use thiserror::Error;

use crate::task::UploadStatus;

pub type Result<T> = std::result::Result<T, SluiceError>;

#[derive(Debug, Error)]
pub enum SluiceError {
    #[error("chunk read error: {0}")]
    HashRead(String),

    #[error("hash worker crashed: {0}")]
    WorkerFatal(String),

    #[error("worker pool is shut down")]
    PoolShutdown,

    #[error("network error: {0}")]
    Network(String),

    #[error("server rejected request: HTTP {status}: {message}")]
    Server { status: u16, message: String },

    #[error("chunk validation failed: {0}")]
    Validation(String),

    #[error("upload cancelled")]
    Cancelled,

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: UploadStatus,
        to: UploadStatus,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl SluiceError {
    /// Whether this error is transient and worth retrying.
    ///
    /// Transport-level failures always are; server rejections only for
    /// 429 and 5xx. Local read errors and protocol errors never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            SluiceError::Network(_) => true,
            SluiceError::Server { status, .. } => *status == 429 || *status >= 500,
            SluiceError::Io(e) => is_retryable_io(e),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SluiceError::Cancelled)
    }
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}
