use thiserror::Error;

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    /// Manifest or chunk object absent. Recoverable for deletes.
    #[error("not found: {0}")]
    NotFound(String),

    /// Remote-side failure after retries (network, timeout, backend error).
    #[error("remote {remote}: {message}")]
    Remote { remote: String, message: String },

    /// Size mismatch, corrupt manifest, failed reconstruction.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Invalid configuration (replication factor, shard counts, ...).
    #[error("policy error: {0}")]
    Policy(String),

    #[error("authentication failed")]
    Auth,

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PoolError {
    pub fn remote(remote: impl Into<String>, message: impl std::fmt::Display) -> Self {
        PoolError::Remote {
            remote: remote.into(),
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PoolError::NotFound(_))
    }

    /// Transient failures worth retrying with backoff. Auth, policy, and
    /// cancellation are surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Remote { .. } | PoolError::Io(_))
    }
}
