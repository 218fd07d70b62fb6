//! Sync error types.

use sitehero_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network hiccup, timeout or server overload. Retried with backoff.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Permanently rejected. Never retried automatically.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Local storage is full even after eviction.
    #[error("storage full: used {used} of {quota} bytes")]
    QuotaExceeded { used: u64, quota: u64 },

    /// Session is no longer valid. Draining pauses until re-authentication.
    #[error("authentication expired")]
    AuthExpired,

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("sync manager not running")]
    ChannelClosed,
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::QuotaExceeded { used, quota } => SyncError::QuotaExceeded { used, quota },
            other => SyncError::Storage(other),
        }
    }
}

impl SyncError {
    /// True if the operation may succeed when retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }
}

/// Failure of a whole batch send, as reported by a [`crate::RemoteService`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("request timed out")]
    Timeout,

    #[error("authentication expired")]
    AuthExpired,

    #[error("batch rejected: {0}")]
    Validation(String),
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Transient(msg) => SyncError::TransientNetwork(msg),
            RemoteError::Timeout => SyncError::TransientNetwork("request timed out".to_string()),
            RemoteError::AuthExpired => SyncError::AuthExpired,
            RemoteError::Validation(msg) => SyncError::Validation(msg),
        }
    }
}
