//! Storage error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in the local store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage quota exceeded: used {used} of {quota} bytes")]
    QuotaExceeded { used: u64, quota: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store connection lock poisoned")]
    Lock,
}

impl StorageError {
    /// True for quota pressure, whether enforced by the store or reported by SQLite.
    pub fn is_quota_exceeded(&self) -> bool {
        match self {
            StorageError::QuotaExceeded { .. } => true,
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::DiskFull
            }
            _ => false,
        }
    }
}
