//! Error taxonomy for the memory engine.
//!
//! Every fallible engine operation returns [`Result`]. Callers distinguish
//! caller mistakes ([`MemoryError::Validation`]) from missing data
//! ([`MemoryError::NotFound`]), lost optimistic races ([`MemoryError::Conflict`])
//! and backend trouble ([`MemoryError::Storage`], [`MemoryError::Indexing`]).

use thiserror::Error;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflicting write on {key}: expected version {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("indexing failed: {0}")]
    Indexing(String),

    #[error("graph integrity violated: {0}")]
    GraphIntegrity(String),

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("storage error: {0}")]
    Storage(rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl MemoryError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn indexing(msg: impl Into<String>) -> Self {
        Self::Indexing(msg.into())
    }

    /// Whether a background worker should retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Indexing(_) | Self::Io(_) => true,
            Self::Storage(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DiskFull) => Self::Capacity(format!("database full: {e}")),
            Some(rusqlite::ErrorCode::TooBig) => Self::Capacity(format!("value too large: {e}")),
            _ => Self::Storage(e),
        }
    }
}

impl From<tokio::task::JoinError> for MemoryError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Io(std::io::Error::other(format!("background task failed: {e}")))
    }
}
