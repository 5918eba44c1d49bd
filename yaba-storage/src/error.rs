//! Error types for the storage layer.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The entity store could not be read or written.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A document on disk is not valid JSON for its kind.
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization error for values stored in the database.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A cache rebuild is already running.
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// The cache may not be queried in its current state.
    #[error("cache is unusable while {state}")]
    CacheUnusable { state: String },

    /// Entity not found.
    #[error("entity not found: {0}")]
    NotFound(String),

    /// Invalid data.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl From<yaba_types::Error> for StorageError {
    fn from(err: yaba_types::Error) -> Self {
        Self::InvalidData(err.to_string())
    }
}
