//! Error types for the sync layer.

use thiserror::Error;
use yaba_storage::StorageError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Local storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The peer sent a malformed or out-of-sequence message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A snapshot the merge needs is missing.
    #[error("merge impossible: {0}")]
    MergeImpossible(String),

    /// Network error.
    #[error("network error: {0}")]
    Network(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,

    /// The session was cancelled locally.
    #[error("sync cancelled")]
    Cancelled,

    /// The peer reported an error.
    #[error("peer error {code}: {message}")]
    PeerError { code: u32, message: String },
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::ChannelClosed,
            std::io::ErrorKind::InvalidData => Self::Protocol(e.to_string()),
            _ => Self::Network(e.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Network(format!("blocking task failed: {e}"))
        }
    }
}

impl From<yaba_types::Error> for SyncError {
    fn from(e: yaba_types::Error) -> Self {
        Self::Storage(StorageError::from(e))
    }
}
