use chainstore::StoreError;
use chainstore_storage::StorageError;

/// Errors from block log operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Append requires the secret key, which this node does not hold.
    #[error("log is not writable")]
    NotWritable,

    /// The log has been closed.
    #[error("log is closed")]
    Closed,

    /// A received block failed verification against the chain state.
    #[error("bad block at index {index}: {reason}")]
    BadBlock { index: u64, reason: String },

    /// The on-disk header is from an unknown format version.
    #[error("unsupported log version {0}")]
    UnsupportedVersion(u32),

    /// Encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Storage-level failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<LogError> for StoreError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::Storage(err) => StoreError::Storage(err),
            other => StoreError::Chain(other.to_string()),
        }
    }
}

/// Result alias for log operations.
pub type LogResult<T> = Result<T, LogError>;
