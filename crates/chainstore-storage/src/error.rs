/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The object does not exist. Callers use this to distinguish "never
    /// written" from real I/O failures.
    #[error("not found: {0}")]
    NotFound(String),

    /// A read past the end of the object (short read).
    #[error("read out of range in {path}: offset {offset}, length {length}, size {size}")]
    OutOfRange {
        path: String,
        offset: u64,
        length: usize,
        size: u64,
    },

    /// The object is exclusively locked by another handle or process.
    #[error("locked: {0}")]
    Locked(String),

    /// The relative path is empty, absolute, or escapes the storage root.
    #[error("invalid storage path: {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// I/O error from the underlying filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Returns `true` for "the object is simply absent or too short",
    /// as opposed to a real I/O failure.
    pub fn is_absence(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::OutOfRange { .. })
    }
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
