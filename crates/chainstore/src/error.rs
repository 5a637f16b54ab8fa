use chainstore_crypto::{CryptoError, DiscoveryKey};
use chainstore_storage::StorageError;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store (or a view of it) has been closed.
    #[error("store is closed")]
    Closed,

    /// A default chain was requested without a namespace name.
    #[error("default chain requested without a name")]
    MissingName,

    /// The on-disk key record for this chain does not derive the requested
    /// discovery key. The record belongs to a different chain or is corrupt.
    #[error("stored key record does not match discovery key {0}")]
    WrongNameStored(DiscoveryKey),

    /// A chain referenced only by discovery key has no key material on this
    /// node: it was never created here and never received from a peer.
    /// Callers treat this as "not present", not as a failure.
    #[error("no key material on this node for discovery key {0}")]
    UnknownKeypair(DiscoveryKey),

    /// A chain asked for a filename the store manages itself.
    #[error("chain file name is reserved: {0}")]
    ReservedFile(String),

    /// The peer stream is closed; no more frames can be sent.
    #[error("peer stream is closed")]
    StreamClosed,

    /// Failure inside the chain implementation.
    #[error("chain error: {0}")]
    Chain(String),

    /// Storage-level failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Key material failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl StoreError {
    /// Shorthand for wrapping a chain-implementation failure.
    pub fn chain(message: impl Into<String>) -> Self {
        Self::Chain(message.into())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
