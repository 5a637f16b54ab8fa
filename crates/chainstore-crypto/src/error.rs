/// Errors from key handling and derivation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Input was neither valid hex nor valid base32.
    #[error("invalid key encoding: {0}")]
    InvalidEncoding(String),

    /// Decoded input had the wrong length.
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The bytes do not form a valid Ed25519 public key.
    #[error("invalid public key")]
    InvalidKey,

    /// Signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
}

/// Result alias for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
