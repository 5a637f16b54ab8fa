use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::keys::PublicKey;

/// Keyed hash tag for discovery keys. Fixed for the lifetime of the wire
/// format: changing it would orphan every announced chain.
const DISCOVERY_TAG: &[u8] = b"bitweb";

/// Public announcement tag for a chain (32 bytes).
///
/// A `DiscoveryKey` is the keyed BLAKE3 hash of a fixed tag under the
/// chain's public key, so it is a deterministic function of the public key
/// alone: peers can ask "do you have this chain?" without revealing the
/// key. It is also the cache key and the on-disk directory name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscoveryKey([u8; 32]);

impl DiscoveryKey {
    /// Compute the discovery key for a public key.
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(*blake3::keyed_hash(public_key.as_bytes(), DISCOVERY_TAG).as_bytes())
    }

    /// Create from raw 32-byte material (e.g. a peer announcement).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw 32 bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full hex-encoded string (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short identifier (first 8 hex characters), for logs.
    pub fn short_id(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a hex string (64 hex characters).
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| CryptoError::InvalidLength {
                expected: 32,
                actual: v.len(),
            })?;
        Ok(Self(arr))
    }
}

impl From<&PublicKey> for DiscoveryKey {
    fn from(public_key: &PublicKey) -> Self {
        Self::from_public_key(public_key)
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryKey({})", self.short_id())
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_id())
    }
}
