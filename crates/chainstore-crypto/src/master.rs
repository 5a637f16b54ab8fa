use std::fmt;

use rand::RngCore;

use crate::error::CryptoError;
use crate::keys::KeyPair;

/// Derivation namespace for chain keypairs. Seeds derived under other tags
/// (by future collaborators) can never collide with chain keys.
const DERIVE_NAMESPACE: &[u8] = b"chainstore";

/// The store's master secret: 32 random bytes created once per store.
///
/// All named chain keypairs are derived from it, so two stores sharing a
/// master secret agree on every named chain and two stores with distinct
/// secrets never collide. The secret itself never leaves the store root.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    /// Generate a fresh random master key.
    pub fn generate() -> Self {
        Self(random_name())
    }

    /// Create from raw 32-byte material (e.g. the persisted `master_key` file).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create from a byte slice, failing on wrong length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    /// The raw 32 bytes, for persistence.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive a 32-byte keypair seed for a chain name.
    ///
    /// Keyed BLAKE3 under the master key over the namespace tag and the
    /// name, with an explicit separator so distinct names never alias.
    pub fn derive_seed(&self, name: &[u8]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_keyed(&self.0);
        hasher.update(DERIVE_NAMESPACE);
        hasher.update(b":");
        hasher.update(name);
        *hasher.finalize().as_bytes()
    }

    /// Derive the full signing keypair for a chain name.
    pub fn derive_key_pair(&self, name: &[u8]) -> KeyPair {
        KeyPair::from_seed(self.derive_seed(name))
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey(<redacted>)")
    }
}

/// Fill a fresh buffer with `n` random bytes.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// A random 32-byte chain name (used when `get` is called with no options).
pub fn random_name() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}
