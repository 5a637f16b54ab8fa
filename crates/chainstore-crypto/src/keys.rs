use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, CryptoResult};

/// Ed25519 public key identifying a chain (32 bytes).
///
/// This is the externally shareable identifier. Displayed as lowercase hex;
/// parsing accepts hex or unpadded base32.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

/// Ed25519 secret key material (64 bytes: seed followed by public key).
///
/// Present only when this node can append to the chain.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey(#[serde(with = "bytes64_serde")] [u8; 64]);

/// Ed25519 signature over a block hash.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "bytes64_serde")] [u8; 64]);

/// A signing keypair for a writable chain.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl PublicKey {
    /// Create from raw 32-byte key material.
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

    /// Lowercase unpadded base32 encoding.
    pub fn to_base32(&self) -> String {
        data_encoding::BASE32_NOPAD
            .encode(&self.0)
            .to_ascii_lowercase()
    }

    /// Parse from a hex string (64 hex characters).
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        Self::try_from_slice(&bytes)
    }

    /// Parse from an unpadded base32 string (case-insensitive).
    pub fn from_base32(s: &str) -> CryptoResult<Self> {
        let bytes = data_encoding::BASE32_NOPAD
            .decode(s.to_ascii_uppercase().as_bytes())
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        Self::try_from_slice(&bytes)
    }

    /// Verify a signature on a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        use ed25519_dalek::Verifier;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| CryptoError::InvalidKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(message, &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    fn try_from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }
}

impl FromStr for PublicKey {
    type Err = CryptoError;

    /// Accepts hex (64 chars) or unpadded base32 (52 chars).
    fn from_str(s: &str) -> CryptoResult<Self> {
        if s.len() == 64 {
            Self::from_hex(s)
        } else {
            Self::from_base32(s)
        }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl SecretKey {
    /// Create from raw 64-byte keypair material (seed followed by public key).
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// The raw 64 bytes.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// The 32-byte seed half.
    fn seed(&self) -> [u8; 32] {
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&self.0[..32]);
        seed
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(<redacted>)")
    }
}

impl Signature {
    /// Create from raw 64-byte signature material.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// The raw 64 bytes.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", hex::encode(&self.0[..8]))
    }
}

impl KeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut csprng = rand::thread_rng();
        let signing = ed25519_dalek::SigningKey::generate(&mut csprng);
        Self::from_signing_key(signing)
    }

    /// Derive deterministically from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_signing_key(ed25519_dalek::SigningKey::from_bytes(&seed))
    }

    /// Reconstruct from stored secret key material.
    pub fn from_secret(secret: SecretKey) -> Self {
        Self::from_seed(secret.seed())
    }

    /// Sign a message with this keypair.
    pub fn sign(&self, message: &[u8]) -> Signature {
        use ed25519_dalek::Signer;
        let signing = ed25519_dalek::SigningKey::from_bytes(&self.secret.seed());
        Signature(signing.sign(message).to_bytes())
    }

    fn from_signing_key(signing: ed25519_dalek::SigningKey) -> Self {
        Self {
            public: PublicKey(signing.verifying_key().to_bytes()),
            secret: SecretKey(signing.to_keypair_bytes()),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

mod bytes64_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}
