use chainstore_crypto::{KeyPair, PublicKey, Signature};
use serde::{Deserialize, Serialize};

use crate::error::{LogError, LogResult};

/// Previous-hash value of the genesis block.
pub const GENESIS_PREV: [u8; 32] = [0u8; 32];

/// A single signed block in the chain.
///
/// Each block commits to its predecessor: `hash` covers the previous
/// block's hash, the index, and the payload, and `signature` is the
/// writer's signature over `hash`. Verifying a block therefore verifies
/// its whole prefix.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Position in the chain, starting at zero.
    pub index: u64,
    /// Hash of the previous block (all zeroes for genesis).
    pub prev_hash: [u8; 32],
    /// The payload bytes.
    pub data: Vec<u8>,
    /// BLAKE3 hash over prev_hash, index, and data.
    pub hash: [u8; 32],
    /// Writer's Ed25519 signature over `hash`.
    pub signature: Signature,
}

impl Block {
    /// Build and sign the block at `index` on top of `prev_hash`.
    pub fn build(index: u64, prev_hash: [u8; 32], data: Vec<u8>, pair: &KeyPair) -> Self {
        let hash = compute_hash(index, &prev_hash, &data);
        let signature = pair.sign(&hash);
        Self {
            index,
            prev_hash,
            data,
            hash,
            signature,
        }
    }

    /// Recompute this block's hash from its contents.
    pub fn compute_hash(&self) -> [u8; 32] {
        compute_hash(self.index, &self.prev_hash, &self.data)
    }

    /// Verify the block against the writer key and the expected link.
    pub fn verify(&self, public: &PublicKey, expected_prev: &[u8; 32]) -> LogResult<()> {
        if &self.prev_hash != expected_prev {
            return Err(LogError::BadBlock {
                index: self.index,
                reason: "broken link to previous block".into(),
            });
        }
        if self.compute_hash() != self.hash {
            return Err(LogError::BadBlock {
                index: self.index,
                reason: "hash does not match contents".into(),
            });
        }
        public
            .verify(&self.hash, &self.signature)
            .map_err(|_| LogError::BadBlock {
                index: self.index,
                reason: "invalid signature".into(),
            })
    }
}

/// Domain-separated block hash: a chain and a storage object with the same
/// bytes can never collide.
fn compute_hash(index: u64, prev_hash: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"chainstore-block-v1:");
    hasher.update(prev_hash);
    hasher.update(&index.to_le_bytes());
    hasher.update(data);
    *hasher.finalize().as_bytes()
}
