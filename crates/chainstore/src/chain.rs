//! The chain contract the store consumes.
//!
//! The store never interprets chain contents: it instantiates chains,
//! deduplicates their handles, and fans them onto peer streams. A chain
//! implementation receives a [`ChainContext`] (its file router, resolved
//! key material, and namespaced block caches) and is otherwise free in how
//! it stores and replicates blocks.

use std::sync::Arc;

use async_trait::async_trait;
use chainstore_crypto::{DiscoveryKey, KeyPair, PublicKey, SecretKey};
use chainstore_storage::layout;
use chainstore_storage::{StorageBackend, StorageHandle};

use crate::error::{StoreError, StoreResult};
use crate::keyfile;
use crate::options::ChainOptions;
use crate::stream::PeerStream;
use crate::subcache::CacheSet;

/// Per-chain file router: maps a chain-internal filename to a storage
/// handle inside the chain's directory.
///
/// The `key` and `secret_key` filenames are managed by the store's key
/// records and cannot be opened through the router.
pub struct ChainFiles {
    backend: Arc<dyn StorageBackend>,
    dir: String,
}

impl ChainFiles {
    /// Build the router for one chain's directory. The store does this for
    /// every chain it opens; chain implementations use it directly in tests.
    pub fn new(backend: Arc<dyn StorageBackend>, discovery_key: &DiscoveryKey) -> Self {
        Self {
            backend,
            dir: layout::chain_dir(discovery_key),
        }
    }

    /// Open the chain file with the given name.
    pub fn open(&self, name: &str) -> StoreResult<Box<dyn StorageHandle>> {
        if keyfile::is_reserved(name) {
            return Err(StoreError::ReservedFile(name.to_string()));
        }
        Ok(self.backend.open(&format!("{}/{name}", self.dir))?)
    }
}

impl std::fmt::Debug for ChainFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainFiles").field("dir", &self.dir).finish()
    }
}

/// Final key material for a chain, after the on-disk record is consulted.
#[derive(Clone, Debug)]
pub struct ChainKeys {
    /// The chain's public key.
    pub public: PublicKey,
    /// Secret key when this node can append.
    pub secret: Option<SecretKey>,
    /// Derivation name when the keypair came from the master secret.
    pub name: Option<Vec<u8>>,
}

impl ChainKeys {
    /// Returns `true` when this node holds the secret key.
    pub fn writable(&self) -> bool {
        self.secret.is_some()
    }

    /// The full keypair, when writable.
    pub fn key_pair(&self) -> Option<KeyPair> {
        self.secret.as_ref().map(|secret| KeyPair {
            public: self.public,
            secret: secret.clone(),
        })
    }
}

/// Everything a chain implementation needs to come up.
pub struct ChainContext {
    /// File router scoped to this chain's directory.
    pub files: ChainFiles,
    /// Resolved key material.
    pub keys: ChainKeys,
    /// The chain's discovery key (cache key, announcement token).
    pub discovery_key: DiscoveryKey,
    /// Block sub-caches, already namespaced for this chain.
    pub cache: CacheSet,
}

/// An append-only, cryptographically addressed log.
///
/// `open` returning `Ok` is the chain's ready signal; an `Err` is its error
/// signal. Closing is driven by the store (eviction or store close), so the
/// handle returned by `get` is alive until every owning view lets go.
#[async_trait]
pub trait Chain: Send + Sync + Sized + 'static {
    /// Open (or create) the chain from its context.
    async fn open(ctx: ChainContext, opts: ChainOptions) -> StoreResult<Self>;

    /// The chain's public key.
    fn public_key(&self) -> PublicKey;

    /// The chain's secret key, when writable.
    fn secret_key(&self) -> Option<SecretKey>;

    /// The chain's discovery key.
    fn discovery_key(&self) -> DiscoveryKey;

    /// Number of blocks in the chain.
    fn length(&self) -> u64;

    /// Returns `true` when this node can append.
    fn writable(&self) -> bool;

    /// Returns `true` once the chain has been closed.
    fn is_closed(&self) -> bool;

    /// Flush and close. Further operations fail.
    async fn close(&self) -> StoreResult<()>;

    /// Start replicating this chain over a shared peer stream.
    ///
    /// The chain owns its per-stream tasks; they must stop when the stream
    /// closes, when its sub-channel is closed, or when the chain closes.
    async fn replicate(self: Arc<Self>, stream: Arc<dyn PeerStream>) -> StoreResult<()>;
}
