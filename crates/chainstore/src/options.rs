use chainstore_crypto::{CryptoResult, DiscoveryKey, KeyPair, MasterKey, PublicKey};

use crate::subcache::CacheSet;

/// Store-wide configuration.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Soft cap on cached chains. Chains owned by a view are pinned and do
    /// not count against eviction; only idle chains are evicted.
    pub cache_size: usize,
    /// Use this master secret instead of loading `master_key` from storage.
    pub master_key: Option<MasterKey>,
    /// Block sub-caches shared by every chain (each chain gets a fresh
    /// namespace of them).
    pub cache: Option<CacheSet>,
    /// Default chain options applied when a `get` does not override them.
    pub chain: ChainOptions,
    /// Capacity of the store event broadcast channel.
    pub channel_capacity: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            cache_size: 1000,
            master_key: None,
            cache: None,
            chain: ChainOptions::default(),
            channel_capacity: 1024,
        }
    }
}

/// Options passed through to the chain implementation.
#[derive(Clone, Debug, Default)]
pub struct ChainOptions {
    /// Open for sparse replication: the chain may hold a subset of blocks.
    pub sparse: bool,
}

/// Per-`get` options selecting which chain to open and how.
///
/// At most one of `key_pair` / `key` / `name` / `discovery_key` decides the
/// chain identity, consulted in that order; with none of them set a fresh
/// chain under a random name is created. `default` marks a namespaced
/// default request and requires `name`.
#[derive(Clone, Debug, Default)]
pub struct GetOptions {
    /// Open by public key (read-only unless key material is on disk).
    pub key: Option<PublicKey>,
    /// Open by discovery key alone: resolves only if the chain exists
    /// locally (a passive reference).
    pub discovery_key: Option<DiscoveryKey>,
    /// Open with a full keypair (writable).
    pub key_pair: Option<KeyPair>,
    /// Open the chain derived from the master secret under this name.
    pub name: Option<Vec<u8>>,
    /// This is a namespaced-default request; `name` must be present.
    pub default: bool,
    /// Override the store-wide block sub-caches for this chain.
    pub cache: Option<CacheSet>,
    /// Override the store-wide chain options for this chain.
    pub chain: Option<ChainOptions>,
}

impl GetOptions {
    /// Open the chain derived under `name`.
    pub fn named(name: impl AsRef<[u8]>) -> Self {
        Self {
            name: Some(name.as_ref().to_vec()),
            ..Self::default()
        }
    }

    /// Parse a hex or base32 encoded public key into `{ key }` options.
    pub fn from_encoded(s: &str) -> CryptoResult<Self> {
        Ok(Self::from(s.parse::<PublicKey>()?))
    }
}

impl From<PublicKey> for GetOptions {
    fn from(key: PublicKey) -> Self {
        Self {
            key: Some(key),
            ..Self::default()
        }
    }
}

impl From<[u8; 32]> for GetOptions {
    fn from(key: [u8; 32]) -> Self {
        Self::from(PublicKey::from_bytes(key))
    }
}

impl From<KeyPair> for GetOptions {
    fn from(key_pair: KeyPair) -> Self {
        Self {
            key_pair: Some(key_pair),
            ..Self::default()
        }
    }
}

impl From<DiscoveryKey> for GetOptions {
    fn from(discovery_key: DiscoveryKey) -> Self {
        Self {
            discovery_key: Some(discovery_key),
            ..Self::default()
        }
    }
}
