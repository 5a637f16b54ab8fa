//! Factory and lifecycle manager for collections of append-only,
//! cryptographically addressed chains.
//!
//! A [`Chainstore`] turns one storage root and one master secret into any
//! number of chains:
//!
//! - keypairs for named chains derive deterministically from the master
//!   secret, so a store rehydrates every named chain from disk;
//! - chain handles are deduplicated through a reference-counted cache with
//!   LRU eviction of idle chains;
//! - replication multiplexes every open chain onto shared peer streams and
//!   materializes chains lazily when a peer announces their discovery key;
//! - [`Chainstore::namespace`] gives independent consumers disjoint
//!   "default" chains over the same physical store.
//!
//! The chain data structure itself, the byte storage, and the peer
//! transport are collaborators behind the [`Chain`], `StorageBackend`, and
//! [`PeerStream`] seams.
//!
//! ```no_run
//! use chainstore::{Chainstore, GetOptions, StoreOptions};
//! # use chainstore::{Chain, StoreResult};
//! # async fn demo<C: Chain>() -> StoreResult<()> {
//! let store: Chainstore<C> = Chainstore::open("./store", StoreOptions::default()).await?;
//! let chain = store.default(GetOptions::default()).await?;
//! let same = store.get(chain.public_key()).await?;
//! assert!(std::sync::Arc::ptr_eq(&chain, &same));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod chain;
pub mod error;
pub mod keyfile;
pub mod options;
pub mod resolver;
pub mod store;
pub mod stream;
pub mod subcache;

pub use chain::{Chain, ChainContext, ChainFiles, ChainKeys};
pub use error::{StoreError, StoreResult};
pub use options::{ChainOptions, GetOptions, StoreOptions};
pub use resolver::ResolvedKeys;
pub use store::{Chainstore, StoreEvent};
pub use stream::{MemoryPeerStream, PeerStream, StreamFrame};
pub use subcache::{CacheSet, SharedCache};

// The key material types travel with the store API.
pub use chainstore_crypto::{
    DiscoveryKey, KeyPair, MasterKey, PublicKey, SecretKey, Signature,
};
pub use chainstore_storage::{DiskStorage, MemoryStorage, StorageBackend, StorageHandle};
