//! Reference chain implementation for the chainstore.
//!
//! A [`BlockLog`] is a signed, hash-chained append-only log satisfying the
//! store's chain contract: every block commits to its predecessor and
//! carries the writer's Ed25519 signature, so replicated data verifies
//! against the chain's public key alone. Replication is a small have /
//! request / data exchange over a shared peer stream; live appends push
//! fresh announcements.
//!
//! ```no_run
//! use chainstore::{GetOptions, StoreOptions};
//! use chainstore_log::Store;
//!
//! # async fn demo() -> chainstore::StoreResult<()> {
//! let store = Store::open("./store", StoreOptions::default()).await?;
//! let chain = store.default(GetOptions::default()).await?;
//! chain.append(b"hello").map_err(chainstore::StoreError::from)?;
//! assert_eq!(chain.block(0).unwrap(), Some(b"hello".to_vec()));
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod error;
pub mod log;
pub mod sync;

pub use block::Block;
pub use error::{LogError, LogResult};
pub use log::BlockLog;
pub use sync::LogMessage;

/// A chainstore over block logs: the batteries-included store type.
pub type Store = chainstore::Chainstore<BlockLog>;
