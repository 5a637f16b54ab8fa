//! Cryptographic identity for the chainstore.
//!
//! Every chain is addressed by an Ed25519 public key; peers announce chains
//! by a keyed-BLAKE3 *discovery key* derived from the public key alone, so
//! availability can be advertised without revealing the key itself. A store
//! holds one 32-byte master secret from which named chain keypairs are
//! derived deterministically.
//!
//! All crypto operations wrap established libraries; no custom cryptography.

pub mod discovery;
pub mod error;
pub mod keys;
pub mod master;

pub use discovery::DiscoveryKey;
pub use error::{CryptoError, CryptoResult};
pub use keys::{KeyPair, PublicKey, SecretKey, Signature};
pub use master::{random_bytes, random_name, MasterKey};
