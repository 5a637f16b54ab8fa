//! Normalizes the polymorphic `get` options into concrete key material.
//!
//! Everything downstream of this module (cache, keyfile, factory) sees one
//! shape: a discovery key, whatever key material is known up front, and the
//! derivation name when the master secret is involved.

use chainstore_crypto::{random_name, DiscoveryKey, MasterKey, PublicKey, SecretKey};

use crate::error::{StoreError, StoreResult};
use crate::options::GetOptions;

/// Tentative key material for a chain, before the on-disk record is consulted.
#[derive(Clone, Debug)]
pub struct ResolvedKeys {
    /// Known public key, absent for passive (discovery-key-only) references.
    pub public_key: Option<PublicKey>,
    /// Known secret key: from a supplied keypair or a master-secret derivation.
    pub secret_key: Option<SecretKey>,
    /// Always known: derived from the public key, or supplied directly.
    pub discovery_key: DiscoveryKey,
    /// Derivation name, present only for master-secret-derived chains.
    pub name: Option<Vec<u8>>,
}

impl ResolvedKeys {
    /// A passive reference: only the discovery key is known.
    pub fn passive(discovery_key: DiscoveryKey) -> Self {
        Self {
            public_key: None,
            secret_key: None,
            discovery_key,
            name: None,
        }
    }

    fn derived(master: &MasterKey, name: Vec<u8>) -> Self {
        let pair = master.derive_key_pair(&name);
        Self {
            discovery_key: DiscoveryKey::from_public_key(&pair.public),
            public_key: Some(pair.public),
            secret_key: Some(pair.secret),
            name: Some(name),
        }
    }
}

/// Choose how the keypair will be obtained, per the option precedence:
/// keypair, then bare key, then derivation name, then passive discovery
/// key; with nothing supplied a fresh random name is derived.
pub fn resolve(opts: &GetOptions, master: &MasterKey) -> StoreResult<ResolvedKeys> {
    if let Some(pair) = &opts.key_pair {
        return Ok(ResolvedKeys {
            discovery_key: DiscoveryKey::from_public_key(&pair.public),
            public_key: Some(pair.public),
            secret_key: Some(pair.secret.clone()),
            name: None,
        });
    }

    if let Some(key) = &opts.key {
        return Ok(ResolvedKeys {
            discovery_key: DiscoveryKey::from_public_key(key),
            public_key: Some(*key),
            secret_key: None,
            name: None,
        });
    }

    if let Some(name) = &opts.name {
        return Ok(ResolvedKeys::derived(master, name.clone()));
    }

    // A default request is meaningless without a namespace name.
    if opts.default {
        return Err(StoreError::MissingName);
    }

    if let Some(discovery_key) = opts.discovery_key {
        return Ok(ResolvedKeys::passive(discovery_key));
    }

    Ok(ResolvedKeys::derived(master, random_name().to_vec()))
}
