//! Per-chain key records.
//!
//! Two files in a chain's directory belong to the store, not the chain:
//!
//! - `key` — the 32-byte public key, followed by the derivation name when
//!   the keypair was derived from the master secret. Leading with the
//!   public key keeps the on-disk exists-check a uniform 32-byte read;
//!   carrying the name lets a derived chain rehydrate its keypair without
//!   ever persisting the secret key.
//! - `secret_key` — the 64-byte secret key, written only for externally
//!   supplied keypairs.

use std::sync::Arc;

use chainstore_crypto::{DiscoveryKey, MasterKey, PublicKey, SecretKey};
use chainstore_storage::{layout, StorageBackend};
use tracing::debug;

use crate::chain::ChainKeys;
use crate::error::{StoreError, StoreResult};
use crate::resolver::ResolvedKeys;

/// Filename of the public-key/name record.
pub const KEY_FILE: &str = "key";
/// Filename of the persisted secret key.
pub const SECRET_KEY_FILE: &str = "secret_key";

/// Returns `true` for filenames managed by this module.
pub fn is_reserved(name: &str) -> bool {
    name == KEY_FILE || name == SECRET_KEY_FILE
}

/// Check whether a chain exists on disk without instantiating it.
///
/// Reads the first 32 bytes of the `key` record: absence or a short read
/// means the chain was never materialized here; other I/O errors propagate.
pub fn chain_exists(
    backend: &Arc<dyn StorageBackend>,
    discovery_key: &DiscoveryKey,
) -> StoreResult<bool> {
    let handle = backend.open(&layout::chain_file(discovery_key, KEY_FILE))?;
    match handle.read(0, 32) {
        Ok(_) => Ok(true),
        Err(e) if e.is_absence() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Load the chain's key record, or initialize it from the resolver output.
///
/// The on-disk record wins over resolver-supplied material: a persisted
/// name re-derives the keypair and must still hash to the requested
/// discovery key (`WrongNameStored` otherwise). With nothing on disk and
/// no key material resolved, the chain does not exist on this node
/// (`UnknownKeypair`).
pub fn load_or_init(
    backend: &Arc<dyn StorageBackend>,
    master: &MasterKey,
    resolved: &ResolvedKeys,
) -> StoreResult<ChainKeys> {
    let dk = resolved.discovery_key;
    let key_handle = backend.open(&layout::chain_file(&dk, KEY_FILE))?;

    let size = match key_handle.len() {
        Ok(size) if size >= 32 => Some(size),
        Ok(_) => None,
        Err(e) if e.is_absence() => None,
        Err(e) => return Err(e.into()),
    };

    if let Some(size) = size {
        let record = key_handle.read(0, size as usize)?;
        let mut public_bytes = [0u8; 32];
        public_bytes.copy_from_slice(&record[..32]);
        let public = PublicKey::from_bytes(public_bytes);

        if record.len() > 32 {
            // Derived chain: re-derive from the stored name and verify.
            let name = record[32..].to_vec();
            let pair = master.derive_key_pair(&name);
            if pair.public != public || DiscoveryKey::from_public_key(&pair.public) != dk {
                return Err(StoreError::WrongNameStored(dk));
            }
            return Ok(ChainKeys {
                public,
                secret: Some(pair.secret),
                name: Some(name),
            });
        }

        if DiscoveryKey::from_public_key(&public) != dk {
            return Err(StoreError::WrongNameStored(dk));
        }
        let secret = read_secret(backend, &dk)?.or_else(|| resolved.secret_key.clone());
        return Ok(ChainKeys {
            public,
            secret,
            name: None,
        });
    }

    // Nothing on disk: persist what the resolver produced.
    if let (Some(public), Some(name)) = (resolved.public_key, &resolved.name) {
        let mut record = public.as_bytes().to_vec();
        record.extend_from_slice(name);
        key_handle.write(0, &record)?;
        key_handle.sync()?;
        debug!(discovery_key = %dk, "persisted derived chain name");
        return Ok(ChainKeys {
            public,
            secret: resolved.secret_key.clone(),
            name: Some(name.clone()),
        });
    }

    if let Some(public) = resolved.public_key {
        key_handle.write(0, public.as_bytes())?;
        key_handle.sync()?;
        if let Some(secret) = &resolved.secret_key {
            let secret_handle = backend.open(&layout::chain_file(&dk, SECRET_KEY_FILE))?;
            secret_handle.write(0, secret.as_bytes())?;
            secret_handle.sync()?;
        }
        debug!(discovery_key = %dk, "persisted chain key");
        return Ok(ChainKeys {
            public,
            secret: resolved.secret_key.clone(),
            name: None,
        });
    }

    Err(StoreError::UnknownKeypair(dk))
}

fn read_secret(
    backend: &Arc<dyn StorageBackend>,
    discovery_key: &DiscoveryKey,
) -> StoreResult<Option<SecretKey>> {
    let handle = backend.open(&layout::chain_file(discovery_key, SECRET_KEY_FILE))?;
    match handle.read(0, 64) {
        Ok(bytes) => {
            let mut arr = [0u8; 64];
            arr.copy_from_slice(&bytes);
            Ok(Some(SecretKey::from_bytes(arr)))
        }
        Err(e) if e.is_absence() => Ok(None),
        Err(e) => Err(e.into()),
    }
}
