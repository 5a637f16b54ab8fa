//! The fixed on-disk path convention for a store root.
//!
//! - `master_key` at the root: the 32-byte master secret.
//! - `d[0:2]/d[2:4]/d/<name>` for chain files, where `d` is the hex
//!   encoding of the chain's discovery key. The two-level prefix bounds
//!   directory fanout (a flat layout degrades on case-insensitive
//!   filesystems once stores hold many thousands of chains).

use chainstore_crypto::DiscoveryKey;

/// Relative path of the persisted master secret.
pub const MASTER_KEY_FILE: &str = "master_key";

/// Directory holding every file of the chain with the given discovery key.
pub fn chain_dir(discovery_key: &DiscoveryKey) -> String {
    let d = discovery_key.to_hex();
    format!("{}/{}/{}", &d[0..2], &d[2..4], d)
}

/// Path of a single named file inside a chain's directory.
pub fn chain_file(discovery_key: &DiscoveryKey, name: &str) -> String {
    format!("{}/{}", chain_dir(discovery_key), name)
}
