//! Random-access byte storage for the chainstore.
//!
//! Chains never touch the filesystem directly: they read and write named
//! objects through the [`StorageBackend`] / [`StorageHandle`] contract, and
//! the [`layout`] module fixes where those objects live relative to the
//! store root. Two backends are provided:
//!
//! - [`MemoryStorage`] — `HashMap`-based backend for tests and embedding
//! - [`DiskStorage`] — file-per-object backend rooted at a directory
//!
//! # Design Rules
//!
//! 1. Objects are created lazily on first write; reads of absent objects
//!    fail with [`StorageError::NotFound`], which callers may rely on.
//! 2. `read` returns exactly the requested byte count or fails; short
//!    reads are reported as [`StorageError::OutOfRange`].
//! 3. Handles close on drop. All I/O errors are propagated, never
//!    silently ignored.

pub mod disk;
pub mod error;
pub mod layout;
pub mod memory;
pub mod traits;

pub use disk::DiskStorage;
pub use error::{StorageError, StorageResult};
pub use memory::MemoryStorage;
pub use traits::{StorageBackend, StorageHandle};
