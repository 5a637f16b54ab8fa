use crate::error::StorageResult;

/// Random-access handle to one named storage object.
///
/// All implementations must satisfy these invariants:
/// - `read` returns exactly `length` bytes, or fails: `NotFound` when the
///   object was never written, `OutOfRange` when it is shorter than the
///   requested range.
/// - `write` creates the object if absent and zero-fills any gap between
///   the current size and `offset`.
/// - `len` reports the current size, failing `NotFound` for absent objects.
/// - Handles are safe to share across threads; the handle closes on drop.
pub trait StorageHandle: Send + Sync {
    /// Read exactly `length` bytes starting at `offset`.
    fn read(&self, offset: u64, length: usize) -> StorageResult<Vec<u8>>;

    /// Write `data` at `offset`, creating or growing the object as needed.
    fn write(&self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Current size of the object in bytes.
    fn len(&self) -> StorageResult<u64>;

    /// Returns `true` if the object exists but holds no bytes.
    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Flush buffered writes to durable storage. No-op for volatile backends.
    fn sync(&self) -> StorageResult<()>;
}

/// Factory mapping a relative path to a [`StorageHandle`].
///
/// The chainstore owns the path convention (see [`crate::layout`]); a
/// backend only has to honor the handle contract per path. Any
/// `Fn(&str) -> StorageResult<Box<dyn StorageHandle>>` closure is a
/// backend, which covers ad hoc routing and test doubles.
pub trait StorageBackend: Send + Sync {
    /// Open a handle for the object at `path`.
    ///
    /// Opening is cheap and never creates the object; absence surfaces on
    /// first read.
    fn open(&self, path: &str) -> StorageResult<Box<dyn StorageHandle>>;
}

impl<F> StorageBackend for F
where
    F: Fn(&str) -> StorageResult<Box<dyn StorageHandle>> + Send + Sync,
{
    fn open(&self, path: &str) -> StorageResult<Box<dyn StorageHandle>> {
        self(path)
    }
}
