use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chainstore::{
    Chain, ChainContext, ChainOptions, PeerStream, SharedCache, StoreResult,
};
use chainstore_crypto::{DiscoveryKey, KeyPair, PublicKey, SecretKey};
use chainstore_storage::StorageHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::block::{Block, GENESIS_PREV};
use crate::error::{LogError, LogResult};
use crate::sync;

/// Current on-disk format version.
const FORMAT_VERSION: u32 = 1;

/// Frame header: 4 bytes length + 4 bytes CRC32.
const FRAME_HEADER: u64 = 8;

/// Small rewritten-per-append summary of the log.
#[derive(Debug, Serialize, Deserialize)]
struct HeaderRecord {
    version: u32,
    length: u64,
    tip_hash: [u8; 32],
}

/// Mutable chain state, guarded by one lock.
struct LogState {
    length: u64,
    tip_hash: [u8; 32],
    /// Byte offset of each block's frame in the `log` file.
    offsets: Vec<u64>,
    /// End of the last valid frame (where the next append goes).
    write_offset: u64,
}

/// A signed, hash-chained append-only block log.
///
/// The reference implementation of the store's chain contract. Blocks are
/// framed with a length prefix and a CRC32 checksum in a single `log`
/// object; recovery reads the file front-to-back and stops at the first
/// torn or diverging frame. A `bitfield` object records held blocks (and
/// carries the on-disk writer lock); a `header` object summarizes the tip.
pub struct BlockLog {
    public: PublicKey,
    pair: Option<KeyPair>,
    name: Option<Vec<u8>>,
    discovery_key: DiscoveryKey,
    sparse: bool,
    log: Box<dyn StorageHandle>,
    header: Box<dyn StorageHandle>,
    bitfield: Box<dyn StorageHandle>,
    state: RwLock<LogState>,
    cache: Option<SharedCache>,
    appended: broadcast::Sender<u64>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BlockLog {
    fn open_inner(ctx: ChainContext, opts: ChainOptions) -> LogResult<Self> {
        let log = ctx.files.open("log").map_err(store_to_log)?;
        // Opening the bitfield also takes the writer lock on disk backends.
        let bitfield = ctx.files.open("bitfield").map_err(store_to_log)?;
        let header = ctx.files.open("header").map_err(store_to_log)?;

        let state = recover(log.as_ref())?;
        check_header(header.as_ref(), &state)?;

        let (appended, _) = broadcast::channel(256);
        let log = Self {
            public: ctx.keys.public,
            pair: ctx.keys.key_pair(),
            name: ctx.keys.name.clone(),
            discovery_key: ctx.discovery_key,
            sparse: opts.sparse,
            log,
            header,
            bitfield,
            state: RwLock::new(state),
            cache: ctx.cache.data,
            appended,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };
        debug!(
            discovery_key = %log.discovery_key,
            length = log.length(),
            writable = log.pair.is_some(),
            "block log opened"
        );
        Ok(log)
    }

    /// The derivation name, when the keypair came from the master secret.
    pub fn name(&self) -> Option<&[u8]> {
        self.name.as_deref()
    }

    /// Whether the log was opened for sparse replication.
    pub fn sparse(&self) -> bool {
        self.sparse
    }

    /// Number of blocks in the log.
    pub fn length(&self) -> u64 {
        self.state.read().expect("lock poisoned").length
    }

    /// Hash of the last block (all zeroes for an empty log).
    pub fn tip_hash(&self) -> [u8; 32] {
        self.state.read().expect("lock poisoned").tip_hash
    }

    /// Append a payload; returns the new block's index. Writer only.
    pub fn append(&self, data: impl AsRef<[u8]>) -> LogResult<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LogError::Closed);
        }
        let pair = self.pair.as_ref().ok_or(LogError::NotWritable)?;

        let index = {
            let mut state = self.state.write().expect("lock poisoned");
            let block = Block::build(
                state.length,
                state.tip_hash,
                data.as_ref().to_vec(),
                pair,
            );
            self.persist(&mut state, &block)?;
            block.index
        };
        let _ = self.appended.send(index + 1);
        Ok(index)
    }

    /// Append a block received from a peer.
    ///
    /// Verifies the link, the hash, and the writer signature. Returns
    /// `false` without touching the log when the block is not the next one
    /// (stale or ahead of a gap).
    pub(crate) fn append_remote(&self, block: Block) -> LogResult<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LogError::Closed);
        }
        let length = {
            let mut state = self.state.write().expect("lock poisoned");
            if block.index != state.length {
                return Ok(false);
            }
            block.verify(&self.public, &state.tip_hash)?;
            self.persist(&mut state, &block)?;
            state.length
        };
        let _ = self.appended.send(length);
        Ok(true)
    }

    /// The payload of a block, `None` past the end of the log.
    pub fn block(&self, index: u64) -> LogResult<Option<Vec<u8>>> {
        if let Some(cache) = &self.cache {
            if let Some(data) = cache.get(index) {
                return Ok(Some(data));
            }
        }
        let Some(record) = self.read_record(index)? else {
            return Ok(None);
        };
        if let Some(cache) = &self.cache {
            cache.insert(index, record.data.clone());
        }
        Ok(Some(record.data))
    }

    /// The full signed block at `index`, for forwarding to peers.
    pub(crate) fn read_record(&self, index: u64) -> LogResult<Option<Block>> {
        let offset = {
            let state = self.state.read().expect("lock poisoned");
            match state.offsets.get(index as usize) {
                Some(offset) => *offset,
                None => return Ok(None),
            }
        };
        let header = self.log.read(offset, FRAME_HEADER as usize)?;
        let len = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes")) as usize;
        let payload = self.log.read(offset + FRAME_HEADER, len)?;
        let block: Block = bincode::deserialize(&payload)
            .map_err(|e| LogError::Serialization(e.to_string()))?;
        Ok(Some(block))
    }

    /// Whether the block at `index` is held locally (bitfield probe).
    pub fn has(&self, index: u64) -> LogResult<bool> {
        let byte = self.read_bitfield_byte(index / 8)?;
        Ok(byte & (1 << (index % 8)) != 0)
    }

    /// Wait until the log holds at least `length` blocks.
    pub async fn when_length(&self, length: u64) {
        let mut appended = self.appended.subscribe();
        while self.length() < length {
            match appended.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub(crate) fn appended(&self) -> broadcast::Receiver<u64> {
        self.appended.subscribe()
    }

    pub(crate) fn register_task(&self, task: tokio::task::JoinHandle<()>) {
        self.tasks.lock().expect("lock poisoned").push(task);
    }

    /// Write one block's frame, bitfield bit, and the refreshed header.
    fn persist(&self, state: &mut LogState, block: &Block) -> LogResult<()> {
        let payload =
            bincode::serialize(block).map_err(|e| LogError::Serialization(e.to_string()))?;
        let mut frame = Vec::with_capacity(FRAME_HEADER as usize + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        self.log.write(state.write_offset, &frame)?;
        self.log.sync()?;

        state.offsets.push(state.write_offset);
        state.write_offset += frame.len() as u64;
        state.tip_hash = block.hash;
        state.length += 1;

        self.set_bit(block.index)?;
        self.write_header(state)?;

        if let Some(cache) = &self.cache {
            cache.insert(block.index, block.data.clone());
        }
        Ok(())
    }

    fn set_bit(&self, index: u64) -> LogResult<()> {
        let byte_index = index / 8;
        let current = self.read_bitfield_byte(byte_index)?;
        self.bitfield
            .write(byte_index, &[current | (1 << (index % 8))])?;
        Ok(())
    }

    fn read_bitfield_byte(&self, byte_index: u64) -> LogResult<u8> {
        match self.bitfield.read(byte_index, 1) {
            Ok(bytes) => Ok(bytes[0]),
            Err(e) if e.is_absence() => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_header(&self, state: &LogState) -> LogResult<()> {
        let record = HeaderRecord {
            version: FORMAT_VERSION,
            length: state.length,
            tip_hash: state.tip_hash,
        };
        let bytes =
            bincode::serialize(&record).map_err(|e| LogError::Serialization(e.to_string()))?;
        self.header.write(0, &bytes)?;
        Ok(())
    }

    async fn close_inner(&self) -> LogResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let tasks: Vec<_> = {
            let mut tasks = self.tasks.lock().expect("lock poisoned");
            tasks.drain(..).collect()
        };
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        self.log.sync()?;
        self.header.sync()?;
        self.bitfield.sync()?;
        debug!(discovery_key = %self.discovery_key, "block log closed");
        Ok(())
    }
}

/// Scan the log file front-to-back, rebuilding offsets and the tip.
///
/// Stops at the first torn, corrupt, or diverging frame; everything after
/// it is treated as garbage and overwritten by the next append.
fn recover(log: &dyn StorageHandle) -> LogResult<LogState> {
    let size = match log.len() {
        Ok(size) => size,
        Err(e) if e.is_absence() => 0,
        Err(e) => return Err(e.into()),
    };

    let mut state = LogState {
        length: 0,
        tip_hash: GENESIS_PREV,
        offsets: Vec::new(),
        write_offset: 0,
    };

    while state.write_offset + FRAME_HEADER <= size {
        let offset = state.write_offset;
        let header = log.read(offset, FRAME_HEADER as usize)?;
        let len = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes")) as u64;
        let expected_crc = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes"));

        if len == 0 || offset + FRAME_HEADER + len > size {
            warn!(offset, len, "torn frame; stopping recovery");
            break;
        }
        let payload = log.read(offset + FRAME_HEADER, len as usize)?;
        if crc32fast::hash(&payload) != expected_crc {
            warn!(offset, "CRC mismatch; stopping recovery");
            break;
        }
        let block: Block = match bincode::deserialize(&payload) {
            Ok(block) => block,
            Err(e) => {
                warn!(offset, error = %e, "undecodable frame; stopping recovery");
                break;
            }
        };
        if block.index != state.length
            || block.prev_hash != state.tip_hash
            || block.compute_hash() != block.hash
        {
            warn!(offset, index = block.index, "log diverges; stopping recovery");
            break;
        }

        state.offsets.push(offset);
        state.tip_hash = block.hash;
        state.length += 1;
        state.write_offset = offset + FRAME_HEADER + len;
    }

    Ok(state)
}

/// Validate the header record against the recovered state.
fn check_header(header: &dyn StorageHandle, state: &LogState) -> LogResult<()> {
    let size = match header.len() {
        Ok(size) => size,
        Err(e) if e.is_absence() => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let bytes = header.read(0, size as usize)?;
    let record: HeaderRecord = match bincode::deserialize(&bytes) {
        Ok(record) => record,
        Err(e) => {
            warn!(error = %e, "unreadable log header; trusting recovery");
            return Ok(());
        }
    };
    if record.version != FORMAT_VERSION {
        return Err(LogError::UnsupportedVersion(record.version));
    }
    if record.length != state.length {
        warn!(
            header = record.length,
            recovered = state.length,
            "log header out of date"
        );
    }
    Ok(())
}

fn store_to_log(err: chainstore::StoreError) -> LogError {
    match err {
        chainstore::StoreError::Storage(err) => LogError::Storage(err),
        other => LogError::Serialization(other.to_string()),
    }
}

#[async_trait]
impl Chain for BlockLog {
    async fn open(ctx: ChainContext, opts: ChainOptions) -> StoreResult<Self> {
        Ok(Self::open_inner(ctx, opts)?)
    }

    fn public_key(&self) -> PublicKey {
        self.public
    }

    fn secret_key(&self) -> Option<SecretKey> {
        self.pair.as_ref().map(|pair| pair.secret.clone())
    }

    fn discovery_key(&self) -> DiscoveryKey {
        self.discovery_key
    }

    fn length(&self) -> u64 {
        BlockLog::length(self)
    }

    fn writable(&self) -> bool {
        self.pair.is_some()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> StoreResult<()> {
        Ok(self.close_inner().await?)
    }

    async fn replicate(self: Arc<Self>, stream: Arc<dyn PeerStream>) -> StoreResult<()> {
        sync::start(self, stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainstore::{CacheSet, ChainFiles, ChainKeys};
    use chainstore_storage::{layout, MemoryStorage, StorageBackend};

    fn pair() -> KeyPair {
        KeyPair::from_seed([21u8; 32])
    }

    fn context(storage: &MemoryStorage, pair: &KeyPair, writable: bool) -> ChainContext {
        let dk = DiscoveryKey::from_public_key(&pair.public);
        ChainContext {
            files: ChainFiles::new(Arc::new(storage.clone()), &dk),
            keys: ChainKeys {
                public: pair.public,
                secret: writable.then(|| pair.secret.clone()),
                name: None,
            },
            discovery_key: dk,
            cache: CacheSet::default(),
        }
    }

    async fn open(storage: &MemoryStorage, pair: &KeyPair, writable: bool) -> BlockLog {
        BlockLog::open(context(storage, pair, writable), ChainOptions::default())
            .await
            .unwrap()
    }

    // -----------------------------------------------------------------------
    // Append / read
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn fresh_log_is_empty_and_writable() {
        let storage = MemoryStorage::new();
        let log = open(&storage, &pair(), true).await;
        assert_eq!(log.length(), 0);
        assert_eq!(log.tip_hash(), GENESIS_PREV);
        assert!(Chain::writable(&log));
        assert!(log.block(0).unwrap().is_none());
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let storage = MemoryStorage::new();
        let log = open(&storage, &pair(), true).await;
        assert_eq!(log.append(b"hello").unwrap(), 0);
        assert_eq!(log.append(b"world").unwrap(), 1);
        assert_eq!(log.length(), 2);
        assert_eq!(log.block(0).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(log.block(1).unwrap(), Some(b"world".to_vec()));
        assert!(log.has(0).unwrap());
        assert!(log.has(1).unwrap());
        assert!(!log.has(2).unwrap());
    }

    #[tokio::test]
    async fn read_only_log_rejects_appends() {
        let storage = MemoryStorage::new();
        let log = open(&storage, &pair(), false).await;
        assert!(!Chain::writable(&log));
        assert!(matches!(log.append(b"nope"), Err(LogError::NotWritable)));
    }

    #[tokio::test]
    async fn closed_log_rejects_appends() {
        let storage = MemoryStorage::new();
        let log = open(&storage, &pair(), true).await;
        log.close_inner().await.unwrap();
        assert!(matches!(log.append(b"late"), Err(LogError::Closed)));
        assert!(Chain::is_closed(&log));
    }

    #[tokio::test]
    async fn when_length_returns_once_reached() {
        let storage = MemoryStorage::new();
        let log = open(&storage, &pair(), true).await;
        log.append(b"a").unwrap();
        // Already satisfied: must not hang.
        log.when_length(1).await;
    }

    #[tokio::test]
    async fn block_cache_is_used() {
        let storage = MemoryStorage::new();
        let data = chainstore::SharedCache::new(8);
        let mut ctx = context(&storage, &pair(), true);
        ctx.cache = CacheSet {
            data: Some(data.clone()),
            tree: None,
        }
        .namespace();
        let log = BlockLog::open(ctx, ChainOptions::default()).await.unwrap();
        log.append(b"cached").unwrap();
        assert_eq!(log.block(0).unwrap(), Some(b"cached".to_vec()));
        // The append landed in the shared cache through the chain's namespace.
        assert!(!data.is_empty());
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn reopen_recovers_state_and_continues() {
        let storage = MemoryStorage::new();
        let keys = pair();
        let tip = {
            let log = open(&storage, &keys, true).await;
            log.append(b"one").unwrap();
            log.append(b"two").unwrap();
            log.close_inner().await.unwrap();
            log.tip_hash()
        };

        let log = open(&storage, &keys, true).await;
        assert_eq!(log.length(), 2);
        assert_eq!(log.tip_hash(), tip);
        assert_eq!(log.block(1).unwrap(), Some(b"two".to_vec()));

        log.append(b"three").unwrap();
        assert_eq!(log.block(2).unwrap(), Some(b"three".to_vec()));
    }

    #[tokio::test]
    async fn torn_tail_is_discarded() {
        let storage = MemoryStorage::new();
        let keys = pair();
        {
            let log = open(&storage, &keys, true).await;
            log.append(b"kept").unwrap();
            log.close_inner().await.unwrap();
        }

        // Scribble a partial frame after the last valid one.
        let dk = DiscoveryKey::from_public_key(&keys.public);
        let handle = storage.open(&layout::chain_file(&dk, "log")).unwrap();
        let end = handle.len().unwrap();
        handle.write(end, &[0xff, 0xff, 0xff]).unwrap();

        let log = open(&storage, &keys, true).await;
        assert_eq!(log.length(), 1);
        assert_eq!(log.block(0).unwrap(), Some(b"kept".to_vec()));
        // The next append overwrites the garbage and survives reopen.
        log.append(b"after").unwrap();
        log.close_inner().await.unwrap();
        let log = open(&storage, &keys, true).await;
        assert_eq!(log.length(), 2);
    }

    #[tokio::test]
    async fn corrupt_frame_stops_recovery() {
        let storage = MemoryStorage::new();
        let keys = pair();
        {
            let log = open(&storage, &keys, true).await;
            log.append(b"aaaa").unwrap();
            log.append(b"bbbb").unwrap();
            log.close_inner().await.unwrap();
        }

        // Flip a payload byte inside the first frame: CRC now fails, and
        // everything after it is unreachable.
        let dk = DiscoveryKey::from_public_key(&keys.public);
        let handle = storage.open(&layout::chain_file(&dk, "log")).unwrap();
        let corrupted = handle.read(FRAME_HEADER, 1).unwrap()[0] ^ 0xff;
        handle.write(FRAME_HEADER, &[corrupted]).unwrap();

        let log = open(&storage, &keys, true).await;
        assert_eq!(log.length(), 0);
    }

    // -----------------------------------------------------------------------
    // Remote appends
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn remote_append_verifies_and_applies() {
        let storage_a = MemoryStorage::new();
        let storage_b = MemoryStorage::new();
        let keys = pair();
        let writer = open(&storage_a, &keys, true).await;
        let reader = open(&storage_b, &keys, false).await;

        writer.append(b"payload").unwrap();
        let block = writer.read_record(0).unwrap().unwrap();
        assert!(reader.append_remote(block.clone()).unwrap());
        assert_eq!(reader.block(0).unwrap(), Some(b"payload".to_vec()));

        // Stale re-delivery is a no-op.
        assert!(!reader.append_remote(block).unwrap());
    }

    #[tokio::test]
    async fn remote_append_rejects_forged_blocks() {
        let storage = MemoryStorage::new();
        let reader = open(&storage, &pair(), false).await;
        let forger = KeyPair::from_seed([99u8; 32]);
        let forged = Block::build(0, GENESIS_PREV, b"evil".to_vec(), &forger);
        assert!(matches!(
            reader.append_remote(forged),
            Err(LogError::BadBlock { .. })
        ));
        assert_eq!(reader.length(), 0);
    }
}
