//! The chain factory engine and its namespaced views.
//!
//! One engine per physical store: it owns the master secret, the chain
//! cache, and the active replication streams. Users hold [`Chainstore`]
//! views onto it; every view shares the one engine, contributes at most one
//! cache reference per chain it owns, and derives its default chain under
//! its own namespace name.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chainstore_crypto::{DiscoveryKey, MasterKey};
use chainstore_storage::{layout, DiskStorage, StorageBackend};
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, info, warn};

use crate::cache::ChainCache;
use crate::chain::{Chain, ChainContext, ChainFiles};
use crate::error::{StoreError, StoreResult};
use crate::keyfile;
use crate::options::{ChainOptions, GetOptions, StoreOptions};
use crate::resolver::{self, ResolvedKeys};
use crate::stream::{PeerStream, StreamFrame};
use crate::subcache::CacheSet;

/// Events emitted by the engine.
pub enum StoreEvent<C> {
    /// A chain became ready (locally requested or peer-initiated).
    Feed {
        discovery_key: DiscoveryKey,
        chain: Arc<C>,
    },
    /// A background failure: eviction close or replication.
    Error(Arc<StoreError>),
}

impl<C> Clone for StoreEvent<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Feed {
                discovery_key,
                chain,
            } => Self::Feed {
                discovery_key: *discovery_key,
                chain: Arc::clone(chain),
            },
            Self::Error(err) => Self::Error(Arc::clone(err)),
        }
    }
}

impl<C> std::fmt::Debug for StoreEvent<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Feed { discovery_key, .. } => {
                f.debug_struct("Feed").field("discovery_key", discovery_key).finish()
            }
            Self::Error(err) => f.debug_tuple("Error").field(err).finish(),
        }
    }
}

/// A cache slot: inserted synchronously so concurrent `get`s deduplicate,
/// initialized once when the chain finishes opening.
struct ChainSlot<C> {
    chain: OnceCell<Arc<C>>,
}

impl<C> ChainSlot<C> {
    fn new() -> Self {
        Self {
            chain: OnceCell::new(),
        }
    }
}

/// One registered replication stream.
struct StreamEntry {
    stream: Arc<dyn PeerStream>,
    /// Discovery keys already riding this stream, so a chain is attached at
    /// most once per (stream, chain) pair.
    replicated: HashSet<DiscoveryKey>,
    driver: tokio::task::JoinHandle<()>,
}

/// The shared engine behind every view of one store.
struct Engine<C: Chain> {
    backend: Arc<dyn StorageBackend>,
    master: MasterKey,
    options: StoreOptions,
    cache: Mutex<ChainCache<Arc<ChainSlot<C>>>>,
    streams: Mutex<Vec<StreamEntry>>,
    events: broadcast::Sender<StoreEvent<C>>,
    closed: AtomicBool,
    /// Handed to stream drivers, which must not keep a closed store alive.
    weak: Weak<Engine<C>>,
}

impl<C: Chain> Engine<C> {
    fn new(backend: Arc<dyn StorageBackend>, master: MasterKey, options: StoreOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(options.channel_capacity);
        Arc::new_cyclic(|weak| Self {
            cache: Mutex::new(ChainCache::new(options.cache_size)),
            streams: Mutex::new(Vec::new()),
            backend,
            master,
            options,
            events,
            closed: AtomicBool::new(false),
            weak: weak.clone(),
        })
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn emit_error(&self, err: StoreError) {
        let _ = self.events.send(StoreEvent::Error(Arc::new(err)));
    }

    fn resolve(&self, opts: &GetOptions) -> StoreResult<ResolvedKeys> {
        self.ensure_open()?;
        resolver::resolve(opts, &self.master)
    }

    /// Open (or fetch) the chain for already-resolved keys.
    ///
    /// With `pin` set, the calling view's cache reference is taken under
    /// the same lock that materializes the slot, before the open suspends:
    /// eviction pressure from concurrent `get`s can never drop a slot a
    /// view is waiting on.
    async fn get_resolved(
        &self,
        resolved: ResolvedKeys,
        chain_opts: Option<ChainOptions>,
        cache_opts: Option<CacheSet>,
        pin: bool,
    ) -> StoreResult<Arc<C>> {
        self.ensure_open()?;
        let dk = resolved.discovery_key;

        // The slot goes into the cache before any I/O happens, so a second
        // `get` for the same id always lands on the same slot.
        let (slot, evicted) = {
            let mut cache = self.cache.lock().expect("lock poisoned");
            let existing = if pin {
                cache.get_and_increment(&dk)
            } else {
                cache.get(&dk)
            };
            match existing {
                Some(slot) => (slot, Vec::new()),
                None => {
                    let slot = Arc::new(ChainSlot::new());
                    let evicted = if pin {
                        cache.insert_pinned(dk, Arc::clone(&slot))
                    } else {
                        cache.insert(dk, Arc::clone(&slot))
                    };
                    (slot, evicted)
                }
            }
        };
        self.close_evicted(evicted);

        let opened = slot
            .chain
            .get_or_try_init(|| self.open_chain(dk, &resolved, chain_opts, cache_opts))
            .await
            .map(Arc::clone);

        match opened {
            Ok(chain) => {
                // A failed concurrent attempt (or eviction of an unpinned
                // slot) may have dropped the entry mid-open; restore it so
                // later gets deduplicate against this live instance.
                let evicted = {
                    let mut cache = self.cache.lock().expect("lock poisoned");
                    match cache.entry(&dk) {
                        Some((existing, _)) => {
                            if pin && !Arc::ptr_eq(&existing, &slot) {
                                // The original slot carried this view's
                                // reference; move it to the replacement.
                                let repinned = cache.increment(&dk);
                                debug_assert!(repinned, "entry is present under the cache lock");
                            }
                            Vec::new()
                        }
                        None if pin => cache.insert_pinned(dk, Arc::clone(&slot)),
                        None => cache.insert(dk, Arc::clone(&slot)),
                    }
                };
                self.close_evicted(evicted);
                Ok(chain)
            }
            Err(err) => {
                {
                    let mut cache = self.cache.lock().expect("lock poisoned");
                    if pin && !cache.decrement(&dk) {
                        debug!(discovery_key = %dk, "reference was dropped with its entry");
                    }
                    // The failed slot must not shadow the id for later
                    // gets; a surviving reference means another caller is
                    // still waiting on it.
                    if let Some((existing, refs)) = cache.entry(&dk) {
                        if refs == 0 && Arc::ptr_eq(&existing, &slot) && slot.chain.get().is_none()
                        {
                            cache.remove(&dk);
                        }
                    }
                }
                if matches!(err, StoreError::UnknownKeypair(_)) {
                    // Not an error: the chain simply is not on this node.
                    debug!(discovery_key = %dk, "no local key material for chain");
                }
                Err(err)
            }
        }
    }

    async fn open_chain(
        &self,
        dk: DiscoveryKey,
        resolved: &ResolvedKeys,
        chain_opts: Option<ChainOptions>,
        cache_opts: Option<CacheSet>,
    ) -> StoreResult<Arc<C>> {
        let keys = keyfile::load_or_init(&self.backend, &self.master, resolved)?;
        let files = ChainFiles::new(Arc::clone(&self.backend), &dk);
        let cache = cache_opts
            .or_else(|| self.options.cache.clone())
            .map(|set| set.namespace())
            .unwrap_or_default();
        let opts = chain_opts.unwrap_or_else(|| self.options.chain.clone());

        let ctx = ChainContext {
            files,
            keys,
            discovery_key: dk,
            cache,
        };
        let chain = Arc::new(C::open(ctx, opts).await?);
        debug!(discovery_key = %dk, writable = chain.writable(), "chain ready");

        let _ = self.events.send(StoreEvent::Feed {
            discovery_key: dk,
            chain: Arc::clone(&chain),
        });
        self.inject(&chain, dk).await;
        Ok(chain)
    }

    /// Attach a freshly ready chain to every live stream it is not already
    /// riding. This is what makes replication symmetric: locally created
    /// and peer-announced chains both reach every stream.
    async fn inject(&self, chain: &Arc<C>, dk: DiscoveryKey) {
        let targets: Vec<Arc<dyn PeerStream>> = {
            let mut streams = self.streams.lock().expect("lock poisoned");
            streams
                .iter_mut()
                .filter(|entry| !entry.stream.is_closed())
                .filter_map(|entry| {
                    entry
                        .replicated
                        .insert(dk)
                        .then(|| Arc::clone(&entry.stream))
                })
                .collect()
        };
        for stream in targets {
            debug!(discovery_key = %dk, "injecting chain into live stream");
            if let Err(err) = Arc::clone(chain).replicate(stream).await {
                warn!(discovery_key = %dk, error = %err, "chain injection failed");
                self.emit_error(err);
            }
        }
    }

    fn is_loaded(&self, opts: &GetOptions) -> StoreResult<bool> {
        let resolved = resolver::resolve(opts, &self.master)?;
        let cache = self.cache.lock().expect("lock poisoned");
        Ok(cache.contains(&resolved.discovery_key))
    }

    fn is_external(&self, opts: &GetOptions) -> StoreResult<bool> {
        let resolved = resolver::resolve(opts, &self.master)?;
        let cache = self.cache.lock().expect("lock poisoned");
        Ok(cache.refs(&resolved.discovery_key) > 0)
    }

    /// Take one view reference for a chain that is already cached.
    /// Returns `false` (no reference taken) when the id is not cached.
    fn try_pin(&self, dk: &DiscoveryKey) -> bool {
        let mut cache = self.cache.lock().expect("lock poisoned");
        cache.get_and_increment(dk).is_some()
    }

    /// Drop one view reference. Returns `false` when the entry was already
    /// removed (its references went with it).
    fn decrement(&self, dk: &DiscoveryKey) -> bool {
        let mut cache = self.cache.lock().expect("lock poisoned");
        cache.decrement(dk)
    }

    fn refs(&self, dk: &DiscoveryKey) -> u32 {
        self.cache.lock().expect("lock poisoned").refs(dk)
    }

    fn pinned_chains(&self) -> Vec<Arc<C>> {
        let cache = self.cache.lock().expect("lock poisoned");
        cache
            .pinned_values()
            .into_iter()
            .filter_map(|slot| slot.chain.get().cloned())
            .collect()
    }

    fn close_evicted(&self, victims: Vec<Arc<ChainSlot<C>>>) {
        for victim in victims {
            let Some(chain) = victim.chain.get().cloned() else {
                continue;
            };
            let events = self.events.clone();
            let dk = chain.discovery_key();
            tokio::spawn(async move {
                debug!(discovery_key = %dk, "closing evicted chain");
                if let Err(err) = chain.close().await {
                    let _ = events.send(StoreEvent::Error(Arc::new(err)));
                }
            });
        }
    }

    async fn attach_stream(
        &self,
        stream: Arc<dyn PeerStream>,
        chains: Vec<Arc<C>>,
    ) -> StoreResult<()> {
        self.ensure_open()?;

        let replicated: HashSet<DiscoveryKey> =
            chains.iter().map(|chain| chain.discovery_key()).collect();
        // Subscribe before the driver task is scheduled: announcements that
        // arrive right after attach must not be dropped.
        let frames = stream.subscribe();
        let driver = tokio::spawn(Self::drive_stream(
            self.weak.clone(),
            Arc::clone(&stream),
            frames,
        ));
        {
            let mut streams = self.streams.lock().expect("lock poisoned");
            streams.push(StreamEntry {
                stream: Arc::clone(&stream),
                replicated,
                driver,
            });
        }
        debug!(chains = chains.len(), "peer stream attached");

        for chain in chains {
            let dk = chain.discovery_key();
            if let Err(err) = chain.replicate(Arc::clone(&stream)).await {
                warn!(discovery_key = %dk, error = %err, "replication start failed");
                self.emit_error(err);
            }
        }
        Ok(())
    }

    /// Per-stream driver: answers remote discovery-key requests and cleans
    /// up when the stream goes away. Holds only a weak engine reference so
    /// streams never keep a closed store alive.
    async fn drive_stream(
        engine: Weak<Self>,
        stream: Arc<dyn PeerStream>,
        mut frames: broadcast::Receiver<StreamFrame>,
    ) {
        let mut closed = stream.closed();
        while !stream.is_closed() {
            tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() || *closed.borrow() {
                        break;
                    }
                }
                frame = frames.recv() => match frame {
                    Ok(StreamFrame::Discovery(dk)) => {
                        let Some(engine) = engine.upgrade() else { break };
                        engine.handle_discovery(dk, &stream).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "stream driver lagged behind frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        if let Some(engine) = engine.upgrade() {
            engine.detach_stream(&stream);
        }
    }

    /// Answer a remote announcement: materialize the chain if it exists on
    /// disk, otherwise close just that sub-channel.
    async fn handle_discovery(&self, dk: DiscoveryKey, stream: &Arc<dyn PeerStream>) {
        let already = {
            let streams = self.streams.lock().expect("lock poisoned");
            streams
                .iter()
                .find(|entry| Arc::ptr_eq(&entry.stream, stream))
                .map(|entry| entry.replicated.contains(&dk))
                .unwrap_or(false)
        };
        if already {
            return;
        }

        match keyfile::chain_exists(&self.backend, &dk) {
            Ok(true) => match self
                .get_resolved(ResolvedKeys::passive(dk), None, None, false)
                .await
            {
                Ok(chain) => {
                    let fresh = {
                        let mut streams = self.streams.lock().expect("lock poisoned");
                        streams
                            .iter_mut()
                            .find(|entry| Arc::ptr_eq(&entry.stream, stream))
                            .map(|entry| entry.replicated.insert(dk))
                            .unwrap_or(false)
                    };
                    if fresh {
                        if let Err(err) = chain.replicate(Arc::clone(stream)).await {
                            warn!(discovery_key = %dk, error = %err, "replication failed");
                            self.emit_error(err);
                        }
                    }
                }
                Err(err) => {
                    debug!(discovery_key = %dk, error = %err, "cannot serve announced chain");
                    stream.close_channel(&dk);
                }
            },
            Ok(false) => {
                debug!(discovery_key = %dk, "announced chain not on disk");
                stream.close_channel(&dk);
            }
            Err(err) => {
                warn!(discovery_key = %dk, error = %err, "exists-check failed");
                self.emit_error(err);
                stream.close_channel(&dk);
            }
        }
    }

    fn detach_stream(&self, stream: &Arc<dyn PeerStream>) {
        let mut streams = self.streams.lock().expect("lock poisoned");
        streams.retain(|entry| !Arc::ptr_eq(&entry.stream, stream));
    }

    async fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Streams first, then chains: drivers stop announcing before the
        // chains they reference go away.
        let entries: Vec<StreamEntry> = {
            let mut streams = self.streams.lock().expect("lock poisoned");
            streams.drain(..).collect()
        };
        for entry in &entries {
            entry.stream.close();
        }
        for entry in entries {
            let _ = entry.driver.await;
        }

        let slots = {
            let mut cache = self.cache.lock().expect("lock poisoned");
            cache.drain()
        };
        let mut first_err = None;
        for slot in slots {
            if let Some(chain) = slot.chain.get() {
                if let Err(err) = chain.close().await {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        info!("store closed");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Load the persisted master secret, creating it on first open.
fn load_or_create_master(backend: &Arc<dyn StorageBackend>) -> StoreResult<MasterKey> {
    let handle = backend.open(layout::MASTER_KEY_FILE)?;
    match handle.read(0, 32) {
        Ok(bytes) => Ok(MasterKey::from_slice(&bytes)?),
        Err(e) if e.is_absence() => {
            let master = MasterKey::generate();
            handle.write(0, master.as_bytes())?;
            handle.sync()?;
            info!("generated master key for fresh store");
            Ok(master)
        }
        Err(e) => Err(e.into()),
    }
}

/// A user-facing view of the store.
///
/// The root view (from [`Chainstore::open`]) derives its default chain
/// under the name `"default"` and replicates every chain any view owns;
/// [`Chainstore::namespace`] creates child views with disjoint defaults
/// that replicate only what they own. Dropping a view does nothing;
/// references are released by [`Chainstore::close`].
pub struct Chainstore<C: Chain> {
    engine: Arc<Engine<C>>,
    /// `None` at the root; the composed namespace path otherwise.
    namespace: Option<String>,
    /// Chains this view holds a cache reference for. `None` marks a
    /// reservation: a `get` in flight that already took the reference but
    /// has not produced its handle yet.
    owned: Mutex<HashMap<DiscoveryKey, Option<Arc<C>>>>,
}

impl<C: Chain> Chainstore<C> {
    /// Open a store rooted at a directory on disk.
    pub async fn open(root: impl Into<PathBuf>, options: StoreOptions) -> StoreResult<Self> {
        Self::open_with(Arc::new(DiskStorage::new(root)), options).await
    }

    /// Open a store over any storage backend.
    pub async fn open_with(
        backend: Arc<dyn StorageBackend>,
        options: StoreOptions,
    ) -> StoreResult<Self> {
        let master = match &options.master_key {
            Some(master) => master.clone(),
            None => load_or_create_master(&backend)?,
        };
        Ok(Self {
            engine: Engine::new(backend, master, options),
            namespace: None,
            owned: Mutex::new(HashMap::new()),
        })
    }

    /// The name this view derives its default chain under.
    pub fn default_name(&self) -> &str {
        self.namespace.as_deref().unwrap_or("default")
    }

    /// Returns `true` for the root view.
    pub fn is_root(&self) -> bool {
        self.namespace.is_none()
    }

    /// Open (or create) a chain. Repeated calls with equivalent key
    /// material return the same handle, and this view contributes exactly
    /// one cache reference per chain no matter how often it asks.
    pub async fn get(&self, opts: impl Into<GetOptions>) -> StoreResult<Arc<C>> {
        let opts = opts.into();
        let resolved = self.engine.resolve(&opts)?;
        let dk = resolved.discovery_key;

        // Reserve ownership up front: the engine takes this view's cache
        // reference together with the slot, before the open suspends, so
        // concurrent eviction pressure cannot drop an in-flight chain.
        let reserved = {
            let mut owned = self.owned.lock().expect("lock poisoned");
            if owned.contains_key(&dk) {
                false
            } else {
                owned.insert(dk, None);
                true
            }
        };

        let result = self
            .engine
            .get_resolved(resolved, opts.chain, opts.cache, reserved)
            .await;

        match result {
            Ok(chain) => {
                let mut owned = self.owned.lock().expect("lock poisoned");
                match owned.get(&dk).map(|slot| slot.is_some()) {
                    // Already recorded by an earlier call.
                    Some(true) => {}
                    // Our reservation: fill it in.
                    Some(false) if reserved => {
                        owned.insert(dk, Some(Arc::clone(&chain)));
                    }
                    // A concurrent call on this view holds the reservation
                    // and fills it when it completes.
                    Some(false) => {}
                    // The reservation is gone (released by close or by a
                    // failed concurrent attempt); only record ownership if
                    // a fresh reference can actually be taken.
                    None => {
                        if self.engine.try_pin(&dk) {
                            owned.insert(dk, Some(Arc::clone(&chain)));
                        }
                    }
                }
                Ok(chain)
            }
            Err(err) => {
                if reserved {
                    let mut owned = self.owned.lock().expect("lock poisoned");
                    if matches!(owned.get(&dk), Some(None)) {
                        owned.remove(&dk);
                    }
                }
                Err(err)
            }
        }
    }

    /// This view's default chain: `get` under the view's namespace name.
    /// Key material in `opts` still takes precedence over the name.
    pub async fn default(&self, opts: GetOptions) -> StoreResult<Arc<C>> {
        let opts = GetOptions {
            name: Some(self.default_name().as_bytes().to_vec()),
            default: true,
            ..opts
        };
        self.get(opts).await
    }

    /// A child view with a disjoint default chain over the same store.
    pub fn namespace(&self, name: impl AsRef<str>) -> Self {
        let name = name.as_ref();
        let composed = match &self.namespace {
            None => name.to_string(),
            Some(parent) => format!("{parent}:{name}"),
        };
        Self {
            engine: Arc::clone(&self.engine),
            namespace: Some(composed),
            owned: Mutex::new(HashMap::new()),
        }
    }

    /// A child view under a random (collision-free) namespace name.
    pub fn random_namespace(&self) -> Self {
        self.namespace(hex::encode(chainstore_crypto::random_name()))
    }

    /// Returns `true` if the chain is currently instantiated in the cache.
    /// No side effects.
    pub fn is_loaded(&self, opts: impl Into<GetOptions>) -> StoreResult<bool> {
        self.engine.is_loaded(&opts.into())
    }

    /// Returns `true` if the chain is instantiated *and* owned by at least
    /// one view. No side effects.
    pub fn is_external(&self, opts: impl Into<GetOptions>) -> StoreResult<bool> {
        self.engine.is_external(&opts.into())
    }

    /// Check whether a chain exists on disk without instantiating it.
    pub fn chain_exists_on_disk(&self, discovery_key: &DiscoveryKey) -> StoreResult<bool> {
        keyfile::chain_exists(&self.engine.backend, discovery_key)
    }

    /// Current view reference count for a chain in the shared cache.
    pub fn reference_count(&self, discovery_key: &DiscoveryKey) -> u32 {
        self.engine.refs(discovery_key)
    }

    /// Snapshot of the chains this view owns.
    pub fn list(&self) -> HashMap<DiscoveryKey, Arc<C>> {
        self.owned
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter_map(|(dk, chain)| chain.as_ref().map(|chain| (*dk, Arc::clone(chain))))
            .collect()
    }

    /// Replicate over an adopted peer stream.
    ///
    /// The root view replicates every chain owned by any view; a namespaced
    /// view replicates only its own chains. Chains opened later are
    /// injected into the stream automatically.
    pub async fn replicate(&self, stream: Arc<dyn PeerStream>) -> StoreResult<()> {
        let chains = if self.is_root() {
            self.engine.pinned_chains()
        } else {
            self.owned
                .lock()
                .expect("lock poisoned")
                .values()
                .filter_map(|chain| chain.clone())
                .collect()
        };
        self.engine.attach_stream(stream, chains).await
    }

    /// Subscribe to store events (chain ready, background errors).
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent<C>> {
        self.engine.events.subscribe()
    }

    /// Returns `true` once the engine has been closed.
    pub fn is_closed(&self) -> bool {
        self.engine.closed.load(Ordering::SeqCst)
    }

    /// Close this view.
    ///
    /// A namespaced view releases its chain references and leaves the store
    /// running. The root view tears the engine down: destroys all streams,
    /// closes all chains, and reports the first close error if any.
    pub async fn close(&self) -> StoreResult<()> {
        if self.is_root() {
            return self.engine.close().await;
        }
        let owned: Vec<DiscoveryKey> = {
            let mut owned = self.owned.lock().expect("lock poisoned");
            owned.drain().map(|(dk, _)| dk).collect()
        };
        for dk in owned {
            if !self.engine.decrement(&dk) {
                debug!(discovery_key = %dk, "chain reference was already released");
            }
        }
        Ok(())
    }
}

impl<C: Chain> std::fmt::Debug for Chainstore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chainstore")
            .field("namespace", &self.default_name())
            .field("owned", &self.owned.lock().expect("lock poisoned").len())
            .finish()
    }
}
