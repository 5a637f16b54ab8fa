//! Engine behavior against a minimal stub chain: deduplication, reference
//! accounting, eviction, events, and the discovery-request path, all
//! independent of any real chain implementation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chainstore::{
    Chain, ChainContext, ChainKeys, ChainOptions, Chainstore, DiscoveryKey, GetOptions, KeyPair,
    MasterKey, MemoryPeerStream, MemoryStorage, PeerStream, PublicKey, SecretKey, StoreError,
    StoreEvent, StoreOptions, StoreResult, StreamFrame,
};

struct TestChain {
    keys: ChainKeys,
    discovery_key: DiscoveryKey,
    closed: AtomicBool,
    replications: AtomicUsize,
}

#[async_trait]
impl Chain for TestChain {
    async fn open(ctx: ChainContext, _opts: ChainOptions) -> StoreResult<Self> {
        // The chain named "slow" suspends mid-open, so tests can interleave
        // other store operations with an open in flight.
        if ctx.keys.name.as_deref() == Some(b"slow") {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(Self {
            discovery_key: ctx.discovery_key,
            keys: ctx.keys,
            closed: AtomicBool::new(false),
            replications: AtomicUsize::new(0),
        })
    }

    fn public_key(&self) -> PublicKey {
        self.keys.public
    }

    fn secret_key(&self) -> Option<SecretKey> {
        self.keys.secret.clone()
    }

    fn discovery_key(&self) -> DiscoveryKey {
        self.discovery_key
    }

    fn length(&self) -> u64 {
        0
    }

    fn writable(&self) -> bool {
        self.keys.writable()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn replicate(self: Arc<Self>, _stream: Arc<dyn PeerStream>) -> StoreResult<()> {
        self.replications.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type TestStore = Chainstore<TestChain>;

async fn memory_store() -> (MemoryStorage, TestStore) {
    let storage = MemoryStorage::new();
    let store = Chainstore::open_with(Arc::new(storage.clone()), StoreOptions::default())
        .await
        .unwrap();
    (storage, store)
}

/// Poll until `check` holds or a few seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn equivalent_key_material_yields_one_handle() {
    let (_storage, store) = memory_store().await;
    let chain = store.default(GetOptions::default()).await.unwrap();

    let by_key = store.get(chain.public_key()).await.unwrap();
    let by_dk = store.get(chain.discovery_key()).await.unwrap();
    let by_pair = store
        .get(KeyPair {
            public: chain.public_key(),
            secret: chain.secret_key().unwrap(),
        })
        .await
        .unwrap();
    let by_b32 = store
        .get(GetOptions::from_encoded(&chain.public_key().to_base32()).unwrap())
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&chain, &by_key));
    assert!(Arc::ptr_eq(&chain, &by_dk));
    assert!(Arc::ptr_eq(&chain, &by_pair));
    assert!(Arc::ptr_eq(&chain, &by_b32));
}

#[tokio::test]
async fn concurrent_gets_share_one_slot() {
    let (_storage, store) = memory_store().await;
    let store = Arc::new(store);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.get(GetOptions::named("race")).await.unwrap()
        }));
    }
    let mut chains = Vec::new();
    for handle in handles {
        chains.push(handle.await.unwrap());
    }
    for chain in &chains[1..] {
        assert!(Arc::ptr_eq(&chains[0], chain));
    }
    assert_eq!(store.reference_count(&chains[0].discovery_key()), 1);
}

// ---------------------------------------------------------------------------
// Reference accounting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_ref_per_view_regardless_of_gets() {
    let (_storage, store) = memory_store().await;
    let a = store.namespace("a");
    let b = store.namespace("b");

    let chain = a.default(GetOptions::default()).await.unwrap();
    for _ in 0..3 {
        b.get(chain.public_key()).await.unwrap();
    }
    assert_eq!(store.reference_count(&chain.discovery_key()), 2);

    assert!(store.is_loaded(chain.public_key()).unwrap());
    assert!(store.is_external(chain.public_key()).unwrap());
}

#[tokio::test]
async fn view_close_releases_refs_but_keeps_chain_cached() {
    let (_storage, store) = memory_store().await;
    let view = store.namespace("tenant");
    let chain = view.default(GetOptions::default()).await.unwrap();
    assert_eq!(store.reference_count(&chain.discovery_key()), 1);

    view.close().await.unwrap();
    assert_eq!(store.reference_count(&chain.discovery_key()), 0);
    // Idle, not gone.
    assert!(store.is_loaded(chain.public_key()).unwrap());
    assert!(!store.is_external(chain.public_key()).unwrap());
}

// ---------------------------------------------------------------------------
// Derivation and namespaces
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shared_master_key_derives_identical_defaults() {
    let master = MasterKey::from_bytes([77u8; 32]);
    let opts = || StoreOptions {
        master_key: Some(master.clone()),
        ..Default::default()
    };
    let s1: TestStore = Chainstore::open_with(Arc::new(MemoryStorage::new()), opts())
        .await
        .unwrap();
    let s2: TestStore = Chainstore::open_with(Arc::new(MemoryStorage::new()), opts())
        .await
        .unwrap();

    let c1 = s1.default(GetOptions::default()).await.unwrap();
    let c2 = s2.default(GetOptions::default()).await.unwrap();
    assert_eq!(c1.public_key(), c2.public_key());

    let n1 = s1.namespace("x").default(GetOptions::default()).await.unwrap();
    let n2 = s2.namespace("x").default(GetOptions::default()).await.unwrap();
    assert_eq!(n1.public_key(), n2.public_key());
    assert_ne!(n1.public_key(), c1.public_key());
}

#[tokio::test]
async fn namespaces_are_disjoint_and_compose() {
    let (_storage, store) = memory_store().await;
    let a = store.namespace("a").default(GetOptions::default()).await.unwrap();
    let b = store.namespace("b").default(GetOptions::default()).await.unwrap();
    let root = store.default(GetOptions::default()).await.unwrap();
    assert_ne!(a.public_key(), b.public_key());
    assert_ne!(a.public_key(), root.public_key());

    // Nested namespaces chain their names.
    let nested = store.namespace("a").namespace("b");
    assert_eq!(nested.default_name(), "a:b");
    let nested_chain = nested.default(GetOptions::default()).await.unwrap();
    assert_ne!(nested_chain.public_key(), a.public_key());

    // Random namespaces never collide with anything known.
    let random = store.random_namespace();
    assert_ne!(random.default_name(), store.default_name());
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn default_without_name_is_missing_name() {
    let (_storage, store) = memory_store().await;
    let result = store
        .get(GetOptions {
            default: true,
            ..Default::default()
        })
        .await;
    assert!(matches!(result, Err(StoreError::MissingName)));
}

#[tokio::test]
async fn passive_get_for_unknown_chain_is_suppressed() {
    let (_storage, store) = memory_store().await;
    let mut events = store.subscribe();
    let dk = DiscoveryKey::from_bytes([42u8; 32]);

    let result = store.get(dk).await;
    assert!(matches!(result, Err(StoreError::UnknownKeypair(_))));
    // The failed slot does not linger.
    assert!(!store.is_loaded(dk).unwrap());
    // And no error event fires: the chain simply is not local.
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn closed_store_rejects_operations() {
    let (_storage, store) = memory_store().await;
    store.close().await.unwrap();
    assert!(store.is_closed());
    assert!(matches!(
        store.get(GetOptions::default()).await,
        Err(StoreError::Closed)
    ));
    let (stream, _peer) = MemoryPeerStream::pair();
    assert!(matches!(
        store.replicate(stream).await,
        Err(StoreError::Closed)
    ));
    // Idempotent.
    store.close().await.unwrap();
}

#[tokio::test]
async fn root_close_closes_all_chains() {
    let (_storage, store) = memory_store().await;
    let c1 = store.default(GetOptions::default()).await.unwrap();
    let c2 = store.get(GetOptions::named("other")).await.unwrap();
    store.close().await.unwrap();
    assert!(c1.is_closed());
    assert!(c2.is_closed());
}

// ---------------------------------------------------------------------------
// Eviction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chain_being_opened_is_not_evicted() {
    let store: Arc<TestStore> = Arc::new(
        Chainstore::open_with(
            Arc::new(MemoryStorage::new()),
            StoreOptions {
                cache_size: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap(),
    );

    // A get whose open suspends; its slot must stay referenced throughout.
    let pending = tokio::spawn({
        let store = Arc::clone(&store);
        async move {
            let view = store.namespace("writer");
            view.get(GetOptions::named("slow")).await.unwrap()
        }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Meanwhile, churn through other chains so every insert runs an
    // eviction pass over the one-entry cache.
    for i in 0..3 {
        let tmp = store.namespace(format!("tmp-{i}"));
        tmp.default(GetOptions::default()).await.unwrap();
        tmp.close().await.unwrap();
    }

    let slow = pending.await.unwrap();
    // Still pinned by the view that opened it, never evicted mid-open.
    assert_eq!(store.reference_count(&slow.discovery_key()), 1);
    assert!(store.is_loaded(slow.public_key()).unwrap());
    assert!(!slow.is_closed());

    // And later gets deduplicate against the live instance.
    let again = store.get(slow.public_key()).await.unwrap();
    assert!(Arc::ptr_eq(&slow, &again));
}

#[tokio::test]
async fn idle_chains_are_evicted_and_closed() {
    let storage = MemoryStorage::new();
    let store: TestStore = Chainstore::open_with(
        Arc::new(storage),
        StoreOptions {
            cache_size: 1,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let tenant = store.namespace("t1");
    let idle = tenant.default(GetOptions::default()).await.unwrap();
    tenant.close().await.unwrap();

    // Opening another chain overflows the cache and evicts the idle one.
    let _active = store.namespace("t2").default(GetOptions::default()).await.unwrap();
    eventually(|| idle.is_closed()).await;
    assert!(!store.is_loaded(idle.public_key()).unwrap());
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn feed_fires_for_every_new_chain() {
    let (_storage, store) = memory_store().await;
    let mut events = store.subscribe();

    let chain = store.default(GetOptions::default()).await.unwrap();
    match events.recv().await.unwrap() {
        StoreEvent::Feed { discovery_key, .. } => {
            assert_eq!(discovery_key, chain.discovery_key())
        }
        other => panic!("expected feed, got {other:?}"),
    }

    // A cache hit fires nothing.
    store.get(chain.public_key()).await.unwrap();
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn master_key_persists_across_opens() {
    let storage = MemoryStorage::new();
    let store: TestStore =
        Chainstore::open_with(Arc::new(storage.clone()), StoreOptions::default())
            .await
            .unwrap();
    let first = store.default(GetOptions::default()).await.unwrap().public_key();
    store.close().await.unwrap();
    assert!(storage.contains("master_key"));

    let store: TestStore =
        Chainstore::open_with(Arc::new(storage.clone()), StoreOptions::default())
            .await
            .unwrap();
    let second = store.default(GetOptions::default()).await.unwrap().public_key();
    assert_eq!(first, second);
}

#[tokio::test]
async fn reopen_resolves_passive_references_from_disk() {
    let storage = MemoryStorage::new();
    let store: TestStore =
        Chainstore::open_with(Arc::new(storage.clone()), StoreOptions::default())
            .await
            .unwrap();
    let chain = store.get(GetOptions::named("docs")).await.unwrap();
    let dk = chain.discovery_key();
    let public = chain.public_key();
    store.close().await.unwrap();

    let store: TestStore =
        Chainstore::open_with(Arc::new(storage), StoreOptions::default())
            .await
            .unwrap();
    assert!(store.chain_exists_on_disk(&dk).unwrap());
    let rehydrated = store.get(dk).await.unwrap();
    assert_eq!(rehydrated.public_key(), public);
    assert!(rehydrated.writable());
    assert!(store.is_loaded(dk).unwrap());
}

// ---------------------------------------------------------------------------
// Replication multiplexer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn attach_replicates_owned_chains_and_injects_new_ones() {
    let (_storage, store) = memory_store().await;
    let existing = store.default(GetOptions::default()).await.unwrap();

    let (local, _remote) = MemoryPeerStream::pair();
    store.replicate(local).await.unwrap();
    assert_eq!(existing.replications.load(Ordering::SeqCst), 1);

    // A chain opened after the stream is live still reaches it.
    let late = store.get(GetOptions::named("late")).await.unwrap();
    eventually(|| late.replications.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn discovery_requests_materialize_local_chains() {
    let (_storage, store) = memory_store().await;
    let chain = store.get(GetOptions::named("served")).await.unwrap();

    // Attach through an empty view so nothing is pre-replicated.
    let (local, remote) = MemoryPeerStream::pair();
    store.namespace("empty").replicate(local).await.unwrap();
    assert_eq!(chain.replications.load(Ordering::SeqCst), 0);

    remote
        .send(StreamFrame::Discovery(chain.discovery_key()))
        .unwrap();
    eventually(|| chain.replications.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn unknown_discovery_requests_close_the_channel() {
    let (_storage, store) = memory_store().await;
    let (local, remote) = MemoryPeerStream::pair();
    store.replicate(local).await.unwrap();

    let mut frames = remote.subscribe();
    let unknown = DiscoveryKey::from_bytes([9u8; 32]);
    remote.send(StreamFrame::Discovery(unknown)).unwrap();

    loop {
        match frames.recv().await.unwrap() {
            StreamFrame::ChannelClosed(dk) => {
                assert_eq!(dk, unknown);
                break;
            }
            _ => continue,
        }
    }
    assert!(!store.is_loaded(unknown).unwrap());
}

#[tokio::test]
async fn closing_the_stream_detaches_it() {
    let (_storage, store) = memory_store().await;
    let chain = store.default(GetOptions::default()).await.unwrap();

    let (local, remote) = MemoryPeerStream::pair();
    store.replicate(local.clone()).await.unwrap();
    assert_eq!(chain.replications.load(Ordering::SeqCst), 1);

    remote.close();
    eventually(|| local.is_closed()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // New chains are not injected into a dead stream.
    let late = store.get(GetOptions::named("after-close")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(late.replications.load(Ordering::SeqCst), 0);
}
