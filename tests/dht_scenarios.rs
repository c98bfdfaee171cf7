//! End-to-end DHT behavior over the in-process loopback protocol

use kadnet::{
    AddOutcome, Contact, Dht, DhtConfig, LoopbackProtocol, MemoryStorage, Node, NodeId,
    ParallelRouter, Router, SerialRouter, Storage,
};
use std::sync::Arc;

fn separate_stores() -> impl Fn() -> Arc<dyn Storage> {
    || Arc::new(MemoryStorage::new()) as Arc<dyn Storage>
}

/// One shared store for every role, so "our storage" is a single place to
/// assert against
fn shared_store() -> (Arc<MemoryStorage>, impl Fn() -> Arc<dyn Storage>) {
    let store = MemoryStorage::shared();
    let factory = {
        let store = store.clone();
        move || store.clone() as Arc<dyn Storage>
    };
    (store, factory)
}

fn loopback_dht<F>(id: NodeId, factory: F) -> Dht
where
    F: Fn() -> Arc<dyn Storage>,
{
    let config = DhtConfig::default();
    let protocol = LoopbackProtocol::new();
    let router = Arc::new(SerialRouter::new(config.clone()));
    let dht = Dht::new(config, id, protocol.clone(), router, factory);
    protocol.bind(dht.node());
    dht
}

fn parallel_dht<F>(id: NodeId, factory: F) -> (Dht, Arc<ParallelRouter>)
where
    F: Fn() -> Arc<dyn Storage>,
{
    let config = DhtConfig::default();
    let protocol = LoopbackProtocol::new();
    let router = Arc::new(ParallelRouter::new(config.clone()));
    let dht = Dht::new(config, id, protocol.clone(), router.clone(), factory);
    protocol.bind(dht.node());
    (dht, router)
}

/// A standalone peer node reachable over loopback
struct Peer {
    node: Arc<Node>,
    storage: Arc<MemoryStorage>,
    cache: Arc<MemoryStorage>,
}

impl Peer {
    fn new(id: NodeId) -> Self {
        let protocol = LoopbackProtocol::new();
        let storage = Arc::new(MemoryStorage::new());
        let cache = Arc::new(MemoryStorage::new());
        let node = Arc::new(Node::new(
            Contact::new(id, protocol.clone()),
            storage.clone(),
            cache.clone(),
            DhtConfig::default(),
        ));
        protocol.bind(&node);
        Self {
            node,
            storage,
            cache,
        }
    }

    fn contact(&self) -> Contact {
        self.node.our_contact().clone()
    }
}

#[tokio::test]
async fn local_store_local_find() {
    let dht = loopback_dht(NodeId::mid(), separate_stores());
    let key = NodeId::from_key_bytes(b"abc");

    dht.store(key, b"Test".to_vec()).await.unwrap();
    let result = dht.find_value(key).await.unwrap();

    assert!(result.found);
    assert_eq!(result.value, Some(b"Test".to_vec()));
}

#[tokio::test]
async fn value_found_on_closer_peer() {
    // our id is the far end of the space; the peer in the middle is closer
    // to key 0 and already holds the binding
    let dht = loopback_dht(NodeId::max(), separate_stores());
    let peer = Peer::new(NodeId::mid());
    let key = NodeId::zero();
    peer.storage.set(key, b"Test".to_vec(), 0).unwrap();

    dht.node().observe(peer.contact()).await;

    let result = dht.find_value(key).await.unwrap();
    assert!(result.found);
    assert_eq!(result.value, Some(b"Test".to_vec()));

    // the lookup must not copy the value into our own stores
    assert!(!dht.originator_storage().contains(&key).unwrap());
    assert!(!dht.republish_storage().contains(&key).unwrap());
    // and the peer keeps it
    assert!(peer.storage.contains(&key).unwrap());
}

#[tokio::test]
async fn found_value_is_cached_on_intermediate_closer_peer() {
    let dht = loopback_dht(NodeId::zero(), separate_stores());
    let holder = Peer::new(NodeId::mid());
    let intermediate = Peer::new(NodeId::from_bit(158));
    let key = NodeId::zero();
    holder.storage.set(key, b"Test".to_vec(), 0).unwrap();

    dht.node().observe(holder.contact()).await;
    dht.node().observe(intermediate.contact()).await;

    let result = dht.find_value(key).await.unwrap();
    assert!(result.found);
    assert_eq!(result.value, Some(b"Test".to_vec()));

    // the intermediate peer is strictly closer to the key than the holder:
    // it receives a cached copy at half the default expiration
    assert!(intermediate.cache.contains(&key).unwrap());
    assert_eq!(
        intermediate.cache.expiration_secs(&key).unwrap(),
        Some(DhtConfig::default().expiration_secs / 2)
    );
    assert!(!intermediate.storage.contains(&key).unwrap());
}

#[tokio::test]
async fn no_caching_when_the_closest_peer_held_the_value() {
    let dht = loopback_dht(NodeId::max(), separate_stores());
    let holder = Peer::new(NodeId::mid());
    let farther = Peer::new(NodeId::max() ^ NodeId::from_u64(1));
    let key = NodeId::zero();
    holder.storage.set(key, b"Test".to_vec(), 0).unwrap();

    dht.node().observe(holder.contact()).await;
    dht.node().observe(farther.contact()).await;

    let result = dht.find_value(key).await.unwrap();
    assert!(result.found);
    // nobody closer than the holder was encountered; no cache copies appear
    assert!(!farther.cache.contains(&key).unwrap());
    assert!(!holder.cache.contains(&key).unwrap());
}

#[tokio::test]
async fn store_propagates_to_close_peers() {
    let (mine, factory) = shared_store();
    let dht = loopback_dht(NodeId::zero(), factory);
    let peer = Peer::new(NodeId::mid());
    let key = NodeId::zero();

    dht.node().observe(peer.contact()).await;

    assert!(!mine.contains(&key).unwrap());
    assert!(!peer.storage.contains(&key).unwrap());

    dht.store(key, b"Test".to_vec()).await.unwrap();

    assert_eq!(mine.get(&key).unwrap(), Some(b"Test".to_vec()));
    assert_eq!(peer.storage.get(&key).unwrap(), Some(b"Test".to_vec()));
}

#[tokio::test]
async fn store_is_idempotent() {
    let (_mine, factory) = shared_store();
    let dht = loopback_dht(NodeId::zero(), factory);
    let peer = Peer::new(NodeId::mid());
    let key = NodeId::from_u64(12);

    dht.node().observe(peer.contact()).await;

    dht.store(key, b"Test".to_vec()).await.unwrap();
    dht.store(key, b"Test".to_vec()).await.unwrap();

    assert_eq!(peer.storage.get(&key).unwrap(), Some(b"Test".to_vec()));
    assert_eq!(peer.storage.entries().unwrap().len(), 1);
}

#[tokio::test]
async fn parallel_router_resolves_values_too() {
    let (dht, router) = parallel_dht(NodeId::max(), separate_stores());
    let peer = Peer::new(NodeId::mid());
    let key = NodeId::zero();
    peer.storage.set(key, b"Test".to_vec(), 0).unwrap();

    dht.node().observe(peer.contact()).await;

    let result = dht.find_value(key).await.unwrap();
    assert!(result.found);
    assert_eq!(result.value, Some(b"Test".to_vec()));

    dht.shutdown().await;
    router.shutdown().await;
}

#[tokio::test]
async fn bootstrap_fills_buckets_on_both_sides() {
    let dht = loopback_dht(NodeId::max(), separate_stores());

    // a known peer that already knows a small network
    let known = Peer::new(NodeId::mid());
    let others: Vec<Peer> = (0..12u64).map(|i| Peer::new(NodeId::from_u64(1 << i))).collect();
    for other in &others {
        known.node.observe(other.contact()).await;
        other.node.observe(known.contact()).await;
    }

    dht.bootstrap(known.contact()).await.unwrap();

    let our_contacts = dht.node().bucket_list().contacts().await;
    assert!(our_contacts.len() > 1, "bootstrap should learn peers beyond the known one");
    assert!(known
        .node
        .bucket_list()
        .contact_exists(&dht.our_id())
        .await);
}

#[tokio::test]
async fn find_value_without_peers_or_binding_fails_loudly() {
    let dht = loopback_dht(NodeId::mid(), separate_stores());
    let result = dht.find_value(NodeId::zero()).await;
    assert!(matches!(result, Err(kadnet::Error::AllBucketsEmpty)));
}

#[tokio::test]
async fn bucket_splits_past_k_contacts() {
    let list = kadnet::BucketList::new(
        Contact::new(NodeId::random(&mut rand::thread_rng()), LoopbackProtocol::new()),
        20,
        5,
    );
    for _ in 0..21 {
        list.add_contact(Contact::new(
            NodeId::random(&mut rand::thread_rng()),
            LoopbackProtocol::new(),
        ))
        .await;
    }
    assert!(list.bucket_count().await >= 2);
}

#[tokio::test]
async fn duplicate_contact_is_kept_once() {
    let list = kadnet::BucketList::new(
        Contact::new(NodeId::random(&mut rand::thread_rng()), LoopbackProtocol::new()),
        20,
        5,
    );
    let id = NodeId::random(&mut rand::thread_rng());

    let first = list
        .add_contact(Contact::new(id, LoopbackProtocol::new()))
        .await;
    let second = list
        .add_contact(Contact::new(id, LoopbackProtocol::new()))
        .await;

    assert!(matches!(first, AddOutcome::Added));
    assert!(matches!(second, AddOutcome::Refreshed));
    assert_eq!(list.bucket_count().await, 1);
    assert_eq!(list.contacts().await.len(), 1);
}
