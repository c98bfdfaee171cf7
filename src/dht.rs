//! The DHT orchestrator
//!
//! Owns the node, the router, and the three stores; drives bootstrap,
//! store and find; and runs the maintenance loops that keep bindings alive
//! and buckets fresh. Errors from the transport feed per-contact eviction
//! counters instead of aborting whatever operation observed them.

use crate::config::DhtConfig;
use crate::contact::{unix_now, Contact};
use crate::error::{Error, Result};
use crate::id::NodeId;
use crate::node::Node;
use crate::protocol::Protocol;
use crate::router::{LookupKind, Router};
use crate::storage::Storage;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of a value lookup through the DHT
#[derive(Debug, Clone)]
pub struct FindResult {
    pub found: bool,
    pub contacts: Vec<Contact>,
    pub value: Option<Vec<u8>>,
}

/// State the node and routers reach back into: the pending-contact queue
/// and the eviction counters. Held behind a weak reference from the node so
/// it never keeps the DHT alive.
pub struct DhtShared {
    node: Arc<Node>,
    pending_contacts: Mutex<VecDeque<Contact>>,
    eviction_count: Mutex<HashMap<NodeId, u32>>,
    eviction_limit: u32,
}

impl DhtShared {
    /// Queue a contact displaced by a full bucket, deduplicated by id
    pub fn pending_push(&self, contact: Contact) {
        let mut pending = self.pending_contacts.lock();
        if !pending.iter().any(|c| c.id == contact.id) {
            debug!(id = %contact.id, "queued pending contact");
            pending.push_back(contact);
        }
    }

    pub fn pending_contains(&self, id: &NodeId) -> bool {
        self.pending_contacts.lock().iter().any(|c| c.id == *id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending_contacts.lock().len()
    }

    fn pending_pop(&self) -> Option<Contact> {
        self.pending_contacts.lock().pop_front()
    }

    /// Error hook: transient transport failures count toward eviction; at
    /// the limit the contact is dropped from its bucket and a pending
    /// contact takes the slot. Anything else is the caller's to surface.
    pub async fn handle_error(&self, error: &Error, contact: &Contact) {
        if !error.is_transient() {
            return;
        }

        let count = {
            let mut counts = self.eviction_count.lock();
            let count = counts.entry(contact.id).or_insert(0);
            *count += 1;
            *count
        };
        debug!(peer = %contact.id, count, "transient rpc failure");

        if count < self.eviction_limit {
            return;
        }

        self.eviction_count.lock().remove(&contact.id);
        if self.node.bucket_list().remove_contact(&contact.id).await {
            info!(peer = %contact.id, "evicted after repeated failures");
        }
        if let Some(replacement) = self.pending_pop() {
            debug!(id = %replacement.id, "promoting pending contact");
            self.node.observe(replacement).await;
        }
    }

    #[cfg(test)]
    fn eviction_count(&self, id: &NodeId) -> u32 {
        self.eviction_count.lock().get(id).copied().unwrap_or(0)
    }
}

/// A running DHT peer
pub struct Dht {
    inner: Arc<DhtInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub(crate) struct DhtInner {
    pub(crate) config: DhtConfig,
    pub(crate) our_contact: Contact,
    pub(crate) protocol: Arc<dyn Protocol>,
    pub(crate) node: Arc<Node>,
    pub(crate) router: Arc<dyn Router>,
    pub(crate) originator_storage: Arc<dyn Storage>,
    pub(crate) republish_storage: Arc<dyn Storage>,
    pub(crate) cache_storage: Arc<dyn Storage>,
    pub(crate) shared: Arc<DhtShared>,
    rng: Mutex<StdRng>,
}

impl Dht {
    /// Assemble a DHT peer. The factory is called once per storage role:
    /// originator, republish (the node's primary), and cache.
    pub fn new<F>(
        config: DhtConfig,
        id: NodeId,
        protocol: Arc<dyn Protocol>,
        router: Arc<dyn Router>,
        storage_factory: F,
    ) -> Self
    where
        F: Fn() -> Arc<dyn Storage>,
    {
        let originator_storage = storage_factory();
        let republish_storage = storage_factory();
        let cache_storage = storage_factory();

        let our_contact = Contact::new(id, protocol.clone());
        let node = Arc::new(Node::new(
            our_contact.clone(),
            republish_storage.clone(),
            cache_storage.clone(),
            config.clone(),
        ));

        Self::assemble(
            config,
            our_contact,
            protocol,
            node,
            router,
            originator_storage,
            republish_storage,
            cache_storage,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        config: DhtConfig,
        our_contact: Contact,
        protocol: Arc<dyn Protocol>,
        node: Arc<Node>,
        router: Arc<dyn Router>,
        originator_storage: Arc<dyn Storage>,
        republish_storage: Arc<dyn Storage>,
        cache_storage: Arc<dyn Storage>,
    ) -> Self {
        let shared = Arc::new(DhtShared {
            node: node.clone(),
            pending_contacts: Mutex::new(VecDeque::new()),
            eviction_count: Mutex::new(HashMap::new()),
            eviction_limit: config.eviction_limit,
        });
        node.bind_dht(Arc::downgrade(&shared));

        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let inner = Arc::new(DhtInner {
            config,
            our_contact,
            protocol,
            node,
            router,
            originator_storage,
            republish_storage,
            cache_storage,
            shared,
            rng: Mutex::new(rng),
        });

        Self {
            inner,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn our_id(&self) -> NodeId {
        self.inner.our_contact.id
    }

    pub fn our_contact(&self) -> &Contact {
        &self.inner.our_contact
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.inner.node
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.inner.protocol
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    pub fn originator_storage(&self) -> &Arc<dyn Storage> {
        &self.inner.originator_storage
    }

    pub fn republish_storage(&self) -> &Arc<dyn Storage> {
        &self.inner.republish_storage
    }

    pub fn cache_storage(&self) -> &Arc<dyn Storage> {
        &self.inner.cache_storage
    }

    pub fn shared(&self) -> &Arc<DhtShared> {
        &self.inner.shared
    }

    pub(crate) fn inner(&self) -> &Arc<DhtInner> {
        &self.inner
    }

    /// Join the network through one known peer: insert it, look up our own
    /// id to fill nearby buckets, then refresh every bucket whose range does
    /// not contain us with a random-id FIND_NODE.
    pub async fn bootstrap(&self, known: Contact) -> Result<()> {
        info!(peer = %known.id, "bootstrapping");
        self.inner.node.observe(known).await;

        let our_id = self.our_id();
        let result = self
            .inner
            .router
            .lookup(&self.inner.node, our_id, LookupKind::FindNode)
            .await?;
        for contact in result.contacts {
            self.inner.node.observe(contact).await;
        }

        for bucket in self.inner.node.bucket_list().snapshot().await {
            if bucket.contains_id(&our_id) {
                continue;
            }
            let target = {
                let mut rng = self.inner.rng.lock();
                bucket.random_id_within(&mut *rng)
            };
            match self
                .inner
                .router
                .lookup(&self.inner.node, target, LookupKind::FindNode)
                .await
            {
                Ok(result) => {
                    for contact in result.contacts {
                        self.inner.node.observe(contact).await;
                    }
                }
                Err(e) => debug!(%target, "bootstrap refresh failed: {e}"),
            }
        }
        Ok(())
    }

    /// Publish a binding: keep it locally as its originator and place it on
    /// the k closest peers. With no peers yet the local write stands alone.
    pub async fn store(&self, key: NodeId, value: Vec<u8>) -> Result<()> {
        self.inner
            .originator_storage
            .set(key, value.clone(), self.inner.config.expiration_secs)?;
        match self.inner.store_on_closest(key, value).await {
            Err(Error::AllBucketsEmpty) => {
                debug!(%key, "no peers yet; stored locally only");
                Ok(())
            }
            other => other,
        }
    }

    /// Resolve a binding: local stores first, then a FIND_VALUE lookup. A
    /// network hit may leave a half-expiration cached copy on the closest
    /// strictly-closer peer encountered on the way.
    pub async fn find_value(&self, key: NodeId) -> Result<FindResult> {
        for storage in [
            &self.inner.originator_storage,
            &self.inner.republish_storage,
            &self.inner.cache_storage,
        ] {
            if let Some(value) = storage.get(&key)? {
                return Ok(FindResult {
                    found: true,
                    contacts: Vec::new(),
                    value: Some(value),
                });
            }
        }

        let result = self
            .inner
            .router
            .lookup(&self.inner.node, key, LookupKind::FindValue)
            .await?;

        if result.found {
            if let (Some(found_by), Some(value)) = (&result.found_by, &result.value) {
                self.inner
                    .cache_at_closer_peer(key, value, found_by, &result.contacts)
                    .await;
            }
        }

        Ok(FindResult {
            found: result.found,
            contacts: result.contacts,
            value: result.value,
        })
    }

    /// Start the four maintenance loops
    pub fn start_maintenance(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        tasks.push(spawn_periodic(
            &self.inner,
            self.inner.config.key_value_republish_interval,
            |inner| async move { inner.republish_pass(false).await },
        ));
        tasks.push(spawn_periodic(
            &self.inner,
            self.inner.config.originator_republish_interval,
            |inner| async move { inner.republish_pass(true).await },
        ));
        tasks.push(spawn_periodic(
            &self.inner,
            self.inner.config.expiration_scan_interval,
            |inner| async move { inner.expiration_sweep() },
        ));
        tasks.push(spawn_periodic(
            &self.inner,
            self.inner.config.bucket_refresh_interval,
            |inner| async move { inner.bucket_refresh_pass().await },
        ));
    }

    /// Stop timers and the router's workers. In-flight RPC replies arriving
    /// afterwards are discarded with their dropped tasks.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.router.shutdown().await;
    }
}

impl Drop for Dht {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn spawn_periodic<F, Fut>(
    inner: &Arc<DhtInner>,
    period: Duration,
    body: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<DhtInner>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // immediate first tick
        loop {
            interval.tick().await;
            match Weak::upgrade(&weak) {
                Some(inner) => body(inner).await,
                None => break,
            }
        }
    })
}

impl DhtInner {
    /// FIND_NODE the key and STORE the binding on each of the k closest
    pub(crate) async fn store_on_closest(&self, key: NodeId, value: Vec<u8>) -> Result<()> {
        let result = self
            .router
            .lookup(&self.node, key, LookupKind::FindNode)
            .await?;

        let stores = result.contacts.iter().map(|contact| {
            let value = value.clone();
            async move {
                if let Err(e) = contact
                    .protocol
                    .store(
                        self.our_contact.clone(),
                        key,
                        value,
                        false,
                        self.config.expiration_secs,
                    )
                    .await
                {
                    debug!(peer = %contact.id, %key, "store rpc failed: {e}");
                    self.shared.handle_error(&e, contact).await;
                }
            }
        });
        join_all(stores).await;
        Ok(())
    }

    /// The caching-closer step: place a cached copy, at half expiration, on
    /// the closest peer that is strictly closer to the key than the peer the
    /// value came from. Runs only when such a peer was encountered.
    async fn cache_at_closer_peer(
        &self,
        key: NodeId,
        value: &[u8],
        found_by: &Contact,
        encountered: &[Contact],
    ) {
        let found_distance = found_by.id.distance(&key);
        let closer = encountered
            .iter()
            .filter(|c| c.id != found_by.id && c.id != self.our_contact.id)
            .filter(|c| c.id.distance(&key) < found_distance)
            .min_by_key(|c| c.id.distance(&key));

        let Some(closer) = closer else { return };
        debug!(peer = %closer.id, %key, "caching value at closer peer");
        if let Err(e) = closer
            .protocol
            .store(
                self.our_contact.clone(),
                key,
                value.to_vec(),
                true,
                self.config.expiration_secs / 2,
            )
            .await
        {
            self.shared.handle_error(&e, closer).await;
        }
    }

    /// Re-store bindings whose republish timestamp has gone stale. The
    /// originator pass also refreshes values that would lapse before its
    /// next run.
    pub(crate) async fn republish_pass(&self, originator: bool) {
        let (storage, interval) = if originator {
            (
                &self.originator_storage,
                self.config.originator_republish_interval,
            )
        } else {
            (
                &self.republish_storage,
                self.config.key_value_republish_interval,
            )
        };

        let entries = match storage.entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!("republish skipped, storage unreadable: {e}");
                return;
            }
        };

        let now = unix_now();
        let interval_secs = interval.as_secs();
        for (key, stored) in entries {
            let age = now.saturating_sub(stored.republish_timestamp);
            let lapsing = originator
                && stored.expiration_secs != 0
                && age + interval_secs >= stored.expiration_secs;
            if age < interval_secs && !lapsing {
                continue;
            }

            debug!(%key, originator, "republishing binding");
            match self.store_on_closest(key, stored.value).await {
                Ok(()) | Err(Error::AllBucketsEmpty) => {
                    if let Err(e) = storage.touch(&key) {
                        warn!(%key, "republish touch failed: {e}");
                    }
                }
                Err(e) if originator => warn!(%key, "originator republish failed: {e}"),
                Err(e) => debug!(%key, "republish failed: {e}"),
            }
        }
    }

    /// Drop every binding whose expiration has elapsed
    pub(crate) fn expiration_sweep(&self) {
        let now = unix_now();
        for storage in [
            &self.originator_storage,
            &self.republish_storage,
            &self.cache_storage,
        ] {
            let entries = match storage.entries() {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("expiration sweep skipped, storage unreadable: {e}");
                    continue;
                }
            };
            for (key, stored) in entries {
                if stored.is_expired(now) {
                    debug!(%key, "expiring binding");
                    if let Err(e) = storage.remove(&key) {
                        warn!(%key, "expiry removal failed: {e}");
                    }
                }
            }
        }
    }

    /// FIND_NODE a random id inside every stale bucket away from our own
    pub(crate) async fn bucket_refresh_pass(&self) {
        let now = unix_now();
        let interval_secs = self.config.bucket_refresh_interval.as_secs();
        let our_id = self.our_contact.id;

        for bucket in self.node.bucket_list().snapshot().await {
            if bucket.contains_id(&our_id) {
                continue;
            }
            if now.saturating_sub(bucket.touched()) < interval_secs {
                continue;
            }

            let target = {
                let mut rng = self.rng.lock();
                bucket.random_id_within(&mut *rng)
            };
            debug!(%target, "refreshing bucket");
            match self
                .router
                .lookup(&self.node, target, LookupKind::FindNode)
                .await
            {
                Ok(result) => {
                    for contact in result.contacts {
                        self.node.observe(contact).await;
                    }
                    self.node.bucket_list().mark_refreshed(&target).await;
                }
                Err(e) => debug!(%target, "bucket refresh failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LoopbackProtocol;
    use crate::router::SerialRouter;
    use crate::storage::{MemoryStorage, StoredValue};

    fn memory_factory() -> impl Fn() -> Arc<dyn Storage> {
        || Arc::new(MemoryStorage::new()) as Arc<dyn Storage>
    }

    fn build_dht(id: NodeId, config: DhtConfig) -> Dht {
        let protocol = LoopbackProtocol::new();
        let router = Arc::new(SerialRouter::new(config.clone()));
        let dht = Dht::new(config, id, protocol.clone(), router, memory_factory());
        protocol.bind(dht.node());
        dht
    }

    fn dead_contact(id: NodeId) -> Contact {
        let protocol = LoopbackProtocol::new();
        protocol.set_responds(false);
        Contact::new(id, protocol)
    }

    #[tokio::test]
    async fn transient_errors_accumulate_to_eviction() {
        let config = DhtConfig {
            eviction_limit: 3,
            ..DhtConfig::default()
        };
        let dht = build_dht(NodeId::mid(), config);
        let failing = dead_contact(NodeId::from_u64(5));
        dht.node().observe(failing.clone()).await;
        assert!(dht.node().bucket_list().contact_exists(&failing.id).await);

        let timeout = Error::Timeout("probe".into());
        dht.shared().handle_error(&timeout, &failing).await;
        dht.shared().handle_error(&timeout, &failing).await;
        assert_eq!(dht.shared().eviction_count(&failing.id), 2);
        assert!(dht.node().bucket_list().contact_exists(&failing.id).await);

        dht.shared().handle_error(&timeout, &failing).await;
        assert!(!dht.node().bucket_list().contact_exists(&failing.id).await);
        assert_eq!(dht.shared().eviction_count(&failing.id), 0);
    }

    #[tokio::test]
    async fn eviction_promotes_a_pending_contact() {
        let config = DhtConfig {
            eviction_limit: 1,
            ..DhtConfig::default()
        };
        let dht = build_dht(NodeId::mid(), config);
        let failing = dead_contact(NodeId::from_u64(5));
        dht.node().observe(failing.clone()).await;

        let waiting = Contact::new(NodeId::from_u64(77), LoopbackProtocol::new());
        dht.shared().pending_push(waiting.clone());

        dht.shared()
            .handle_error(&Error::Timeout("probe".into()), &failing)
            .await;
        assert!(!dht.node().bucket_list().contact_exists(&failing.id).await);
        assert!(dht.node().bucket_list().contact_exists(&waiting.id).await);
        assert_eq!(dht.shared().pending_len(), 0);
    }

    #[tokio::test]
    async fn non_transient_errors_do_not_count() {
        let dht = build_dht(NodeId::mid(), DhtConfig::default());
        let peer = dead_contact(NodeId::from_u64(5));
        dht.node().observe(peer.clone()).await;

        dht.shared().handle_error(&Error::BadEcho, &peer).await;
        dht.shared()
            .handle_error(&Error::Remote("boom".into()), &peer)
            .await;
        assert_eq!(dht.shared().eviction_count(&peer.id), 0);
        assert!(dht.node().bucket_list().contact_exists(&peer.id).await);
    }

    #[tokio::test]
    async fn expiration_sweep_respects_the_boundary() {
        let dht = build_dht(NodeId::mid(), DhtConfig::default());
        let now = unix_now();

        let lapsed = NodeId::from_u64(1);
        let fresh = NodeId::from_u64(2);
        let immortal = NodeId::from_u64(3);
        dht.republish_storage()
            .insert_record(
                lapsed,
                StoredValue {
                    value: b"old".to_vec(),
                    expiration_secs: 10,
                    republish_timestamp: now - 10,
                },
            )
            .unwrap();
        dht.republish_storage()
            .insert_record(
                fresh,
                StoredValue {
                    value: b"new".to_vec(),
                    expiration_secs: 10,
                    republish_timestamp: now - 9,
                },
            )
            .unwrap();
        dht.cache_storage()
            .insert_record(
                immortal,
                StoredValue {
                    value: b"keep".to_vec(),
                    expiration_secs: 0,
                    republish_timestamp: 0,
                },
            )
            .unwrap();

        dht.inner().expiration_sweep();

        assert!(!dht.republish_storage().contains(&lapsed).unwrap());
        assert!(dht.republish_storage().contains(&fresh).unwrap());
        assert!(dht.cache_storage().contains(&immortal).unwrap());
    }

    #[tokio::test]
    async fn republish_pushes_stale_bindings_back_out() {
        let dht = build_dht(NodeId::zero(), DhtConfig::default());

        let peer_protocol = LoopbackProtocol::new();
        let peer_contact = Contact::new(NodeId::mid(), peer_protocol.clone());
        let peer_storage = Arc::new(MemoryStorage::new());
        let peer_node = Arc::new(Node::new(
            peer_contact.clone(),
            peer_storage.clone(),
            Arc::new(MemoryStorage::new()),
            DhtConfig::default(),
        ));
        peer_protocol.bind(&peer_node);
        dht.node().observe(peer_contact).await;

        let key = NodeId::from_u64(9);
        dht.republish_storage()
            .insert_record(
                key,
                StoredValue {
                    value: b"stale".to_vec(),
                    expiration_secs: 0,
                    republish_timestamp: 1, // far in the past
                },
            )
            .unwrap();

        dht.inner().republish_pass(false).await;

        assert_eq!(peer_storage.get(&key).unwrap(), Some(b"stale".to_vec()));
        // local timestamp refreshed so the next pass skips it
        let ts = dht.republish_storage().timestamp(&key).unwrap().unwrap();
        assert!(ts > 1);
    }

    #[tokio::test]
    async fn fresh_bindings_are_not_republished() {
        let dht = build_dht(NodeId::zero(), DhtConfig::default());

        let peer_protocol = LoopbackProtocol::new();
        let peer_contact = Contact::new(NodeId::mid(), peer_protocol.clone());
        let peer_storage = Arc::new(MemoryStorage::new());
        let peer_node = Arc::new(Node::new(
            peer_contact.clone(),
            peer_storage.clone(),
            Arc::new(MemoryStorage::new()),
            DhtConfig::default(),
        ));
        peer_protocol.bind(&peer_node);
        dht.node().observe(peer_contact).await;

        let key = NodeId::from_u64(9);
        dht.republish_storage()
            .set(key, b"fresh".to_vec(), 0)
            .unwrap();

        dht.inner().republish_pass(false).await;
        assert!(!peer_storage.contains(&key).unwrap());
    }

    #[tokio::test]
    async fn originator_pass_rescues_lapsing_bindings() {
        let dht = build_dht(NodeId::zero(), DhtConfig::default());

        let peer_protocol = LoopbackProtocol::new();
        let peer_contact = Contact::new(NodeId::mid(), peer_protocol.clone());
        let peer_storage = Arc::new(MemoryStorage::new());
        let peer_node = Arc::new(Node::new(
            peer_contact.clone(),
            peer_storage.clone(),
            Arc::new(MemoryStorage::new()),
            DhtConfig::default(),
        ));
        peer_protocol.bind(&peer_node);
        dht.node().observe(peer_contact).await;

        // recently republished, but its expiration falls inside the next
        // originator interval
        let key = NodeId::from_u64(4);
        dht.originator_storage()
            .insert_record(
                key,
                StoredValue {
                    value: b"lapsing".to_vec(),
                    expiration_secs: 60,
                    republish_timestamp: unix_now() - 30,
                },
            )
            .unwrap();

        dht.inner().republish_pass(true).await;
        assert_eq!(peer_storage.get(&key).unwrap(), Some(b"lapsing".to_vec()));
    }
}
