//! The local node: server side of the four RPCs
//!
//! Every inbound call is an observation of the sender. A sender we have
//! never heard of first receives the bindings we are closest to (the
//! anti-redundancy transfer from the Kademlia paper), then lands in the
//! bucket list, and only then is the request served.

use crate::config::DhtConfig;
use crate::contact::Contact;
use crate::dht::DhtShared;
use crate::error::{Error, Result};
use crate::id::NodeId;
use crate::protocol::wire::{RpcOp, RpcPayload, RpcRequest, RpcResponse};
use crate::protocol::{protocol_from_descriptor, FindValueReply};
use crate::routing::{AddOutcome, BucketList};
use crate::storage::Storage;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, trace};

/// One device on the network: identity, routing table, and stores
pub struct Node {
    our_contact: Contact,
    bucket_list: BucketList,
    storage: Arc<dyn Storage>,
    cache_storage: Arc<dyn Storage>,
    config: DhtConfig,
    dht: OnceLock<Weak<DhtShared>>,
}

impl Node {
    pub fn new(
        our_contact: Contact,
        storage: Arc<dyn Storage>,
        cache_storage: Arc<dyn Storage>,
        config: DhtConfig,
    ) -> Self {
        let bucket_list = BucketList::new(
            our_contact.clone(),
            config.k,
            config.split_depth_modulus,
        );
        Self {
            our_contact,
            bucket_list,
            storage,
            cache_storage,
            config,
            dht: OnceLock::new(),
        }
    }

    /// Restore with a pre-built bucket list, for snapshot loads
    pub(crate) fn with_bucket_list(
        our_contact: Contact,
        bucket_list: BucketList,
        storage: Arc<dyn Storage>,
        cache_storage: Arc<dyn Storage>,
        config: DhtConfig,
    ) -> Self {
        Self {
            our_contact,
            bucket_list,
            storage,
            cache_storage,
            config,
            dht: OnceLock::new(),
        }
    }

    /// Wire up the weak error-reporting channel to the owning DHT. The DHT
    /// owns the node; this reference never keeps the DHT alive.
    pub(crate) fn bind_dht(&self, shared: Weak<DhtShared>) {
        let _ = self.dht.set(shared);
    }

    fn dht_shared(&self) -> Option<Arc<DhtShared>> {
        self.dht.get().and_then(Weak::upgrade)
    }

    pub fn our_contact(&self) -> &Contact {
        &self.our_contact
    }

    pub fn our_id(&self) -> NodeId {
        self.our_contact.id
    }

    pub fn bucket_list(&self) -> &BucketList {
        &self.bucket_list
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn cache_storage(&self) -> &Arc<dyn Storage> {
        &self.cache_storage
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    fn guard_sender(&self, sender: &Contact) -> Result<()> {
        if sender.id == self.our_contact.id {
            return Err(Error::SenderIsSelf);
        }
        Ok(())
    }

    /// Someone is pinging us; register them and answer with our contact
    pub async fn ping(&self, sender: Contact) -> Result<Contact> {
        self.guard_sender(&sender)?;
        trace!(from = %sender.id, "ping");
        self.register_sender(&sender).await;
        Ok(self.our_contact.clone())
    }

    /// Place a binding in the primary or cache store.
    ///
    /// Cached writes keep the caller's expiration; primary writes get the
    /// node's own default. For primary writes the sender is inserted before
    /// the new-contact check, which keeps two fresh peers from propagating
    /// stores into each other forever.
    pub async fn store(
        &self,
        sender: Contact,
        key: NodeId,
        value: Vec<u8>,
        is_cached: bool,
        expiration_secs: u64,
    ) -> Result<()> {
        self.guard_sender(&sender)?;
        trace!(from = %sender.id, %key, is_cached, "store");
        self.observe(sender).await;

        if is_cached {
            self.cache_storage.set(key, value, expiration_secs)
        } else {
            self.storage.set(key, value, self.config.expiration_secs)
        }
    }

    /// Up to k contacts close to `key`, excluding the sender
    pub async fn find_node(&self, sender: Contact, key: NodeId) -> Result<Vec<Contact>> {
        self.guard_sender(&sender)?;
        trace!(from = %sender.id, %key, "find_node");
        self.register_sender(&sender).await;
        Ok(self.bucket_list.close_contacts(&key, Some(sender.id)).await)
    }

    /// The binding from primary then cache storage, else close contacts
    pub async fn find_value(&self, sender: Contact, key: NodeId) -> Result<FindValueReply> {
        self.guard_sender(&sender)?;
        trace!(from = %sender.id, %key, "find_value");
        self.register_sender(&sender).await;

        if let Some(value) = self.storage.get(&key)? {
            debug!(%key, "find_value hit in primary storage");
            return Ok(FindValueReply::Value(value));
        }
        if let Some(value) = self.cache_storage.get(&key)? {
            debug!(%key, "find_value hit in cache storage");
            return Ok(FindValueReply::Value(value));
        }
        Ok(FindValueReply::Contacts(
            self.bucket_list.close_contacts(&key, Some(sender.id)).await,
        ))
    }

    /// Insert a contact, routing a deferred newcomer to the pending queue
    pub async fn observe(&self, contact: Contact) {
        if let AddOutcome::Deferred(pending) = self.bucket_list.add_contact(contact).await {
            match self.dht_shared() {
                Some(shared) => shared.pending_push(pending),
                None => debug!(id = %pending.id, "no pending queue; dropping deferred contact"),
            }
        }
    }

    /// New-contact key propagation, then insertion
    async fn register_sender(&self, sender: &Contact) {
        if self.is_new_contact(sender).await {
            self.send_stored_values(sender).await;
        }
        self.observe(sender.clone()).await;
    }

    /// A contact is new iff it is in neither the bucket list nor the
    /// pending queue
    async fn is_new_contact(&self, sender: &Contact) -> bool {
        if self.bucket_list.contact_exists(&sender.id).await {
            return false;
        }
        match self.dht_shared() {
            Some(shared) => !shared.pending_contains(&sender.id),
            None => true,
        }
    }

    /// Transfer to a new peer every binding we are strictly closer to than
    /// all contacts we already know
    async fn send_stored_values(&self, target: &Contact) {
        let contacts = self.bucket_list.contacts().await;
        if contacts.is_empty() {
            return;
        }

        let keys = match self.storage.keys() {
            Ok(keys) => keys,
            Err(e) => {
                debug!("key propagation skipped: {e}");
                return;
            }
        };

        for key in keys {
            let Some(min_other) = contacts.iter().map(|c| c.id.distance(&key)).min() else {
                return;
            };
            if self.our_contact.id.distance(&key) >= min_other {
                continue;
            }

            let value = match self.storage.get(&key) {
                Ok(Some(value)) => value,
                _ => continue,
            };
            debug!(%key, to = %target.id, "propagating binding to new contact");
            if let Err(e) = target
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
                self.report_error(&e, target).await;
            }
        }
    }

    pub(crate) async fn report_error(&self, error: &Error, contact: &Contact) {
        match self.dht_shared() {
            Some(shared) => shared.handle_error(error, contact).await,
            None => debug!(peer = %contact.id, "rpc failed with no error hook: {error}"),
        }
    }

    /// Wire entry point: decode the sender, dispatch, and echo the request's
    /// random id. Failures answer with a fresh random id and the message.
    pub async fn handle_request(&self, request: RpcRequest) -> RpcResponse {
        let echo = request.random_id;
        match self.dispatch(request).await {
            Ok(payload) => RpcResponse {
                random_id: echo,
                payload,
            },
            Err(error) => RpcResponse {
                random_id: NodeId::random(&mut rand::thread_rng()),
                payload: RpcPayload::Error(error.to_string()),
            },
        }
    }

    async fn dispatch(&self, request: RpcRequest) -> Result<RpcPayload> {
        let protocol =
            protocol_from_descriptor(&request.sender_descriptor, self.config.request_timeout)?;
        let sender = Contact::new(request.sender_id, protocol);

        match request.op {
            RpcOp::Ping => {
                self.ping(sender).await?;
                Ok(RpcPayload::Pong)
            }
            RpcOp::Store {
                key,
                value,
                is_cached,
                expiration_secs,
            } => {
                self.store(sender, key, value, is_cached, expiration_secs)
                    .await?;
                Ok(RpcPayload::Stored)
            }
            RpcOp::FindNode { key } => {
                let contacts = self.find_node(sender, key).await?;
                Ok(RpcPayload::Contacts(
                    contacts.iter().map(Contact::record).collect(),
                ))
            }
            RpcOp::FindValue { key } => match self.find_value(sender, key).await? {
                FindValueReply::Value(value) => Ok(RpcPayload::Value(value)),
                FindValueReply::Contacts(contacts) => Ok(RpcPayload::Contacts(
                    contacts.iter().map(Contact::record).collect(),
                )),
            },
        }
    }
}
