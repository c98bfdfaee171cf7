//! In-process protocol for tests and single-process meshes
//!
//! A loopback handle points straight at a live `Node`; there is no wire and
//! no server. The `responds` switch simulates an unresponsive peer so
//! timeout and eviction paths can be exercised deterministically.

use super::{FindValueReply, Protocol, ProtocolDescriptor};
use crate::contact::Contact;
use crate::error::{Error, Result};
use crate::id::NodeId;
use crate::node::Node;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Protocol handle that calls a node in the same process
pub struct LoopbackProtocol {
    node: RwLock<Weak<Node>>,
    responds: AtomicBool,
}

impl LoopbackProtocol {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            node: RwLock::new(Weak::new()),
            responds: AtomicBool::new(true),
        })
    }

    /// Attach the node this handle serves. Done after node construction
    /// because the node's own contact carries this handle.
    pub fn bind(&self, node: &Arc<Node>) {
        *self.node.write() = Arc::downgrade(node);
    }

    /// When false, every call reports a timeout without reaching the node
    pub fn set_responds(&self, responds: bool) {
        self.responds.store(responds, Ordering::SeqCst);
    }

    fn target(&self) -> Result<Arc<Node>> {
        if !self.responds.load(Ordering::SeqCst) {
            return Err(Error::Timeout("loopback peer not responding".into()));
        }
        self.node
            .read()
            .upgrade()
            .ok_or_else(|| Error::Unreachable("loopback node gone".into()))
    }
}

#[async_trait]
impl Protocol for LoopbackProtocol {
    async fn ping(&self, sender: Contact) -> Result<()> {
        self.target()?.ping(sender).await.map(|_| ())
    }

    async fn store(
        &self,
        sender: Contact,
        key: NodeId,
        value: Vec<u8>,
        is_cached: bool,
        expiration_secs: u64,
    ) -> Result<()> {
        self.target()?
            .store(sender, key, value, is_cached, expiration_secs)
            .await
    }

    async fn find_node(&self, sender: Contact, key: NodeId) -> Result<Vec<Contact>> {
        self.target()?.find_node(sender, key).await
    }

    async fn find_value(&self, sender: Contact, key: NodeId) -> Result<FindValueReply> {
        self.target()?.find_value(sender, key).await
    }

    fn descriptor(&self) -> ProtocolDescriptor {
        ProtocolDescriptor::Loopback
    }
}
