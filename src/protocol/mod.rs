//! Client side of the four Kademlia RPCs
//!
//! A `Protocol` is the handle a contact is reached through. Two variants
//! exist: the networked TCP transport and an in-process loopback used by
//! tests and local meshes. Nodes never branch on the variant; they talk to
//! the trait.

mod loopback;
mod tcp;
pub mod wire;

pub use loopback::LoopbackProtocol;
pub use tcp::{TcpProtocol, TcpRpcServer};

use crate::contact::Contact;
use crate::error::{Error, Result};
use crate::id::NodeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Reply of a FIND_VALUE call: the binding if the peer holds it, otherwise
/// the closest contacts it knows. An explicit variant rather than an error,
/// since a miss is normal control flow.
#[derive(Debug, Clone)]
pub enum FindValueReply {
    Value(Vec<u8>),
    Contacts(Vec<Contact>),
}

/// How to reach an endpoint, in serializable form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolDescriptor {
    Tcp { addr: SocketAddr },
    Loopback,
}

/// RPC client contract toward one remote peer.
///
/// Every call takes the local sender contact; a successful call counts as an
/// observation of the remote peer on both sides.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Test liveness
    async fn ping(&self, sender: Contact) -> Result<()>;

    /// Place a binding at the remote node. `is_cached` routes to the cache
    /// store with the caller-supplied expiration; otherwise the remote
    /// applies its own primary-store default.
    async fn store(
        &self,
        sender: Contact,
        key: NodeId,
        value: Vec<u8>,
        is_cached: bool,
        expiration_secs: u64,
    ) -> Result<()>;

    /// Up to k contacts the remote node considers closest to `key`
    async fn find_node(&self, sender: Contact, key: NodeId) -> Result<Vec<Contact>>;

    /// The binding if held, else close contacts
    async fn find_value(&self, sender: Contact, key: NodeId) -> Result<FindValueReply>;

    fn descriptor(&self) -> ProtocolDescriptor;
}

/// Rebuild a client handle from its serialized descriptor.
///
/// Only networked endpoints survive this; a loopback handle is a live
/// in-process reference and cannot cross a wire or a snapshot.
pub fn protocol_from_descriptor(
    descriptor: &ProtocolDescriptor,
    request_timeout: Duration,
) -> Result<Arc<dyn Protocol>> {
    match descriptor {
        ProtocolDescriptor::Tcp { addr } => Ok(Arc::new(TcpProtocol::new(*addr, request_timeout))),
        ProtocolDescriptor::Loopback => Err(Error::Malformed(
            "loopback endpoint cannot cross a process boundary".into(),
        )),
    }
}
