//! Networked transport: bincode frames over TCP
//!
//! One client handle per remote endpoint, one connection per request. The
//! server dispatches frames to the local node and keeps a connection open
//! for as many requests as the peer cares to send.

use super::wire::{read_frame, write_frame, RpcOp, RpcPayload, RpcRequest, RpcResponse};
use super::{protocol_from_descriptor, FindValueReply, Protocol, ProtocolDescriptor};
use crate::contact::Contact;
use crate::error::{Error, Result};
use crate::id::NodeId;
use crate::node::Node;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// RPC client for one remote TCP endpoint
pub struct TcpProtocol {
    target: SocketAddr,
    timeout: Duration,
}

impl TcpProtocol {
    pub fn new(target: SocketAddr, timeout: Duration) -> Self {
        Self { target, timeout }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    async fn call(&self, sender: &Contact, op: RpcOp) -> Result<RpcPayload> {
        let random_id = NodeId::random(&mut rand::thread_rng());
        let request = RpcRequest {
            sender_id: sender.id,
            sender_descriptor: sender.protocol.descriptor(),
            random_id,
            op,
        };

        let exchange = async {
            let mut stream = TcpStream::connect(self.target)
                .await
                .map_err(|e| Error::Unreachable(format!("{}: {e}", self.target)))?;
            write_frame(&mut stream, &request)
                .await
                .map_err(reset_on_io(self.target))?;
            let response: Option<RpcResponse> = read_frame(&mut stream)
                .await
                .map_err(reset_on_io(self.target))?;
            response.ok_or_else(|| Error::ConnectionReset(format!("{}: closed mid-call", self.target)))
        };

        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::Timeout(format!("{}", self.target)))??;

        match response.payload {
            RpcPayload::Error(message) => Err(Error::Remote(message)),
            payload => {
                // the echo must match what we sent; anything else is spoofed
                // or crossed
                if response.random_id != random_id {
                    return Err(Error::BadEcho);
                }
                Ok(payload)
            }
        }
    }

    fn rebuild_contacts(&self, records: Vec<crate::contact::ContactRecord>) -> Vec<Contact> {
        records
            .into_iter()
            .filter_map(|record| {
                match protocol_from_descriptor(&record.descriptor, self.timeout) {
                    Ok(protocol) => Some(Contact {
                        id: record.id,
                        protocol,
                        last_seen: record.last_seen,
                    }),
                    Err(e) => {
                        debug!(id = %record.id, "dropping contact with unusable endpoint: {e}");
                        None
                    }
                }
            })
            .collect()
    }
}

fn reset_on_io(target: SocketAddr) -> impl Fn(Error) -> Error {
    move |error| match error {
        Error::Io(e) => Error::ConnectionReset(format!("{target}: {e}")),
        other => other,
    }
}

#[async_trait]
impl Protocol for TcpProtocol {
    async fn ping(&self, sender: Contact) -> Result<()> {
        match self.call(&sender, RpcOp::Ping).await? {
            RpcPayload::Pong => Ok(()),
            other => Err(Error::Malformed(format!("unexpected ping reply: {other:?}"))),
        }
    }

    async fn store(
        &self,
        sender: Contact,
        key: NodeId,
        value: Vec<u8>,
        is_cached: bool,
        expiration_secs: u64,
    ) -> Result<()> {
        let op = RpcOp::Store {
            key,
            value,
            is_cached,
            expiration_secs,
        };
        match self.call(&sender, op).await? {
            RpcPayload::Stored => Ok(()),
            other => Err(Error::Malformed(format!("unexpected store reply: {other:?}"))),
        }
    }

    async fn find_node(&self, sender: Contact, key: NodeId) -> Result<Vec<Contact>> {
        match self.call(&sender, RpcOp::FindNode { key }).await? {
            RpcPayload::Contacts(records) => Ok(self.rebuild_contacts(records)),
            other => Err(Error::Malformed(format!(
                "unexpected find_node reply: {other:?}"
            ))),
        }
    }

    async fn find_value(&self, sender: Contact, key: NodeId) -> Result<FindValueReply> {
        match self.call(&sender, RpcOp::FindValue { key }).await? {
            RpcPayload::Value(value) => Ok(FindValueReply::Value(value)),
            RpcPayload::Contacts(records) => {
                Ok(FindValueReply::Contacts(self.rebuild_contacts(records)))
            }
            other => Err(Error::Malformed(format!(
                "unexpected find_value reply: {other:?}"
            ))),
        }
    }

    fn descriptor(&self) -> ProtocolDescriptor {
        ProtocolDescriptor::Tcp { addr: self.target }
    }
}

/// Inbound side of the TCP transport
pub struct TcpRpcServer {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl TcpRpcServer {
    /// Bind and start serving the given node
    pub async fn bind(node: Arc<Node>, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let node = node.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(node, stream).await {
                                debug!(%peer, "connection ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for TcpRpcServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(node: Arc<Node>, mut stream: TcpStream) -> Result<()> {
    loop {
        let request: RpcRequest = match read_frame(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(Error::Malformed(message)) => {
                // reply once so the peer can tell, then drop the connection
                let response = RpcResponse {
                    random_id: NodeId::random(&mut rand::thread_rng()),
                    payload: RpcPayload::Error(message.clone()),
                };
                let _ = write_frame(&mut stream, &response).await;
                return Err(Error::Malformed(message));
            }
            Err(e) => return Err(e),
        };

        let response = node.handle_request(request).await;
        write_frame(&mut stream, &response).await?;
    }
}
