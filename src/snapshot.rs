//! Saving and restoring DHT state
//!
//! A snapshot carries our identity and endpoint, the routing table with its
//! timestamps, and the originator and republish stores. Cached copies are
//! deliberately left behind: they are short-lived by construction. Loading
//! rebuilds client handles from descriptors and starts no servers; the
//! caller wires a transport afterwards.

use crate::config::DhtConfig;
use crate::contact::{Contact, ContactRecord};
use crate::dht::Dht;
use crate::error::{Error, Result};
use crate::id::NodeId;
use crate::node::Node;
use crate::protocol::{
    protocol_from_descriptor, LoopbackProtocol, Protocol, ProtocolDescriptor,
};
use crate::router::Router;
use crate::routing::{BucketList, KBucket};
use crate::storage::{Storage, StoredValue};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Format version written into every snapshot
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serialized DHT state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhtSnapshot {
    pub version: u32,
    pub our_id: NodeId,
    pub descriptor: ProtocolDescriptor,
    pub buckets: Vec<BucketRecord>,
    pub originator: Vec<(NodeId, StoredValue)>,
    pub republish: Vec<(NodeId, StoredValue)>,
}

/// One bucket with its range, touch timestamp, and contacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRecord {
    pub low: NodeId,
    pub high: NodeId,
    pub touched: u64,
    pub contacts: Vec<ContactRecord>,
}

impl Dht {
    /// Capture the current state
    pub async fn snapshot(&self) -> Result<DhtSnapshot> {
        let buckets = self
            .node()
            .bucket_list()
            .snapshot()
            .await
            .into_iter()
            .map(|bucket| BucketRecord {
                low: bucket.low(),
                high: bucket.high(),
                touched: bucket.touched(),
                contacts: bucket.contacts().iter().map(Contact::record).collect(),
            })
            .collect();

        Ok(DhtSnapshot {
            version: SNAPSHOT_VERSION,
            our_id: self.our_id(),
            descriptor: self.protocol().descriptor(),
            buckets,
            originator: self.originator_storage().entries()?,
            republish: self.republish_storage().entries()?,
        })
    }

    /// Write the current state to `path`
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let snapshot = self.snapshot().await?;
        let body = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::write(path.as_ref(), body).await?;
        info!(path = %path.as_ref().display(), "saved snapshot");
        Ok(())
    }

    /// Reconstruct a DHT from a snapshot. No RPC server is started; a
    /// loopback endpoint comes back unbound for the caller to attach, and
    /// remote contacts with unrestorable endpoints are dropped.
    pub async fn load<P, F>(
        path: P,
        config: DhtConfig,
        router: Arc<dyn Router>,
        storage_factory: F,
    ) -> Result<Dht>
    where
        P: AsRef<Path>,
        F: Fn() -> Arc<dyn Storage>,
    {
        let body = tokio::fs::read(path.as_ref()).await?;
        let snapshot: DhtSnapshot = serde_json::from_slice(&body)
            .map_err(|e| Error::Snapshot(format!("{}: {e}", path.as_ref().display())))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Snapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let protocol: Arc<dyn Protocol> = match snapshot.descriptor {
            ProtocolDescriptor::Loopback => LoopbackProtocol::new(),
            ref descriptor => protocol_from_descriptor(descriptor, config.request_timeout)?,
        };
        let our_contact = Contact::new(snapshot.our_id, protocol.clone());

        let originator_storage = storage_factory();
        let republish_storage = storage_factory();
        let cache_storage = storage_factory();
        for (key, record) in snapshot.originator {
            originator_storage.insert_record(key, record)?;
        }
        for (key, record) in snapshot.republish {
            republish_storage.insert_record(key, record)?;
        }

        let mut buckets = Vec::with_capacity(snapshot.buckets.len());
        for record in snapshot.buckets {
            let mut contacts = Vec::with_capacity(record.contacts.len());
            for contact in record.contacts {
                match protocol_from_descriptor(&contact.descriptor, config.request_timeout) {
                    Ok(protocol) => contacts.push(Contact {
                        id: contact.id,
                        protocol,
                        last_seen: contact.last_seen,
                    }),
                    Err(e) => {
                        warn!(id = %contact.id, "dropping contact from snapshot: {e}")
                    }
                }
            }
            buckets.push(KBucket::from_parts(
                record.low,
                record.high,
                contacts,
                record.touched,
                config.k,
            ));
        }
        let bucket_list =
            BucketList::restore(our_contact.clone(), config.k, config.split_depth_modulus, buckets);

        let node = Arc::new(Node::with_bucket_list(
            our_contact.clone(),
            bucket_list,
            republish_storage.clone(),
            cache_storage.clone(),
            config.clone(),
        ));

        info!(id = %snapshot.our_id, "loaded snapshot");
        Ok(Dht::assemble(
            config,
            our_contact,
            protocol,
            node,
            router,
            originator_storage,
            republish_storage,
            cache_storage,
        ))
    }
}
