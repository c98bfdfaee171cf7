//! Contacts: a peer identifier paired with the endpoint that reaches it

use crate::id::NodeId;
use crate::protocol::{Protocol, ProtocolDescriptor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the Unix epoch
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// A known peer: its identifier and a client handle for its endpoint.
///
/// Contacts are value-like and may sit in several containers at once;
/// equality is by id alone, so duplication is harmless. `last_seen` is
/// refreshed by bucket-list operations whenever the peer is heard from.
#[derive(Clone)]
pub struct Contact {
    pub id: NodeId,
    pub protocol: Arc<dyn Protocol>,
    pub last_seen: u64,
}

impl Contact {
    pub fn new(id: NodeId, protocol: Arc<dyn Protocol>) -> Self {
        Self {
            id,
            protocol,
            last_seen: unix_now(),
        }
    }

    /// Refresh the last-seen timestamp
    pub fn touch(&mut self) {
        self.last_seen = unix_now();
    }

    /// Serializable form for snapshots and the wire
    pub fn record(&self) -> ContactRecord {
        ContactRecord {
            id: self.id,
            descriptor: self.protocol.descriptor(),
            last_seen: self.last_seen,
        }
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contact")
            .field("id", &self.id)
            .field("endpoint", &self.protocol.descriptor())
            .finish()
    }
}

/// Wire and snapshot representation of a contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub id: NodeId,
    pub descriptor: ProtocolDescriptor,
    pub last_seen: u64,
}
