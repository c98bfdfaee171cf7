//! Key-value storage behind the DHT
//!
//! A node carries three stores with one contract: the primary store for
//! values held on behalf of the network, a cache store for short-lived
//! copies placed by lookups, and (at the DHT level) an originator store for
//! values this peer itself published. Implementations differ only in where
//! the bytes live.

mod file;
mod memory;

pub use file::JsonFileStorage;
pub use memory::MemoryStorage;

use crate::contact::unix_now;
use crate::error::Result;
use crate::id::NodeId;
use serde::{Deserialize, Serialize};

/// A stored binding with its expiration bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: Vec<u8>,
    /// Seconds after the republish timestamp at which the binding lapses;
    /// 0 means never
    pub expiration_secs: u64,
    /// When this node last (re)accepted the binding, unix seconds
    pub republish_timestamp: u64,
}

impl StoredValue {
    pub fn new(value: Vec<u8>, expiration_secs: u64) -> Self {
        Self {
            value,
            expiration_secs,
            republish_timestamp: unix_now(),
        }
    }

    /// True once `expiration_secs` have elapsed since the republish timestamp
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration_secs != 0 && now.saturating_sub(self.republish_timestamp) >= self.expiration_secs
    }
}

/// Storage contract shared by the volatile and persistent variants.
///
/// Every operation is linearizable with respect to the others on the same
/// instance. A corrupted backing store surfaces as an error rather than
/// reading as absent.
pub trait Storage: Send + Sync {
    fn contains(&self, key: &NodeId) -> Result<bool>;

    fn get(&self, key: &NodeId) -> Result<Option<Vec<u8>>>;

    /// Overwrite any prior binding and stamp the republish timestamp
    fn set(&self, key: NodeId, value: Vec<u8>, expiration_secs: u64) -> Result<()>;

    /// Insert a binding preserving its timestamps, for snapshot restore
    fn insert_record(&self, key: NodeId, record: StoredValue) -> Result<()>;

    fn remove(&self, key: &NodeId) -> Result<()>;

    fn keys(&self) -> Result<Vec<NodeId>>;

    /// Refresh only the republish timestamp of an existing binding
    fn touch(&self, key: &NodeId) -> Result<()>;

    fn timestamp(&self, key: &NodeId) -> Result<Option<u64>>;

    fn expiration_secs(&self, key: &NodeId) -> Result<Option<u64>>;

    /// All bindings, for snapshots and sweeps
    fn entries(&self) -> Result<Vec<(NodeId, StoredValue)>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_boundary_is_inclusive() {
        let mut value = StoredValue::new(b"v".to_vec(), 10);
        value.republish_timestamp = 1_000;
        assert!(!value.is_expired(1_009));
        assert!(value.is_expired(1_010));
        assert!(value.is_expired(1_011));
    }

    #[test]
    fn zero_expiration_never_lapses() {
        let mut value = StoredValue::new(b"v".to_vec(), 0);
        value.republish_timestamp = 0;
        assert!(!value.is_expired(u64::MAX));
    }
}
