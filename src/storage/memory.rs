//! In-memory storage, the volatile variant

use super::{StoredValue, Storage};
use crate::contact::unix_now;
use crate::error::Result;
use crate::id::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Volatile storage over a locked hash map
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<NodeId, StoredValue>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A shareable handle, convenient for wiring several roles to one store
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Storage for MemoryStorage {
    fn contains(&self, key: &NodeId) -> Result<bool> {
        Ok(self.entries.read().contains_key(key))
    }

    fn get(&self, key: &NodeId) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).map(|v| v.value.clone()))
    }

    fn set(&self, key: NodeId, value: Vec<u8>, expiration_secs: u64) -> Result<()> {
        self.entries
            .write()
            .insert(key, StoredValue::new(value, expiration_secs));
        Ok(())
    }

    fn insert_record(&self, key: NodeId, record: StoredValue) -> Result<()> {
        self.entries.write().insert(key, record);
        Ok(())
    }

    fn remove(&self, key: &NodeId) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<NodeId>> {
        Ok(self.entries.read().keys().copied().collect())
    }

    fn touch(&self, key: &NodeId) -> Result<()> {
        if let Some(entry) = self.entries.write().get_mut(key) {
            entry.republish_timestamp = unix_now();
        }
        Ok(())
    }

    fn timestamp(&self, key: &NodeId) -> Result<Option<u64>> {
        Ok(self.entries.read().get(key).map(|v| v.republish_timestamp))
    }

    fn expiration_secs(&self, key: &NodeId) -> Result<Option<u64>> {
        Ok(self.entries.read().get(key).map(|v| v.expiration_secs))
    }

    fn entries(&self) -> Result<Vec<(NodeId, StoredValue)>> {
        Ok(self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect())
    }
}
