//! File-backed storage, the persistent variant
//!
//! The whole store is one JSON document, re-read and rewritten under a lock
//! on every operation. That keeps the contract simple and durable: once
//! `set` returns the bytes are fsynced, and a restart sees them again.
//! A store that no longer parses is reported as corruption, never as empty.

use super::{StoredValue, Storage};
use crate::contact::unix_now;
use crate::error::{Error, Result};
use crate::id::NodeId;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Persistent storage over a single JSON file
pub struct JsonFileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

type StoreMap = BTreeMap<String, StoredValue>;

impl JsonFileStorage {
    /// Open or create the backing file. An existing file is validated up
    /// front so corruption surfaces here rather than on first use.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let storage = Self {
            path,
            lock: Mutex::new(()),
        };
        if storage.path.exists() {
            storage.read_map()?;
        } else {
            storage.write_map(&StoreMap::new())?;
        }
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<StoreMap> {
        let text = fs::read_to_string(&self.path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::CorruptStorage(format!("{}: {}", self.path.display(), e)))
    }

    fn write_map(&self, map: &StoreMap) -> Result<()> {
        let mut file = File::create(&self.path)?;
        file.write_all(&serde_json::to_vec(map)?)?;
        file.sync_all()?;
        Ok(())
    }

    fn decode_key(&self, hex_key: &str) -> Result<NodeId> {
        NodeId::from_hex(hex_key).map_err(|_| {
            Error::CorruptStorage(format!("{}: bad key {hex_key}", self.path.display()))
        })
    }
}

impl Storage for JsonFileStorage {
    fn contains(&self, key: &NodeId) -> Result<bool> {
        let _guard = self.lock.lock();
        Ok(self.read_map()?.contains_key(&key.to_hex()))
    }

    fn get(&self, key: &NodeId) -> Result<Option<Vec<u8>>> {
        let _guard = self.lock.lock();
        Ok(self.read_map()?.get(&key.to_hex()).map(|v| v.value.clone()))
    }

    fn set(&self, key: NodeId, value: Vec<u8>, expiration_secs: u64) -> Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        map.insert(key.to_hex(), StoredValue::new(value, expiration_secs));
        debug!(path = %self.path.display(), %key, "stored binding");
        self.write_map(&map)
    }

    fn insert_record(&self, key: NodeId, record: StoredValue) -> Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        map.insert(key.to_hex(), record);
        self.write_map(&map)
    }

    fn remove(&self, key: &NodeId) -> Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        if map.remove(&key.to_hex()).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<NodeId>> {
        let _guard = self.lock.lock();
        self.read_map()?
            .keys()
            .map(|k| self.decode_key(k))
            .collect()
    }

    fn touch(&self, key: &NodeId) -> Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        if let Some(entry) = map.get_mut(&key.to_hex()) {
            entry.republish_timestamp = unix_now();
            self.write_map(&map)?;
        }
        Ok(())
    }

    fn timestamp(&self, key: &NodeId) -> Result<Option<u64>> {
        let _guard = self.lock.lock();
        Ok(self
            .read_map()?
            .get(&key.to_hex())
            .map(|v| v.republish_timestamp))
    }

    fn expiration_secs(&self, key: &NodeId) -> Result<Option<u64>> {
        let _guard = self.lock.lock();
        Ok(self
            .read_map()?
            .get(&key.to_hex())
            .map(|v| v.expiration_secs))
    }

    fn entries(&self) -> Result<Vec<(NodeId, StoredValue)>> {
        let _guard = self.lock.lock();
        self.read_map()?
            .into_iter()
            .map(|(k, v)| Ok((self.decode_key(&k)?, v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let key = NodeId::from_u64(1);

        {
            let storage = JsonFileStorage::open(&path).unwrap();
            storage.set(key, b"durable".to_vec(), 120).unwrap();
        }

        let reopened = JsonFileStorage::open(&path).unwrap();
        assert!(reopened.contains(&key).unwrap());
        assert_eq!(reopened.get(&key).unwrap(), Some(b"durable".to_vec()));
        assert_eq!(reopened.expiration_secs(&key).unwrap(), Some(120));
    }

    #[test]
    fn corruption_is_an_error_not_absence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let storage = JsonFileStorage::open(&path).unwrap();
        storage.set(NodeId::from_u64(9), b"v".to_vec(), 0).unwrap();

        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            storage.contains(&NodeId::from_u64(9)),
            Err(Error::CorruptStorage(_))
        ));
        assert!(matches!(
            JsonFileStorage::open(&path),
            Err(Error::CorruptStorage(_))
        ));
    }

    #[test]
    fn touch_rewrites_timestamp_only() {
        let dir = tempdir().unwrap();
        let storage = JsonFileStorage::open(dir.path().join("store.json")).unwrap();
        let key = NodeId::from_u64(3);
        storage
            .insert_record(
                key,
                StoredValue {
                    value: b"v".to_vec(),
                    expiration_secs: 45,
                    republish_timestamp: 1,
                },
            )
            .unwrap();

        storage.touch(&key).unwrap();
        assert!(storage.timestamp(&key).unwrap().unwrap() > 1);
        assert_eq!(storage.expiration_secs(&key).unwrap(), Some(45));
    }

    #[test]
    fn remove_missing_key_is_a_no_op() {
        let dir = tempdir().unwrap();
        let storage = JsonFileStorage::open(dir.path().join("store.json")).unwrap();
        storage.remove(&NodeId::from_u64(404)).unwrap();
        assert!(storage.keys().unwrap().is_empty());
    }
}
