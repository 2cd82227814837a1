//! Raft log and metadata persistence over the storage driver seam.
//!
//! Lives under the node's raft storage prefix. Keys:
//! - `hs` → hard state (term, vote, commit)
//! - `e | index(8B BE)` → log entry
//! - `sn` → latest snapshot (last index/term + serialized cluster state)
//! - `id` → this node's stable 64-bit id
//! - `dc` → decommissioning flag

use crate::raft::message::Entry;
use serde::{Deserialize, Serialize};
use tidepool_model::{error, DbError};
use tidepool_storage::{SharedStorageDriver, StorageDriver, WriteBatch};

const KEY_HARD_STATE: &[u8] = b"hs";
const KEY_SNAPSHOT: &[u8] = b"sn";
const KEY_NODE_ID: &[u8] = b"id";
const KEY_DECOMMISSIONING: &[u8] = b"dc";
const ENTRY_PREFIX: u8 = b'e';

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<u64>,
    pub commit: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub last_index: u64,
    pub last_term: u64,
    pub data: Vec<u8>,
}

fn entry_key(index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(ENTRY_PREFIX);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

#[derive(Clone)]
pub struct RaftStore {
    storage: SharedStorageDriver,
}

impl RaftStore {
    pub fn new(storage: SharedStorageDriver) -> Self {
        Self { storage }
    }

    pub fn open(&self) -> Result<(), DbError> {
        self.storage.open()
    }

    // --- node metadata ---

    /// The stable node id, or 0 when this store has never been assigned one.
    pub fn node_id(&self) -> Result<u64, DbError> {
        match self.storage.get(&[KEY_NODE_ID.to_vec()])?.remove(0) {
            Some(raw) => Ok(u64::from_be_bytes(
                raw.try_into().map_err(|_| error::E_CORRUPTED)?,
            )),
            None => Ok(0),
        }
    }

    pub fn set_node_id(&self, node_id: u64) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.put(KEY_NODE_ID.to_vec(), node_id.to_be_bytes().to_vec());
        self.storage.batch(&batch)
    }

    pub fn is_decommissioning(&self) -> Result<bool, DbError> {
        Ok(self.storage.get(&[KEY_DECOMMISSIONING.to_vec()])?.remove(0).is_some())
    }

    pub fn set_decommissioning_flag(&self) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.put(KEY_DECOMMISSIONING.to_vec(), vec![1]);
        self.storage.batch(&batch)
    }

    pub fn clear_decommissioning_flag(&self) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.delete(KEY_DECOMMISSIONING.to_vec());
        self.storage.batch(&batch)
    }

    // --- hard state ---

    pub fn hard_state(&self) -> Result<HardState, DbError> {
        match self.storage.get(&[KEY_HARD_STATE.to_vec()])?.remove(0) {
            Some(raw) => serde_json::from_slice(&raw).map_err(|_| error::E_CORRUPTED),
            None => Ok(HardState::default()),
        }
    }

    pub fn set_hard_state(&self, hard_state: &HardState) -> Result<(), DbError> {
        let encoded = serde_json::to_vec(hard_state).map_err(|_| error::E_STORAGE)?;
        let mut batch = WriteBatch::new();
        batch.put(KEY_HARD_STATE.to_vec(), encoded);
        self.storage.batch(&batch)
    }

    // --- log ---

    pub fn append(&self, entries: &[Entry]) -> Result<(), DbError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for entry in entries {
            let encoded = serde_json::to_vec(entry).map_err(|_| error::E_STORAGE)?;
            batch.put(entry_key(entry.index), encoded);
        }
        self.storage.batch(&batch)
    }

    pub fn entry(&self, index: u64) -> Result<Option<Entry>, DbError> {
        match self.storage.get(&[entry_key(index)])?.remove(0) {
            Some(raw) => Ok(Some(
                serde_json::from_slice(&raw).map_err(|_| error::E_CORRUPTED)?,
            )),
            None => Ok(None),
        }
    }

    /// Entries in `[lo, hi]` that exist, in order.
    pub fn entries(&self, lo: u64, hi: u64) -> Result<Vec<Entry>, DbError> {
        let mut out = Vec::new();
        for index in lo..=hi {
            match self.entry(index)? {
                Some(entry) => out.push(entry),
                None => break,
            }
        }
        Ok(out)
    }

    /// Delete all entries with `index >= from`.
    pub fn truncate_from(&self, from: u64) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        self.storage.scan_prefix(&[ENTRY_PREFIX], &mut |k, _| {
            if let Ok(bytes) = <[u8; 8]>::try_from(&k[1..]) {
                if u64::from_be_bytes(bytes) >= from {
                    batch.delete(k.to_vec());
                }
            }
            true
        })?;
        if !batch.is_empty() {
            self.storage.batch(&batch)?;
        }
        Ok(())
    }

    pub fn last_index(&self) -> Result<u64, DbError> {
        let mut last = 0u64;
        self.storage.scan_prefix(&[ENTRY_PREFIX], &mut |k, _| {
            if let Ok(bytes) = <[u8; 8]>::try_from(&k[1..]) {
                let index = u64::from_be_bytes(bytes);
                if index > last {
                    last = index;
                }
            }
            true
        })?;
        if last == 0 {
            last = self.snapshot()?.map(|s| s.last_index).unwrap_or(0);
        }
        Ok(last)
    }

    // --- snapshot ---

    pub fn snapshot(&self) -> Result<Option<SnapshotRecord>, DbError> {
        match self.storage.get(&[KEY_SNAPSHOT.to_vec()])?.remove(0) {
            Some(raw) => Ok(Some(
                serde_json::from_slice(&raw).map_err(|_| error::E_CORRUPTED)?,
            )),
            None => Ok(None),
        }
    }

    /// Persist a snapshot and drop every entry it covers.
    pub fn set_snapshot(&self, snapshot: &SnapshotRecord) -> Result<(), DbError> {
        let encoded = serde_json::to_vec(snapshot).map_err(|_| error::E_STORAGE)?;
        let mut batch = WriteBatch::new();
        batch.put(KEY_SNAPSHOT.to_vec(), encoded);
        self.storage.scan_prefix(&[ENTRY_PREFIX], &mut |k, _| {
            if let Ok(bytes) = <[u8; 8]>::try_from(&k[1..]) {
                if u64::from_be_bytes(bytes) <= snapshot.last_index {
                    batch.delete(k.to_vec());
                }
            }
            true
        })?;
        self.storage.batch(&batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tidepool_storage::MemoryStorageDriver;

    fn store() -> RaftStore {
        RaftStore::new(Arc::new(MemoryStorageDriver::new()))
    }

    fn entry(index: u64, term: u64) -> Entry {
        Entry { index, term, data: vec![index as u8] }
    }

    #[test]
    fn node_id_round_trip() {
        let store = store();
        assert_eq!(store.node_id().unwrap(), 0);
        store.set_node_id(42).unwrap();
        assert_eq!(store.node_id().unwrap(), 42);
    }

    #[test]
    fn decommissioning_flag_persists() {
        let store = store();
        assert!(!store.is_decommissioning().unwrap());
        store.set_decommissioning_flag().unwrap();
        assert!(store.is_decommissioning().unwrap());
        store.clear_decommissioning_flag().unwrap();
        assert!(!store.is_decommissioning().unwrap());
    }

    #[test]
    fn log_append_truncate() {
        let store = store();
        store.append(&[entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();
        assert_eq!(store.last_index().unwrap(), 3);
        assert_eq!(store.entries(1, 3).unwrap().len(), 3);

        store.truncate_from(2).unwrap();
        assert_eq!(store.last_index().unwrap(), 1);
        assert!(store.entry(2).unwrap().is_none());
    }

    #[test]
    fn snapshot_compacts_log() {
        let store = store();
        store.append(&[entry(1, 1), entry(2, 1), entry(3, 1), entry(4, 1)]).unwrap();
        store
            .set_snapshot(&SnapshotRecord { last_index: 3, last_term: 1, data: b"state".to_vec() })
            .unwrap();

        assert!(store.entry(3).unwrap().is_none());
        assert!(store.entry(4).unwrap().is_some());
        assert_eq!(store.snapshot().unwrap().unwrap().last_index, 3);

        // last_index falls back to the snapshot when the log is empty
        store.truncate_from(4).unwrap();
        assert_eq!(store.last_index().unwrap(), 3);
    }
}
