//! A named causal KV namespace backed by storage, a Merkle tree, and an
//! update monitor.
//!
//! Persisted layout inside the bucket's storage prefix:
//! - `d | key` → JSON-encoded [`Row`]
//! - `m | leaf(4B BE) | key` → empty (Merkle leaf index)
//! - `v` → last assigned local version (8B BE)
//!
//! The Merkle tree's leaves hash exactly the sibling sets stored under the
//! data prefix; every mutation writes the row, the leaf index, and the
//! version counter in one storage batch and folds the hash delta into the
//! in-memory tree. On open the tree is rebuilt from a full scan.

use crate::monitor::Monitor;
use std::collections::HashMap;
use std::sync::Mutex;
use tidepool_merkle::{MerkleTree, NodeHash};
use tidepool_model::{error, DbError, Row, SiblingSet, UpdateBatch, MAX_KEY_LENGTH};
use tidepool_storage::{SharedStorageDriver, StorageDriver, WriteBatch};

const DATA_PREFIX: u8 = b'd';
const MERKLE_PREFIX: u8 = b'm';
const VERSION_KEY: &[u8] = b"v";

/// Static per-bucket configuration, including the relay replication policy
/// (which directions this bucket syncs with edge relays).
#[derive(Debug, Clone)]
pub struct BucketConfig {
    pub name: String,
    /// Replica id stamped into dots created by this node.
    pub node_name: String,
    pub merkle_depth: u8,
    pub replicate_incoming: bool,
    pub replicate_outgoing: bool,
}

struct BucketInner {
    merkle: MerkleTree,
    next_version: u64,
}

pub struct Bucket {
    config: BucketConfig,
    storage: SharedStorageDriver,
    monitor: Monitor,
    inner: Mutex<BucketInner>,
}

fn data_key(key: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + key.len());
    k.push(DATA_PREFIX);
    k.extend_from_slice(key.as_bytes());
    k
}

fn index_key(leaf: u32, key: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(5 + key.len());
    k.push(MERKLE_PREFIX);
    k.extend_from_slice(&leaf.to_be_bytes());
    k.extend_from_slice(key.as_bytes());
    k
}

fn index_prefix(leaf: u32) -> Vec<u8> {
    let mut k = Vec::with_capacity(5);
    k.push(MERKLE_PREFIX);
    k.extend_from_slice(&leaf.to_be_bytes());
    k
}

fn decode_row(raw: &[u8]) -> Result<Row, DbError> {
    serde_json::from_slice(raw).map_err(|_| error::E_CORRUPTED)
}

fn validate_key(key: &str) -> Result<(), DbError> {
    if key.is_empty() {
        return Err(error::E_EMPTY);
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(error::E_LENGTH);
    }
    Ok(())
}

impl Bucket {
    /// Open a bucket over its (already prefixed) storage, rebuilding the
    /// Merkle tree and version counter from the stored rows.
    pub fn open(config: BucketConfig, storage: SharedStorageDriver) -> Result<Self, DbError> {
        if !tidepool_model::valid_bucket_name(&config.name) {
            return Err(error::E_INVALID_BUCKET);
        }

        let mut merkle = MerkleTree::new(config.merkle_depth)?;
        let mut max_version = 0u64;
        let mut decode_error = None;

        storage.scan_prefix(&[DATA_PREFIX], &mut |k, v| {
            let row = match decode_row(v) {
                Ok(row) => row,
                Err(e) => {
                    decode_error = Some(e);
                    return false;
                }
            };
            let key = &k[1..];
            let leaf = merkle.leaf_for_key(key);
            // Rebuild never fails on a leaf id the tree produced itself
            let _ = merkle.apply_delta(leaf, row.siblings.hash(key));
            if row.local_version > max_version {
                max_version = row.local_version;
            }
            true
        })?;

        if let Some(e) = decode_error {
            return Err(e);
        }

        if let Some(raw) = storage.get(&[VERSION_KEY.to_vec()])?.remove(0) {
            let stored = u64::from_be_bytes(raw.try_into().map_err(|_| error::E_CORRUPTED)?);
            if stored > max_version {
                max_version = stored;
            }
        }

        Ok(Self {
            config,
            storage,
            monitor: Monitor::new(max_version),
            inner: Mutex::new(BucketInner { merkle, next_version: max_version }),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn replicates_incoming(&self) -> bool {
        self.config.replicate_incoming
    }

    pub fn replicates_outgoing(&self) -> bool {
        self.config.replicate_outgoing
    }

    pub fn merkle_depth(&self) -> u8 {
        self.config.merkle_depth
    }

    pub fn merkle_node_hash(&self, node_id: u32) -> Result<NodeHash, DbError> {
        let inner = self.inner.lock().map_err(|_| error::E_STORAGE)?;
        inner.merkle.node_hash(node_id)
    }

    pub fn merkle_root_hash(&self) -> Result<NodeHash, DbError> {
        self.merkle_node_hash(1)
    }

    /// Apply an update batch: each op becomes the minimum new sibling
    /// dominating its context. Returns the resulting sibling set per key.
    pub fn batch(&self, update: &UpdateBatch) -> Result<HashMap<String, SiblingSet>, DbError> {
        update.validate()?;

        let mut inner = self.inner.lock().map_err(|_| error::E_STORAGE)?;

        let mut working: HashMap<String, SiblingSet> = HashMap::new();
        for op in &update.ops {
            if !working.contains_key(op.key()) {
                let current = self.read_siblings(op.key())?;
                working.insert(op.key().to_string(), current);
            }
        }
        let originals = working.clone();

        for op in &update.ops {
            let context = op.decode_context()?.effective();
            let current = working
                .get(op.key())
                .cloned()
                .unwrap_or_default();

            let sibling = current.event(
                context.clone(),
                &self.config.node_name,
                op.value().map(|v| v.to_vec()),
            );

            let mut next = current;
            next.discard(&context);
            let next = next.join(&SiblingSet::from_siblings(vec![sibling]));
            working.insert(op.key().to_string(), next);
        }

        self.commit(&mut inner, &originals, &working)?;
        Ok(working)
    }

    /// Join an incoming patch into the stored sets. Keys whose join changes
    /// nothing are skipped entirely (no version bump, no notification).
    pub fn merge(&self, patch: &HashMap<String, SiblingSet>) -> Result<(), DbError> {
        for key in patch.keys() {
            validate_key(key)?;
        }

        let mut inner = self.inner.lock().map_err(|_| error::E_STORAGE)?;

        let mut originals = HashMap::new();
        let mut working = HashMap::new();
        for (key, incoming) in patch {
            let current = self.read_siblings(key)?;
            let joined = current.join(incoming);
            if joined == current {
                continue;
            }
            originals.insert(key.clone(), current);
            working.insert(key.clone(), joined);
        }

        self.commit(&mut inner, &originals, &working)
    }

    pub fn get(&self, keys: &[String]) -> Result<Vec<SiblingSet>, DbError> {
        for key in keys {
            validate_key(key)?;
        }
        keys.iter().map(|k| self.read_siblings(k)).collect()
    }

    /// All rows whose key starts with any of the given prefixes.
    pub fn get_matches(&self, prefixes: &[String]) -> Result<Vec<Row>, DbError> {
        for prefix in prefixes {
            validate_key(prefix)?;
        }

        let mut rows = Vec::new();
        let mut decode_error = None;
        for prefix in prefixes {
            self.storage.scan_prefix(&data_key(prefix), &mut |_, v| {
                match decode_row(v) {
                    Ok(row) => {
                        rows.push(row);
                        true
                    }
                    Err(e) => {
                        decode_error = Some(e);
                        false
                    }
                }
            })?;
        }

        match decode_error {
            Some(e) => Err(e),
            None => Ok(rows),
        }
    }

    /// All rows stored under a Merkle node's leaf range.
    pub fn get_sync_children(&self, node_id: u32) -> Result<Vec<Row>, DbError> {
        let (lo, hi) = {
            let inner = self.inner.lock().map_err(|_| error::E_STORAGE)?;
            inner.merkle.leaf_range(node_id)?
        };

        let mut keys: Vec<Vec<u8>> = Vec::new();
        for leaf in lo..=hi {
            let prefix = index_prefix(leaf);
            self.storage.scan_prefix(&prefix, &mut |k, _| {
                keys.push(k[5..].to_vec());
                true
            })?;
        }

        let data_keys: Vec<Vec<u8>> = keys
            .iter()
            .map(|k| {
                let mut dk = Vec::with_capacity(1 + k.len());
                dk.push(DATA_PREFIX);
                dk.extend_from_slice(k);
                dk
            })
            .collect();

        let mut rows = Vec::with_capacity(keys.len());
        for raw in self.storage.get(&data_keys)?.into_iter().flatten() {
            rows.push(decode_row(&raw)?);
        }
        Ok(rows)
    }

    /// Physically drop keys: rows, index entries, and their Merkle
    /// contribution. Part of the sync protocol, not general GC.
    pub fn forget(&self, keys: &[String]) -> Result<(), DbError> {
        let mut inner = self.inner.lock().map_err(|_| error::E_STORAGE)?;

        let mut batch = WriteBatch::new();
        let mut deltas: Vec<(u32, NodeHash)> = Vec::new();
        for key in keys {
            validate_key(key)?;
            let current = self.read_siblings(key)?;
            if current.is_empty() {
                continue;
            }
            let leaf = inner.merkle.leaf_for_key(key.as_bytes());
            deltas.push((leaf, current.hash(key.as_bytes())));
            batch.delete(data_key(key));
            batch.delete(index_key(leaf, key));
        }

        if batch.is_empty() {
            return Ok(());
        }

        self.storage.batch(&batch)?;
        for (leaf, delta) in deltas {
            let _ = inner.merkle.apply_delta(leaf, delta);
        }
        Ok(())
    }

    fn read_siblings(&self, key: &str) -> Result<SiblingSet, DbError> {
        let raw = self.storage.get(&[data_key(key)])?.remove(0);
        match raw {
            Some(raw) => Ok(decode_row(&raw)?.siblings),
            None => Ok(SiblingSet::new()),
        }
    }

    /// Write changed keys in one storage batch, fold hash deltas into the
    /// tree, and notify the monitor.
    fn commit(
        &self,
        inner: &mut BucketInner,
        originals: &HashMap<String, SiblingSet>,
        working: &HashMap<String, SiblingSet>,
    ) -> Result<(), DbError> {
        let mut changed: Vec<&String> = working
            .iter()
            .filter(|(key, next)| originals.get(*key) != Some(next))
            .map(|(key, _)| key)
            .collect();
        changed.sort();

        if changed.is_empty() {
            return Ok(());
        }

        let mut batch = WriteBatch::new();
        let mut deltas: Vec<(u32, NodeHash)> = Vec::new();
        let mut notifications: Vec<Row> = Vec::new();
        let mut version = inner.next_version;

        for key in &changed {
            let next = &working[*key];
            version += 1;

            let row = Row {
                key: (*key).clone(),
                local_version: version,
                siblings: next.clone(),
            };
            let encoded = serde_json::to_vec(&row).map_err(|_| error::E_STORAGE)?;

            let leaf = inner.merkle.leaf_for_key(key.as_bytes());
            let old_hash = match originals.get(*key) {
                Some(old) if !old.is_empty() => old.hash(key.as_bytes()),
                _ => 0,
            };
            deltas.push((leaf, old_hash ^ next.hash(key.as_bytes())));

            batch.put(data_key(key), encoded);
            batch.put(index_key(leaf, key), Vec::new());
            notifications.push(row);
        }

        batch.put(VERSION_KEY.to_vec(), version.to_be_bytes().to_vec());
        self.storage.batch(&batch)?;

        for (leaf, delta) in deltas {
            let _ = inner.merkle.apply_delta(leaf, delta);
        }
        inner.next_version = version;

        for row in notifications {
            self.monitor.notify(row);
        }

        Ok(())
    }
}
