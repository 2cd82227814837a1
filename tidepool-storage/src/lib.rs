//! Storage driver seam.
//!
//! Everything durable in tidepool goes through [`StorageDriver`]: a
//! prefix-scoped, byte-lexicographically ordered key-value store with
//! atomic batches, visitor-based scans, and a one-shot recovery hook.
//! The production driver is redb; tests swap in the in-memory driver.

pub mod prefix;
pub mod memory;
pub mod redb_driver;

pub use memory::MemoryStorageDriver;
pub use prefix::PrefixedStorageDriver;
pub use redb_driver::RedbStorageDriver;

use std::sync::Arc;
use tidepool_model::DbError;

/// One write in an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An ordered list of writes applied atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Put { key: key.into(), value: value.into() });
        self
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Ordered KV storage behind an object-safe, synchronous interface.
///
/// Callers own threading: drivers are `Send + Sync` and internally
/// serialized where the engine requires it. Scans visit keys in
/// byte-lexicographic order; the visitor returns `false` to stop early.
pub trait StorageDriver: Send + Sync {
    fn open(&self) -> Result<(), DbError>;
    fn close(&self) -> Result<(), DbError>;

    /// Attempt to repair the medium after [`open`](Self::open) reported
    /// `E_CORRUPTED`. Data may be lost; the store is empty but usable after
    /// a successful recover.
    fn recover(&self) -> Result<(), DbError>;

    fn get(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, DbError>;

    /// Visit every `(key, value)` with the given prefix in order.
    fn scan_prefix(
        &self,
        prefix: &[u8],
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), DbError>;

    fn batch(&self, batch: &WriteBatch) -> Result<(), DbError>;
}

/// Collect a full prefix scan. Convenience for small ranges and tests.
pub fn scan_collect(
    driver: &dyn StorageDriver,
    prefix: &[u8],
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
    let mut out = Vec::new();
    driver.scan_prefix(prefix, &mut |k, v| {
        out.push((k.to_vec(), v.to_vec()));
        true
    })?;
    Ok(out)
}

/// Delete everything under a prefix in one batch.
pub fn purge_prefix(driver: &dyn StorageDriver, prefix: &[u8]) -> Result<(), DbError> {
    let mut batch = WriteBatch::new();
    driver.scan_prefix(prefix, &mut |k, _| {
        batch.delete(k.to_vec());
        true
    })?;
    if !batch.is_empty() {
        driver.batch(&batch)?;
    }
    Ok(())
}

/// Shared handle to a driver. Prefix drivers are cheap wrappers over this.
pub type SharedStorageDriver = Arc<dyn StorageDriver>;
