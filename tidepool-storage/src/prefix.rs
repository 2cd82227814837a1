//! Prefix-scoped view over another driver.

use crate::{BatchOp, SharedStorageDriver, StorageDriver, WriteBatch};
use tidepool_model::DbError;

/// Scopes every operation under a byte prefix. Prefix drivers compose:
/// wrapping a prefixed driver concatenates prefixes.
#[derive(Clone)]
pub struct PrefixedStorageDriver {
    prefix: Vec<u8>,
    inner: SharedStorageDriver,
}

impl PrefixedStorageDriver {
    pub fn new(prefix: impl Into<Vec<u8>>, inner: SharedStorageDriver) -> Self {
        Self { prefix: prefix.into(), inner }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn scoped(&self, key: &[u8]) -> Vec<u8> {
        let mut k = Vec::with_capacity(self.prefix.len() + key.len());
        k.extend_from_slice(&self.prefix);
        k.extend_from_slice(key);
        k
    }
}

impl StorageDriver for PrefixedStorageDriver {
    fn open(&self) -> Result<(), DbError> {
        self.inner.open()
    }

    fn close(&self) -> Result<(), DbError> {
        // The underlying driver is shared; closing it is the owner's call.
        Ok(())
    }

    fn recover(&self) -> Result<(), DbError> {
        self.inner.recover()
    }

    fn get(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, DbError> {
        let scoped: Vec<Vec<u8>> = keys.iter().map(|k| self.scoped(k)).collect();
        self.inner.get(&scoped)
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), DbError> {
        let scoped = self.scoped(prefix);
        let strip = self.prefix.len();
        self.inner.scan_prefix(&scoped, &mut |k, v| visitor(&k[strip..], v))
    }

    fn batch(&self, batch: &WriteBatch) -> Result<(), DbError> {
        let mut scoped = WriteBatch::new();
        for op in &batch.ops {
            match op {
                BatchOp::Put { key, value } => {
                    scoped.put(self.scoped(key), value.clone());
                }
                BatchOp::Delete { key } => {
                    scoped.delete(self.scoped(key));
                }
            }
        }
        self.inner.batch(&scoped)
    }
}
