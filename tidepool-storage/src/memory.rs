//! In-memory storage driver for tests and simulations.

use crate::{BatchOp, StorageDriver, WriteBatch};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tidepool_model::{error, DbError};

/// `BTreeMap` behind a mutex. Supports an injected corrupted state so
/// recovery paths can be exercised.
#[derive(Debug, Default)]
pub struct MemoryStorageDriver {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    corrupted: AtomicBool,
}

impl MemoryStorageDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the medium corrupted: `open` fails with `E_CORRUPTED` until
    /// `recover` wipes it.
    pub fn corrupt(&self) {
        self.corrupted.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DbError> {
        if self.corrupted.load(Ordering::SeqCst) {
            Err(error::E_CORRUPTED)
        } else {
            Ok(())
        }
    }
}

impl StorageDriver for MemoryStorageDriver {
    fn open(&self) -> Result<(), DbError> {
        self.check()
    }

    fn close(&self) -> Result<(), DbError> {
        Ok(())
    }

    fn recover(&self) -> Result<(), DbError> {
        self.data.lock().map_err(|_| error::E_STORAGE)?.clear();
        self.corrupted.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, DbError> {
        self.check()?;
        let data = self.data.lock().map_err(|_| error::E_STORAGE)?;
        Ok(keys.iter().map(|k| data.get(k).cloned()).collect())
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), DbError> {
        self.check()?;
        let data = self.data.lock().map_err(|_| error::E_STORAGE)?;
        for (k, v) in data.range(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                break;
            }
            if !visitor(k, v) {
                break;
            }
        }
        Ok(())
    }

    fn batch(&self, batch: &WriteBatch) -> Result<(), DbError> {
        self.check()?;
        let mut data = self.data.lock().map_err(|_| error::E_STORAGE)?;
        for op in &batch.ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    data.remove(key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{purge_prefix, scan_collect};

    #[test]
    fn batch_then_get() {
        let driver = MemoryStorageDriver::new();
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        driver.batch(&batch).unwrap();

        let got = driver.get(&[b"a".to_vec(), b"missing".to_vec()]).unwrap();
        assert_eq!(got, vec![Some(b"1".to_vec()), None]);
    }

    #[test]
    fn scan_is_prefix_bounded_and_ordered() {
        let driver = MemoryStorageDriver::new();
        let mut batch = WriteBatch::new();
        batch.put(b"p/a".to_vec(), b"1".to_vec());
        batch.put(b"p/b".to_vec(), b"2".to_vec());
        batch.put(b"q/c".to_vec(), b"3".to_vec());
        driver.batch(&batch).unwrap();

        let rows = scan_collect(&driver, b"p/").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, b"p/a");
        assert_eq!(rows[1].0, b"p/b");
    }

    #[test]
    fn purge_removes_only_prefix() {
        let driver = MemoryStorageDriver::new();
        let mut batch = WriteBatch::new();
        batch.put(b"p/a".to_vec(), b"1".to_vec());
        batch.put(b"q/b".to_vec(), b"2".to_vec());
        driver.batch(&batch).unwrap();

        purge_prefix(&driver, b"p/").unwrap();
        assert!(scan_collect(&driver, b"p/").unwrap().is_empty());
        assert_eq!(scan_collect(&driver, b"q/").unwrap().len(), 1);
    }

    #[test]
    fn corruption_blocks_until_recover() {
        let driver = MemoryStorageDriver::new();
        driver.corrupt();
        assert_eq!(driver.open(), Err(error::E_CORRUPTED));
        driver.recover().unwrap();
        assert!(driver.open().is_ok());
    }
}
