//! Durable storage driver backed by redb.

use crate::{BatchOp, StorageDriver, WriteBatch};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Mutex;
use tidepool_model::{error, DbError};

const TABLE_DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("data");

/// Single-file redb database holding the whole node keyspace in one ordered
/// table. Opened once per process; prefix drivers layer on top.
pub struct RedbStorageDriver {
    path: PathBuf,
    db: Mutex<Option<Database>>,
}

impl RedbStorageDriver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), db: Mutex::new(None) }
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T, DbError>) -> Result<T, DbError> {
        let guard = self.db.lock().map_err(|_| error::E_STORAGE)?;
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(error::E_STORAGE),
        }
    }
}

fn map_db_err(e: impl std::fmt::Display) -> DbError {
    tracing::error!(error = %e, "storage engine fault");
    error::E_STORAGE
}

impl StorageDriver for RedbStorageDriver {
    fn open(&self) -> Result<(), DbError> {
        let mut guard = self.db.lock().map_err(|_| error::E_STORAGE)?;
        if guard.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(map_db_err)?;
        }

        let db = match Database::create(&self.path) {
            Ok(db) => db,
            Err(redb::DatabaseError::Storage(e)) => {
                tracing::error!(error = %e, path = %self.path.display(), "database is corrupted");
                return Err(error::E_CORRUPTED);
            }
            Err(e) => return Err(map_db_err(e)),
        };

        // Ensure the table exists so scans on a fresh store succeed
        let txn = db.begin_write().map_err(map_db_err)?;
        txn.open_table(TABLE_DATA).map_err(map_db_err)?;
        txn.commit().map_err(map_db_err)?;

        *guard = Some(db);
        Ok(())
    }

    fn close(&self) -> Result<(), DbError> {
        let mut guard = self.db.lock().map_err(|_| error::E_STORAGE)?;
        *guard = None;
        Ok(())
    }

    fn recover(&self) -> Result<(), DbError> {
        let mut guard = self.db.lock().map_err(|_| error::E_STORAGE)?;
        *guard = None;

        if self.path.exists() {
            let mut aside = self.path.clone();
            aside.set_extension("corrupted");
            std::fs::rename(&self.path, &aside).map_err(map_db_err)?;
            tracing::warn!(
                from = %self.path.display(),
                to = %aside.display(),
                "moved corrupted database aside"
            );
        }

        drop(guard);
        self.open()
    }

    fn get(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, DbError> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(map_db_err)?;
            let table = txn.open_table(TABLE_DATA).map_err(map_db_err)?;
            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                let value = table
                    .get(key.as_slice())
                    .map_err(map_db_err)?
                    .map(|v| v.value().to_vec());
                out.push(value);
            }
            Ok(out)
        })
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), DbError> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(map_db_err)?;
            let table = txn.open_table(TABLE_DATA).map_err(map_db_err)?;
            let mut range = table.range(prefix..).map_err(map_db_err)?;
            while let Some(entry) = range.next() {
                let (k, v) = entry.map_err(map_db_err)?;
                if !k.value().starts_with(prefix) {
                    break;
                }
                if !visitor(k.value(), v.value()) {
                    break;
                }
            }
            Ok(())
        })
    }

    fn batch(&self, batch: &WriteBatch) -> Result<(), DbError> {
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_db_err)?;
            {
                let mut table = txn.open_table(TABLE_DATA).map_err(map_db_err)?;
                for op in &batch.ops {
                    match op {
                        BatchOp::Put { key, value } => {
                            table
                                .insert(key.as_slice(), value.as_slice())
                                .map_err(map_db_err)?;
                        }
                        BatchOp::Delete { key } => {
                            table.remove(key.as_slice()).map_err(map_db_err)?;
                        }
                    }
                }
            }
            txn.commit().map_err(map_db_err)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan_collect;
    use tempfile::tempdir;

    #[test]
    fn open_write_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.redb");

        let driver = RedbStorageDriver::new(&path);
        driver.open().unwrap();
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"v".to_vec());
        driver.batch(&batch).unwrap();
        driver.close().unwrap();

        let reopened = RedbStorageDriver::new(&path);
        reopened.open().unwrap();
        assert_eq!(reopened.get(&[b"k".to_vec()]).unwrap(), vec![Some(b"v".to_vec())]);
    }

    #[test]
    fn scan_stops_at_prefix_end() {
        let dir = tempdir().unwrap();
        let driver = RedbStorageDriver::new(dir.path().join("data.redb"));
        driver.open().unwrap();

        let mut batch = WriteBatch::new();
        batch.put(b"a/1".to_vec(), b"x".to_vec());
        batch.put(b"a/2".to_vec(), b"y".to_vec());
        batch.put(b"b/1".to_vec(), b"z".to_vec());
        driver.batch(&batch).unwrap();

        let rows = scan_collect(&driver, b"a/").unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn recover_moves_file_aside_and_reopens_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.redb");

        let driver = RedbStorageDriver::new(&path);
        driver.open().unwrap();
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"v".to_vec());
        driver.batch(&batch).unwrap();

        driver.recover().unwrap();
        assert_eq!(driver.get(&[b"k".to_vec()]).unwrap(), vec![None]);
        assert!(dir.path().join("data.corrupted").exists());
    }
}
