use std::path::Path;

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use tracing::info;

use crate::error::{Result, TernError};
use crate::store::ByteStore;

fn store_err(err: rocksdb::Error) -> TernError {
    TernError::FatalStore(err.to_string())
}

/// LSM-backed byte store.
pub struct RocksStore {
    db: DB,
    sync_batches: bool,
}

impl RocksStore {
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with(dir, true)
    }

    /// Bulk-load tuning: batches skip the WAL entirely and nothing is
    /// synced until [`ByteStore::sync`] at the end of the load.
    pub fn open_bulk(dir: &Path) -> Result<Self> {
        Self::open_with(dir, false)
    }

    fn open_with(dir: &Path, sync_batches: bool) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(64 << 20);
        opts.increase_parallelism(4);
        let db = DB::open(&opts, dir).map_err(store_err)?;
        info!(dir = %dir.display(), "opened byte store");
        Ok(RocksStore { db, sync_batches })
    }
}

impl ByteStore for RocksStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db.get(key).map_err(store_err)
    }

    fn set_one(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(key, value).map_err(store_err)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.delete(key).map_err(store_err)
    }

    fn write_batch(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for (key, value) in entries {
            batch.put(key, value);
        }
        let mut opts = WriteOptions::default();
        opts.set_sync(false);
        if !self.sync_batches {
            opts.disable_wal(true);
        }
        self.db.write_opt(batch, &opts).map_err(store_err)
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(store_err)?;
            if !key.starts_with(prefix) {
                break;
            }
            if !visit(&key, &value)? {
                break;
            }
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.db.flush().map_err(store_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn disk_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store.set_one(b"key", b"value").unwrap();
        assert_eq!(store.get(b"key").unwrap(), Some(b"value".to_vec()));

        store
            .write_batch(&[
                (b"p/1".to_vec(), b"a".to_vec()),
                (b"p/2".to_vec(), b"b".to_vec()),
            ])
            .unwrap();
        let mut keys = Vec::new();
        store
            .scan_prefix(b"p/", &mut |k, _| {
                keys.push(k.to_vec());
                Ok(true)
            })
            .unwrap();
        assert_eq!(keys, vec![b"p/1".to_vec(), b"p/2".to_vec()]);
        store.sync().unwrap();
    }
}
