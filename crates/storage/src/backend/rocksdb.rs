//! RocksDB storage backend, persistent. Suitable for production.

use std::path::Path;
use std::sync::Arc;

use rocksdb::checkpoint::Checkpoint;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, MultiThreaded,
    OptimisticTransactionDB, Options, SnapshotWithThreadMode, Transaction,
};

use crate::api::tables::TABLES;
use crate::api::{KvIter, KvPair, ReadView, StorageBackend, WriteTransaction};
use crate::error::StoreError;

type Db = OptimisticTransactionDB<MultiThreaded>;

pub struct RocksDbBackend {
    db: Db,
}

impl std::fmt::Debug for RocksDbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbBackend").finish_non_exhaustive()
    }
}

impl RocksDbBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let descriptors = TABLES
            .iter()
            .map(|table| ColumnFamilyDescriptor::new(*table, Options::default()));
        let db = Db::open_cf_descriptors(&opts, path, descriptors)?;
        Ok(Self { db })
    }
}

fn cf<'a>(db: &'a Db, table: &str) -> Result<Arc<BoundColumnFamily<'a>>, StoreError> {
    db.cf_handle(table)
        .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
}

fn boxed_iter<'a, I>(iter: I) -> KvIter<'a>
where
    I: Iterator<Item = Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>> + 'a,
{
    Box::new(iter.map(|item| {
        item.map(|(key, value)| (key.into_vec(), value.into_vec()))
            .map_err(StoreError::from)
    }))
}

impl StorageBackend for RocksDbBackend {
    fn begin_read(&self) -> Result<Box<dyn ReadView + '_>, StoreError> {
        Ok(Box::new(RocksDbReadView {
            db: &self.db,
            snapshot: self.db.snapshot(),
        }))
    }

    fn begin_write(&self) -> Result<Box<dyn WriteTransaction + '_>, StoreError> {
        Ok(Box::new(RocksDbWriteTx {
            db: &self.db,
            txn: self.db.transaction(),
        }))
    }

    fn checkpoint_to(&self, dir: &Path) -> Result<(), StoreError> {
        Checkpoint::new(&self.db)?.create_checkpoint(dir)?;
        Ok(())
    }
}

struct RocksDbReadView<'db> {
    db: &'db Db,
    snapshot: SnapshotWithThreadMode<'db, Db>,
}

impl ReadView for RocksDbReadView<'_> {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = cf(self.db, table)?;
        Ok(self.snapshot.get_cf(&cf, key)?)
    }

    fn iter_from<'a>(&'a self, table: &str, start: &[u8]) -> Result<KvIter<'a>, StoreError> {
        let cf = cf(self.db, table)?;
        Ok(boxed_iter(self.snapshot.iterator_cf(
            &cf,
            IteratorMode::From(start, Direction::Forward),
        )))
    }

    fn iter_rev_from<'a>(&'a self, table: &str, start: &[u8]) -> Result<KvIter<'a>, StoreError> {
        let cf = cf(self.db, table)?;
        Ok(boxed_iter(self.snapshot.iterator_cf(
            &cf,
            IteratorMode::From(start, Direction::Reverse),
        )))
    }

    fn last(&self, table: &str) -> Result<Option<KvPair>, StoreError> {
        let cf = cf(self.db, table)?;
        let mut iter = boxed_iter(self.snapshot.iterator_cf(&cf, IteratorMode::End));
        iter.next().transpose()
    }
}

struct RocksDbWriteTx<'db> {
    db: &'db Db,
    txn: Transaction<'db, Db>,
}

impl ReadView for RocksDbWriteTx<'_> {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = cf(self.db, table)?;
        Ok(self.txn.get_cf(&cf, key)?)
    }

    fn iter_from<'a>(&'a self, table: &str, start: &[u8]) -> Result<KvIter<'a>, StoreError> {
        let cf = cf(self.db, table)?;
        Ok(boxed_iter(self.txn.iterator_cf(
            &cf,
            IteratorMode::From(start, Direction::Forward),
        )))
    }

    fn iter_rev_from<'a>(&'a self, table: &str, start: &[u8]) -> Result<KvIter<'a>, StoreError> {
        let cf = cf(self.db, table)?;
        Ok(boxed_iter(self.txn.iterator_cf(
            &cf,
            IteratorMode::From(start, Direction::Reverse),
        )))
    }

    fn last(&self, table: &str) -> Result<Option<KvPair>, StoreError> {
        let cf = cf(self.db, table)?;
        let mut iter = boxed_iter(self.txn.iterator_cf(&cf, IteratorMode::End));
        iter.next().transpose()
    }
}

impl WriteTransaction for RocksDbWriteTx<'_> {
    fn put(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let cf = cf(self.db, table)?;
        Ok(self.txn.put_cf(&cf, key, value)?)
    }

    fn delete(&mut self, table: &str, key: &[u8]) -> Result<(), StoreError> {
        let cf = cf(self.db, table)?;
        Ok(self.txn.delete_cf(&cf, key)?)
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        Ok(self.txn.commit()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tables::{SEQUENCER_BATCH_ITEM, STATE};

    #[test]
    fn writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = RocksDbBackend::open(dir.path()).unwrap();
            let mut tx = backend.begin_write().unwrap();
            tx.put(STATE, b"k", b"v").unwrap();
            tx.put(SEQUENCER_BATCH_ITEM, &[0; 32], b"item").unwrap();
            tx.commit().unwrap();
        }
        let backend = RocksDbBackend::open(dir.path()).unwrap();
        let view = backend.begin_read().unwrap();
        assert_eq!(view.get(STATE, b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(
            view.last(SEQUENCER_BATCH_ITEM).unwrap().unwrap().0,
            vec![0; 32]
        );
    }

    #[test]
    fn reverse_iteration_seeks_for_previous() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RocksDbBackend::open(dir.path()).unwrap();
        let mut tx = backend.begin_write().unwrap();
        for key in [1u8, 3, 5] {
            tx.put(STATE, &[key], &[key]).unwrap();
        }
        tx.commit().unwrap();

        let view = backend.begin_read().unwrap();
        let first = view.iter_rev_from(STATE, &[4]).unwrap().next().unwrap().unwrap();
        assert_eq!(first.0, vec![3]);
    }
}
