//! In-memory storage backend, non-persistent. Suitable for testing.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::api::tables::TABLES;
use crate::api::{KvIter, KvPair, ReadView, StorageBackend, WriteTransaction};
use crate::error::StoreError;

type Table = BTreeMap<Vec<u8>, Vec<u8>>;
type Tables = HashMap<String, Table>;

#[derive(Debug)]
pub struct InMemoryBackend {
    inner: Arc<RwLock<Tables>>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let mut tables = Tables::new();
        for table in TABLES {
            tables.insert(table.to_string(), Table::new());
        }
        Self {
            inner: Arc::new(RwLock::new(tables)),
        }
    }

    fn snapshot(&self) -> Result<Tables, StoreError> {
        Ok(self
            .inner
            .read()
            .map_err(|_| StoreError::LockPoisoned)?
            .clone())
    }
}

impl StorageBackend for InMemoryBackend {
    fn begin_read(&self) -> Result<Box<dyn ReadView + '_>, StoreError> {
        Ok(Box::new(InMemoryReadView {
            tables: self.snapshot()?,
        }))
    }

    fn begin_write(&self) -> Result<Box<dyn WriteTransaction + '_>, StoreError> {
        Ok(Box::new(InMemoryWriteTx {
            base: Arc::clone(&self.inner),
            snapshot: self.snapshot()?,
            overlay: HashMap::new(),
        }))
    }

    fn checkpoint_to(&self, dir: &Path) -> Result<(), StoreError> {
        let tables = self.snapshot()?;
        std::fs::create_dir_all(dir)?;
        for (name, table) in &tables {
            let mut file = std::fs::File::create(dir.join(format!("{name}.kv")))?;
            for (key, value) in table {
                file.write_all(&(key.len() as u32).to_be_bytes())?;
                file.write_all(key)?;
                file.write_all(&(value.len() as u32).to_be_bytes())?;
                file.write_all(value)?;
            }
        }
        Ok(())
    }
}

fn table<'a>(tables: &'a Tables, name: &str) -> Result<&'a Table, StoreError> {
    tables
        .get(name)
        .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
}

fn range_iter(table: &Table, start: &[u8], reverse: bool) -> KvIter<'static> {
    // Tables are snapshots already; materializing the range keeps the
    // iterator independent of the view's borrow.
    let entries: Vec<KvPair> = if reverse {
        table
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(start)))
            .rev()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    } else {
        table
            .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };
    Box::new(entries.into_iter().map(Ok))
}

#[derive(Debug)]
struct InMemoryReadView {
    tables: Tables,
}

impl ReadView for InMemoryReadView {
    fn get(&self, name: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(table(&self.tables, name)?.get(key).cloned())
    }

    fn iter_from<'a>(&'a self, name: &str, start: &[u8]) -> Result<KvIter<'a>, StoreError> {
        Ok(range_iter(table(&self.tables, name)?, start, false))
    }

    fn iter_rev_from<'a>(&'a self, name: &str, start: &[u8]) -> Result<KvIter<'a>, StoreError> {
        Ok(range_iter(table(&self.tables, name)?, start, true))
    }

    fn last(&self, name: &str) -> Result<Option<KvPair>, StoreError> {
        Ok(table(&self.tables, name)?
            .last_key_value()
            .map(|(k, v)| (k.clone(), v.clone())))
    }
}

/// `None` in the overlay marks a pending delete.
type Overlay = HashMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>;

struct InMemoryWriteTx {
    base: Arc<RwLock<Tables>>,
    snapshot: Tables,
    overlay: Overlay,
}

impl InMemoryWriteTx {
    fn merged(&self, name: &str) -> Result<Table, StoreError> {
        let mut merged = table(&self.snapshot, name)?.clone();
        if let Some(pending) = self.overlay.get(name) {
            for (key, value) in pending {
                match value {
                    Some(value) => {
                        merged.insert(key.clone(), value.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }
        Ok(merged)
    }
}

impl ReadView for InMemoryWriteTx {
    fn get(&self, name: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(pending) = self.overlay.get(name)
            && let Some(value) = pending.get(key)
        {
            return Ok(value.clone());
        }
        Ok(table(&self.snapshot, name)?.get(key).cloned())
    }

    fn iter_from<'a>(&'a self, name: &str, start: &[u8]) -> Result<KvIter<'a>, StoreError> {
        Ok(range_iter(&self.merged(name)?, start, false))
    }

    fn iter_rev_from<'a>(&'a self, name: &str, start: &[u8]) -> Result<KvIter<'a>, StoreError> {
        Ok(range_iter(&self.merged(name)?, start, true))
    }

    fn last(&self, name: &str) -> Result<Option<KvPair>, StoreError> {
        Ok(self
            .merged(name)?
            .last_key_value()
            .map(|(k, v)| (k.clone(), v.clone())))
    }
}

impl WriteTransaction for InMemoryWriteTx {
    fn put(&mut self, name: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        table(&self.snapshot, name)?;
        self.overlay
            .entry(name.to_string())
            .or_default()
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, name: &str, key: &[u8]) -> Result<(), StoreError> {
        table(&self.snapshot, name)?;
        self.overlay
            .entry(name.to_string())
            .or_default()
            .insert(key.to_vec(), None);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut tables = self.base.write().map_err(|_| StoreError::LockPoisoned)?;
        for (name, pending) in self.overlay {
            let table = tables
                .get_mut(&name)
                .ok_or(StoreError::UnknownTable(name))?;
            for (key, value) in pending {
                match value {
                    Some(value) => {
                        table.insert(key, value);
                    }
                    None => {
                        table.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tables::{CHECKPOINT, STATE};

    #[test]
    fn writes_are_invisible_until_commit() {
        let backend = InMemoryBackend::new();
        let mut tx = backend.begin_write().unwrap();
        tx.put(STATE, b"k", b"v").unwrap();
        assert_eq!(tx.get(STATE, b"k").unwrap(), Some(b"v".to_vec()));

        let view = backend.begin_read().unwrap();
        assert_eq!(view.get(STATE, b"k").unwrap(), None);

        tx.commit().unwrap();
        let view = backend.begin_read().unwrap();
        assert_eq!(view.get(STATE, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn dropped_transaction_discards_writes() {
        let backend = InMemoryBackend::new();
        {
            let mut tx = backend.begin_write().unwrap();
            tx.put(STATE, b"k", b"v").unwrap();
        }
        assert_eq!(backend.begin_read().unwrap().get(STATE, b"k").unwrap(), None);
    }

    #[test]
    fn snapshot_is_isolated_from_later_commits() {
        let backend = InMemoryBackend::new();
        let mut tx = backend.begin_write().unwrap();
        tx.put(STATE, b"k", b"old").unwrap();
        tx.commit().unwrap();

        let view = backend.begin_read().unwrap();
        let mut tx = backend.begin_write().unwrap();
        tx.put(STATE, b"k", b"new").unwrap();
        tx.commit().unwrap();

        assert_eq!(view.get(STATE, b"k").unwrap(), Some(b"old".to_vec()));
    }

    #[test]
    fn iteration_is_ordered_and_seekable() {
        let backend = InMemoryBackend::new();
        let mut tx = backend.begin_write().unwrap();
        for i in [3u8, 1, 5, 2] {
            tx.put(CHECKPOINT, &[i], &[i]).unwrap();
        }
        tx.commit().unwrap();

        let view = backend.begin_read().unwrap();
        let forward: Vec<_> = view
            .iter_from(CHECKPOINT, &[2])
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(forward, vec![vec![2], vec![3], vec![5]]);

        let reverse: Vec<_> = view
            .iter_rev_from(CHECKPOINT, &[4])
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(reverse, vec![vec![3], vec![2], vec![1]]);

        assert_eq!(view.last(CHECKPOINT).unwrap().unwrap().0, vec![5]);
    }

    #[test]
    fn write_transaction_iterates_own_writes() {
        let backend = InMemoryBackend::new();
        let mut tx = backend.begin_write().unwrap();
        tx.put(CHECKPOINT, &[1], b"a").unwrap();
        tx.put(CHECKPOINT, &[2], b"b").unwrap();
        tx.delete(CHECKPOINT, &[1]).unwrap();
        let keys: Vec<_> = tx
            .iter_from(CHECKPOINT, &[])
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![vec![2]]);
    }

    #[test]
    fn checkpoint_writes_every_table_to_disk() {
        let backend = InMemoryBackend::new();
        let mut tx = backend.begin_write().unwrap();
        tx.put(STATE, b"k", b"v").unwrap();
        tx.commit().unwrap();

        let dir = tempfile::tempdir().unwrap();
        backend.checkpoint_to(dir.path()).unwrap();
        for table in crate::api::tables::TABLES {
            assert!(dir.path().join(format!("{table}.kv")).is_file());
        }
        let state_bytes = std::fs::read(dir.path().join("state.kv")).unwrap();
        assert!(!state_bytes.is_empty());
    }
}
