//! Backend-facing storage API.
//!
//! The engine consumes an ordered key-value store through these traits:
//! consistent snapshot reads, buffered read-your-writes write transactions,
//! seekable iteration in both directions, and a whole-store checkpoint to a
//! directory. One writer (the driver) and many snapshot readers.

pub mod tables;

use std::fmt::Debug;
use std::path::Path;

use crate::error::StoreError;

pub type KvPair = (Vec<u8>, Vec<u8>);
pub type KvIter<'a> = Box<dyn Iterator<Item = Result<KvPair, StoreError>> + 'a>;

/// Point-in-time read access to every table.
pub trait ReadView {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Forward iterator over entries with `key >= start`.
    fn iter_from<'a>(&'a self, table: &str, start: &[u8]) -> Result<KvIter<'a>, StoreError>;

    /// Reverse iterator over entries with `key <= start`, newest key first.
    fn iter_rev_from<'a>(&'a self, table: &str, start: &[u8]) -> Result<KvIter<'a>, StoreError>;

    /// The entry with the greatest key, if the table is non-empty.
    fn last(&self, table: &str) -> Result<Option<KvPair>, StoreError>;
}

/// A write transaction. Mutations are buffered and become visible to other
/// readers only on `commit`; reads through the transaction observe its own
/// pending writes. Dropping the transaction discards everything.
pub trait WriteTransaction: ReadView {
    fn put(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn delete(&mut self, table: &str, key: &[u8]) -> Result<(), StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// An ordered key-value store with named tables.
pub trait StorageBackend: Debug + Send + Sync {
    /// Opens a consistent snapshot of the whole store.
    fn begin_read(&self) -> Result<Box<dyn ReadView + '_>, StoreError>;

    /// Opens a write transaction.
    fn begin_write(&self) -> Result<Box<dyn WriteTransaction + '_>, StoreError>;

    /// Persists a consistent copy of the whole store into `dir`.
    fn checkpoint_to(&self, dir: &Path) -> Result<(), StoreError>;
}
