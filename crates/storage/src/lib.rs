//! Key-value storage layer for the arbrex engine.
//!
//! Exposes named ordered tables through snapshot reads and atomic write
//! transactions. Two backends: an in-memory store for tests and a RocksDB
//! store (behind the `rocksdb` feature) for production.

pub mod api;
pub mod backend;
pub mod error;

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::api::{ReadView, StorageBackend, WriteTransaction};
use crate::backend::in_memory::InMemoryBackend;
#[cfg(feature = "rocksdb")]
use crate::backend::rocksdb::RocksDbBackend;
use crate::error::StoreError;

/// Storage backend type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineType {
    /// In-memory storage, non-persistent. Suitable for testing.
    InMemory,
    /// RocksDB storage, persistent. Suitable for production.
    #[cfg(feature = "rocksdb")]
    RocksDb,
}

/// Handle to the underlying store. `Clone` shares the same backend.
#[derive(Debug, Clone)]
pub struct Store {
    backend: Arc<dyn StorageBackend>,
}

impl Store {
    pub fn new(_path: &Path, engine_type: EngineType) -> Result<Self, StoreError> {
        info!("Starting storage engine ({engine_type:?})");
        let store = match engine_type {
            EngineType::InMemory => Self {
                backend: Arc::new(InMemoryBackend::new()),
            },
            #[cfg(feature = "rocksdb")]
            EngineType::RocksDb => Self {
                backend: Arc::new(RocksDbBackend::open(_path)?),
            },
        };
        Ok(store)
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(InMemoryBackend::new()),
        }
    }

    /// Opens a consistent snapshot of the whole store.
    pub fn begin_read(&self) -> Result<Box<dyn ReadView + '_>, StoreError> {
        self.backend.begin_read()
    }

    /// Opens a write transaction.
    pub fn begin_write(&self) -> Result<Box<dyn WriteTransaction + '_>, StoreError> {
        self.backend.begin_write()
    }

    /// Persists a consistent copy of the whole store into `dir`.
    pub fn checkpoint_to(&self, dir: &Path) -> Result<(), StoreError> {
        self.backend.checkpoint_to(dir)
    }
}
