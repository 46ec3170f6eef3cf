#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown table {0}")]
    UnknownTable(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for StoreError {
    fn from(error: rocksdb::Error) -> Self {
        StoreError::Backend(error.to_string())
    }
}
