//! # Storage
//!
//! Key/value persistence used by the archiver. Keys and values are opaque
//! bytes; ordering of keys is bytewise.
//!
//! Two backends:
//! - [`MemoryBackend`]: process-local, used when no storage path is configured
//! - [`SqliteBackend`]: a single `data.sqlite3` file under the storage path
//!
//! `mget` reads from one consistent snapshot and `mput` is atomic: either
//! every pair lands or none does.

mod memory;
mod sqlite;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// One key/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KvPair {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("storage lock poisoned")]
    Poisoned,
}

/// Blocking key/value store. Async callers go through `spawn_blocking`.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    fn delete(&self, key: &[u8]) -> Result<(), StorageError>;
    /// Values for `keys`, in order, read from one snapshot.
    fn mget(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, StorageError>;
    /// Writes every pair atomically.
    fn mput(&self, pairs: &[KvPair]) -> Result<(), StorageError>;
}

/// SQLite under `path` when given, memory otherwise.
pub fn open_backend(path: Option<&Path>) -> Result<Arc<dyn StorageBackend>, StorageError> {
    match path {
        Some(dir) => {
            let backend = SqliteBackend::open(dir)?;
            info!("storage: sqlite at {}", backend.path().display());
            Ok(Arc::new(backend))
        }
        None => {
            info!("storage: in-memory, archived events are lost on exit");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(backend: &dyn StorageBackend) {
        assert_eq!(backend.get(b"missing").unwrap(), None);

        backend.put(b"k1", b"v1").unwrap();
        backend.put(b"k1", b"v1b").unwrap();
        assert_eq!(backend.get(b"k1").unwrap(), Some(b"v1b".to_vec()));

        backend
            .mput(&[KvPair::new("k2", "v2"), KvPair::new("k3", "v3")])
            .unwrap();
        let values = backend
            .mget(&[b"k3".to_vec(), b"nope".to_vec(), b"k2".to_vec()])
            .unwrap();
        assert_eq!(
            values,
            vec![Some(b"v3".to_vec()), None, Some(b"v2".to_vec())]
        );

        backend.delete(b"k1").unwrap();
        backend.delete(b"k1").unwrap();
        assert_eq!(backend.get(b"k1").unwrap(), None);
    }

    #[test]
    fn memory_backend_contract() {
        exercise(&MemoryBackend::new());
    }

    #[test]
    fn sqlite_backend_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&SqliteBackend::open(dir.path()).unwrap());
    }

    #[test]
    fn open_backend_picks_sqlite_for_a_path() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open_backend(Some(dir.path())).unwrap();
        backend.put(b"k", b"v").unwrap();
        assert!(dir.path().join(sqlite::DB_FILE_NAME).exists());
    }
}
