use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::{KvPair, StorageBackend, StorageError};

pub(crate) const DB_FILE_NAME: &str = "data.sqlite3";
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// `kv` table in a single SQLite file.
#[derive(Debug)]
pub struct SqliteBackend {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Opens (creating if needed) `<dir>/data.sqlite3`.
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir).map_err(|source| StorageError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(DB_FILE_NAME);

        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   BLOB PRIMARY KEY,
                value BLOB NOT NULL
            )",
        )?;

        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for SqliteBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn mget(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, StorageError> {
        let mut conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let mut values = Vec::with_capacity(keys.len());
        {
            let mut stmt = tx.prepare_cached("SELECT value FROM kv WHERE key = ?1")?;
            for key in keys {
                let value = stmt
                    .query_row(params![key], |row| row.get(0))
                    .optional()?;
                values.push(value);
            }
        }
        tx.commit()?;
        Ok(values)
    }

    fn mput(&self, pairs: &[KvPair]) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt =
                tx.prepare_cached("INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)")?;
            for pair in pairs {
                stmt.execute(params![pair.key, pair.value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = SqliteBackend::open(dir.path()).unwrap();
            backend.mput(&[KvPair::new("a", "1"), KvPair::new("b", "2")]).unwrap();
        }

        let backend = SqliteBackend::open(dir.path()).unwrap();
        assert_eq!(backend.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let backend = SqliteBackend::open(&nested).unwrap();
        assert_eq!(backend.path(), nested.join(DB_FILE_NAME));
    }
}
