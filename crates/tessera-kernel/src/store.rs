//! Local key-value persistence.
//!
//! The metadata index keeps its durable copy here, and the sync manager keeps
//! the remote snapshot pointer. Both only need get/put/delete, prefix scans
//! for loading, and an atomic batch so a directory rename never lands half
//! written.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

/// Local persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One mutation inside a [`KvStore::write_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Put(String, Vec<u8>),
    Delete(String),
}

/// Generic durable key-value store.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// All pairs whose key starts with `prefix`, ordered by key.
    fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;

    /// Apply every op or none of them.
    fn write_batch(&self, ops: Vec<KvOp>) -> StoreResult<()>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
"#;

/// SQLite-backed store, one table of `(key, value)` rows.
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KvStore for SqliteKvStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv
             WHERE substr(key, 1, length(?1)) = ?1
             ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn write_batch(&self, ops: Vec<KvOp>) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for op in ops {
            match op {
                KvOp::Put(key, value) => {
                    tx.execute(
                        "INSERT INTO kv (key, value) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                        params![key, value],
                    )?;
                }
                KvOp::Delete(key) => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

/// Ephemeral store for tests and throwaway mounts.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, ops: Vec<KvOp>) -> StoreResult<()> {
        let mut entries = self.entries.write();
        for op in ops {
            match op {
                KvOp::Put(key, value) => {
                    entries.insert(key, value);
                }
                KvOp::Delete(key) => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}
