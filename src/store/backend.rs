//! Durable key-value backends with a byte quota.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::BackendError;

/// Size a record occupies: key bytes plus value bytes.
pub fn record_size(key: &str, value: &str) -> usize {
  key.len() + value.len()
}

/// Synchronous key-value store with a capacity limit.
///
/// `set` fails with [`BackendError::Capacity`] when the write would not fit.
pub trait KeyValueBackend: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

  fn set(&self, key: &str, value: &str) -> Result<(), BackendError>;

  fn remove(&self, key: &str) -> Result<(), BackendError>;

  /// All stored keys, in ascending order.
  fn keys(&self) -> Result<Vec<String>, BackendError>;

  /// All stored (key, value) pairs, in ascending key order.
  fn entries(&self) -> Result<Vec<(String, String)>, BackendError> {
    let mut entries = Vec::new();
    for key in self.keys()? {
      if let Some(value) = self.get(&key)? {
        entries.push((key, value));
      }
    }
    Ok(entries)
  }
}

/// In-memory backend.
pub struct MemoryBackend {
  entries: Mutex<BTreeMap<String, String>>,
  capacity: usize,
}

impl MemoryBackend {
  pub fn new(capacity: usize) -> Self {
    Self {
      entries: Mutex::new(BTreeMap::new()),
      capacity,
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, String>>, BackendError> {
    self
      .entries
      .lock()
      .map_err(|e| BackendError::Storage(format!("Lock poisoned: {}", e)))
  }
}

impl KeyValueBackend for MemoryBackend {
  fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
    let mut entries = self.lock()?;
    let used: usize = entries
      .iter()
      .filter(|(k, _)| k.as_str() != key)
      .map(|(k, v)| record_size(k, v))
      .sum();
    let needed = record_size(key, value);

    if used + needed > self.capacity {
      return Err(BackendError::Capacity {
        needed,
        available: self.capacity.saturating_sub(used),
      });
    }

    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), BackendError> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, BackendError> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn entries(&self) -> Result<Vec<(String, String)>, BackendError> {
    Ok(
      self
        .lock()?
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    )
  }
}

/// SQLite-based backend.
pub struct SqliteBackend {
  conn: Mutex<Connection>,
  capacity: usize,
}

impl SqliteBackend {
  /// Open the backend at the default location.
  pub fn open(capacity: usize) -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path, capacity)
  }

  /// Open the backend at `path`, creating parent directories as needed.
  pub fn open_at(path: &Path, capacity: usize) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open storage database at {}: {}", path.display(), e))?;

    Self::with_connection(conn, capacity)
  }

  /// Open a throwaway in-memory database.
  pub fn in_memory(capacity: usize) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn, capacity)
  }

  fn with_connection(conn: Connection, capacity: usize) -> Result<Self> {
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run storage migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
      capacity,
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("crms-cache").join("store.db"))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, BackendError> {
    self
      .conn
      .lock()
      .map_err(|e| BackendError::Storage(format!("Lock poisoned: {}", e)))
  }
}

/// Schema for the key-value table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueBackend for SqliteBackend {
  fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
    let conn = self.lock()?;
    let value = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    // Bytes used by every other record
    let used: i64 = tx.query_row(
      "SELECT COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0)
       FROM kv_store WHERE key != ?",
      params![key],
      |row| row.get(0),
    )?;
    let used = usize::try_from(used).unwrap_or(0);
    let needed = record_size(key, value);

    if used + needed > self.capacity {
      return Err(BackendError::Capacity {
        needed,
        available: self.capacity.saturating_sub(used),
      });
    }

    tx.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    tx.commit()?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), BackendError> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, BackendError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT key FROM kv_store ORDER BY key")?;
    let keys = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
  }

  fn entries(&self) -> Result<Vec<(String, String)>, BackendError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT key, value FROM kv_store ORDER BY key")?;
    let entries = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<Result<Vec<(String, String)>, _>>()?;
    Ok(entries)
  }
}
