//! Durable key-value storage using redb.
//!
//! # Table design
//!
//! A single `KV` table maps UTF-8 keys to opaque byte values. Every
//! `set`/`remove` is its own write transaction, so a successful return means
//! the value is committed to disk.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use super::KeyValueStore;
use crate::error::{RelayError, Result};

// ---------------------------------------------------------------------------
// Table definition
// ---------------------------------------------------------------------------

/// Key: storage key string
/// Value: raw bytes (JSON for everything the SDK writes)
const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

fn storage_err(e: impl std::fmt::Display) -> RelayError {
    RelayError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// RedbStore
// ---------------------------------------------------------------------------

pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the redb database at `path`.
    ///
    /// Creates the `KV` table if it doesn't already exist.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(storage_err)?;
        // Ensure the table exists before any reads
        let wt = db.begin_write().map_err(storage_err)?;
        wt.open_table(KV).map_err(storage_err)?;
        wt.commit().map_err(storage_err)?;
        Ok(Self { db })
    }
}

impl KeyValueStore for RedbStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let rt = self.db.begin_read().map_err(storage_err)?;
        let table = rt.open_table(KV).map_err(storage_err)?;
        let value = table.get(key).map_err(storage_err)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let wt = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = wt.open_table(KV).map_err(storage_err)?;
            table.insert(key, value).map_err(storage_err)?;
        }
        wt.commit().map_err(storage_err)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let wt = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = wt.open_table(KV).map_err(storage_err)?;
            table.remove(key).map_err(storage_err)?;
        }
        wt.commit().map_err(storage_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, RedbStore) {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(&dir.path().join("relay.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn set_then_get_returns_value() {
        let (_dir, store) = open_tmp();
        store.set("device.attributes", b"{}").unwrap();
        assert_eq!(store.get("device.attributes").unwrap(), Some(b"{}".to_vec()));
    }

    #[test]
    fn remove_missing_key_is_ok() {
        let (_dir, store) = open_tmp();
        store.remove("nope").unwrap();
        assert_eq!(store.get("nope").unwrap(), None);
    }

    #[test]
    fn values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.db");
        {
            let store = RedbStore::open(&path).unwrap();
            store.set("k", b"persisted").unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"persisted".to_vec()));
    }
}
