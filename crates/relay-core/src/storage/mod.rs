//! Persistent key-value storage capability.
//!
//! Everything the SDK persists (the event log, the device attribute map, the
//! test-device flag) goes through [`KeyValueStore`]. Two backends ship here:
//! [`MemoryStore`] for tests and ephemeral hosts, [`RedbStore`] for durable
//! on-disk storage.

pub mod disk;
pub mod memory;

pub use disk::RedbStore;
pub use memory::MemoryStore;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Read and JSON-decode the value stored under `key`.
pub fn get_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// JSON-encode `value` and store it under `key`.
pub fn set_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, &bytes)
}
