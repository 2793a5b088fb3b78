// ABOUTME: The abstract key-value service the store persists into, plus an in-memory implementation.
// ABOUTME: Mirrors the host storage API shape: get/set/remove over JSON values and best-effort size reporting.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors raised by a key-value backend itself.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// A JSON key-value storage service. Used both for the durable backing
/// store and for the ephemeral session-scoped store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the given keys, or every key when `keys` is `None`. Missing keys
    /// are absent from the returned map.
    async fn get(&self, keys: Option<&[String]>) -> Result<Map<String, Value>, BackendError>;

    /// Write every entry, replacing existing values.
    async fn set(&self, entries: Map<String, Value>) -> Result<(), BackendError>;

    /// Delete the given keys. Missing keys are ignored.
    async fn remove(&self, keys: &[String]) -> Result<(), BackendError>;

    /// Bytes used by the given keys (or everything). `None` means the host
    /// does not support size reporting.
    async fn bytes_in_use(&self, _keys: Option<&[String]>) -> Result<Option<u64>, BackendError> {
        Ok(None)
    }
}

/// Fetch a single key.
pub async fn get_one(store: &dyn KeyValueStore, key: &str) -> Result<Option<Value>, BackendError> {
    let keys = [key.to_string()];
    let mut found = store.get(Some(&keys[..])).await?;
    Ok(found.remove(key))
}

/// Write a single key.
pub async fn set_one(store: &dyn KeyValueStore, key: &str, value: Value) -> Result<(), BackendError> {
    let mut entries = Map::new();
    entries.insert(key.to_string(), value);
    store.set(entries).await
}

/// Approximate serialized size of one entry.
pub(crate) fn entry_size(key: &str, value: &Value) -> u64 {
    (key.len() + value.to_string().len()) as u64
}

/// In-process key-value store. Serves as the session-scoped service and as
/// the backing store in tests.
#[derive(Debug)]
pub struct MemoryKv {
    entries: RwLock<Map<String, Value>>,
    reports_size: bool,
    unavailable: AtomicBool,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Map::new()),
            reports_size: true,
            unavailable: AtomicBool::new(false),
        }
    }

    /// A store seeded with the given entries.
    pub fn with_entries(entries: Map<String, Value>) -> Self {
        Self {
            entries: RwLock::new(entries),
            ..Self::new()
        }
    }

    /// A store that behaves like a host without `getBytesInUse`.
    pub fn without_size_reporting() -> Self {
        Self {
            reports_size: false,
            ..Self::new()
        }
    }

    /// Make every subsequent call fail (or succeed again), simulating an
    /// outage of the host storage service.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, keys: Option<&[String]>) -> Result<Map<String, Value>, BackendError> {
        self.check_available()?;
        let entries = self.entries.read().await;
        Ok(match keys {
            None => entries.clone(),
            Some(keys) => keys
                .iter()
                .filter_map(|k| entries.get(k).map(|v| (k.clone(), v.clone())))
                .collect(),
        })
    }

    async fn set(&self, new_entries: Map<String, Value>) -> Result<(), BackendError> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        for (key, value) in new_entries {
            entries.insert(key, value);
        }
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<(), BackendError> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn bytes_in_use(&self, keys: Option<&[String]>) -> Result<Option<u64>, BackendError> {
        self.check_available()?;
        if !self.reports_size {
            return Ok(None);
        }
        let entries = self.entries.read().await;
        let total = entries
            .iter()
            .filter(|(k, _)| keys.is_none_or(|keys| keys.contains(k)))
            .map(|(k, v)| entry_size(k, v))
            .sum();
        Ok(Some(total))
    }
}
