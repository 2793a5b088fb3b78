// ABOUTME: SQLite-backed implementation of the key-value service for durable on-disk storage.
// ABOUTME: Stores each key as one row of serialized JSON and reports size from stored byte lengths.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};

use crate::kv::{BackendError, KeyValueStore};

/// A key-value store persisted in a single SQLite table.
pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl SqliteKv {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BackendError::Unavailable(format!("create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    /// An in-memory database, discarded when dropped.
    pub fn open_in_memory() -> Result<Self, BackendError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, BackendError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, BackendError> {
        self.conn
            .lock()
            .map_err(|_| BackendError::Unavailable("sqlite connection lock poisoned".to_string()))
    }
}

#[async_trait]
impl KeyValueStore for SqliteKv {
    async fn get(&self, keys: Option<&[String]>) -> Result<Map<String, Value>, BackendError> {
        let conn = self.lock()?;
        let mut found = Map::new();

        match keys {
            None => {
                let mut stmt = conn.prepare("SELECT key, value FROM kv")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                for row in rows {
                    let (key, raw) = row?;
                    found.insert(key, serde_json::from_str(&raw)?);
                }
            }
            Some(keys) => {
                let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
                for key in keys {
                    let raw: Option<String> = stmt
                        .query_row(params![key], |row| row.get(0))
                        .optional()?;
                    if let Some(raw) = raw {
                        found.insert(key.clone(), serde_json::from_str(&raw)?);
                    }
                }
            }
        }

        Ok(found)
    }

    async fn set(&self, entries: Map<String, Value>) -> Result<(), BackendError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for (key, value) in &entries {
            tx.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<(), BackendError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for key in keys {
            tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn bytes_in_use(&self, keys: Option<&[String]>) -> Result<Option<u64>, BackendError> {
        let conn = self.lock()?;
        let total: i64 = match keys {
            None => conn.query_row(
                "SELECT COALESCE(SUM(LENGTH(key) + LENGTH(value)), 0) FROM kv",
                [],
                |row| row.get(0),
            )?,
            Some(keys) => {
                let mut stmt =
                    conn.prepare("SELECT COALESCE(LENGTH(key) + LENGTH(value), 0) FROM kv WHERE key = ?1")?;
                let mut sum = 0i64;
                for key in keys {
                    let size: Option<i64> = stmt.query_row(params![key], |row| row.get(0)).optional()?;
                    sum += size.unwrap_or(0);
                }
                sum
            }
        };
        Ok(Some(total.max(0) as u64))
    }
}
