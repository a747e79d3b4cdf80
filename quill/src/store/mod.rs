// quill/src/store/mod.rs
//!
//! Persistent key-value store for whole JSON documents.
//!
//! Callers read a document, change it in memory and write it back. There is
//! no transactional discipline beyond that: a single writer is assumed.

pub mod migrations;

use crate::{DbPool, Error};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// Synchronous string-keyed store of JSON values.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, Error>;
    fn set(&self, key: &str, value: &Value) -> Result<(), Error>;
    fn remove(&self, key: &str) -> Result<(), Error>;
}

/// Bring a connection's schema up to date.
pub fn migrate_db(conn: &mut Connection) -> Result<(), Error> {
    migrations::runner().to_latest(conn)?;
    Ok(())
}

// ============================================================================
// SQLite store
// ============================================================================

pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// Open (or create) a database file and migrate it.
    pub fn open(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Store(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let manager = SqliteConnectionManager::file(path);
        let pool = r2d2::Pool::new(manager)?;
        Self::from_pool(pool)
    }

    /// A private in-memory database. The pool holds a single connection so
    /// every caller sees the same data.
    pub fn in_memory() -> Result<Self, Error> {
        let manager = SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
        Self::from_pool(pool)
    }

    pub fn from_pool(pool: DbPool) -> Result<Self, Error> {
        {
            let mut conn = pool.get()?;
            migrate_db(&mut conn)?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Value>, Error> {
        let conn = self.pool.get()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), Error> {
        let conn = self.pool.get()?;
        let json = serde_json::to_string(value)?;
        conn.execute(
            concat!(
                "INSERT INTO kv_store (key, value) VALUES (?1, ?2) ",
                "ON CONFLICT(key) DO UPDATE SET ",
                "value = excluded.value, ",
                "updated_at = CURRENT_TIMESTAMP"
            ),
            params![key, json],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, Error> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}
