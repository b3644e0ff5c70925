//! SQLite implementation of the KvStore trait.
//!
//! This is the persistent storage backend for Trellis devices. It uses
//! rusqlite with bundled SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::migration::{self, now_millis};
use crate::traits::KvStore;

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        tracing::debug!(path = %path.display(), "opened sqlite store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Background(e.to_string()))?
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let value = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                updated_at = excluded.updated_at",
                params![key, value, now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn get_many(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let prefix = prefix.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM kv
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key",
            )?;
            let rows = stmt
                .query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.blocking(|conn| {
            conn.execute("DELETE FROM kv", [])?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StoreExt;

    #[tokio::test]
    async fn test_set_and_get() {
        let store = SqliteStore::open_memory().unwrap();
        store.set("__meta/x", vec![7, 8]).await.unwrap();
        assert_eq!(store.get("__meta/x").await.unwrap(), Some(vec![7, 8]));
        assert!(store.get("__meta/y").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite() {
        let store = SqliteStore::open_memory().unwrap();
        store.set("k", vec![1]).await.unwrap();
        store.set("k", vec![2]).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(vec![2]));
        assert_eq!(store.get_many("").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_many_is_sorted_and_prefix_bound() {
        let store = SqliteStore::open_memory().unwrap();
        store.set("__group/b/", vec![2]).await.unwrap();
        store.set("__group/a/", vec![1]).await.unwrap();
        store.set("__groupie/", vec![9]).await.unwrap();
        store.set("__perm/__group/a/", vec![3]).await.unwrap();

        let groups = store.get_many("__group/").await.unwrap();
        assert_eq!(
            groups,
            vec![
                ("__group/a/".to_string(), vec![1]),
                ("__group/b/".to_string(), vec![2]),
            ]
        );
    }

    #[tokio::test]
    async fn test_prefix_with_like_wildcards() {
        // '%' and '_' must be matched literally
        let store = SqliteStore::open_memory().unwrap();
        store.set("__data/a_b/1/", vec![1]).await.unwrap();
        store.set("__data/axb/1/", vec![2]).await.unwrap();
        assert_eq!(store.get_many("__data/a_b/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let store = SqliteStore::open_memory().unwrap();
        store.set("a", vec![1]).await.unwrap();
        store.set("b", vec![2]).await.unwrap();
        store.remove("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        store.clear().await.unwrap();
        assert!(store.get_many("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_records_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.put_record("__meta/name", &"laptop").await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let name: Option<String> = store.get_record("__meta/name").await.unwrap();
        assert_eq!(name.as_deref(), Some("laptop"));
    }
}
