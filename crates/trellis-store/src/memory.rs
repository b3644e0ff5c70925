//! In-memory implementation of the KvStore trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{Result, StoreError};
use crate::traits::KvStore;

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.entries
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.entries
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.write()?.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.write()?.remove(key);
        Ok(())
    }

    async fn get_many(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.read()?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        self.write()?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StoreExt;

    #[tokio::test]
    async fn test_set_get_remove() {
        let store = MemoryStore::new();
        assert!(store.get("a").await.unwrap().is_none());

        store.set("a", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(vec![1, 2, 3]));

        store.remove("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());

        // Removing again is fine
        store.remove("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_get_many_respects_prefix() {
        let store = MemoryStore::new();
        store.set("__data/notes/1/", vec![1]).await.unwrap();
        store.set("__data/notes/2/", vec![2]).await.unwrap();
        store.set("__data/notesx/1/", vec![3]).await.unwrap();
        store.set("__group/g/", vec![4]).await.unwrap();

        let notes = store.get_many("__data/notes/").await.unwrap();
        let keys: Vec<_> = notes.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["__data/notes/1/", "__data/notes/2/"]);

        assert_eq!(store.get_many("__data/").await.unwrap().len(), 3);
        assert_eq!(store.get_many("").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_typed_records() {
        let store = MemoryStore::new();
        store.put_record("k", &vec!["x".to_string()]).await.unwrap();
        let value: Option<Vec<String>> = store.get_record("k").await.unwrap();
        assert_eq!(value, Some(vec!["x".to_string()]));

        store.set("bad", vec![0xff]).await.unwrap();
        let bad: Result<Option<Vec<String>>> = store.get_record("bad").await;
        assert!(matches!(bad, Err(StoreError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_clear() {
        let store = MemoryStore::new();
        store.set("a", vec![]).await.unwrap();
        store.set("b", vec![]).await.unwrap();
        assert_eq!(store.len(), 2);
        store.clear().await.unwrap();
        assert!(store.is_empty());
    }
}
