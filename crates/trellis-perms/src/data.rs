//! Application data items.
//!
//! Values are arbitrary JSON documents stored as CBOR under
//! `__data/<prefix>/<id>/`. Visibility and privileges live in the item's
//! permission triple, not here.

use std::sync::Arc;

use serde_json::Value;
use trellis_core::{namespace, ObjectKey};
use trellis_store::{KvStore, StoreExt};

use crate::error::Result;

pub struct DataStore<S> {
    store: Arc<S>,
}

impl<S> Clone for DataStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: KvStore> DataStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn get(&self, key: &ObjectKey) -> Result<Option<Value>> {
        Ok(self.store.get_record(key.as_str()).await?)
    }

    pub async fn set(&self, key: &ObjectKey, value: &Value) -> Result<()> {
        self.store.put_record(key.as_str(), value).await?;
        Ok(())
    }

    pub async fn remove(&self, key: &ObjectKey) -> Result<()> {
        self.store.remove(key.as_str()).await?;
        Ok(())
    }

    /// Items under an application prefix as `(id, value)` pairs, ordered by id.
    pub async fn by_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let start = ObjectKey::data_prefix(prefix)?;
        let records = self.store.get_records::<Value>(&start).await?;
        Ok(records
            .into_iter()
            .filter_map(|(raw, value)| {
                let key = ObjectKey::from_raw(raw);
                let (_, id) = key.as_data()?;
                Some((id.to_string(), value))
            })
            .collect())
    }

    /// Every data item.
    pub async fn all(&self) -> Result<Vec<(ObjectKey, Value)>> {
        let records = self.store.get_records::<Value>(namespace::DATA).await?;
        Ok(records
            .into_iter()
            .map(|(raw, value)| (ObjectKey::from_raw(raw), value))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_store::MemoryStore;

    #[tokio::test]
    async fn test_set_get_remove() {
        let data = DataStore::new(Arc::new(MemoryStore::new()));
        let key = ObjectKey::data("notes", "1").unwrap();

        data.set(&key, &json!({"text": "hi"})).await.unwrap();
        assert_eq!(data.get(&key).await.unwrap(), Some(json!({"text": "hi"})));

        data.remove(&key).await.unwrap();
        assert!(data.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_by_prefix_does_not_leak_across_prefixes() {
        let data = DataStore::new(Arc::new(MemoryStore::new()));
        for (prefix, id) in [("notes", "1"), ("notes", "2"), ("notesx", "1"), ("todo", "a")] {
            let key = ObjectKey::data(prefix, id).unwrap();
            data.set(&key, &json!(format!("{prefix}:{id}"))).await.unwrap();
        }

        let notes = data.by_prefix("notes").await.unwrap();
        assert_eq!(
            notes,
            vec![
                ("1".to_string(), json!("notes:1")),
                ("2".to_string(), json!("notes:2")),
            ]
        );
        assert_eq!(data.all().await.unwrap().len(), 4);
    }
}
