//! Store trait definition.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use trellis_core::{from_cbor, to_cbor};

use crate::error::Result;

/// A flat, ordered key-value store.
///
/// Keys are UTF-8 strings; values are opaque bytes. Implementations must be
/// safe to share between tasks.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a single value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite a value.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Delete a value. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, sorted by key.
    async fn get_many(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Delete every entry.
    async fn clear(&self) -> Result<()>;
}

/// Typed CBOR records on top of a [`KvStore`].
pub trait StoreExt: KvStore {
    /// Fetch and decode a record.
    fn get_record<T>(&self, key: &str) -> impl std::future::Future<Output = Result<Option<T>>> + Send
    where
        T: DeserializeOwned + Send;

    /// Encode and store a record.
    fn put_record<T>(&self, key: &str, value: &T) -> impl std::future::Future<Output = Result<()>> + Send
    where
        T: Serialize + Sync;

    /// Fetch and decode every record under a prefix.
    fn get_records<T>(
        &self,
        prefix: &str,
    ) -> impl std::future::Future<Output = Result<Vec<(String, T)>>> + Send
    where
        T: DeserializeOwned + Send;
}

impl<S: KvStore + ?Sized> StoreExt for S {
    async fn get_record<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(from_cbor(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_record<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let bytes = to_cbor(value)?;
        self.set(key, bytes).await
    }

    async fn get_records<T>(&self, prefix: &str) -> Result<Vec<(String, T)>>
    where
        T: DeserializeOwned + Send,
    {
        let entries = self.get_many(prefix).await?;
        entries
            .into_iter()
            .map(|(key, bytes)| Ok((key, from_cbor(&bytes)?)))
            .collect()
    }
}
