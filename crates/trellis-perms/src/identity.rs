//! Local identity and pending-link state.
//!
//! None of this is replicated. The identity names this device and the two
//! structural groups it was initialised with; the pending-link marker names
//! the one device whose link confirmation will be accepted.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use trellis_core::{namespace, DeviceKey, GroupId};
use trellis_store::{KvStore, StoreExt};

use crate::error::Result;

fn identity_key() -> String {
    format!("{}identity", namespace::META)
}

fn pending_link_key() -> String {
    format!("{}pending_link", namespace::META)
}

fn pending_contact_prefix() -> String {
    format!("{}pending_contact/", namespace::META)
}

fn pending_contact_key(key: &DeviceKey) -> String {
    format!("{}{}", pending_contact_prefix(), key.to_hex())
}

/// Current time in Unix milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// This device's place in the group graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// This device's key.
    pub device: DeviceKey,
    /// The LINKED group of the identity this device belongs to.
    pub linked: GroupId,
    /// The CONTACTS group of that identity.
    pub contacts: GroupId,
}

/// An outstanding request to join another device's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingLink {
    /// The device asked to link us.
    pub key: DeviceKey,
    /// When the request was sent (Unix ms).
    pub requested_at: i64,
}

impl PendingLink {
    pub fn new(key: DeviceKey) -> Self {
        Self {
            key,
            requested_at: now_millis(),
        }
    }

    /// Whether the request has outlived its timeout.
    pub fn is_expired(&self, now: i64, timeout: Duration) -> bool {
        now.saturating_sub(self.requested_at) > timeout.as_millis() as i64
    }
}

pub struct IdentityStore<S> {
    store: Arc<S>,
}

impl<S> Clone for IdentityStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: KvStore> IdentityStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn identity(&self) -> Result<Option<Identity>> {
        Ok(self.store.get_record(&identity_key()).await?)
    }

    pub async fn set_identity(&self, identity: &Identity) -> Result<()> {
        self.store.put_record(&identity_key(), identity).await?;
        Ok(())
    }

    pub async fn pending_link(&self) -> Result<Option<PendingLink>> {
        Ok(self.store.get_record(&pending_link_key()).await?)
    }

    pub async fn set_pending_link(&self, pending: &PendingLink) -> Result<()> {
        self.store.put_record(&pending_link_key(), pending).await?;
        Ok(())
    }

    pub async fn clear_pending_link(&self) -> Result<()> {
        self.store.remove(&pending_link_key()).await?;
        Ok(())
    }

    /// Remember that we asked a device to become a contact.
    pub async fn add_pending_contact(&self, key: &DeviceKey) -> Result<()> {
        self.store
            .put_record(&pending_contact_key(key), &now_millis())
            .await?;
        Ok(())
    }

    /// Consume the marker for a device, returning whether it was set.
    pub async fn take_pending_contact(&self, key: &DeviceKey) -> Result<bool> {
        let slot = pending_contact_key(key);
        if self.store.get(&slot).await?.is_none() {
            return Ok(false);
        }
        self.store.remove(&slot).await?;
        Ok(true)
    }

    /// Devices we have asked to become contacts and not heard back from.
    pub async fn pending_contacts(&self) -> Result<Vec<DeviceKey>> {
        let prefix = pending_contact_prefix();
        let mut keys = Vec::new();
        for (slot, _) in self.store.get_many(&prefix).await? {
            let hex = slot.strip_prefix(prefix.as_str()).unwrap_or(&slot);
            keys.push(DeviceKey::from_hex(hex)?);
        }
        Ok(keys)
    }

    /// Wipe every namespace: groups, triples, data, and metadata.
    pub async fn clear_all(&self) -> Result<()> {
        self.store.clear().await?;
        tracing::info!("cleared all local state");
        Ok(())
    }
}
