//! Strong type definitions for Trellis.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::DeviceKey;
use crate::error::CoreError;

/// Key prefixes under which state lives in the key-value store.
pub mod namespace {
    /// Group records: `__group/<id>/`.
    pub const GROUP: &str = "__group/";
    /// Permission triples: `__perm/<object key>`.
    pub const PERM: &str = "__perm/";
    /// Application data: `__data/<prefix>/<id>/`.
    pub const DATA: &str = "__data/";
    /// Local device metadata.
    pub const META: &str = "__meta/";
}

/// Identifier of a node in the group graph.
///
/// Device leaves use the hex-encoded device key; every other group uses a
/// random 128-bit value.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    /// Wrap an existing id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate a fresh random id.
    pub fn random() -> Self {
        let bytes: [u8; 16] = rand::thread_rng().gen();
        Self(hex::encode(bytes))
    }

    /// The id of a device's leaf group.
    pub fn for_device(key: &DeviceKey) -> Self {
        Self(key.to_hex())
    }

    /// Interpret this id as a device key, if it is one.
    pub fn device_key(&self) -> Option<DeviceKey> {
        DeviceKey::from_hex(&self.0).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.0.chars().take(12).collect();
        write!(f, "GroupId({short})")
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&DeviceKey> for GroupId {
    fn from(key: &DeviceKey) -> Self {
        Self::for_device(key)
    }
}

/// Key of a protected object: either a group or a data item.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// The object key of a group.
    pub fn group(id: &GroupId) -> Self {
        Self(format!("{}{}/", namespace::GROUP, id))
    }

    /// The object key of a data item.
    pub fn data(prefix: &str, id: &str) -> Result<Self, CoreError> {
        validate_segment(prefix)?;
        validate_segment(id)?;
        Ok(Self(format!("{}{prefix}/{id}/", namespace::DATA)))
    }

    /// The key prefix shared by all data items under an application prefix.
    pub fn data_prefix(prefix: &str) -> Result<String, CoreError> {
        validate_segment(prefix)?;
        Ok(format!("{}{prefix}/", namespace::DATA))
    }

    /// Rebuild from a raw stored key.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The group this key protects, if it is a group key.
    pub fn as_group(&self) -> Option<GroupId> {
        self.0
            .strip_prefix(namespace::GROUP)
            .and_then(|rest| rest.strip_suffix('/'))
            .map(GroupId::new)
    }

    /// The `(prefix, id)` pair of a data key.
    pub fn as_data(&self) -> Option<(&str, &str)> {
        self.0
            .strip_prefix(namespace::DATA)
            .and_then(|rest| rest.strip_suffix('/'))
            .and_then(|rest| rest.split_once('/'))
    }

    pub fn is_data(&self) -> bool {
        self.0.starts_with(namespace::DATA)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({})", self.0)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_segment(segment: &str) -> Result<(), CoreError> {
    if segment.is_empty() || segment.contains('/') {
        return Err(CoreError::InvalidObjectKey(format!(
            "segment must be non-empty and contain no '/': {segment:?}"
        )));
    }
    Ok(())
}
