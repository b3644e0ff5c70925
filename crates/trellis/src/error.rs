//! Error types for the device API.

use thiserror::Error;
use trellis_core::{CoreError, DeviceKey, GroupId, ObjectKey};
use trellis_perms::PermsError;
use trellis_store::StoreError;
use trellis_sync::{Rejection, SyncError};

/// Errors returned to the application by [`Device`](crate::Device) calls.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// A local permission check or validator refused the call.
    #[error("rejected: {0}")]
    Rejected(#[from] Rejection),

    /// The device has no identity yet.
    #[error("device not initialized")]
    NotInitialized,

    /// The item's sharing group does not contain the group.
    #[error("{0} is not shared with {1}")]
    NotShared(ObjectKey, GroupId),

    /// Group not known to this device.
    #[error("unknown group: {0}")]
    UnknownGroup(GroupId),

    /// Data item not known to this device.
    #[error("not found: {0}")]
    NotFound(ObjectKey),

    /// Device is not part of this identity.
    #[error("device {0} is not linked")]
    NotLinked(DeviceKey),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("sync error: {0}")]
    Sync(SyncError),

    #[error("permission state error: {0}")]
    Perms(#[from] PermsError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl From<SyncError> for DeviceError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Rejected(reason) => DeviceError::Rejected(reason),
            SyncError::PermsError(e) => DeviceError::Perms(e),
            SyncError::StoreError(e) => DeviceError::Store(e),
            other => DeviceError::Sync(other),
        }
    }
}

/// Result type for device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;
