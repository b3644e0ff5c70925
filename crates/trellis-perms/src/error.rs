//! Error types for the permissions module.

use thiserror::Error;
use trellis_core::{GroupId, ObjectKey, Privilege};

/// Errors that can occur during group and permission operations.
#[derive(Debug, Error)]
pub enum PermsError {
    /// Referenced group does not exist locally.
    #[error("group not found: {0}")]
    GroupNotFound(GroupId),

    /// Attempt to give children to a device leaf.
    #[error("group is a device leaf: {0}")]
    LeafGroup(GroupId),

    /// The edge would close a cycle, or resolution met one.
    #[error("group graph cycle through {0}")]
    Cycle(GroupId),

    /// Object has no permission triple.
    #[error("no permissions recorded for {0}")]
    NoPermissions(ObjectKey),

    /// Privilege level not valid for the requested operation.
    #[error("invalid privilege for this operation: {0:?}")]
    InvalidPrivilege(Privilege),

    /// Storage error.
    #[error("store error: {0}")]
    Store(#[from] trellis_store::StoreError),

    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] trellis_core::CoreError),
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;
