//! Error types for the sync module.

use thiserror::Error;

use crate::pending::Dependency;
use crate::rejection::Rejection;

/// Errors that can occur while dispatching or transporting operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The permission gate refused the operation.
    #[error("rejected: {0}")]
    Rejected(#[from] Rejection),

    /// A locally originated operation references state that does not exist.
    #[error("missing dependency: {0}")]
    MissingDependency(Dependency),

    /// Transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Group or permission state error.
    #[error("permission state error: {0}")]
    PermsError(#[from] trellis_perms::PermsError),

    /// Store operation failed.
    #[error("store error: {0}")]
    StoreError(#[from] trellis_store::StoreError),

    /// Encoding failed.
    #[error("core error: {0}")]
    CoreError(#[from] trellis_core::CoreError),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
