//! Why an operation was not applied.
//!
//! Rejections are local diagnostics. They are logged and published as
//! events, and never sent back to the operation's sender.

use thiserror::Error;
use trellis_core::{GroupId, ObjectKey};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// The operation's tag is not one this device knows.
    #[error("unknown operation type: {0}")]
    UnknownOperationType(String),

    /// The sender lacks the standing the operation requires.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The application validator refused the payload, or the change
    /// would break a structural invariant of the group graph.
    #[error("data invariant violated: {0}")]
    DataInvariantViolated(String),

    /// A device tried to become a contact of its own identity.
    #[error("cannot add own identity as a contact")]
    SelfContactRejected,

    /// Write (or, for triple changes, admin) check failed on a data item.
    #[error("insufficient permissions on data item {0}")]
    InsufficientDataPermissions(ObjectKey),

    /// Admin check failed on a group.
    #[error("insufficient permissions on group {0}")]
    InsufficientGroupPermissions(GroupId),

    /// The frame could not be decoded or exceeds wire limits.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A reply arrived after the request it answers timed out.
    #[error("expired: {0}")]
    Expired(String),
}
