//! Locally observable outcomes of dispatching an operation.

use trellis_core::DeviceKey;

use crate::operation::{Operation, OperationKind};
use crate::pending::Dependency;
use crate::rejection::Rejection;

/// Published on the dispatcher's broadcast channel for every outcome.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    /// The operation changed (or confirmed) local state.
    Applied {
        sender: DeviceKey,
        kind: OperationKind,
    },
    /// The operation was parked until a dependency appears.
    Deferred {
        sender: DeviceKey,
        kind: OperationKind,
        missing: Dependency,
    },
    /// The operation was dropped by the permission gate.
    ///
    /// `kind` is `None` when the frame could not be decoded.
    Rejected {
        sender: DeviceKey,
        kind: Option<OperationKind>,
        reason: Rejection,
    },
    /// A parked operation was dropped to make room.
    Evicted {
        sender: DeviceKey,
        kind: OperationKind,
    },
}

/// What happened to an inbound operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Applied,
    Deferred,
    Rejected(Rejection),
    /// An authorized handshake message for the device to act on.
    Bootstrap(Operation),
}
