//! # Trellis Sync
//!
//! Replicated operations and the permission gate every one of them passes.
//!
//! ## Overview
//!
//! Devices never share state directly. They exchange [`Operation`]s over an
//! encrypted [`Transport`], and each receiver decides on its own, from its
//! own state, whether the sender was entitled to make the change. There is
//! no coordinator and no acknowledgement.
//!
//! ## Key Properties
//!
//! - **Default deny**: unknown or malformed frames are rejected and logged
//! - **Idempotent**: every apply is a set-based edit or an overwrite
//! - **Order tolerant**: operations whose dependencies have not arrived yet
//!   are parked and retried, not dropped
//! - **Silent rejections**: nothing is sent back to a rejected sender
//!
//! ## Dispatch
//!
//! ```text
//! frame ─> decode ─> well-formed? ─> dependencies? ─> authorize ─> apply
//!             │            │               │              │
//!          Rejected     Rejected        Deferred       Rejected
//! ```
//!
//! Handshake messages (link and contact requests and confirmations) stop
//! after authorization and are returned as [`Disposition::Bootstrap`] for
//! the device to act on.

pub mod dispatch;
pub mod error;
pub mod events;
pub mod operation;
pub mod pending;
pub mod rejection;
pub mod transport;

pub use dispatch::{Dispatcher, DispatcherConfig, Validator};
pub use error::{Result, SyncError};
pub use events::{DispatchEvent, Disposition};
pub use operation::{limits, Operation, OperationKind, Snapshot};
pub use pending::{Deferred, Dependency, PendingQueue};
pub use rejection::Rejection;
pub use transport::{memory::Frame, memory::MemoryNetwork, memory::MemoryTransport, Transport};
