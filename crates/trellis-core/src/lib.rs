//! # Trellis Core
//!
//! Pure primitives for Trellis: device identities, group records, permission
//! triples, and the key namespaces they are persisted under.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`DeviceKey`] - A device's public key; also the id of its leaf group
//! - [`GroupId`] - Identifier of a node in the group graph
//! - [`ObjectKey`] - Key of a protected object (a group or a data item)
//! - [`Group`] - A node in the group graph (device leaf or composite)
//! - [`PermissionTriple`] - The admin/write/read group references of an object
//!
//! ## Encoding
//!
//! Records are persisted and sent over the wire as CBOR. See [`encoding`].

pub mod crypto;
pub mod encoding;
pub mod error;
pub mod group;
pub mod types;

pub use crypto::{DeviceKey, Keypair};
pub use encoding::{from_cbor, to_cbor};
pub use error::CoreError;
pub use group::{names, Group, PermissionTriple, Privilege};
pub use types::{namespace, GroupId, ObjectKey};
