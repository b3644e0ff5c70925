//! # Trellis
//!
//! The application-facing API for Trellis: multi-device identities,
//! contacts, and data items guarded by group-based permissions.
//!
//! ## Overview
//!
//! Each participant is a [`Device`]. Devices of the same person form an
//! identity (their LINKED group); other people's identities are imported as
//! contacts. Every data item carries a permission triple naming the groups
//! that may administer, write, and read it.
//!
//! - **Identity**: create a device, link further devices to it, delete them
//! - **Contacts**: exchange LINKED subtrees after both sides confirm
//! - **Data**: set, read, and remove items under a `prefix/id` key
//! - **Sharing**: widen or narrow who may read, write, or administer an item
//!
//! ## Key Concepts
//!
//! - **Originator applies**: a call applies its own operations through the
//!   same permission gate as remote ones, then sends them
//! - **Local decisions**: receivers authorize against their own state only
//! - **No replies to rejections**: a refused operation is logged and dropped
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use trellis::{AutoConfirm, Device, DeviceConfig};
//! use trellis::core::Keypair;
//! use trellis::store::SqliteStore;
//! use trellis::sync::MemoryNetwork;
//!
//! async fn example() {
//!     let network = MemoryNetwork::new();
//!     let transport = network.create_transport(Keypair::generate().device_key()).await;
//!     let store = SqliteStore::open("device.db").unwrap();
//!
//!     let device = Device::new(
//!         Arc::new(store),
//!         Arc::new(transport),
//!         Arc::new(AutoConfirm::accept()),
//!         DeviceConfig::default().with_device_name("laptop"),
//!     );
//!     device.create_device().await.unwrap();
//!     device
//!         .set_data("notes", "1", serde_json::json!({"text": "hi"}))
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `trellis::core` - Keys, group records, permission triples, encoding
//! - `trellis::store` - Key-value storage, in memory and SQLite
//! - `trellis::perms` - Group graph, permission triples, data items
//! - `trellis::sync` - Operations, dispatch, and transports

pub mod config;
pub mod confirm;
mod contacts;
pub mod device;
pub mod error;
mod linking;
mod outbox;
mod sharing;

// Re-export component crates
pub use trellis_core as core;
pub use trellis_perms as perms;
pub use trellis_store as store;
pub use trellis_sync as sync;

// Re-export main types for convenience
pub use config::DeviceConfig;
pub use confirm::{AutoConfirm, Confirm};
pub use device::{Device, GarbageReport};
pub use error::{DeviceError, Result};

// Re-export commonly used types
pub use trellis_core::{DeviceKey, GroupId, Keypair, ObjectKey, PermissionTriple, Privilege};
pub use trellis_sync::{DispatchEvent, Disposition, Operation, Rejection};
