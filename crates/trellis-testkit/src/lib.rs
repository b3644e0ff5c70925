//! # Trellis Testkit
//!
//! Testing utilities for Trellis.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a [`Cluster`] of named devices on one in-memory network,
//!   with a delivery pump that runs until every inbox is empty
//! - **Wire vectors**: known operations with their exact encoded bytes
//! - **Generators**: Proptest strategies for keys, group graphs, and operations
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use trellis_testkit::Cluster;
//!
//! async fn example() -> anyhow::Result<()> {
//!     let mut cluster = Cluster::new();
//!     cluster.add_initialized("alice").await?;
//!     cluster.add("alice-phone").await;
//!     cluster.link("alice-phone", "alice").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Wire Vectors
//!
//! ```rust
//! use trellis_testkit::vectors::verify_all_vectors;
//!
//! assert!(verify_all_vectors().is_empty());
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use trellis_testkit::generators::operation;
//!
//! proptest! {
//!     #[test]
//!     fn decoding_never_panics(op in operation()) {
//!         let bytes = op.to_bytes().unwrap();
//!         let _ = trellis_sync::Operation::from_bytes(&bytes[1..]);
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{init_tracing, seeded_key, Cluster, Delivery, MemoryDevice};
pub use generators::{group_dag, operation, GroupDag};
pub use vectors::{all_vectors, verify_all_vectors, WireVector};
