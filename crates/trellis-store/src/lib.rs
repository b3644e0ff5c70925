//! # Trellis Store
//!
//! Key-value persistence for Trellis. Every device keeps its group graph,
//! permission triples, application data, and local metadata in a single
//! [`KvStore`], namespaced by key prefix.
//!
//! ## Key Types
//!
//! - [`KvStore`] - The async trait for all storage operations
//! - [`StoreExt`] - Typed CBOR record helpers on top of any [`KvStore`]
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use trellis_store::{KvStore, SqliteStore, StoreExt};
//!
//! async fn example() {
//!     // Open a SQLite database
//!     let store = SqliteStore::open("device.db").unwrap();
//!
//!     // Or use an in-memory database for testing
//!     let store = SqliteStore::open_memory().unwrap();
//!
//!     store.put_record("__meta/answer", &42u32).await.unwrap();
//!     let answer: Option<u32> = store.get_record("__meta/answer").await.unwrap();
//!     assert_eq!(answer, Some(42));
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Prefix scans**: `get_many` returns every entry under a key prefix, sorted by key
//! - **Opaque values**: the store never interprets values; records are CBOR by convention

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{KvStore, StoreExt};
