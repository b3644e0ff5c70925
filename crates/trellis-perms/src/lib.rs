//! # Trellis Permissions
//!
//! The group graph and the permission triples that hang off it.
//!
//! ## Overview
//!
//! Access control is expressed as group membership. Every protected object,
//! whether a group or a data item, carries a [`PermissionTriple`] naming an
//! admin, a write, and a read group. A device holds a privilege when the
//! referenced group resolves to a set containing its key.
//!
//! ## Key Concepts
//!
//! - **GroupStore**: the DAG of device leaves and composite groups, with resolution
//! - **PermissionStore**: triples per object, grants, revocations, and privilege checks
//! - **DataStore**: application values under `__data/<prefix>/<id>/`
//! - **IdentityStore**: this device's identity and the pending-link marker
//!
//! ## Grant Model
//!
//! Readers are an open list: a grant appends to the read group in place.
//! Writers and admins form a versioned chain: each grant wraps the current
//! group in a new link `[previous] ++ members`, so a grant never reaches back
//! into a group the grantee does not control. Chains can be flattened with
//! [`PermissionStore::compact_chain`] when the history is no longer wanted.
//!
//! [`PermissionTriple`]: trellis_core::PermissionTriple

pub mod data;
pub mod error;
pub mod gc;
pub mod group;
pub mod identity;
pub mod permission;

pub use data::DataStore;
pub use error::{PermsError, Result};
pub use group::{rename_in_subtree, GroupStore};
pub use identity::{now_millis, Identity, IdentityStore, PendingLink};
pub use permission::{ChainLink, PermissionStore};
