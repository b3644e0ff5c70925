//! Group records and permission triples.
//!
//! The group graph is a DAG whose leaves are devices. A composite group
//! denotes the set of devices reachable from it. Every protected object
//! carries a [`PermissionTriple`] naming the groups that may administer,
//! write, and read it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::crypto::DeviceKey;
use crate::types::GroupId;

/// Names given to groups with a structural role.
pub mod names {
    /// All devices of one identity.
    pub const LINKED: &str = "linked";
    /// Top-level groups of other identities known to this device.
    pub const CONTACTS: &str = "contacts";
    /// A group widening a data item's visibility beyond its owner.
    pub const SHARE: &str = "__share";
    /// A link in a writer privilege chain.
    pub const WRITERS: &str = "__writers";
    /// A link in an admin privilege chain.
    pub const ADMINS: &str = "__admins";
    /// Admin group attached to the groups imported from a contact.
    pub const CONTACT_ADMINS: &str = "__contact_admins";

    /// Whether a group with this name was synthesized by the permission layer.
    pub fn is_synthetic(name: &str) -> bool {
        matches!(name, SHARE | WRITERS | ADMINS | CONTACT_ADMINS)
    }
}

/// A node in the group graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Unique id. Device leaves use the device key.
    pub id: GroupId,

    /// Human-readable name.
    pub name: String,

    /// Whether this group belongs to another identity known as a contact.
    pub contact_level: bool,

    /// Groups that list this group as a child.
    pub parents: BTreeSet<GroupId>,

    /// Member groups. `None` marks a device leaf.
    pub children: Option<BTreeSet<GroupId>>,
}

impl Group {
    /// A device leaf.
    pub fn leaf(key: &DeviceKey, name: impl Into<String>) -> Self {
        Self {
            id: GroupId::for_device(key),
            name: name.into(),
            contact_level: false,
            parents: BTreeSet::new(),
            children: None,
        }
    }

    /// A composite group with the given children.
    pub fn composite(
        id: GroupId,
        name: impl Into<String>,
        children: impl IntoIterator<Item = GroupId>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            contact_level: false,
            parents: BTreeSet::new(),
            children: Some(children.into_iter().collect()),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    /// Children of a composite group; empty for a leaf.
    pub fn child_ids(&self) -> impl Iterator<Item = &GroupId> {
        self.children.iter().flatten()
    }

    pub fn has_child(&self, id: &GroupId) -> bool {
        self.children.as_ref().is_some_and(|c| c.contains(id))
    }

    /// The device this group stands for, if it is a device leaf.
    pub fn device_key(&self) -> Option<DeviceKey> {
        if self.is_leaf() {
            self.id.device_key()
        } else {
            None
        }
    }

    /// Whether this group was synthesized by the permission layer.
    pub fn is_synthetic(&self) -> bool {
        names::is_synthetic(&self.name)
    }
}

/// Privilege levels. Greater levels contain all lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Privilege {
    Read,
    Write,
    Admin,
}

impl Privilege {
    /// Name of the chain links synthesized when granting this privilege.
    pub fn chain_name(&self) -> &'static str {
        match self {
            Privilege::Read => names::SHARE,
            Privilege::Write => names::WRITERS,
            Privilege::Admin => names::ADMINS,
        }
    }
}

/// The admin/write/read group references of a protected object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionTriple {
    pub admin: GroupId,
    pub write: GroupId,
    pub read: GroupId,
}

impl PermissionTriple {
    /// A triple naming the same group for every privilege.
    pub fn uniform(group: &GroupId) -> Self {
        Self {
            admin: group.clone(),
            write: group.clone(),
            read: group.clone(),
        }
    }

    /// The group referenced for a privilege.
    pub fn get(&self, privilege: Privilege) -> &GroupId {
        match privilege {
            Privilege::Read => &self.read,
            Privilege::Write => &self.write,
            Privilege::Admin => &self.admin,
        }
    }

    /// Repoint the reference for a privilege.
    pub fn set(&mut self, privilege: Privilege, group: GroupId) {
        match privilege {
            Privilege::Read => self.read = group,
            Privilege::Write => self.write = group,
            Privilege::Admin => self.admin = group,
        }
    }

    /// Groups that confer at least the given privilege.
    pub fn holders(&self, privilege: Privilege) -> Vec<&GroupId> {
        match privilege {
            Privilege::Admin => vec![&self.admin],
            Privilege::Write => vec![&self.write, &self.admin],
            Privilege::Read => vec![&self.read, &self.write, &self.admin],
        }
    }

    /// Every distinct group referenced by the triple.
    pub fn groups(&self) -> BTreeSet<&GroupId> {
        [&self.admin, &self.write, &self.read].into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[test]
    fn test_leaf_has_no_children() {
        let key = Keypair::generate().device_key();
        let leaf = Group::leaf(&key, "phone");
        assert!(leaf.is_leaf());
        assert_eq!(leaf.child_ids().count(), 0);
        assert_eq!(leaf.device_key(), Some(key));
    }

    #[test]
    fn test_empty_composite_is_not_a_leaf() {
        let group = Group::composite(GroupId::random(), "contacts", []);
        assert!(!group.is_leaf());
        assert_eq!(group.device_key(), None);
    }

    #[test]
    fn test_privilege_ordering() {
        assert!(Privilege::Admin > Privilege::Write);
        assert!(Privilege::Write > Privilege::Read);
    }

    #[test]
    fn test_holders_follow_implication() {
        let triple = PermissionTriple {
            admin: GroupId::new("a"),
            write: GroupId::new("w"),
            read: GroupId::new("r"),
        };
        assert_eq!(triple.holders(Privilege::Admin).len(), 1);
        assert_eq!(triple.holders(Privilege::Write).len(), 2);
        assert_eq!(triple.holders(Privilege::Read).len(), 3);
    }

    #[test]
    fn test_synthetic_names() {
        assert!(names::is_synthetic(names::SHARE));
        assert!(names::is_synthetic(names::WRITERS));
        assert!(!names::is_synthetic(names::LINKED));
    }
}
