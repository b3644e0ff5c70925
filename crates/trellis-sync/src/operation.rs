//! Replicated operations.
//!
//! An [`Operation`] is the only thing devices ever send each other. Each
//! variant carries exactly the fields its receiver needs to authorize and
//! apply it against local state. On the wire it is CBOR, externally tagged
//! by variant name.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use trellis_core::{to_cbor, CoreError, DeviceKey, Group, GroupId, ObjectKey, PermissionTriple};

use crate::rejection::Rejection;

/// Wire size limits.
pub mod limits {
    /// Max encoded size of a single frame.
    pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;
    /// Max groups in a request or contact subtree.
    pub const MAX_SUBTREE_GROUPS: usize = 1024;
    /// Max groups in a link snapshot.
    pub const MAX_SNAPSHOT_GROUPS: usize = 65_536;
    /// Max permission triples in a link snapshot.
    pub const MAX_SNAPSHOT_PERMISSIONS: usize = 131_072;
    /// Max data items in a link snapshot.
    pub const MAX_SNAPSHOT_DATA: usize = 65_536;
    /// Max members in a single grant.
    pub const MAX_GRANT_MEMBERS: usize = 256;
}

/// Full local state handed to a device joining a linked identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The identity's LINKED group.
    pub linked: GroupId,
    /// The identity's CONTACTS group.
    pub contacts: GroupId,
    pub groups: Vec<Group>,
    pub permissions: Vec<(ObjectKey, PermissionTriple)>,
    pub data: Vec<(ObjectKey, Value)>,
}

/// The closed set of replicated operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// A fresh device asks to join the receiver's identity.
    RequestUpdateLinked {
        /// The joiner's temporary LINKED id, renamed by the receiver.
        temp_name: GroupId,
        src_key: DeviceKey,
        subtree: Vec<Group>,
    },

    /// The full state of the identity the joiner was admitted to.
    ConfirmUpdateLinked { snapshot: Snapshot },

    /// Ask the receiver's identity to become a contact.
    RequestContact {
        req_key: DeviceKey,
        /// The requester's LINKED id.
        req_name: GroupId,
        subtree: Vec<Group>,
    },

    /// Accept a contact request, carrying the acceptor's own subtree.
    ConfirmContact { name: GroupId, subtree: Vec<Group> },

    /// Add `child` under `parent`, maintaining both edge directions.
    LinkGroups { parent: GroupId, child: GroupId },

    AddParent { group: GroupId, parent: GroupId },

    AddChild { group: GroupId, child: GroupId },

    /// Extend the writer chain of an object with a link chosen by the sender.
    AddWriter {
        key: ObjectKey,
        chain: GroupId,
        previous: GroupId,
        members: Vec<GroupId>,
    },

    /// Extend the admin chain of an object with a link chosen by the sender.
    AddAdmin {
        key: ObjectKey,
        chain: GroupId,
        previous: GroupId,
        members: Vec<GroupId>,
    },

    RemoveParent { group: GroupId, parent: GroupId },

    RemoveWriter { key: ObjectKey, member: GroupId },

    RemoveAdmin { key: ObjectKey, member: GroupId },

    /// Create or merge a group record.
    ///
    /// The triple is used only when the receiver has none for the group.
    UpdateGroup {
        group: Group,
        permissions: Option<PermissionTriple>,
    },

    /// Create or overwrite a data item, optionally replacing its triple.
    UpdateData {
        key: ObjectKey,
        value: Value,
        permissions: Option<PermissionTriple>,
    },

    DeleteDevice { device: DeviceKey },

    DeleteGroup { group: GroupId },

    DeleteData { key: ObjectKey },
}

/// Discriminant of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    RequestUpdateLinked,
    ConfirmUpdateLinked,
    RequestContact,
    ConfirmContact,
    LinkGroups,
    AddParent,
    AddChild,
    AddWriter,
    AddAdmin,
    RemoveParent,
    RemoveWriter,
    RemoveAdmin,
    UpdateGroup,
    UpdateData,
    DeleteDevice,
    DeleteGroup,
    DeleteData,
}

impl OperationKind {
    pub const ALL: [OperationKind; 17] = [
        OperationKind::RequestUpdateLinked,
        OperationKind::ConfirmUpdateLinked,
        OperationKind::RequestContact,
        OperationKind::ConfirmContact,
        OperationKind::LinkGroups,
        OperationKind::AddParent,
        OperationKind::AddChild,
        OperationKind::AddWriter,
        OperationKind::AddAdmin,
        OperationKind::RemoveParent,
        OperationKind::RemoveWriter,
        OperationKind::RemoveAdmin,
        OperationKind::UpdateGroup,
        OperationKind::UpdateData,
        OperationKind::DeleteDevice,
        OperationKind::DeleteGroup,
        OperationKind::DeleteData,
    ];

    /// The wire tag of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::RequestUpdateLinked => "RequestUpdateLinked",
            OperationKind::ConfirmUpdateLinked => "ConfirmUpdateLinked",
            OperationKind::RequestContact => "RequestContact",
            OperationKind::ConfirmContact => "ConfirmContact",
            OperationKind::LinkGroups => "LinkGroups",
            OperationKind::AddParent => "AddParent",
            OperationKind::AddChild => "AddChild",
            OperationKind::AddWriter => "AddWriter",
            OperationKind::AddAdmin => "AddAdmin",
            OperationKind::RemoveParent => "RemoveParent",
            OperationKind::RemoveWriter => "RemoveWriter",
            OperationKind::RemoveAdmin => "RemoveAdmin",
            OperationKind::UpdateGroup => "UpdateGroup",
            OperationKind::UpdateData => "UpdateData",
            OperationKind::DeleteDevice => "DeleteDevice",
            OperationKind::DeleteGroup => "DeleteGroup",
            OperationKind::DeleteData => "DeleteData",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Handshake messages whose handling belongs to the device, not the
    /// state machine.
    pub fn is_bootstrap(&self) -> bool {
        matches!(
            self,
            OperationKind::RequestUpdateLinked
                | OperationKind::ConfirmUpdateLinked
                | OperationKind::RequestContact
                | OperationKind::ConfirmContact
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::RequestUpdateLinked { .. } => OperationKind::RequestUpdateLinked,
            Operation::ConfirmUpdateLinked { .. } => OperationKind::ConfirmUpdateLinked,
            Operation::RequestContact { .. } => OperationKind::RequestContact,
            Operation::ConfirmContact { .. } => OperationKind::ConfirmContact,
            Operation::LinkGroups { .. } => OperationKind::LinkGroups,
            Operation::AddParent { .. } => OperationKind::AddParent,
            Operation::AddChild { .. } => OperationKind::AddChild,
            Operation::AddWriter { .. } => OperationKind::AddWriter,
            Operation::AddAdmin { .. } => OperationKind::AddAdmin,
            Operation::RemoveParent { .. } => OperationKind::RemoveParent,
            Operation::RemoveWriter { .. } => OperationKind::RemoveWriter,
            Operation::RemoveAdmin { .. } => OperationKind::RemoveAdmin,
            Operation::UpdateGroup { .. } => OperationKind::UpdateGroup,
            Operation::UpdateData { .. } => OperationKind::UpdateData,
            Operation::DeleteDevice { .. } => OperationKind::DeleteDevice,
            Operation::DeleteGroup { .. } => OperationKind::DeleteGroup,
            Operation::DeleteData { .. } => OperationKind::DeleteData,
        }
    }

    pub fn is_bootstrap(&self) -> bool {
        self.kind().is_bootstrap()
    }

    /// Check if this operation respects size limits.
    pub fn validate_limits(&self) -> Result<(), &'static str> {
        match self {
            Operation::RequestUpdateLinked { subtree, .. }
            | Operation::RequestContact { subtree, .. }
            | Operation::ConfirmContact { subtree, .. } => {
                if subtree.len() > limits::MAX_SUBTREE_GROUPS {
                    return Err("too many groups in subtree");
                }
            }
            Operation::ConfirmUpdateLinked { snapshot } => {
                if snapshot.groups.len() > limits::MAX_SNAPSHOT_GROUPS {
                    return Err("too many groups in snapshot");
                }
                if snapshot.permissions.len() > limits::MAX_SNAPSHOT_PERMISSIONS {
                    return Err("too many permissions in snapshot");
                }
                if snapshot.data.len() > limits::MAX_SNAPSHOT_DATA {
                    return Err("too many data items in snapshot");
                }
            }
            Operation::AddWriter { members, .. } | Operation::AddAdmin { members, .. } => {
                if members.len() > limits::MAX_GRANT_MEMBERS {
                    return Err("too many members in grant");
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Encode for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        to_cbor(self)
    }

    /// Decode a frame received from a peer.
    ///
    /// A well-formed frame whose tag is not a known operation is an
    /// [`Rejection::UnknownOperationType`]; anything else that fails to
    /// decode or exceeds the wire limits is [`Rejection::InvalidMessage`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Rejection> {
        use ciborium::value::Value as Cbor;

        if bytes.len() > limits::MAX_FRAME_BYTES {
            return Err(Rejection::InvalidMessage(format!(
                "frame of {} bytes exceeds limit",
                bytes.len()
            )));
        }

        let raw: Cbor = ciborium::from_reader(bytes)
            .map_err(|e| Rejection::InvalidMessage(e.to_string()))?;
        let tag = match &raw {
            Cbor::Map(entries) if entries.len() == 1 => match &entries[0].0 {
                Cbor::Text(tag) => tag.clone(),
                _ => return Err(Rejection::InvalidMessage("operation tag is not text".into())),
            },
            Cbor::Text(tag) => tag.clone(),
            _ => return Err(Rejection::InvalidMessage("frame is not a tagged operation".into())),
        };
        if OperationKind::from_name(&tag).is_none() {
            return Err(Rejection::UnknownOperationType(tag));
        }

        let operation: Operation = ciborium::from_reader(bytes)
            .map_err(|e| Rejection::InvalidMessage(e.to_string()))?;
        operation
            .validate_limits()
            .map_err(|e| Rejection::InvalidMessage(e.to_string()))?;
        Ok(operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_core::Keypair;

    #[test]
    fn test_kind_names_are_wire_tags() {
        let op = Operation::DeleteGroup {
            group: GroupId::new("g"),
        };
        let bytes = op.to_bytes().unwrap();
        let raw: ciborium::value::Value = ciborium::from_reader(bytes.as_slice()).unwrap();
        let map = raw.as_map().unwrap();
        assert_eq!(map[0].0.as_text(), Some(OperationKind::DeleteGroup.as_str()));

        for kind in OperationKind::ALL {
            assert_eq!(OperationKind::from_name(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_update_data_survives_the_wire() {
        let op = Operation::UpdateData {
            key: ObjectKey::data("notes", "1").unwrap(),
            value: json!({"text": "hi", "n": 3, "tags": ["a", "b"]}),
            permissions: Some(PermissionTriple::uniform(&GroupId::new("linked"))),
        };
        let decoded = Operation::from_bytes(&op.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn test_unknown_tag_is_denied() {
        let mut bytes = Vec::new();
        let forged = std::collections::BTreeMap::from([("GrantEverything", ("x", 1))]);
        ciborium::into_writer(&forged, &mut bytes).unwrap();

        assert_eq!(
            Operation::from_bytes(&bytes),
            Err(Rejection::UnknownOperationType("GrantEverything".into()))
        );
    }

    #[test]
    fn test_malformed_frames_are_invalid() {
        assert!(matches!(
            Operation::from_bytes(&[0xff, 0x01]),
            Err(Rejection::InvalidMessage(_))
        ));

        // Known tag with the wrong body
        let mut bytes = Vec::new();
        let forged = std::collections::BTreeMap::from([("DeleteGroup", 42u32)]);
        ciborium::into_writer(&forged, &mut bytes).unwrap();
        assert!(matches!(
            Operation::from_bytes(&bytes),
            Err(Rejection::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_oversized_grant_is_invalid() {
        let op = Operation::AddWriter {
            key: ObjectKey::data("notes", "1").unwrap(),
            chain: GroupId::random(),
            previous: GroupId::random(),
            members: (0..=limits::MAX_GRANT_MEMBERS).map(|_| GroupId::random()).collect(),
        };
        assert!(op.validate_limits().is_err());
        assert!(matches!(
            Operation::from_bytes(&op.to_bytes().unwrap()),
            Err(Rejection::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_bootstrap_kinds() {
        let key = Keypair::generate().device_key();
        let op = Operation::RequestContact {
            req_key: key,
            req_name: GroupId::random(),
            subtree: vec![Group::leaf(&key, "phone")],
        };
        assert!(op.is_bootstrap());
        assert!(!Operation::DeleteDevice { device: key }.is_bootstrap());
        assert_eq!(
            OperationKind::ALL.iter().filter(|k| k.is_bootstrap()).count(),
            4
        );
    }
    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn group_id() -> impl Strategy<Value = GroupId> {
            "[^/]{1,24}".prop_map(GroupId::new)
        }

        fn group_edit() -> impl Strategy<Value = Operation> {
            prop_oneof![
                (group_id(), group_id())
                    .prop_map(|(group, child)| Operation::AddChild { group, child }),
                (group_id(), group_id())
                    .prop_map(|(group, parent)| Operation::AddParent { group, parent }),
                (group_id(), group_id())
                    .prop_map(|(group, parent)| Operation::RemoveParent { group, parent }),
                (group_id(), group_id())
                    .prop_map(|(parent, child)| Operation::LinkGroups { parent, child }),
                group_id().prop_map(|group| Operation::DeleteGroup { group }),
            ]
        }

        proptest! {
            #[test]
            fn test_arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
                let _ = Operation::from_bytes(&bytes);
            }

            #[test]
            fn test_group_edits_decode_to_themselves(op in group_edit()) {
                let decoded = Operation::from_bytes(&op.to_bytes().unwrap()).unwrap();
                prop_assert_eq!(decoded, op);
            }

            #[test]
            fn test_data_writes_decode_to_themselves(
                prefix in "[a-z]{1,8}",
                id in "[^/]{1,16}",
                text in ".{0,32}",
                n in any::<i64>(),
                owner in proptest::option::of(group_id()),
            ) {
                let op = Operation::UpdateData {
                    key: ObjectKey::data(&prefix, &id).unwrap(),
                    value: json!({"text": text, "n": n}),
                    permissions: owner.as_ref().map(PermissionTriple::uniform),
                };
                let decoded = Operation::from_bytes(&op.to_bytes().unwrap()).unwrap();
                prop_assert_eq!(decoded, op);
            }
        }
    }
}
