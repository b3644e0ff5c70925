//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::{json, Map, Value};

use trellis_core::{DeviceKey, Group, GroupId, Keypair, ObjectKey, PermissionTriple};
use trellis_sync::Operation;

/// Generate a random device key.
pub fn device_key() -> impl Strategy<Value = DeviceKey> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed).device_key())
}

/// Generate a group id in the same alphabet as random ids.
pub fn group_id() -> impl Strategy<Value = GroupId> {
    "[0-9a-f]{8,32}".prop_map(GroupId::new)
}

/// Generate a valid data key.
pub fn data_key() -> impl Strategy<Value = ObjectKey> {
    ("[a-z][a-z0-9_-]{0,15}", "[a-zA-Z0-9_-]{1,16}")
        .prop_filter_map("valid data key", |(prefix, id)| ObjectKey::data(&prefix, &id).ok())
}

/// Generate a small JSON value.
pub fn json_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[ -~]{0,32}".prop_map(Value::from),
        ("[a-z]{1,8}", any::<i32>()).prop_map(|(k, v)| {
            let mut object = Map::new();
            object.insert(k, json!(v));
            Value::Object(object)
        }),
    ]
}

/// Generate a permission triple over arbitrary ids.
pub fn triple() -> impl Strategy<Value = PermissionTriple> {
    (group_id(), group_id(), group_id()).prop_map(|(admin, write, read)| PermissionTriple {
        admin,
        write,
        read,
    })
}

/// An acyclic group graph over a handful of devices.
#[derive(Debug, Clone)]
pub struct GroupDag {
    pub devices: Vec<DeviceKey>,
    /// Leaves first, then composites in creation order.
    pub groups: Vec<Group>,
}

impl GroupDag {
    /// The composite groups, in creation order.
    pub fn composites(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter().filter(|g| !g.is_leaf())
    }

    /// Devices reachable from `root` by walking child edges.
    pub fn reachable(&self, root: &GroupId) -> std::collections::BTreeSet<DeviceKey> {
        let mut out = std::collections::BTreeSet::new();
        let mut stack = vec![root];
        let mut seen = std::collections::HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(group) = self.groups.iter().find(|g| &g.id == id) {
                match group.device_key() {
                    Some(key) => {
                        out.insert(key);
                    }
                    None => stack.extend(group.child_ids()),
                }
            }
        }
        out
    }
}

/// Generate an acyclic group graph.
///
/// Each composite may only contain leaves and earlier composites, so the
/// result never has a cycle. Parent sets are kept consistent with children.
pub fn group_dag(max_devices: usize, max_composites: usize) -> impl Strategy<Value = GroupDag> {
    (
        prop::collection::vec(device_key(), 1..=max_devices.max(1)),
        prop::collection::vec(
            prop::collection::vec(any::<prop::sample::Index>(), 0..4),
            1..=max_composites.max(1),
        ),
    )
        .prop_map(|(mut devices, picks)| {
            devices.sort();
            devices.dedup();
            let mut groups: Vec<Group> = devices.iter().map(|k| Group::leaf(k, "device")).collect();

            for (n, children) in picks.into_iter().enumerate() {
                let id = GroupId::new(format!("g{n:04}"));
                let pool = groups.len();
                let members: Vec<GroupId> = children
                    .iter()
                    .map(|i| groups[i.index(pool)].id.clone())
                    .collect();
                for member in &members {
                    if let Some(child) = groups.iter_mut().find(|g| &g.id == member) {
                        child.parents.insert(id.clone());
                    }
                }
                groups.push(Group::composite(id, "group", members));
            }
            GroupDag { devices, groups }
        })
}

/// Generate a non-handshake operation over arbitrary ids.
pub fn operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        (group_id(), group_id()).prop_map(|(parent, child)| Operation::LinkGroups { parent, child }),
        (group_id(), group_id()).prop_map(|(group, parent)| Operation::AddParent { group, parent }),
        (group_id(), group_id()).prop_map(|(group, child)| Operation::AddChild { group, child }),
        (data_key(), group_id(), group_id(), prop::collection::vec(group_id(), 1..4)).prop_map(
            |(key, chain, previous, members)| Operation::AddWriter {
                key,
                chain,
                previous,
                members,
            }
        ),
        (data_key(), group_id()).prop_map(|(key, member)| Operation::RemoveAdmin { key, member }),
        (group_id(), prop::collection::vec(group_id(), 0..4), prop::option::of(triple())).prop_map(
            |(id, children, permissions)| Operation::UpdateGroup {
                group: Group::composite(id, "group", children),
                permissions,
            }
        ),
        (data_key(), json_value(), prop::option::of(triple())).prop_map(
            |(key, value, permissions)| Operation::UpdateData {
                key,
                value,
                permissions,
            }
        ),
        device_key().prop_map(|device| Operation::DeleteDevice { device }),
        group_id().prop_map(|group| Operation::DeleteGroup { group }),
        data_key().prop_map(|key| Operation::DeleteData { key }),
    ]
}
