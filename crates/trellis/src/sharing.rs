//! Sharing data items with other groups, and privilege grants.
//!
//! A data item's read group doubles as its visibility pointer. Sharing
//! replaces it with a `__share` group whose children are the previous
//! reader and the new target; later shares add children to it. Unsharing
//! removes a child, collapsing the sharing group back into its last child
//! or rebuilding it over the remaining ones.
//!
//! Devices joining an item's audience may not know the groups its triple
//! names. The originator ships them first: the item's privilege chain
//! links, the sharing group, and the subtrees of the other members, each
//! administered by the sharing group. Receivers park anything that arrives
//! before what it depends on.

use std::collections::{BTreeSet, HashSet};

use trellis_core::{names, DeviceKey, Group, GroupId, ObjectKey, PermissionTriple, Privilege};
use trellis_perms::permission::triple_holds;
use trellis_perms::Identity;
use trellis_store::KvStore;
use trellis_sync::{Operation, Rejection, Transport};

use crate::device::Device;
use crate::error::{DeviceError, Result};
use crate::outbox::Outbox;

impl<S: KvStore, T: Transport> Device<S, T> {
    /// Let every device of `target` read a data item.
    pub async fn grant_reader_privs(&self, prefix: &str, id: &str, target: &GroupId) -> Result<()> {
        let _guard = self.guard.lock().await;
        let key = ObjectKey::data(prefix, id)?;
        self.share_key(&key, target).await
    }

    /// Let every device of `target` write a data item. Shares it first if needed.
    pub async fn grant_writer_privs(&self, prefix: &str, id: &str, target: &GroupId) -> Result<()> {
        let _guard = self.guard.lock().await;
        let key = ObjectKey::data(prefix, id)?;
        self.grant_chain(&key, target, Privilege::Write).await
    }

    /// Let every device of `target` administer a data item. Shares it first if needed.
    pub async fn grant_admin_privs(&self, prefix: &str, id: &str, target: &GroupId) -> Result<()> {
        let _guard = self.guard.lock().await;
        let key = ObjectKey::data(prefix, id)?;
        self.grant_chain(&key, target, Privilege::Admin).await
    }

    pub async fn revoke_writer_privs(&self, prefix: &str, id: &str, target: &GroupId) -> Result<()> {
        let _guard = self.guard.lock().await;
        let key = ObjectKey::data(prefix, id)?;
        self.revoke_chain(&key, target, Privilege::Write).await
    }

    pub async fn revoke_admin_privs(&self, prefix: &str, id: &str, target: &GroupId) -> Result<()> {
        let _guard = self.guard.lock().await;
        let key = ObjectKey::data(prefix, id)?;
        self.revoke_chain(&key, target, Privilege::Admin).await
    }

    /// Revoke write and admin, then stop sharing the item with `target`.
    pub async fn revoke_all_privs(&self, prefix: &str, id: &str, target: &GroupId) -> Result<()> {
        let _guard = self.guard.lock().await;
        let key = ObjectKey::data(prefix, id)?;
        self.revoke_chain(&key, target, Privilege::Write).await?;
        self.revoke_chain(&key, target, Privilege::Admin).await?;
        match self.unshare_key(&key, target).await {
            Err(DeviceError::NotShared(..)) => Ok(()),
            other => other,
        }
    }

    /// Stop sharing a data item with `target`.
    ///
    /// The item is deleted from devices that lose access before the sharing
    /// group is restructured.
    pub async fn unshare(&self, prefix: &str, id: &str, target: &GroupId) -> Result<()> {
        let _guard = self.guard.lock().await;
        let key = ObjectKey::data(prefix, id)?;
        self.unshare_key(&key, target).await
    }

    /// The local identity and the item's triple, if this device administers it.
    async fn require_admin(&self, key: &ObjectKey) -> Result<(Identity, PermissionTriple)> {
        let identity = self.require_identity().await?;
        let Some(triple) = self.perms().get_permissions(key).await? else {
            return Err(DeviceError::NotFound(key.clone()));
        };
        if !triple_holds(self.groups(), &triple, Privilege::Admin, &self.key()).await? {
            return Err(Rejection::InsufficientGroupPermissions(triple.admin.clone()).into());
        }
        Ok((identity, triple))
    }

    async fn require_group(&self, id: &GroupId) -> Result<()> {
        if self.groups().exists(id).await? {
            Ok(())
        } else {
            Err(DeviceError::UnknownGroup(id.clone()))
        }
    }

    /// Writer and admin chain links behind a triple, oldest first.
    async fn chain_links(&self, triple: &PermissionTriple) -> Result<Vec<(Group, PermissionTriple)>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![(triple.admin.clone(), false), (triple.write.clone(), false)];

        while let Some((id, leaving)) = stack.pop() {
            if leaving {
                if let Some(link) = self.groups().get(&id).await? {
                    let link_triple = self
                        .perms()
                        .get_permissions(&ObjectKey::group(&id))
                        .await?
                        .unwrap_or_else(|| PermissionTriple::uniform(&triple.admin));
                    out.push((link, link_triple));
                }
                continue;
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(group) = self.groups().get(&id).await? else {
                continue;
            };
            if !matches!(group.name.as_str(), names::WRITERS | names::ADMINS) {
                continue;
            }
            stack.push((id, true));
            stack.extend(group.child_ids().map(|c| (c.clone(), false)));
        }
        Ok(out)
    }

    /// Queue `root`'s subtree for devices that will read through the sharing group.
    async fn ship_subtree(
        &self,
        outbox: &mut Outbox,
        root: &GroupId,
        share: &GroupId,
        recipients: &BTreeSet<DeviceKey>,
    ) -> Result<()> {
        if recipients.is_empty() {
            return Ok(());
        }
        let member = PermissionTriple {
            admin: share.clone(),
            write: root.clone(),
            read: root.clone(),
        };
        let subtree = self.groups().export_subtree(root).await?;
        let ids: HashSet<GroupId> = subtree.iter().map(|g| g.id.clone()).collect();
        for mut group in subtree {
            // Seen from the other side these are a contact's groups
            group.contact_level = true;
            group.parents.retain(|p| ids.contains(p));
            outbox.remote(
                Operation::UpdateGroup {
                    group,
                    permissions: Some(member.clone()),
                },
                recipients,
            );
        }
        Ok(())
    }

    pub(crate) async fn share_key(&self, key: &ObjectKey, target: &GroupId) -> Result<()> {
        let (_, triple) = self.require_admin(key).await?;
        self.require_group(target).await?;
        let Some(value) = self.data().get(key).await? else {
            return Err(DeviceError::NotFound(key.clone()));
        };

        let sharing = self
            .groups()
            .get(&triple.read)
            .await?
            .filter(|g| g.name == names::SHARE);
        let already = match &sharing {
            Some(share) => share.has_child(target),
            None => &triple.read == target,
        };
        if already {
            return Ok(());
        }

        let old_audience = self.resolve(&triple.groups().into_iter().collect::<Vec<_>>()).await?;
        let target_devices = self.resolve(&[target]).await?;
        let new_devices: BTreeSet<DeviceKey> =
            target_devices.difference(&old_audience).copied().collect();
        let everyone: BTreeSet<DeviceKey> = old_audience.union(&target_devices).copied().collect();

        let mut outbox = Outbox::new();
        for (link, link_triple) in self.chain_links(&triple).await? {
            outbox.remote(
                Operation::UpdateGroup {
                    group: link,
                    permissions: Some(link_triple),
                },
                &new_devices,
            );
        }

        let share_id = match sharing {
            None => {
                let share_id = GroupId::random();
                outbox.local(
                    Operation::UpdateGroup {
                        group: Group::composite(
                            share_id.clone(),
                            names::SHARE,
                            [triple.read.clone(), target.clone()],
                        ),
                        permissions: Some(PermissionTriple::uniform(&triple.admin)),
                    },
                    &everyone,
                );
                self.ship_subtree(&mut outbox, &triple.read, &share_id, &new_devices)
                    .await?;
                self.ship_subtree(&mut outbox, target, &share_id, &old_audience)
                    .await?;
                outbox.local(
                    Operation::AddParent {
                        group: triple.read.clone(),
                        parent: share_id.clone(),
                    },
                    &everyone,
                );
                outbox.local(
                    Operation::AddParent {
                        group: target.clone(),
                        parent: share_id.clone(),
                    },
                    &everyone,
                );

                let mut shared = triple.clone();
                shared.read = share_id.clone();
                outbox.local(
                    Operation::UpdateData {
                        key: key.clone(),
                        value,
                        permissions: Some(shared),
                    },
                    &everyone,
                );
                share_id
            }
            Some(share) => {
                let share_triple = self
                    .perms()
                    .get_permissions(&ObjectKey::group(&share.id))
                    .await?
                    .unwrap_or_else(|| PermissionTriple::uniform(&triple.admin));
                let mut extended = share.clone();
                extended.parents.clear();
                if let Some(children) = extended.children.as_mut() {
                    children.insert(target.clone());
                }
                outbox.remote(
                    Operation::UpdateGroup {
                        group: extended,
                        permissions: Some(share_triple),
                    },
                    &new_devices,
                );
                for member in share.child_ids() {
                    self.ship_subtree(&mut outbox, member, &share.id, &new_devices)
                        .await?;
                }
                self.ship_subtree(&mut outbox, target, &share.id, &old_audience)
                    .await?;
                outbox.local(
                    Operation::AddChild {
                        group: share.id.clone(),
                        child: target.clone(),
                    },
                    &old_audience,
                );
                outbox.local(
                    Operation::AddParent {
                        group: target.clone(),
                        parent: share.id.clone(),
                    },
                    &everyone,
                );
                outbox.remote(
                    Operation::UpdateData {
                        key: key.clone(),
                        value,
                        permissions: Some(triple.clone()),
                    },
                    &new_devices,
                );
                share.id
            }
        };

        self.commit(outbox).await?;
        tracing::info!(object = %key, member = %target, share = %share_id, "shared item");
        Ok(())
    }

    pub(crate) async fn unshare_key(&self, key: &ObjectKey, target: &GroupId) -> Result<()> {
        let (identity, triple) = self.require_admin(key).await?;
        if target == &identity.linked {
            return Err(DeviceError::InvalidArgument("cannot unshare from the owning identity".into()));
        }
        let not_shared = || DeviceError::NotShared(key.clone(), target.clone());

        let share = self
            .groups()
            .get(&triple.read)
            .await?
            .filter(|g| g.name == names::SHARE && g.has_child(target))
            .ok_or_else(not_shared)?;
        let remaining: Vec<GroupId> = share.child_ids().filter(|c| *c != target).cloned().collect();
        if remaining.is_empty() {
            return Err(not_shared());
        }
        let Some(value) = self.data().get(key).await? else {
            return Err(DeviceError::NotFound(key.clone()));
        };

        let mut kept_ids: Vec<&GroupId> = remaining.iter().collect();
        kept_ids.extend([&triple.write, &triple.admin]);
        let keep = self.resolve(&kept_ids).await?;
        let dropped: BTreeSet<DeviceKey> = self
            .resolve(&[target])
            .await?
            .difference(&keep)
            .copied()
            .collect();
        let everyone: BTreeSet<DeviceKey> = keep.union(&dropped).copied().collect();

        let mut outbox = Outbox::new();
        outbox.remote(Operation::DeleteData { key: key.clone() }, &dropped);

        let mut narrowed = triple.clone();
        if let [survivor] = remaining.as_slice() {
            narrowed.read = survivor.clone();
            outbox.local(
                Operation::UpdateData {
                    key: key.clone(),
                    value,
                    permissions: Some(narrowed),
                },
                &keep,
            );
            outbox.local(
                Operation::RemoveParent {
                    group: survivor.clone(),
                    parent: share.id.clone(),
                },
                &keep,
            );
        } else {
            let rebuilt = GroupId::random();
            outbox.local(
                Operation::UpdateGroup {
                    group: Group::composite(rebuilt.clone(), names::SHARE, remaining.iter().cloned()),
                    permissions: Some(PermissionTriple::uniform(&triple.admin)),
                },
                &keep,
            );
            for member in &remaining {
                outbox.local(
                    Operation::AddParent {
                        group: member.clone(),
                        parent: rebuilt.clone(),
                    },
                    &keep,
                );
            }
            narrowed.read = rebuilt;
            outbox.local(
                Operation::UpdateData {
                    key: key.clone(),
                    value,
                    permissions: Some(narrowed),
                },
                &keep,
            );
            for member in &remaining {
                outbox.local(
                    Operation::RemoveParent {
                        group: member.clone(),
                        parent: share.id.clone(),
                    },
                    &keep,
                );
            }
        }
        outbox.local(
            Operation::DeleteGroup {
                group: share.id.clone(),
            },
            &everyone,
        );

        self.commit(outbox).await?;
        tracing::info!(object = %key, member = %target, "unshared item");
        Ok(())
    }

    async fn grant_chain(&self, key: &ObjectKey, target: &GroupId, privilege: Privilege) -> Result<()> {
        if privilege == Privilege::Read {
            return self.share_key(key, target).await;
        }
        let (_, triple) = self.require_admin(key).await?;
        self.require_group(target).await?;

        let readers = self.resolve(&triple.holders(Privilege::Read)).await?;
        let target_devices = self.resolve(&[target]).await?;
        let triple = if target_devices.is_subset(&readers) {
            triple
        } else {
            self.share_key(key, target).await?;
            self.perms()
                .get_permissions(key)
                .await?
                .ok_or_else(|| DeviceError::NotFound(key.clone()))?
        };

        let mut audience = self.resolve(&triple.groups().into_iter().collect::<Vec<_>>()).await?;
        audience.extend(target_devices);

        let chain = GroupId::random();
        let previous = triple.get(privilege).clone();
        let members = vec![target.clone()];
        let operation = match privilege {
            Privilege::Admin => Operation::AddAdmin {
                key: key.clone(),
                chain,
                previous,
                members,
            },
            _ => Operation::AddWriter {
                key: key.clone(),
                chain,
                previous,
                members,
            },
        };

        let mut outbox = Outbox::new();
        outbox.local(operation, &audience);
        self.commit(outbox).await?;
        tracing::info!(object = %key, member = %target, ?privilege, "granted privilege");
        Ok(())
    }

    async fn revoke_chain(&self, key: &ObjectKey, target: &GroupId, privilege: Privilege) -> Result<()> {
        let (identity, triple) = self.require_admin(key).await?;
        if target == &identity.linked {
            return Err(DeviceError::InvalidArgument("cannot revoke the owning identity".into()));
        }
        let audience = self.resolve(&triple.groups().into_iter().collect::<Vec<_>>()).await?;
        let operation = match privilege {
            Privilege::Admin => Operation::RemoveAdmin {
                key: key.clone(),
                member: target.clone(),
            },
            _ => Operation::RemoveWriter {
                key: key.clone(),
                member: target.clone(),
            },
        };

        let mut outbox = Outbox::new();
        outbox.local(operation, &audience);
        self.commit(outbox).await?;
        tracing::info!(object = %key, member = %target, ?privilege, "revoked privilege");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use trellis_core::Keypair;
    use trellis_store::MemoryStore;
    use trellis_sync::{MemoryNetwork, MemoryTransport};

    use super::*;
    use crate::confirm::AutoConfirm;
    use crate::DeviceConfig;

    type TestDevice = Device<MemoryStore, MemoryTransport>;

    async fn device(network: &Arc<MemoryNetwork>) -> TestDevice {
        let key = Keypair::generate().device_key();
        let device = Device::new(
            Arc::new(MemoryStore::new()),
            Arc::new(network.create_transport(key).await),
            Arc::new(AutoConfirm::accept()),
            DeviceConfig::default(),
        );
        device.create_device().await.unwrap();
        device
    }

    /// Deliver frames until every inbox is empty.
    async fn settle(devices: &[&TestDevice]) {
        loop {
            let mut delivered = 0;
            for device in devices {
                while let Some(frame) = device.transport().try_recv().await {
                    device.on_message(frame.from, &frame.bytes).await.unwrap();
                    delivered += 1;
                }
            }
            if delivered == 0 {
                break;
            }
        }
    }

    async fn befriend(a: &TestDevice, b: &TestDevice) {
        a.add_contact(b.key()).await.unwrap();
        settle(&[a, b]).await;
    }

    async fn linked(device: &TestDevice) -> GroupId {
        device.identity().await.unwrap().unwrap().linked
    }

    #[tokio::test]
    async fn test_share_then_collapse() {
        let network = MemoryNetwork::new();
        let a = device(&network).await;
        let b = device(&network).await;
        befriend(&a, &b).await;
        let (la, lb) = (linked(&a).await, linked(&b).await);

        a.set_data("notes", "1", json!({"text": "hi"})).await.unwrap();
        a.grant_reader_privs("notes", "1", &lb).await.unwrap();
        settle(&[&a, &b]).await;

        assert_eq!(
            b.get_single_data("notes", "1").await.unwrap(),
            Some(json!({"text": "hi"}))
        );
        let expected: BTreeSet<DeviceKey> = [a.key(), b.key()].into_iter().collect();
        assert_eq!(a.readers("notes", "1").await.unwrap(), expected);
        assert_eq!(b.readers("notes", "1").await.unwrap(), expected);

        let share = a.permissions("notes", "1").await.unwrap().unwrap().read;
        assert_ne!(share, la);

        a.unshare("notes", "1", &lb).await.unwrap();
        settle(&[&a, &b]).await;

        assert_eq!(a.permissions("notes", "1").await.unwrap().unwrap().read, la);
        assert!(!a.groups().exists(&share).await.unwrap());
        assert!(!b.groups().exists(&share).await.unwrap());
        assert_eq!(b.get_single_data("notes", "1").await.unwrap(), None);
        assert!(!a
            .groups()
            .get(&la)
            .await
            .unwrap()
            .unwrap()
            .parents
            .contains(&share));
    }

    #[tokio::test]
    async fn test_extend_then_rebuild() {
        let network = MemoryNetwork::new();
        let a = device(&network).await;
        let b = device(&network).await;
        let c = device(&network).await;
        befriend(&a, &b).await;
        befriend(&a, &c).await;
        let (lb, lc) = (linked(&b).await, linked(&c).await);

        a.set_data("notes", "1", json!(1)).await.unwrap();
        a.grant_reader_privs("notes", "1", &lb).await.unwrap();
        settle(&[&a, &b, &c]).await;
        let first = a.permissions("notes", "1").await.unwrap().unwrap().read;

        a.grant_reader_privs("notes", "1", &lc).await.unwrap();
        settle(&[&a, &b, &c]).await;

        // Extending keeps the sharing group
        assert_eq!(a.permissions("notes", "1").await.unwrap().unwrap().read, first);
        let everyone: BTreeSet<DeviceKey> = [a.key(), b.key(), c.key()].into_iter().collect();
        for device in [&a, &b, &c] {
            assert_eq!(device.get_single_data("notes", "1").await.unwrap(), Some(json!(1)));
            assert_eq!(device.readers("notes", "1").await.unwrap(), everyone);
        }

        a.unshare("notes", "1", &lb).await.unwrap();
        settle(&[&a, &b, &c]).await;

        let rebuilt = a.permissions("notes", "1").await.unwrap().unwrap().read;
        assert_ne!(rebuilt, first);
        let remaining: BTreeSet<DeviceKey> = [a.key(), c.key()].into_iter().collect();
        assert_eq!(a.readers("notes", "1").await.unwrap(), remaining);
        assert_eq!(c.readers("notes", "1").await.unwrap(), remaining);
        assert_eq!(b.get_single_data("notes", "1").await.unwrap(), None);
        assert!(!a.groups().exists(&first).await.unwrap());
    }

    #[tokio::test]
    async fn test_grant_and_revoke_writer() {
        let network = MemoryNetwork::new();
        let a = device(&network).await;
        let b = device(&network).await;
        befriend(&a, &b).await;
        let lb = linked(&b).await;

        a.set_data("notes", "1", json!("draft")).await.unwrap();
        a.grant_writer_privs("notes", "1", &lb).await.unwrap();
        settle(&[&a, &b]).await;

        assert!(a
            .has_privilege("notes", "1", Privilege::Write, &b.key())
            .await
            .unwrap());
        b.set_data("notes", "1", json!("edited")).await.unwrap();
        settle(&[&a, &b]).await;
        assert_eq!(a.get_single_data("notes", "1").await.unwrap(), Some(json!("edited")));

        a.revoke_writer_privs("notes", "1", &lb).await.unwrap();
        settle(&[&a, &b]).await;
        assert!(!b
            .has_privilege("notes", "1", Privilege::Write, &b.key())
            .await
            .unwrap());
        assert!(matches!(
            b.set_data("notes", "1", json!("again")).await,
            Err(DeviceError::Rejected(Rejection::InsufficientDataPermissions(_)))
        ));
    }

    #[tokio::test]
    async fn test_revoke_all_ends_sharing() {
        let network = MemoryNetwork::new();
        let a = device(&network).await;
        let b = device(&network).await;
        befriend(&a, &b).await;
        let (la, lb) = (linked(&a).await, linked(&b).await);

        a.set_data("notes", "1", json!(1)).await.unwrap();
        a.grant_admin_privs("notes", "1", &lb).await.unwrap();
        settle(&[&a, &b]).await;
        assert!(b
            .has_privilege("notes", "1", Privilege::Admin, &b.key())
            .await
            .unwrap());

        a.revoke_all_privs("notes", "1", &lb).await.unwrap();
        settle(&[&a, &b]).await;

        assert_eq!(a.permissions("notes", "1").await.unwrap().unwrap().read, la);
        assert_eq!(b.get_single_data("notes", "1").await.unwrap(), None);

        // Nothing left to unshare
        a.revoke_all_privs("notes", "1", &lb).await.unwrap();
    }

    #[tokio::test]
    async fn test_sharing_preconditions() {
        let network = MemoryNetwork::new();
        let a = device(&network).await;
        let b = device(&network).await;
        befriend(&a, &b).await;
        let (la, lb) = (linked(&a).await, linked(&b).await);

        assert!(matches!(
            a.grant_reader_privs("notes", "missing", &lb).await,
            Err(DeviceError::NotFound(_))
        ));

        a.set_data("notes", "1", json!(1)).await.unwrap();
        assert!(matches!(
            a.grant_reader_privs("notes", "1", &GroupId::new("nobody")).await,
            Err(DeviceError::UnknownGroup(_))
        ));
        assert!(matches!(
            a.unshare("notes", "1", &lb).await,
            Err(DeviceError::NotShared(..))
        ));
        assert!(matches!(
            a.unshare("notes", "1", &la).await,
            Err(DeviceError::InvalidArgument(_))
        ));

        // Sharing with the current reader changes nothing
        a.grant_reader_privs("notes", "1", &la).await.unwrap();
        assert_eq!(a.permissions("notes", "1").await.unwrap().unwrap().read, la);

        a.grant_reader_privs("notes", "1", &lb).await.unwrap();
        settle(&[&a, &b]).await;
        assert!(matches!(
            b.grant_reader_privs("notes", "1", &lb).await,
            Err(DeviceError::Rejected(Rejection::InsufficientGroupPermissions(_)))
        ));
    }
}
