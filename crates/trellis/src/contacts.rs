//! Contact exchange between identities.
//!
//! Both sides end up holding the other identity's LINKED subtree under
//! their own CONTACTS group. Imported groups are administered by a
//! `__contact_admins` group containing the contact's root and our own
//! LINKED group, so either side may later update the imported records.

use std::collections::{BTreeSet, HashMap};

use trellis_core::{names, DeviceKey, Group, GroupId, ObjectKey, PermissionTriple};
use trellis_perms::Identity;
use trellis_store::KvStore;
use trellis_sync::{Operation, Rejection, Transport};

use crate::device::Device;
use crate::error::{DeviceError, Result};
use crate::outbox::Outbox;

/// Groups under `root` whose every recorded parent goes with it, parents
/// first. A group with no recorded parents is kept.
fn exclusive_descendants(root: &GroupId, subtree: &[Group]) -> Vec<GroupId> {
    let mut doomed = BTreeSet::from([root.clone()]);
    let mut order = Vec::new();
    loop {
        let mut changed = false;
        for group in subtree.iter().filter(|g| &g.id != root) {
            if !doomed.contains(&group.id)
                && !group.parents.is_empty()
                && group.parents.iter().all(|p| doomed.contains(p))
            {
                doomed.insert(group.id.clone());
                order.push(group.id.clone());
                changed = true;
            }
        }
        if !changed {
            return order;
        }
    }
}

/// The first group found on a cycle among `groups`, following child edges.
fn find_cycle(groups: &[Group]) -> Option<GroupId> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Open,
        Done,
    }

    let by_id: HashMap<&GroupId, &Group> = groups.iter().map(|g| (&g.id, g)).collect();
    let mut marks: HashMap<&GroupId, Mark> = HashMap::new();

    for start in groups {
        if marks.contains_key(&start.id) {
            continue;
        }
        let mut stack: Vec<(&GroupId, bool)> = vec![(&start.id, false)];
        while let Some((id, leaving)) = stack.pop() {
            if leaving {
                marks.insert(id, Mark::Done);
                continue;
            }
            match marks.get(id) {
                Some(Mark::Done) => continue,
                Some(Mark::Open) => return Some(id.clone()),
                None => {}
            }
            marks.insert(id, Mark::Open);
            stack.push((id, true));
            if let Some(group) = by_id.get(id) {
                for child in group.child_ids() {
                    match marks.get(child) {
                        Some(Mark::Open) => return Some(child.clone()),
                        Some(Mark::Done) => {}
                        None => stack.push((child, false)),
                    }
                }
            }
        }
    }
    None
}

impl<S: KvStore, T: Transport> Device<S, T> {
    /// Ask the identity owning `key` to become a contact.
    pub async fn add_contact(&self, key: DeviceKey) -> Result<()> {
        let _guard = self.guard.lock().await;
        let identity = self.require_identity().await?;
        if key == self.key() || self.linked_devices_of(&identity).await?.contains(&key) {
            return Err(Rejection::SelfContactRejected.into());
        }

        self.identities().add_pending_contact(&key).await?;
        let subtree = self.groups().export_subtree(&identity.linked).await?;
        self.send(
            key,
            &Operation::RequestContact {
                req_key: self.key(),
                req_name: identity.linked.clone(),
                subtree,
            },
        )
        .await?;

        tracing::info!(peer = %key, "requested contact");
        Ok(())
    }

    /// Top-level groups of every known contact.
    pub async fn get_contacts(&self) -> Result<Vec<GroupId>> {
        let _guard = self.guard.lock().await;
        let identity = self.require_identity().await?;
        Ok(match self.groups().get(&identity.contacts).await? {
            Some(contacts) => contacts.child_ids().cloned().collect(),
            None => Vec::new(),
        })
    }

    /// Forget a contact and every group imported with it.
    pub async fn remove_contact(&self, name: &GroupId) -> Result<()> {
        let _guard = self.guard.lock().await;
        let identity = self.require_identity().await?;
        let is_contact = self
            .groups()
            .get(&identity.contacts)
            .await?
            .is_some_and(|c| c.has_child(name));
        if !is_contact {
            return Err(DeviceError::UnknownGroup(name.clone()));
        }

        let subtree = self.groups().descendants(name).await?;
        let order = exclusive_descendants(name, &subtree);
        let mut doomed: BTreeSet<GroupId> = order.iter().cloned().collect();
        doomed.insert(name.clone());

        let mut admins = BTreeSet::new();
        for id in &doomed {
            if let Some(triple) = self.perms().get_permissions(&ObjectKey::group(id)).await? {
                if let Some(admin) = self.groups().get(&triple.admin).await? {
                    if admin.name == names::CONTACT_ADMINS {
                        admins.insert(admin.id);
                    }
                }
            }
        }

        let recipients = self.linked_devices_of(&identity).await?;
        let mut outbox = Outbox::new();
        for id in order.iter().rev().chain([name]).chain(&admins) {
            outbox.local(Operation::DeleteGroup { group: id.clone() }, &recipients);
        }
        self.commit(outbox).await?;

        tracing::info!(contact = %name, groups = doomed.len(), "removed contact");
        Ok(())
    }

    async fn check_not_self(&self, identity: &Identity, sender: &DeviceKey, root: &GroupId) -> Result<()> {
        if root == &identity.linked || self.linked_devices_of(identity).await?.contains(sender) {
            return Err(Rejection::SelfContactRejected.into());
        }
        Ok(())
    }

    pub(crate) async fn accept_contact(
        &self,
        sender: DeviceKey,
        req_key: DeviceKey,
        req_name: GroupId,
        subtree: Vec<Group>,
    ) -> Result<()> {
        if sender != req_key {
            return Err(Rejection::PermissionDenied(format!(
                "contact request for {req_key} sent by {sender}"
            ))
            .into());
        }
        let Some(identity) = self.identity().await? else {
            return Err(Rejection::PermissionDenied("no identity to add contacts to".into()).into());
        };
        self.check_not_self(&identity, &sender, &req_name).await?;

        let prompt = format!("Accept contact request from {}?", sender.fingerprint());
        if !self.confirm.confirm(&prompt).await {
            return Err(Rejection::PermissionDenied("contact request declined".into()).into());
        }

        let outbox = self
            .import_contact(&identity, &sender, &req_name, &subtree)
            .await?;
        self.commit(outbox).await?;

        let own = self.groups().export_subtree(&identity.linked).await?;
        self.send(
            sender,
            &Operation::ConfirmContact {
                name: identity.linked.clone(),
                subtree: own,
            },
        )
        .await?;

        tracing::info!(contact = %req_name, peer = %sender, "accepted contact");
        Ok(())
    }

    pub(crate) async fn complete_contact(
        &self,
        sender: DeviceKey,
        name: GroupId,
        subtree: Vec<Group>,
    ) -> Result<()> {
        let Some(identity) = self.identity().await? else {
            return Err(Rejection::PermissionDenied("no identity to add contacts to".into()).into());
        };
        self.check_not_self(&identity, &sender, &name).await?;

        // An answer to our own request needs no second confirmation
        if !self.identities().take_pending_contact(&sender).await? {
            let prompt = format!("Add {} as a contact?", sender.fingerprint());
            if !self.confirm.confirm(&prompt).await {
                return Err(Rejection::PermissionDenied("contact declined".into()).into());
            }
        }

        let outbox = self
            .import_contact(&identity, &sender, &name, &subtree)
            .await?;
        self.commit(outbox).await?;

        tracing::info!(contact = %name, peer = %sender, "added contact");
        Ok(())
    }

    /// Build the operations that hang a contact's subtree under CONTACTS.
    ///
    /// Everything is applied here and mirrored to our other devices.
    async fn import_contact(
        &self,
        identity: &Identity,
        sender: &DeviceKey,
        root: &GroupId,
        subtree: &[Group],
    ) -> Result<Outbox> {
        let ids: BTreeSet<&GroupId> = subtree.iter().map(|g| &g.id).collect();
        let Some(root_record) = subtree.iter().find(|g| &g.id == root) else {
            return Err(Rejection::InvalidMessage("contact subtree lacks its root".into()).into());
        };
        if root_record.is_leaf() {
            return Err(Rejection::InvalidMessage("contact root is a device leaf".into()).into());
        }
        let sender_leaf = GroupId::for_device(sender);
        if !subtree.iter().any(|g| g.id == sender_leaf && g.is_leaf()) {
            return Err(Rejection::InvalidMessage("sender is not part of the contact subtree".into()).into());
        }
        if let Some(id) = find_cycle(subtree) {
            return Err(Rejection::DataInvariantViolated(format!("contact subtree has a cycle at {id}")).into());
        }

        let recipients = self.linked_devices_of(identity).await?;
        let mut outbox = Outbox::new();

        match self.groups().get(root).await? {
            Some(existing) if !existing.contact_level => {
                return Err(Rejection::InvalidMessage(format!("{root} is not a contact")).into());
            }
            Some(_) => {}
            None => {
                let admins = GroupId::random();
                outbox.local(
                    Operation::UpdateGroup {
                        group: Group::composite(
                            admins.clone(),
                            names::CONTACT_ADMINS,
                            [root.clone(), identity.linked.clone()],
                        ),
                        permissions: Some(PermissionTriple::uniform(&identity.linked)),
                    },
                    &recipients,
                );

                let imported = PermissionTriple::uniform(&admins);
                let ordered = std::iter::once(root_record)
                    .chain(subtree.iter().filter(|g| &g.id != root));
                for group in ordered {
                    if self.groups().exists(&group.id).await? {
                        continue;
                    }
                    let mut record = group.clone();
                    record.contact_level = &group.id == root || group.parents.contains(root);
                    record.parents.retain(|p| ids.contains(p));
                    if &group.id == root {
                        record.parents.insert(identity.contacts.clone());
                    }
                    if let Some(children) = record.children.as_mut() {
                        children.retain(|c| ids.contains(c));
                    }
                    outbox.local(
                        Operation::UpdateGroup {
                            group: record,
                            permissions: Some(imported.clone()),
                        },
                        &recipients,
                    );
                }
            }
        }

        outbox.local(
            Operation::AddChild {
                group: identity.contacts.clone(),
                child: root.clone(),
            },
            &recipients,
        );
        outbox.local(
            Operation::AddParent {
                group: root.clone(),
                parent: identity.contacts.clone(),
            },
            &recipients,
        );
        Ok(outbox)
    }
}
