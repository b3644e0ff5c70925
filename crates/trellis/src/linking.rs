//! Joining a fresh device to an existing identity.
//!
//! ```text
//! joiner                                   target
//!   | create_device, set pending link        |
//!   |---- RequestUpdateLinked ------------->|  confirm, rename temp id,
//!   |                                        |  add leaf under LINKED,
//!   |                                        |  tell linked devices + contacts
//!   |<--- ConfirmUpdateLinked(snapshot) ----|
//!   | wipe, adopt snapshot, clear marker     |
//! ```

use std::collections::BTreeSet;

use trellis_core::{names, DeviceKey, Group, GroupId, PermissionTriple};
use trellis_perms::{rename_in_subtree, Identity, PendingLink};
use trellis_store::KvStore;
use trellis_sync::{Operation, Rejection, Snapshot, Transport};

use crate::device::Device;
use crate::error::{DeviceError, Result};
use crate::outbox::Outbox;

impl<S: KvStore, T: Transport> Device<S, T> {
    /// Ask `target` to admit this device into its identity.
    ///
    /// Initialises this device first if needed. The request stays acceptable
    /// for [`DeviceConfig::link_timeout`](crate::DeviceConfig::link_timeout).
    pub async fn create_linked_device(&self, target: DeviceKey) -> Result<DeviceKey> {
        let _guard = self.guard.lock().await;
        if target == self.key() {
            return Err(DeviceError::InvalidArgument("cannot link a device to itself".into()));
        }

        if let Some(identity) = self.identity().await? {
            self.require_fresh(&identity).await?;
        }
        self.init_identity().await?;
        let identity = self.require_identity().await?;
        let subtree = self.groups().export_subtree(&identity.linked).await?;

        self.identities()
            .set_pending_link(&PendingLink::new(target))
            .await?;
        self.send(
            target,
            &Operation::RequestUpdateLinked {
                temp_name: identity.linked.clone(),
                src_key: self.key(),
                subtree,
            },
        )
        .await?;

        tracing::info!(peer = %target, "requested link");
        Ok(self.key())
    }

    /// Joining replaces all local state, so only an identity of this device
    /// alone, with no contacts and no data, may join another.
    async fn require_fresh(&self, identity: &Identity) -> Result<()> {
        let alone = self.linked_devices_of(identity).await? == BTreeSet::from([self.key()]);
        let no_contacts = self
            .groups()
            .get(&identity.contacts)
            .await?
            .map_or(true, |c| c.child_ids().next().is_none());
        let no_data = self.data().all().await?.is_empty();
        if alone && no_contacts && no_data {
            Ok(())
        } else {
            Err(DeviceError::InvalidArgument(
                "device already holds identity state; delete it before linking".into(),
            ))
        }
    }

    pub(crate) async fn accept_link(
        &self,
        sender: DeviceKey,
        temp_name: GroupId,
        src_key: DeviceKey,
        mut subtree: Vec<Group>,
    ) -> Result<()> {
        if sender != src_key {
            return Err(Rejection::PermissionDenied(format!(
                "link request for {src_key} sent by {sender}"
            ))
            .into());
        }
        let Some(identity) = self.identity().await? else {
            return Err(Rejection::PermissionDenied("no identity to link into".into()).into());
        };

        rename_in_subtree(&mut subtree, &temp_name, &identity.linked);
        let leaf_id = GroupId::for_device(&sender);
        let fresh = subtree.len() == 2
            && subtree
                .iter()
                .any(|g| g.id == identity.linked && g.child_ids().eq([&leaf_id]));
        let Some(leaf) = subtree.iter().find(|g| g.id == leaf_id && g.is_leaf()) else {
            return Err(Rejection::InvalidMessage("link request lacks the sender's leaf".into()).into());
        };
        if !fresh {
            return Err(Rejection::InvalidMessage(
                "link requests must come from a fresh device".into(),
            )
            .into());
        }

        let prompt = format!("Link device {} to this identity?", sender.fingerprint());
        if !self.confirm.confirm(&prompt).await {
            return Err(Rejection::PermissionDenied("link request declined".into()).into());
        }

        let linked_devices = self.linked_devices_of(&identity).await?;
        let contact_devices = self.contact_devices_of(&identity).await?;
        let everyone: BTreeSet<DeviceKey> = linked_devices.union(&contact_devices).copied().collect();

        let mut record = Group::leaf(&sender, leaf.name.clone());
        record.parents.insert(identity.linked.clone());
        let owned = PermissionTriple::uniform(&identity.linked);

        let mut seen_by_contacts = record.clone();
        seen_by_contacts.contact_level = true;

        let mut outbox = Outbox::new();
        outbox.local(
            Operation::UpdateGroup {
                group: record,
                permissions: Some(owned.clone()),
            },
            &linked_devices,
        );
        outbox.remote(
            Operation::UpdateGroup {
                group: seen_by_contacts,
                permissions: Some(owned),
            },
            &contact_devices,
        );
        outbox.local(
            Operation::AddChild {
                group: identity.linked.clone(),
                child: leaf_id,
            },
            &everyone,
        );
        self.commit(outbox).await?;

        let snapshot = self.snapshot(&identity).await?;
        self.send(sender, &Operation::ConfirmUpdateLinked { snapshot })
            .await?;

        tracing::info!(device = %sender, "linked new device");
        Ok(())
    }

    async fn snapshot(&self, identity: &Identity) -> Result<Snapshot> {
        Ok(Snapshot {
            linked: identity.linked.clone(),
            contacts: identity.contacts.clone(),
            groups: self.groups().all().await?,
            permissions: self.perms().all().await?,
            data: self.data().all().await?,
        })
    }

    /// Replace all local state with the identity we were admitted to.
    ///
    /// The dispatcher has already matched the sender against the pending
    /// link marker.
    pub(crate) async fn adopt_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let own_leaf = GroupId::for_device(&self.key());
        let admits_us = snapshot
            .groups
            .iter()
            .any(|g| g.id == snapshot.linked && g.name == names::LINKED && g.has_child(&own_leaf));
        if !admits_us {
            return Err(Rejection::InvalidMessage("snapshot does not include this device".into()).into());
        }
        let keys_ok = snapshot
            .permissions
            .iter()
            .all(|(key, _)| key.as_group().is_some() || key.is_data())
            && snapshot.data.iter().all(|(key, _)| key.is_data());
        if !keys_ok {
            return Err(Rejection::InvalidMessage("snapshot holds keys outside its namespaces".into()).into());
        }

        self.identities().clear_all().await?;
        self.dispatcher().clear_deferred();

        for group in &snapshot.groups {
            self.groups().put(group).await?;
        }
        for (key, triple) in &snapshot.permissions {
            self.perms().set_permissions(key, triple).await?;
        }
        for (key, value) in &snapshot.data {
            self.data().set(key, value).await?;
        }
        self.identities()
            .set_identity(&Identity {
                device: self.key(),
                linked: snapshot.linked.clone(),
                contacts: snapshot.contacts.clone(),
            })
            .await?;

        tracing::info!(
            linked = %snapshot.linked,
            groups = snapshot.groups.len(),
            items = snapshot.data.len(),
            "joined identity"
        );
        Ok(())
    }
}
