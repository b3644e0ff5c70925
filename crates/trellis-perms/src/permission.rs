//! Permission triples and privilege checks.
//!
//! Triples live under `__perm/<object key>`. A device holds a privilege on
//! an object when one of the groups conferring it resolves to a set that
//! contains the device. Admin implies write, and write implies read.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use trellis_core::{namespace, DeviceKey, GroupId, ObjectKey, PermissionTriple, Privilege};
use trellis_store::{KvStore, StoreExt};

use crate::error::{PermsError, Result};
use crate::group::GroupStore;

fn record_key(key: &ObjectKey) -> String {
    format!("{}{}", namespace::PERM, key)
}

/// A link added to a writer or admin chain.
///
/// The originator of a grant picks the chain id; replicas replay the same
/// link so every device ends up with the same group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    /// The new head of the chain.
    pub chain: GroupId,
    /// The group the triple pointed at before the grant.
    pub previous: GroupId,
}

/// Access to the permission triples of one device.
pub struct PermissionStore<S> {
    store: Arc<S>,
    groups: GroupStore<S>,
}

impl<S> Clone for PermissionStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            groups: self.groups.clone(),
        }
    }
}

impl<S: KvStore> PermissionStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            groups: GroupStore::new(store.clone()),
            store,
        }
    }

    /// The group graph the triples refer into.
    pub fn groups(&self) -> &GroupStore<S> {
        &self.groups
    }

    pub async fn get_permissions(&self, key: &ObjectKey) -> Result<Option<PermissionTriple>> {
        Ok(self.store.get_record(&record_key(key)).await?)
    }

    pub async fn set_permissions(&self, key: &ObjectKey, triple: &PermissionTriple) -> Result<()> {
        self.store.put_record(&record_key(key), triple).await?;
        Ok(())
    }

    pub async fn remove_permissions(&self, key: &ObjectKey) -> Result<()> {
        self.store.remove(&record_key(key)).await?;
        Ok(())
    }

    async fn require(&self, key: &ObjectKey) -> Result<PermissionTriple> {
        self.get_permissions(key)
            .await?
            .ok_or_else(|| PermsError::NoPermissions(key.clone()))
    }

    /// Every stored triple, ordered by object key.
    pub async fn all(&self) -> Result<Vec<(ObjectKey, PermissionTriple)>> {
        let records = self
            .store
            .get_records::<PermissionTriple>(namespace::PERM)
            .await?;
        Ok(records
            .into_iter()
            .map(|(raw, triple)| {
                let key = raw.strip_prefix(namespace::PERM).unwrap_or(&raw);
                (ObjectKey::from_raw(key), triple)
            })
            .collect())
    }

    /// Grant write privilege by wrapping the current write group in a new chain link.
    pub async fn add_writer(&self, key: &ObjectKey, members: &[GroupId]) -> Result<ChainLink> {
        self.extend_chain(key, Privilege::Write, members).await
    }

    /// Grant admin privilege by wrapping the current admin group in a new chain link.
    pub async fn add_admin(&self, key: &ObjectKey, members: &[GroupId]) -> Result<ChainLink> {
        self.extend_chain(key, Privilege::Admin, members).await
    }

    async fn extend_chain(
        &self,
        key: &ObjectKey,
        privilege: Privilege,
        members: &[GroupId],
    ) -> Result<ChainLink> {
        let triple = self.require(key).await?;
        let link = ChainLink {
            chain: GroupId::random(),
            previous: triple.get(privilege).clone(),
        };
        self.apply_chain(key, privilege, &link, members).await?;
        Ok(link)
    }

    /// Install a chain link chosen by the grant's originator.
    ///
    /// Replaying a link is a no-op. If the triple has moved on since the
    /// link was chosen, the current head is folded into the new link so no
    /// earlier grant is lost.
    pub async fn apply_chain(
        &self,
        key: &ObjectKey,
        privilege: Privilege,
        link: &ChainLink,
        members: &[GroupId],
    ) -> Result<()> {
        if privilege == Privilege::Read {
            return Err(PermsError::InvalidPrivilege(privilege));
        }
        let mut triple = self.require(key).await?;
        let head = triple.get(privilege).clone();

        let mut children = vec![link.previous.clone()];
        if head != link.previous && head != link.chain {
            children.push(head.clone());
        }
        children.extend(members.iter().cloned());

        self.groups
            .new_group_with_id(&link.chain, privilege.chain_name(), false, &children)
            .await?;

        let chain_key = ObjectKey::group(&link.chain);
        if self.get_permissions(&chain_key).await?.is_none() {
            self.set_permissions(&chain_key, &PermissionTriple::uniform(&triple.admin))
                .await?;
        }

        if head != link.chain {
            triple.set(privilege, link.chain.clone());
            self.set_permissions(key, &triple).await?;
        }

        tracing::debug!(object = %key, ?privilege, chain = %link.chain, "extended privilege chain");
        Ok(())
    }

    /// Grant read privilege by appending to the read group in place.
    pub async fn add_reader(&self, key: &ObjectKey, members: &[GroupId]) -> Result<()> {
        let triple = self.require(key).await?;
        self.groups.add_to_group(&triple.read, members).await
    }

    /// Remove a member from every writer chain link reachable from the head.
    ///
    /// Non-synthetic groups such as a linked identity are never edited, so a
    /// member that holds the privilege through one of those keeps it.
    pub async fn remove_writer(&self, key: &ObjectKey, member: &GroupId) -> Result<bool> {
        self.remove_from_chain(key, Privilege::Write, member).await
    }

    /// Remove a member from every admin chain link reachable from the head.
    pub async fn remove_admin(&self, key: &ObjectKey, member: &GroupId) -> Result<bool> {
        self.remove_from_chain(key, Privilege::Admin, member).await
    }

    /// Remove a member from the read group, if it is a synthetic group.
    pub async fn remove_reader(&self, key: &ObjectKey, member: &GroupId) -> Result<bool> {
        self.remove_from_chain(key, Privilege::Read, member).await
    }

    async fn remove_from_chain(
        &self,
        key: &ObjectKey,
        privilege: Privilege,
        member: &GroupId,
    ) -> Result<bool> {
        let triple = self.require(key).await?;
        let mut seen = HashSet::new();
        let mut stack = vec![triple.get(privilege).clone()];
        let mut removed = false;

        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(group) = self.groups.get(&id).await? else {
                continue;
            };
            if !group.is_synthetic() {
                continue;
            }
            if group.has_child(member) {
                self.groups
                    .remove_from_group(&id, std::slice::from_ref(member))
                    .await?;
                removed = true;
            }
            stack.extend(
                group
                    .child_ids()
                    .filter(|c| *c != member)
                    .cloned(),
            );
        }

        if removed {
            tracing::debug!(object = %key, ?privilege, member = %member, "revoked member");
        }
        Ok(removed)
    }

    /// Remove a member from whichever of the three groups contain it.
    pub async fn unshare_data(&self, key: &ObjectKey, member: &GroupId) -> Result<bool> {
        let admin = self.remove_admin(key, member).await?;
        let write = self.remove_writer(key, member).await?;
        let read = self.remove_reader(key, member).await?;
        Ok(admin || write || read)
    }

    /// Whether a device holds at least the given privilege on an object.
    ///
    /// Objects without a triple grant nothing.
    pub async fn holds(
        &self,
        key: &ObjectKey,
        privilege: Privilege,
        device: &DeviceKey,
    ) -> Result<bool> {
        let Some(triple) = self.get_permissions(key).await? else {
            return Ok(false);
        };
        triple_holds(&self.groups, &triple, privilege, device).await
    }

    pub async fn has_read(&self, key: &ObjectKey, device: &DeviceKey) -> Result<bool> {
        self.holds(key, Privilege::Read, device).await
    }

    pub async fn has_write(&self, key: &ObjectKey, device: &DeviceKey) -> Result<bool> {
        self.holds(key, Privilege::Write, device).await
    }

    pub async fn has_admin(&self, key: &ObjectKey, device: &DeviceKey) -> Result<bool> {
        self.holds(key, Privilege::Admin, device).await
    }

    /// Every device able to read an object.
    pub async fn audience(&self, key: &ObjectKey) -> Result<BTreeSet<DeviceKey>> {
        match self.get_permissions(key).await? {
            Some(triple) => self.groups.resolve(triple.groups()).await,
            None => Ok(BTreeSet::new()),
        }
    }
}

/// Check a privilege against a triple that may not be stored locally.
pub async fn triple_holds<S: KvStore>(
    groups: &GroupStore<S>,
    triple: &PermissionTriple,
    privilege: Privilege,
    device: &DeviceKey,
) -> Result<bool> {
    let devices = groups.resolve(triple.holders(privilege)).await?;
    Ok(devices.contains(device))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::{names, Keypair};
    use trellis_store::MemoryStore;

    struct Fixture {
        perms: PermissionStore<MemoryStore>,
        owner: DeviceKey,
        owner_group: GroupId,
        other: DeviceKey,
        other_leaf: GroupId,
        key: ObjectKey,
    }

    async fn fixture() -> Fixture {
        let perms = PermissionStore::new(Arc::new(MemoryStore::new()));
        let groups = perms.groups();
        let owner = Keypair::generate().device_key();
        let other = Keypair::generate().device_key();
        let owner_leaf = groups.create_leaf(&owner, "owner").await.unwrap();
        let other_leaf = groups.create_leaf(&other, "other").await.unwrap();
        let owner_group = groups
            .new_group(names::LINKED, false, &[owner_leaf])
            .await
            .unwrap();

        let key = ObjectKey::data("notes", "1").unwrap();
        perms
            .set_permissions(&key, &PermissionTriple::uniform(&owner_group))
            .await
            .unwrap();

        Fixture {
            perms,
            owner,
            owner_group,
            other,
            other_leaf,
            key,
        }
    }

    #[tokio::test]
    async fn test_owner_holds_everything() {
        let f = fixture().await;
        assert!(f.perms.has_admin(&f.key, &f.owner).await.unwrap());
        assert!(f.perms.has_write(&f.key, &f.owner).await.unwrap());
        assert!(f.perms.has_read(&f.key, &f.owner).await.unwrap());
        assert!(!f.perms.has_read(&f.key, &f.other).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_triple_grants_nothing() {
        let f = fixture().await;
        let unknown = ObjectKey::data("notes", "2").unwrap();
        assert!(!f.perms.has_read(&unknown, &f.owner).await.unwrap());
        assert!(f.perms.audience(&unknown).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_writer_grant_revoke_round_trip() {
        let f = fixture().await;

        let link = f
            .perms
            .add_writer(&f.key, &[f.other_leaf.clone()])
            .await
            .unwrap();
        assert_eq!(link.previous, f.owner_group);
        assert!(f.perms.has_write(&f.key, &f.other).await.unwrap());
        assert!(f.perms.has_read(&f.key, &f.other).await.unwrap());
        assert!(!f.perms.has_admin(&f.key, &f.other).await.unwrap());

        assert!(f.perms.remove_writer(&f.key, &f.other_leaf).await.unwrap());
        assert!(!f.perms.has_write(&f.key, &f.other).await.unwrap());
        assert!(!f.perms.has_read(&f.key, &f.other).await.unwrap());

        // The owner keeps write through the untouched linked group
        assert!(f.perms.has_write(&f.key, &f.owner).await.unwrap());
    }

    #[tokio::test]
    async fn test_writer_grant_creates_new_chain_link() {
        let f = fixture().await;
        let first = f.perms.add_writer(&f.key, &[f.other_leaf.clone()]).await.unwrap();
        let second = f.perms.add_writer(&f.key, &[]).await.unwrap();

        assert_eq!(second.previous, first.chain);
        let triple = f.perms.get_permissions(&f.key).await.unwrap().unwrap();
        assert_eq!(triple.write, second.chain);
        assert_eq!(triple.read, f.owner_group);

        let head = f.perms.groups().get(&second.chain).await.unwrap().unwrap();
        assert_eq!(head.name, names::WRITERS);

        // Removal reaches into earlier links
        f.perms.remove_writer(&f.key, &f.other_leaf).await.unwrap();
        assert!(!f.perms.has_write(&f.key, &f.other).await.unwrap());
    }

    #[tokio::test]
    async fn test_apply_chain_is_idempotent() {
        let f = fixture().await;
        let link = ChainLink {
            chain: GroupId::new("chain-1"),
            previous: f.owner_group.clone(),
        };
        let members = [f.other_leaf.clone()];
        f.perms.apply_chain(&f.key, Privilege::Admin, &link, &members).await.unwrap();
        f.perms.apply_chain(&f.key, Privilege::Admin, &link, &members).await.unwrap();

        let triple = f.perms.get_permissions(&f.key).await.unwrap().unwrap();
        assert_eq!(triple.admin, link.chain);
        let chain = f.perms.groups().get(&link.chain).await.unwrap().unwrap();
        assert_eq!(chain.child_ids().count(), 2);
        assert!(f.perms.has_admin(&f.key, &f.other).await.unwrap());
    }

    #[tokio::test]
    async fn test_apply_chain_folds_in_concurrent_head() {
        let f = fixture().await;
        let mine = f.perms.add_admin(&f.key, &[]).await.unwrap();

        // A link chosen against the older head
        let theirs = ChainLink {
            chain: GroupId::new("theirs"),
            previous: f.owner_group.clone(),
        };
        f.perms
            .apply_chain(&f.key, Privilege::Admin, &theirs, &[f.other_leaf.clone()])
            .await
            .unwrap();

        let chain = f.perms.groups().get(&theirs.chain).await.unwrap().unwrap();
        assert!(chain.has_child(&mine.chain));
        assert!(f.perms.has_admin(&f.key, &f.owner).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_chain_is_rejected() {
        let f = fixture().await;
        let link = ChainLink {
            chain: GroupId::random(),
            previous: f.owner_group.clone(),
        };
        assert!(matches!(
            f.perms.apply_chain(&f.key, Privilege::Read, &link, &[]).await,
            Err(PermsError::InvalidPrivilege(Privilege::Read))
        ));
    }

    #[tokio::test]
    async fn test_reader_appends_in_place() {
        let f = fixture().await;
        let share = f
            .perms
            .groups()
            .new_group(names::SHARE, false, &[f.owner_group.clone()])
            .await
            .unwrap();
        let mut triple = f.perms.get_permissions(&f.key).await.unwrap().unwrap();
        triple.read = share.clone();
        f.perms.set_permissions(&f.key, &triple).await.unwrap();

        f.perms.add_reader(&f.key, &[f.other_leaf.clone()]).await.unwrap();
        let after = f.perms.get_permissions(&f.key).await.unwrap().unwrap();
        assert_eq!(after.read, share);
        assert!(f.perms.has_read(&f.key, &f.other).await.unwrap());
        assert!(!f.perms.has_write(&f.key, &f.other).await.unwrap());

        assert!(f.perms.remove_reader(&f.key, &f.other_leaf).await.unwrap());
        assert!(!f.perms.has_read(&f.key, &f.other).await.unwrap());
    }

    #[tokio::test]
    async fn test_linked_group_is_never_edited() {
        let f = fixture().await;
        let owner_leaf = GroupId::for_device(&f.owner);
        assert!(!f.perms.remove_writer(&f.key, &owner_leaf).await.unwrap());
        assert!(f.perms.has_write(&f.key, &f.owner).await.unwrap());
    }

    #[tokio::test]
    async fn test_unshare_data_sweeps_all_three() {
        let f = fixture().await;
        f.perms.add_admin(&f.key, &[f.other_leaf.clone()]).await.unwrap();
        f.perms.add_writer(&f.key, &[f.other_leaf.clone()]).await.unwrap();
        assert!(f.perms.has_admin(&f.key, &f.other).await.unwrap());

        assert!(f.perms.unshare_data(&f.key, &f.other_leaf).await.unwrap());
        assert!(!f.perms.has_read(&f.key, &f.other).await.unwrap());
        assert!(!f.perms.unshare_data(&f.key, &f.other_leaf).await.unwrap());
    }

    #[tokio::test]
    async fn test_all_lists_object_keys() {
        let f = fixture().await;
        let all = f.perms.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, f.key);
    }
}
