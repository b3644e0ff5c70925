//! The group graph.
//!
//! Groups live under `__group/<id>/` as CBOR records. Composite groups name
//! their children; device leaves have none. Resolution walks children edges
//! down to the leaves. Parent edges are bookkeeping used for cleanup and are
//! never followed during resolution.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use trellis_core::{namespace, DeviceKey, Group, GroupId, ObjectKey};
use trellis_store::{KvStore, StoreExt};

use crate::error::{PermsError, Result};

fn record_key(id: &GroupId) -> String {
    ObjectKey::group(id).as_str().to_string()
}

enum Visit {
    Enter(GroupId),
    Exit(GroupId),
}

/// Access to the group graph of one device.
pub struct GroupStore<S> {
    store: Arc<S>,
}

impl<S> Clone for GroupStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: KvStore> GroupStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn get(&self, id: &GroupId) -> Result<Option<Group>> {
        Ok(self.store.get_record(&record_key(id)).await?)
    }

    /// Write a group record as-is. Edges of other groups are untouched.
    pub async fn put(&self, group: &Group) -> Result<()> {
        self.store.put_record(&record_key(&group.id), group).await?;
        Ok(())
    }

    pub async fn exists(&self, id: &GroupId) -> Result<bool> {
        Ok(self.store.get(&record_key(id)).await?.is_some())
    }

    async fn require(&self, id: &GroupId) -> Result<Group> {
        self.get(id)
            .await?
            .ok_or_else(|| PermsError::GroupNotFound(id.clone()))
    }

    /// Every group record, ordered by id.
    pub async fn all(&self) -> Result<Vec<Group>> {
        let records = self.store.get_records::<Group>(namespace::GROUP).await?;
        Ok(records.into_iter().map(|(_, group)| group).collect())
    }

    /// Resolve group references to the device keys they currently denote.
    ///
    /// Missing groups and empty composites contribute nothing. Meeting a
    /// group that is already on the current path fails with
    /// [`PermsError::Cycle`] instead of looping.
    pub async fn resolve<'a, I>(&self, ids: I) -> Result<BTreeSet<DeviceKey>>
    where
        I: IntoIterator<Item = &'a GroupId> + Send,
    {
        let mut stack: Vec<Visit> = ids.into_iter().map(|id| Visit::Enter(id.clone())).collect();
        let mut on_path = HashSet::new();
        let mut done = HashSet::new();
        let mut devices = BTreeSet::new();

        while let Some(visit) = stack.pop() {
            let id = match visit {
                Visit::Exit(id) => {
                    on_path.remove(&id);
                    done.insert(id);
                    continue;
                }
                Visit::Enter(id) => id,
            };

            if done.contains(&id) {
                continue;
            }
            if on_path.contains(&id) {
                return Err(PermsError::Cycle(id));
            }

            let Some(group) = self.get(&id).await? else {
                done.insert(id);
                continue;
            };

            match group.children {
                None => {
                    if let Some(key) = id.device_key() {
                        devices.insert(key);
                    }
                    done.insert(id);
                }
                Some(children) => {
                    on_path.insert(id.clone());
                    stack.push(Visit::Exit(id));
                    stack.extend(children.into_iter().map(Visit::Enter));
                }
            }
        }

        Ok(devices)
    }

    /// Resolve a single group.
    pub async fn resolve_one(&self, id: &GroupId) -> Result<BTreeSet<DeviceKey>> {
        self.resolve([id]).await
    }

    /// Create a composite group under a fresh id.
    ///
    /// Each existing member gains the new group as a parent.
    pub async fn new_group(
        &self,
        name: &str,
        contact_level: bool,
        members: &[GroupId],
    ) -> Result<GroupId> {
        let id = GroupId::random();
        self.new_group_with_id(&id, name, contact_level, members)
            .await?;
        Ok(id)
    }

    /// Create a composite group under an id chosen elsewhere.
    ///
    /// Replaying the creation of an existing group only adds the members.
    pub async fn new_group_with_id(
        &self,
        id: &GroupId,
        name: &str,
        contact_level: bool,
        members: &[GroupId],
    ) -> Result<()> {
        if self.exists(id).await? {
            return self.add_to_group(id, members).await;
        }

        for member in members {
            if self.would_create_cycle(id, member).await? {
                return Err(PermsError::Cycle(member.clone()));
            }
        }

        let mut group = Group::composite(id.clone(), name, members.iter().cloned());
        group.contact_level = contact_level;
        self.put(&group).await?;

        for member in members {
            if let Some(mut child) = self.get(member).await? {
                if child.parents.insert(id.clone()) {
                    self.put(&child).await?;
                }
            }
        }

        tracing::debug!(group = %id, name, members = members.len(), "created group");
        Ok(())
    }

    /// Create (or refresh) the leaf for a device.
    pub async fn create_leaf(&self, key: &DeviceKey, name: &str) -> Result<GroupId> {
        let id = GroupId::for_device(key);
        match self.get(&id).await? {
            Some(mut existing) => {
                existing.name = name.to_string();
                self.put(&existing).await?;
            }
            None => self.put(&Group::leaf(key, name)).await?,
        }
        Ok(id)
    }

    /// Add members to a composite group, maintaining both edge directions.
    ///
    /// Members already present are left alone. Fails without changing
    /// anything if the group is a leaf or any new edge would close a cycle.
    pub async fn add_to_group(&self, group: &GroupId, members: &[GroupId]) -> Result<()> {
        let mut record = self.require(group).await?;
        if record.is_leaf() {
            return Err(PermsError::LeafGroup(group.clone()));
        }
        for member in members {
            if !record.has_child(member) && self.would_create_cycle(group, member).await? {
                return Err(PermsError::Cycle(member.clone()));
            }
        }

        let mut changed = false;
        if let Some(children) = record.children.as_mut() {
            for member in members {
                changed |= children.insert(member.clone());
            }
        }
        if changed {
            self.put(&record).await?;
        }

        for member in members {
            if let Some(mut child) = self.get(member).await? {
                if child.parents.insert(group.clone()) {
                    self.put(&child).await?;
                }
            }
        }
        Ok(())
    }

    /// Remove members from a group, maintaining both edge directions.
    pub async fn remove_from_group(&self, group: &GroupId, members: &[GroupId]) -> Result<()> {
        if let Some(mut record) = self.get(group).await? {
            if let Some(children) = record.children.as_mut() {
                let before = children.len();
                children.retain(|c| !members.contains(c));
                if children.len() != before {
                    self.put(&record).await?;
                }
            }
        }

        for member in members {
            if let Some(mut child) = self.get(member).await? {
                if child.parents.remove(group) {
                    self.put(&child).await?;
                }
            }
        }
        Ok(())
    }

    /// Add a single child edge. Returns whether anything changed.
    pub async fn add_child(&self, group: &GroupId, child: &GroupId) -> Result<bool> {
        let mut record = self.require(group).await?;
        if record.has_child(child) {
            return Ok(false);
        }
        if record.is_leaf() {
            return Err(PermsError::LeafGroup(group.clone()));
        }
        if self.would_create_cycle(group, child).await? {
            return Err(PermsError::Cycle(child.clone()));
        }
        if let Some(children) = record.children.as_mut() {
            children.insert(child.clone());
        }
        self.put(&record).await?;
        Ok(true)
    }

    /// Add a single parent edge. Returns whether anything changed.
    pub async fn add_parent(&self, group: &GroupId, parent: &GroupId) -> Result<bool> {
        let mut record = self.require(group).await?;
        if record.parents.contains(parent) {
            return Ok(false);
        }
        if self.would_create_cycle(parent, group).await? {
            return Err(PermsError::Cycle(parent.clone()));
        }
        record.parents.insert(parent.clone());
        self.put(&record).await?;
        Ok(true)
    }

    /// Drop a single parent edge. Returns whether anything changed.
    pub async fn remove_parent(&self, group: &GroupId, parent: &GroupId) -> Result<bool> {
        let Some(mut record) = self.get(group).await? else {
            return Ok(false);
        };
        if !record.parents.remove(parent) {
            return Ok(false);
        }
        self.put(&record).await?;
        Ok(true)
    }

    /// Store a group received from a peer, merging into any local record.
    ///
    /// A new group is stored as received. For an existing group the edge
    /// sets are unioned and the local name, kind, and contact flag win, so
    /// replays and partial views never remove local edges.
    pub async fn upsert(&self, incoming: &Group) -> Result<()> {
        let Some(mut local) = self.get(&incoming.id).await? else {
            for child in incoming.child_ids() {
                if self.would_create_cycle(&incoming.id, child).await? {
                    return Err(PermsError::Cycle(child.clone()));
                }
            }
            return self.put(incoming).await;
        };

        let mut changed = false;
        for parent in &incoming.parents {
            changed |= local.parents.insert(parent.clone());
        }

        let mut new_children = Vec::new();
        if !local.is_leaf() {
            for child in incoming.child_ids() {
                if !local.has_child(child) {
                    if self.would_create_cycle(&local.id, child).await? {
                        return Err(PermsError::Cycle(child.clone()));
                    }
                    new_children.push(child.clone());
                }
            }
        }
        if let Some(children) = local.children.as_mut() {
            changed |= !new_children.is_empty();
            children.extend(new_children);
        }

        if changed {
            self.put(&local).await?;
        }
        Ok(())
    }

    /// Remove a device leaf and every edge pointing at it.
    pub async fn delete_device(&self, device: &DeviceKey) -> Result<()> {
        self.remove_group(&GroupId::for_device(device)).await
    }

    /// Remove a group record and every edge pointing at it.
    ///
    /// Descendants are left in place even if nothing else reaches them.
    pub async fn remove_group(&self, id: &GroupId) -> Result<()> {
        for mut group in self.all().await? {
            if &group.id == id {
                continue;
            }
            let mut changed = group.parents.remove(id);
            if let Some(children) = group.children.as_mut() {
                changed |= children.remove(id);
            }
            if changed {
                self.put(&group).await?;
            }
        }
        self.store.remove(&record_key(id)).await?;
        tracing::debug!(group = %id, "removed group");
        Ok(())
    }

    /// The root and every group reachable from it, root first.
    ///
    /// Missing groups are skipped.
    pub async fn descendants(&self, root: &GroupId) -> Result<Vec<Group>> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([root.clone()]);
        let mut out = Vec::new();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(group) = self.get(&id).await? {
                queue.extend(group.child_ids().cloned());
                out.push(group);
            }
        }
        Ok(out)
    }

    /// A subtree ready to send to another device.
    ///
    /// Parent edges leading outside the subtree are stripped, since they
    /// name groups the receiver does not have.
    pub async fn export_subtree(&self, root: &GroupId) -> Result<Vec<Group>> {
        let mut groups = self.descendants(root).await?;
        let ids: BTreeSet<GroupId> = groups.iter().map(|g| g.id.clone()).collect();
        for group in &mut groups {
            group.parents.retain(|p| ids.contains(p));
        }
        Ok(groups)
    }

    /// Whether adding `child` under `parent` would close a cycle.
    pub async fn would_create_cycle(&self, parent: &GroupId, child: &GroupId) -> Result<bool> {
        if parent == child {
            return Ok(true);
        }
        let mut seen = HashSet::new();
        let mut stack = vec![child.clone()];
        while let Some(id) = stack.pop() {
            if &id == parent {
                return Ok(true);
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(group) = self.get(&id).await? {
                stack.extend(group.child_ids().cloned());
            }
        }
        Ok(false)
    }
}

/// Replace every occurrence of one group id with another in a set of records.
pub fn rename_in_subtree(groups: &mut [Group], from: &GroupId, to: &GroupId) {
    let swap = |set: &mut BTreeSet<GroupId>| {
        if set.remove(from) {
            set.insert(to.clone());
        }
    };
    for group in groups {
        if &group.id == from {
            group.id = to.clone();
        }
        swap(&mut group.parents);
        if let Some(children) = group.children.as_mut() {
            swap(children);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::Keypair;
    use trellis_store::MemoryStore;

    fn store() -> GroupStore<MemoryStore> {
        GroupStore::new(Arc::new(MemoryStore::new()))
    }

    async fn leaf(groups: &GroupStore<MemoryStore>) -> (DeviceKey, GroupId) {
        let key = Keypair::generate().device_key();
        let id = groups.create_leaf(&key, "device").await.unwrap();
        (key, id)
    }

    #[tokio::test]
    async fn test_resolve_leaf_and_composite() {
        let groups = store();
        let (a, la) = leaf(&groups).await;
        let (b, lb) = leaf(&groups).await;
        let g = groups
            .new_group("pair", false, &[la.clone(), lb.clone()])
            .await
            .unwrap();

        assert_eq!(groups.resolve_one(&la).await.unwrap(), BTreeSet::from([a]));
        assert_eq!(
            groups.resolve_one(&g).await.unwrap(),
            BTreeSet::from([a, b])
        );

        // Members learn their parent
        let record = groups.get(&la).await.unwrap().unwrap();
        assert!(record.parents.contains(&g));
    }

    #[tokio::test]
    async fn test_resolve_missing_and_empty() {
        let groups = store();
        let empty = groups.new_group("empty", false, &[]).await.unwrap();
        assert!(groups.resolve_one(&empty).await.unwrap().is_empty());
        assert!(groups
            .resolve_one(&GroupId::new("nowhere"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_resolve_diamond_once() {
        let groups = store();
        let (a, la) = leaf(&groups).await;
        let left = groups.new_group("l", false, &[la.clone()]).await.unwrap();
        let right = groups.new_group("r", false, &[la.clone()]).await.unwrap();
        let top = groups.new_group("t", false, &[left, right]).await.unwrap();
        assert_eq!(groups.resolve_one(&top).await.unwrap(), BTreeSet::from([a]));
    }

    #[tokio::test]
    async fn test_resolve_detects_cycle() {
        let groups = store();
        // Write records directly; the edge-adding API refuses to build this.
        let x = GroupId::new("x");
        let y = GroupId::new("y");
        groups
            .put(&Group::composite(x.clone(), "x", [y.clone()]))
            .await
            .unwrap();
        groups
            .put(&Group::composite(y.clone(), "y", [x.clone()]))
            .await
            .unwrap();

        assert!(matches!(
            groups.resolve_one(&x).await,
            Err(PermsError::Cycle(_))
        ));
    }

    #[tokio::test]
    async fn test_add_to_group_rejects_cycle() {
        let groups = store();
        let inner = groups.new_group("inner", false, &[]).await.unwrap();
        let outer = groups.new_group("outer", false, &[inner.clone()]).await.unwrap();

        let result = groups.add_to_group(&inner, &[outer.clone()]).await;
        assert!(matches!(result, Err(PermsError::Cycle(_))));
        assert!(matches!(
            groups.add_to_group(&inner, &[inner.clone()]).await,
            Err(PermsError::Cycle(_))
        ));

        // Nothing was written
        let record = groups.get(&inner).await.unwrap().unwrap();
        assert_eq!(record.child_ids().count(), 0);
    }

    #[tokio::test]
    async fn test_add_to_leaf_fails() {
        let groups = store();
        let (_, la) = leaf(&groups).await;
        let (_, lb) = leaf(&groups).await;
        assert!(matches!(
            groups.add_to_group(&la, &[lb]).await,
            Err(PermsError::LeafGroup(_))
        ));
    }

    #[tokio::test]
    async fn test_add_child_is_idempotent() {
        let groups = store();
        let (_, la) = leaf(&groups).await;
        let g = groups.new_group("g", false, &[]).await.unwrap();

        assert!(groups.add_child(&g, &la).await.unwrap());
        assert!(!groups.add_child(&g, &la).await.unwrap());

        let record = groups.get(&g).await.unwrap().unwrap();
        assert_eq!(record.child_ids().filter(|c| **c == la).count(), 1);
    }

    #[tokio::test]
    async fn test_remove_from_group_is_symmetric() {
        let groups = store();
        let (a, la) = leaf(&groups).await;
        let (b, lb) = leaf(&groups).await;
        let g = groups
            .new_group("g", false, &[la.clone(), lb.clone()])
            .await
            .unwrap();

        groups.remove_from_group(&g, &[la.clone()]).await.unwrap();
        assert_eq!(groups.resolve_one(&g).await.unwrap(), BTreeSet::from([b]));
        assert!(!groups.get(&la).await.unwrap().unwrap().parents.contains(&g));
        assert!(!groups.resolve_one(&g).await.unwrap().contains(&a));
    }

    #[tokio::test]
    async fn test_delete_device_clears_every_parent() {
        let groups = store();
        let (a, la) = leaf(&groups).await;
        let (b, lb) = leaf(&groups).await;
        let p1 = groups.new_group("p1", false, &[la.clone(), lb.clone()]).await.unwrap();
        let p2 = groups.new_group("p2", false, &[la.clone()]).await.unwrap();

        // A parent the leaf does not know about
        let stale = GroupId::new("stale");
        groups
            .put(&Group::composite(stale.clone(), "stale", [la.clone()]))
            .await
            .unwrap();

        groups.delete_device(&a).await.unwrap();

        for parent in [&p1, &p2, &stale] {
            assert!(!groups.resolve_one(parent).await.unwrap().contains(&a));
        }
        assert_eq!(groups.resolve_one(&p1).await.unwrap(), BTreeSet::from([b]));
        assert!(!groups.exists(&la).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_group_is_not_recursive() {
        let groups = store();
        let (_, la) = leaf(&groups).await;
        let g = groups.new_group("g", false, &[la.clone()]).await.unwrap();
        let top = groups.new_group("top", false, &[g.clone()]).await.unwrap();

        groups.remove_group(&g).await.unwrap();

        assert!(!groups.exists(&g).await.unwrap());
        assert!(groups.exists(&la).await.unwrap());
        assert!(groups.get(&la).await.unwrap().unwrap().parents.is_empty());
        assert_eq!(groups.get(&top).await.unwrap().unwrap().child_ids().count(), 0);
    }

    #[tokio::test]
    async fn test_upsert_merges_edges() {
        let groups = store();
        let (_, la) = leaf(&groups).await;
        let (_, lb) = leaf(&groups).await;
        let g = groups.new_group("local", true, &[la.clone()]).await.unwrap();

        let mut incoming = Group::composite(g.clone(), "remote", [lb.clone()]);
        incoming.parents.insert(GroupId::new("p"));
        groups.upsert(&incoming).await.unwrap();

        let merged = groups.get(&g).await.unwrap().unwrap();
        assert_eq!(merged.name, "local");
        assert!(merged.contact_level);
        assert!(merged.has_child(&la));
        assert!(merged.has_child(&lb));
        assert!(merged.parents.contains(&GroupId::new("p")));

        // Replaying changes nothing
        groups.upsert(&incoming).await.unwrap();
        assert_eq!(groups.get(&g).await.unwrap().unwrap(), merged);
    }

    #[tokio::test]
    async fn test_export_subtree_trims_outside_parents() {
        let groups = store();
        let (_, la) = leaf(&groups).await;
        let root = groups.new_group("root", false, &[la.clone()]).await.unwrap();
        let _other = groups.new_group("other", false, &[la.clone()]).await.unwrap();

        let subtree = groups.export_subtree(&root).await.unwrap();
        assert_eq!(subtree.len(), 2);
        assert_eq!(subtree[0].id, root);
        let exported_leaf = subtree.iter().find(|g| g.id == la).unwrap();
        assert_eq!(exported_leaf.parents, BTreeSet::from([root]));
    }

    #[test]
    fn test_rename_in_subtree() {
        let temp = GroupId::new("temp");
        let linked = GroupId::new("linked");
        let key = Keypair::generate().device_key();
        let mut leaf = Group::leaf(&key, "phone");
        leaf.parents.insert(temp.clone());
        let mut groups = vec![Group::composite(temp.clone(), "linked", [leaf.id.clone()]), leaf];

        rename_in_subtree(&mut groups, &temp, &linked);

        assert_eq!(groups[0].id, linked);
        assert!(groups[1].parents.contains(&linked));
        assert!(!groups[1].parents.contains(&temp));
    }

    proptest::proptest! {
        #[test]
        fn test_resolve_matches_union_of_children(edges in proptest::collection::vec((0usize..8, 0usize..8), 0..24)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let groups = store();
                let mut keys = Vec::new();
                let mut leaves = Vec::new();
                for _ in 0..4 {
                    let (k, l) = leaf(&groups).await;
                    keys.push(k);
                    leaves.push(l);
                }
                let ids: Vec<GroupId> = (0..8).map(|i| GroupId::new(format!("g{i}"))).collect();
                for id in &ids {
                    groups.put(&Group::composite(id.clone(), "g", [])).await.unwrap();
                }
                // Edges only point from lower to higher index, so the graph is acyclic
                for (from, to) in &edges {
                    let (from, to) = (*from.min(to), *from.max(to));
                    if from != to {
                        groups.add_to_group(&ids[from], &[ids[to].clone()]).await.unwrap();
                    }
                    groups.add_to_group(&ids[to], &[leaves[to % 4].clone()]).await.unwrap();
                }

                for id in &ids {
                    let record = groups.get(id).await.unwrap().unwrap();
                    let mut expected = BTreeSet::new();
                    for child in record.child_ids() {
                        expected.extend(groups.resolve_one(child).await.unwrap());
                    }
                    assert_eq!(groups.resolve_one(id).await.unwrap(), expected);
                }
            });
        }
    }
}
