//! Reclamation of synthetic groups.
//!
//! Writer and admin grants leave a chain of links behind, and unsharing can
//! strand sharing groups. Nothing here runs implicitly: compacting a chain
//! discards the record of who was granted what, in which order.

use std::collections::{BTreeSet, HashSet};

use trellis_core::{names, GroupId, ObjectKey, Privilege};
use trellis_store::KvStore;

use crate::error::{PermsError, Result};
use crate::permission::PermissionStore;

impl<S: KvStore> PermissionStore<S> {
    /// Flatten a writer or admin chain into its head.
    ///
    /// Intermediate links that no other triple references are dissolved:
    /// their children move up to the head and the links are deleted. The
    /// head resolves to the same devices before and after. Returns the
    /// number of deleted links.
    pub async fn compact_chain(&self, key: &ObjectKey, privilege: Privilege) -> Result<usize> {
        if privilege == Privilege::Read {
            return Err(PermsError::InvalidPrivilege(privilege));
        }
        let triple = self
            .get_permissions(key)
            .await?
            .ok_or_else(|| PermsError::NoPermissions(key.clone()))?;
        let head_id = triple.get(privilege).clone();
        let groups = self.groups();

        let Some(mut head) = groups.get(&head_id).await? else {
            return Ok(0);
        };
        if head.name != privilege.chain_name() {
            return Ok(0);
        }

        let referenced = self.referenced_groups().await?;
        let mut dissolved = Vec::new();
        let mut members = BTreeSet::new();
        let mut seen = HashSet::from([head_id.clone()]);
        let mut stack: Vec<GroupId> = head.child_ids().cloned().collect();

        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            match groups.get(&id).await? {
                Some(link)
                    if link.name == privilege.chain_name() && !referenced.contains(&id) =>
                {
                    stack.extend(link.child_ids().cloned());
                    dissolved.push(id);
                }
                _ => {
                    members.insert(id);
                }
            }
        }

        if dissolved.is_empty() {
            return Ok(0);
        }

        head.children = Some(members.clone());
        groups.put(&head).await?;
        for link in &dissolved {
            groups.remove_group(link).await?;
            self.remove_permissions(&ObjectKey::group(link)).await?;
        }
        for member in &members {
            if let Some(mut child) = groups.get(member).await? {
                if child.parents.insert(head_id.clone()) {
                    groups.put(&child).await?;
                }
            }
        }

        tracing::info!(object = %key, ?privilege, removed = dissolved.len(), "compacted chain");
        Ok(dissolved.len())
    }

    /// Delete synthetic groups that nothing points at any more.
    ///
    /// A sharing group or chain link is an orphan when it has no parents and
    /// no triple other than its own references it. Deleting one may orphan
    /// its children, so the sweep repeats until nothing changes.
    pub async fn sweep_orphans(&self) -> Result<Vec<GroupId>> {
        let groups = self.groups();
        let mut removed = Vec::new();

        loop {
            let referenced = self.referenced_groups().await?;
            let orphans: Vec<GroupId> = groups
                .all()
                .await?
                .into_iter()
                .filter(|g| {
                    matches!(g.name.as_str(), names::SHARE | names::WRITERS | names::ADMINS)
                        && g.parents.is_empty()
                        && !referenced.contains(&g.id)
                })
                .map(|g| g.id)
                .collect();

            if orphans.is_empty() {
                break;
            }
            for id in orphans {
                groups.remove_group(&id).await?;
                self.remove_permissions(&ObjectKey::group(&id)).await?;
                removed.push(id);
            }
        }

        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "swept orphaned groups");
        }
        Ok(removed)
    }

    /// Groups named by a triple, ignoring a group's own triple.
    async fn referenced_groups(&self) -> Result<HashSet<GroupId>> {
        let mut referenced = HashSet::new();
        for (key, triple) in self.all().await? {
            let owner = key.as_group();
            for id in triple.groups() {
                if owner.as_ref() != Some(id) {
                    referenced.insert(id.clone());
                }
            }
        }
        Ok(referenced)
    }
}
