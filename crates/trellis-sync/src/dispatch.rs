//! The permission gate.
//!
//! Every operation, whether it arrives from a peer or is originated here,
//! goes through the same three steps against local state only:
//!
//! 1. **Dependencies**: if a referenced group or triple is missing, the
//!    operation is parked (inbound) or refused (local).
//! 2. **Authorization**: a predicate per operation kind.
//! 3. **Apply**: a set-based edit or overwrite, so duplicates are no-ops.
//!
//! Handshake operations stop after step 2 and are handed back to the device.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use trellis_core::{DeviceKey, GroupId, ObjectKey, PermissionTriple, Privilege};
use trellis_perms::permission::triple_holds;
use trellis_perms::{
    now_millis, ChainLink, DataStore, GroupStore, IdentityStore, PermissionStore, PermsError,
};
use trellis_store::KvStore;

use crate::error::{Result, SyncError};
use crate::events::{DispatchEvent, Disposition};
use crate::operation::{Operation, OperationKind};
use crate::pending::{Deferred, Dependency, PendingQueue};
use crate::rejection::Rejection;

/// Application hook run on every data write, local or remote.
pub type Validator = Arc<dyn Fn(&ObjectKey, &Value) -> std::result::Result<(), String> + Send + Sync>;

/// Dispatcher configuration.
#[derive(Clone)]
pub struct DispatcherConfig {
    /// How long a pending link request stays acceptable.
    pub link_timeout: Duration,
    /// Maximum number of parked operations.
    pub max_deferred: usize,
    /// Maximum number of parked operations from a single sender.
    pub max_deferred_per_sender: usize,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Optional data validator.
    pub validator: Option<Validator>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            link_timeout: Duration::from_secs(300),
            max_deferred: 1024,
            max_deferred_per_sender: 256,
            event_capacity: 256,
            validator: None,
        }
    }
}

impl std::fmt::Debug for DispatcherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherConfig")
            .field("link_timeout", &self.link_timeout)
            .field("max_deferred", &self.max_deferred)
            .field("max_deferred_per_sender", &self.max_deferred_per_sender)
            .field("event_capacity", &self.event_capacity)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

/// Map errors raised while applying an edit that breaks graph structure.
fn structural(e: PermsError) -> SyncError {
    match e {
        PermsError::Cycle(_)
        | PermsError::LeafGroup(_)
        | PermsError::GroupNotFound(_)
        | PermsError::InvalidPrivilege(_) => {
            Rejection::DataInvariantViolated(e.to_string()).into()
        }
        other => other.into(),
    }
}

/// Map errors raised while resolving groups for a privilege check.
fn gate(e: PermsError) -> SyncError {
    match e {
        PermsError::Cycle(_) => Rejection::PermissionDenied(e.to_string()).into(),
        other => other.into(),
    }
}

/// Authorizes and applies operations for one device.
pub struct Dispatcher<S> {
    local: DeviceKey,
    groups: GroupStore<S>,
    perms: PermissionStore<S>,
    data: DataStore<S>,
    identity: IdentityStore<S>,
    config: DispatcherConfig,
    pending: Mutex<PendingQueue>,
    events: broadcast::Sender<DispatchEvent>,
}

impl<S: KvStore> Dispatcher<S> {
    pub fn new(store: Arc<S>, local: DeviceKey, config: DispatcherConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            local,
            groups: GroupStore::new(store.clone()),
            perms: PermissionStore::new(store.clone()),
            data: DataStore::new(store.clone()),
            identity: IdentityStore::new(store),
            pending: Mutex::new(PendingQueue::new(
                config.max_deferred,
                config.max_deferred_per_sender,
            )),
            config,
            events,
        }
    }

    pub fn local_key(&self) -> DeviceKey {
        self.local
    }

    pub fn groups(&self) -> &GroupStore<S> {
        &self.groups
    }

    pub fn perms(&self) -> &PermissionStore<S> {
        &self.perms
    }

    pub fn data(&self) -> &DataStore<S> {
        &self.data
    }

    pub fn identity(&self) -> &IdentityStore<S> {
        &self.identity
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Subscribe to dispatch outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    /// Number of parked operations.
    pub fn deferred_len(&self) -> usize {
        self.pending_queue().len()
    }

    /// Drop every parked operation.
    pub fn clear_deferred(&self) {
        self.pending_queue().clear();
    }

    fn pending_queue(&self) -> MutexGuard<'_, PendingQueue> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish an event. Nobody listening is fine.
    pub fn notify(&self, event: DispatchEvent) {
        let _ = self.events.send(event);
    }

    /// Record a rejection locally. Nothing is sent to the sender.
    pub fn reject(&self, sender: DeviceKey, kind: Option<OperationKind>, reason: Rejection) {
        tracing::warn!(
            sender = %sender,
            kind = kind.map(|k| k.as_str()).unwrap_or("undecodable"),
            reason = %reason,
            "rejected operation"
        );
        self.notify(DispatchEvent::Rejected {
            sender,
            kind,
            reason,
        });
    }

    /// Decode and dispatch a frame from a peer.
    pub async fn handle_frame(&self, sender: DeviceKey, bytes: &[u8]) -> Result<Disposition> {
        match Operation::from_bytes(bytes) {
            Ok(operation) => self.dispatch(sender, operation).await,
            Err(reason) => {
                self.reject(sender, None, reason.clone());
                Ok(Disposition::Rejected(reason))
            }
        }
    }

    /// Dispatch an operation received from a peer.
    ///
    /// Rejections are reported through the returned [`Disposition`] and the
    /// event channel; only local storage failures are errors.
    pub async fn dispatch(&self, sender: DeviceKey, operation: Operation) -> Result<Disposition> {
        let disposition = self.process(sender, operation).await?;
        if disposition == Disposition::Applied {
            self.retry_deferred().await?;
        }
        Ok(disposition)
    }

    /// Authorize and apply an operation originated on this device.
    ///
    /// Unlike [`Dispatcher::dispatch`], nothing is parked: a missing
    /// dependency or a failed check is returned as an error.
    pub async fn execute(&self, operation: &Operation) -> Result<()> {
        let kind = operation.kind();
        if kind.is_bootstrap() {
            return Err(Rejection::InvalidMessage(format!("{kind} is not applied locally")).into());
        }
        self.check_well_formed(operation)?;
        if let Some(missing) = self.missing_dependency(operation).await? {
            return Err(SyncError::MissingDependency(missing));
        }
        self.authorize(operation, &self.local).await?;
        self.apply(operation).await?;
        self.notify(DispatchEvent::Applied {
            sender: self.local,
            kind,
        });
        self.retry_deferred().await
    }

    async fn process(&self, sender: DeviceKey, operation: Operation) -> Result<Disposition> {
        let kind = operation.kind();

        if let Err(reason) = self.check_well_formed(&operation) {
            self.reject(sender, Some(kind), reason.clone());
            return Ok(Disposition::Rejected(reason));
        }

        if !kind.is_bootstrap() {
            if let Some(missing) = self.missing_dependency(&operation).await? {
                self.defer(sender, operation, missing);
                return Ok(Disposition::Deferred);
            }
        }

        let outcome = match self.authorize(&operation, &sender).await {
            Ok(()) if kind.is_bootstrap() => return Ok(Disposition::Bootstrap(operation)),
            Ok(()) => self.apply(&operation).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                tracing::debug!(sender = %sender, kind = %kind, "applied operation");
                self.notify(DispatchEvent::Applied { sender, kind });
                Ok(Disposition::Applied)
            }
            Err(SyncError::Rejected(reason)) => {
                self.reject(sender, Some(kind), reason.clone());
                Ok(Disposition::Rejected(reason))
            }
            Err(e) => Err(e),
        }
    }

    fn defer(&self, sender: DeviceKey, operation: Operation, missing: Dependency) {
        let kind = operation.kind();
        tracing::debug!(sender = %sender, kind = %kind, missing = %missing, "deferring operation");
        self.notify(DispatchEvent::Deferred {
            sender,
            kind,
            missing: missing.clone(),
        });

        let evicted = self.pending_queue().push(Deferred {
            sender,
            operation,
            missing,
        });
        if let Some(evicted) = evicted {
            let kind = evicted.operation.kind();
            tracing::warn!(sender = %evicted.sender, kind = %kind, "deferred queue full, dropping oldest");
            self.notify(DispatchEvent::Evicted {
                sender: evicted.sender,
                kind,
            });
        }
    }

    /// Retry parked operations until a pass makes no progress.
    async fn retry_deferred(&self) -> Result<()> {
        loop {
            let entries = self.pending_queue().drain();
            if entries.is_empty() {
                return Ok(());
            }

            let mut progressed = false;
            for entry in entries {
                match self.missing_dependency(&entry.operation).await? {
                    Some(missing) => {
                        self.pending_queue().push(Deferred { missing, ..entry });
                    }
                    None => {
                        progressed = true;
                        self.process(entry.sender, entry.operation).await?;
                    }
                }
            }

            if !progressed {
                return Ok(());
            }
        }
    }

    /// Reject keys and ids that would escape their namespace.
    fn check_well_formed(&self, operation: &Operation) -> std::result::Result<(), Rejection> {
        let bad_id = |id: &GroupId| id.as_str().is_empty() || id.as_str().contains('/');
        let bad_object = |key: &ObjectKey| key.as_group().is_none() && key.as_data().is_none();

        let ok = match operation {
            Operation::UpdateData { key, .. } | Operation::DeleteData { key } => {
                key.as_data().is_some()
            }
            Operation::AddWriter { key, chain, previous, members }
            | Operation::AddAdmin { key, chain, previous, members } => {
                !bad_object(key) && !bad_id(chain) && !bad_id(previous) && !members.iter().any(bad_id)
            }
            Operation::RemoveWriter { key, member } | Operation::RemoveAdmin { key, member } => {
                !bad_object(key) && !bad_id(member)
            }
            Operation::UpdateGroup { group, .. } => {
                !bad_id(&group.id) && !group.child_ids().any(bad_id)
            }
            Operation::LinkGroups { parent, child } => !bad_id(parent) && !bad_id(child),
            Operation::AddChild { group, child } => !bad_id(group) && !bad_id(child),
            Operation::AddParent { group, parent } | Operation::RemoveParent { group, parent } => {
                !bad_id(group) && !bad_id(parent)
            }
            Operation::DeleteGroup { group } => !bad_id(group),
            _ => true,
        };

        if ok {
            Ok(())
        } else {
            Err(Rejection::InvalidMessage(format!(
                "{} references a malformed key",
                operation.kind()
            )))
        }
    }

    /// The first piece of local state the operation needs but does not find.
    pub async fn missing_dependency(&self, operation: &Operation) -> Result<Option<Dependency>> {
        match operation {
            Operation::LinkGroups { parent, child } => self.first_missing(&[parent, child]).await,
            Operation::AddParent { group, parent } | Operation::RemoveParent { group, parent } => {
                self.first_missing(&[group, parent]).await
            }
            Operation::AddChild { group, .. } => self.first_missing(&[group]).await,
            Operation::AddWriter { key, .. }
            | Operation::AddAdmin { key, .. }
            | Operation::RemoveWriter { key, .. }
            | Operation::RemoveAdmin { key, .. } => {
                if self.perms.get_permissions(key).await?.is_some() {
                    Ok(None)
                } else {
                    Ok(Some(Dependency::Object(key.clone())))
                }
            }
            Operation::UpdateGroup { group, permissions } => {
                let key = ObjectKey::group(&group.id);
                if self.perms.get_permissions(&key).await?.is_some() {
                    return Ok(None);
                }
                match permissions {
                    Some(carried) if carried.admin != group.id => {
                        self.first_missing(&[&carried.admin]).await
                    }
                    Some(_) => Ok(None),
                    None => Ok(Some(Dependency::Object(key))),
                }
            }
            Operation::UpdateData { key, permissions, .. } => {
                if self.perms.get_permissions(key).await?.is_some() {
                    return Ok(None);
                }
                match permissions {
                    Some(carried) => self.first_missing(&[&carried.write, &carried.admin]).await,
                    None => Ok(Some(Dependency::Object(key.clone()))),
                }
            }
            _ => Ok(None),
        }
    }

    async fn first_missing(&self, ids: &[&GroupId]) -> Result<Option<Dependency>> {
        for id in ids {
            if !self.groups.exists(id).await? {
                return Ok(Some(Dependency::Group((*id).clone())));
            }
        }
        Ok(None)
    }

    async fn triple_allows(
        &self,
        triple: &PermissionTriple,
        privilege: Privilege,
        sender: &DeviceKey,
    ) -> Result<bool> {
        triple_holds(&self.groups, triple, privilege, sender)
            .await
            .map_err(gate)
    }

    async fn object_allows(
        &self,
        key: &ObjectKey,
        privilege: Privilege,
        sender: &DeviceKey,
    ) -> Result<bool> {
        self.perms.holds(key, privilege, sender).await.map_err(gate)
    }

    async fn require_group_admin(&self, group: &GroupId, sender: &DeviceKey) -> Result<()> {
        if self
            .object_allows(&ObjectKey::group(group), Privilege::Admin, sender)
            .await?
        {
            Ok(())
        } else {
            Err(Rejection::InsufficientGroupPermissions(group.clone()).into())
        }
    }

    async fn require_object_admin(&self, key: &ObjectKey, sender: &DeviceKey) -> Result<()> {
        if self.object_allows(key, Privilege::Admin, sender).await? {
            return Ok(());
        }
        Err(match key.as_group() {
            Some(group) => Rejection::InsufficientGroupPermissions(group),
            None => Rejection::InsufficientDataPermissions(key.clone()),
        }
        .into())
    }

    async fn is_pending_link(&self, sender: &DeviceKey) -> Result<bool> {
        Ok(self
            .identity
            .pending_link()
            .await?
            .is_some_and(|p| &p.key == sender))
    }

    /// The permission predicate for an operation, against local state only.
    pub async fn authorize(&self, operation: &Operation, sender: &DeviceKey) -> Result<()> {
        match operation {
            Operation::RequestUpdateLinked { .. }
            | Operation::RequestContact { .. }
            | Operation::ConfirmContact { .. } => Ok(()),

            Operation::ConfirmUpdateLinked { .. } => match self.identity.pending_link().await? {
                Some(pending) if &pending.key == sender => {
                    if pending.is_expired(now_millis(), self.config.link_timeout) {
                        Err(Rejection::Expired(format!("link request to {sender} timed out")).into())
                    } else {
                        Ok(())
                    }
                }
                _ => Err(Rejection::PermissionDenied(format!("no pending link with {sender}")).into()),
            },

            Operation::LinkGroups { parent, child } => {
                self.require_group_admin(parent, sender).await?;
                self.require_group_admin(child, sender).await
            }

            Operation::DeleteDevice { device } => {
                let leaf = ObjectKey::group(&GroupId::for_device(device));
                if self.object_allows(&leaf, Privilege::Admin, sender).await? {
                    Ok(())
                } else {
                    Err(Rejection::PermissionDenied(format!(
                        "{sender} may not delete device {device}"
                    ))
                    .into())
                }
            }

            Operation::UpdateGroup { group, permissions } => {
                let key = ObjectKey::group(&group.id);
                let allowed = match self.perms.get_permissions(&key).await? {
                    Some(local) => self.triple_allows(&local, Privilege::Admin, sender).await?,
                    None => match permissions {
                        Some(carried) if carried.admin != group.id => {
                            self.triple_allows(carried, Privilege::Admin, sender).await?
                        }
                        _ => false,
                    },
                };
                if allowed {
                    Ok(())
                } else {
                    Err(Rejection::InsufficientGroupPermissions(group.id.clone()).into())
                }
            }

            Operation::AddParent { parent, .. } | Operation::RemoveParent { parent, .. } => {
                self.require_group_admin(parent, sender).await
            }

            Operation::AddChild { group, .. } => self.require_group_admin(group, sender).await,

            Operation::AddWriter { key, .. }
            | Operation::AddAdmin { key, .. }
            | Operation::RemoveWriter { key, .. }
            | Operation::RemoveAdmin { key, .. } => self.require_object_admin(key, sender).await,

            Operation::DeleteGroup { group } => {
                if !self.groups.exists(group).await? || self.is_pending_link(sender).await? {
                    return Ok(());
                }
                self.require_group_admin(group, sender).await
            }

            Operation::UpdateData {
                key,
                value,
                permissions,
            } => {
                if let Some(validator) = &self.config.validator {
                    (**validator)(key, value).map_err(Rejection::DataInvariantViolated)?;
                }
                let denied = || Rejection::InsufficientDataPermissions(key.clone());
                match self.perms.get_permissions(key).await? {
                    Some(local) => {
                        if !self.triple_allows(&local, Privilege::Write, sender).await? {
                            return Err(denied().into());
                        }
                        let changes_triple = permissions.as_ref().is_some_and(|t| t != &local);
                        if changes_triple
                            && !self.triple_allows(&local, Privilege::Admin, sender).await?
                        {
                            return Err(denied().into());
                        }
                        Ok(())
                    }
                    None => match permissions {
                        Some(carried)
                            if self.triple_allows(carried, Privilege::Write, sender).await? =>
                        {
                            Ok(())
                        }
                        _ => Err(denied().into()),
                    },
                }
            }

            Operation::DeleteData { key } => {
                if self.object_allows(key, Privilege::Write, sender).await? {
                    Ok(())
                } else {
                    Err(Rejection::InsufficientDataPermissions(key.clone()).into())
                }
            }
        }
    }

    /// Mutate local state. Assumes the operation was authorized.
    async fn apply(&self, operation: &Operation) -> Result<()> {
        match operation {
            Operation::LinkGroups { parent, child } => {
                self.groups
                    .add_to_group(parent, std::slice::from_ref(child))
                    .await
                    .map_err(structural)?;
            }
            Operation::AddParent { group, parent } => {
                self.groups
                    .add_parent(group, parent)
                    .await
                    .map_err(structural)?;
            }
            Operation::AddChild { group, child } => {
                self.groups
                    .add_child(group, child)
                    .await
                    .map_err(structural)?;
            }
            Operation::RemoveParent { group, parent } => {
                self.groups.remove_parent(group, parent).await?;
            }
            Operation::AddWriter {
                key,
                chain,
                previous,
                members,
            } => {
                let link = ChainLink {
                    chain: chain.clone(),
                    previous: previous.clone(),
                };
                self.perms
                    .apply_chain(key, Privilege::Write, &link, members)
                    .await
                    .map_err(structural)?;
            }
            Operation::AddAdmin {
                key,
                chain,
                previous,
                members,
            } => {
                let link = ChainLink {
                    chain: chain.clone(),
                    previous: previous.clone(),
                };
                self.perms
                    .apply_chain(key, Privilege::Admin, &link, members)
                    .await
                    .map_err(structural)?;
            }
            Operation::RemoveWriter { key, member } => {
                self.perms.remove_writer(key, member).await?;
            }
            Operation::RemoveAdmin { key, member } => {
                self.perms.remove_admin(key, member).await?;
            }
            Operation::UpdateGroup { group, permissions } => {
                self.groups.upsert(group).await.map_err(structural)?;
                let key = ObjectKey::group(&group.id);
                if let Some(triple) = permissions {
                    if self.perms.get_permissions(&key).await?.is_none() {
                        self.perms.set_permissions(&key, triple).await?;
                    }
                }
            }
            Operation::UpdateData {
                key,
                value,
                permissions,
            } => {
                self.data.set(key, value).await?;
                if let Some(triple) = permissions {
                    self.perms.set_permissions(key, triple).await?;
                }
            }
            Operation::DeleteDevice { device } => {
                if device == &self.local {
                    self.identity.clear_all().await?;
                    self.clear_deferred();
                } else {
                    self.groups.delete_device(device).await?;
                    self.perms
                        .remove_permissions(&ObjectKey::group(&GroupId::for_device(device)))
                        .await?;
                }
            }
            Operation::DeleteGroup { group } => {
                self.groups.remove_group(group).await?;
                self.perms
                    .remove_permissions(&ObjectKey::group(group))
                    .await?;
            }
            Operation::DeleteData { key } => {
                self.data.remove(key).await?;
                self.perms.remove_permissions(key).await?;
            }
            Operation::RequestUpdateLinked { .. }
            | Operation::ConfirmUpdateLinked { .. }
            | Operation::RequestContact { .. }
            | Operation::ConfirmContact { .. } => {
                return Err(Rejection::InvalidMessage(format!(
                    "{} has no local apply",
                    operation.kind()
                ))
                .into());
            }
        }
        Ok(())
    }
}
