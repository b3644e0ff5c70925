//! The Device: one participant's view of its identity, contacts, and data.
//!
//! Every mutating call builds a batch of operations, applies the ones meant
//! for this device through the dispatcher (so local changes pass the same
//! permission gate as remote ones), and only then hands the batch to the
//! transport.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use trellis_core::{names, DeviceKey, GroupId, ObjectKey, PermissionTriple, Privilege};
use trellis_perms::permission::triple_holds;
use trellis_perms::{DataStore, GroupStore, Identity, IdentityStore, PermissionStore};
use trellis_store::KvStore;
use trellis_sync::{DispatchEvent, Dispatcher, Disposition, Operation, Rejection, Transport};

use crate::config::DeviceConfig;
use crate::confirm::Confirm;
use crate::error::{DeviceError, Result};
use crate::outbox::Outbox;

/// What a garbage-collection pass reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GarbageReport {
    /// Chain links folded into their heads.
    pub compacted: usize,
    /// Orphaned synthetic groups deleted.
    pub swept: usize,
}

/// A device participating in a Trellis identity.
pub struct Device<S, T> {
    key: DeviceKey,
    dispatcher: Dispatcher<S>,
    transport: Arc<T>,
    pub(crate) confirm: Arc<dyn Confirm>,
    config: DeviceConfig,
    /// Serialises API calls and inbound handling.
    pub(crate) guard: Mutex<()>,
}

impl<S: KvStore, T: Transport> Device<S, T> {
    /// Create a device over a store and a transport.
    ///
    /// The device key is the transport's local key. Nothing is written until
    /// [`Device::create_device`] or [`Device::create_linked_device`].
    pub fn new(
        store: Arc<S>,
        transport: Arc<T>,
        confirm: Arc<dyn Confirm>,
        config: DeviceConfig,
    ) -> Self {
        let key = transport.local_key();
        Self {
            key,
            dispatcher: Dispatcher::new(store, key, config.dispatcher_config()),
            transport,
            confirm,
            config,
            guard: Mutex::new(()),
        }
    }

    pub fn key(&self) -> DeviceKey {
        self.key
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn dispatcher(&self) -> &Dispatcher<S> {
        &self.dispatcher
    }

    /// Subscribe to dispatch outcomes, including rejections.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.dispatcher.subscribe()
    }

    pub(crate) fn groups(&self) -> &GroupStore<S> {
        self.dispatcher.groups()
    }

    pub(crate) fn perms(&self) -> &PermissionStore<S> {
        self.dispatcher.perms()
    }

    pub(crate) fn data(&self) -> &DataStore<S> {
        self.dispatcher.data()
    }

    pub(crate) fn identities(&self) -> &IdentityStore<S> {
        self.dispatcher.identity()
    }

    /// This device's identity, if it has one.
    pub async fn identity(&self) -> Result<Option<Identity>> {
        Ok(self.identities().identity().await?)
    }

    pub(crate) async fn require_identity(&self) -> Result<Identity> {
        self.identities()
            .identity()
            .await?
            .ok_or(DeviceError::NotInitialized)
    }

    pub(crate) async fn resolve(&self, ids: &[&GroupId]) -> Result<BTreeSet<DeviceKey>> {
        Ok(self.groups().resolve(ids.iter().copied()).await?)
    }

    pub(crate) async fn linked_devices_of(&self, identity: &Identity) -> Result<BTreeSet<DeviceKey>> {
        self.resolve(&[&identity.linked]).await
    }

    pub(crate) async fn contact_devices_of(&self, identity: &Identity) -> Result<BTreeSet<DeviceKey>> {
        self.resolve(&[&identity.contacts]).await
    }

    /// Apply the local part of a batch, then send every entry.
    ///
    /// Nothing is sent if a local apply fails.
    pub(crate) async fn commit(&self, outbox: Outbox) -> Result<()> {
        let entries = outbox.into_entries();
        for entry in entries.iter().filter(|e| e.apply_locally) {
            self.dispatcher.execute(&entry.operation).await?;
        }

        for entry in &entries {
            let recipients: Vec<DeviceKey> = entry
                .recipients
                .iter()
                .filter(|k| **k != self.key)
                .copied()
                .collect();
            if recipients.is_empty() {
                continue;
            }
            tracing::debug!(
                kind = %entry.operation.kind(),
                recipients = recipients.len(),
                "sending operation"
            );
            self.transport
                .send_message(&recipients, &entry.operation)
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn send(&self, to: DeviceKey, operation: &Operation) -> Result<()> {
        tracing::debug!(kind = %operation.kind(), to = %to, "sending operation");
        self.transport.send_message(&[to], operation).await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────────

    /// Handle an encoded frame delivered by the transport.
    pub async fn on_message(&self, sender: DeviceKey, bytes: &[u8]) -> Result<Disposition> {
        let _guard = self.guard.lock().await;
        match self.dispatcher.handle_frame(sender, bytes).await? {
            Disposition::Bootstrap(operation) => self.handle_bootstrap(sender, operation).await,
            other => Ok(other),
        }
    }

    /// Handle an already-decoded operation.
    pub async fn on_operation(&self, sender: DeviceKey, operation: Operation) -> Result<Disposition> {
        let _guard = self.guard.lock().await;
        match self.dispatcher.dispatch(sender, operation).await? {
            Disposition::Bootstrap(operation) => self.handle_bootstrap(sender, operation).await,
            other => Ok(other),
        }
    }

    async fn handle_bootstrap(&self, sender: DeviceKey, operation: Operation) -> Result<Disposition> {
        let kind = operation.kind();
        let outcome = match operation {
            Operation::RequestUpdateLinked {
                temp_name,
                src_key,
                subtree,
            } => self.accept_link(sender, temp_name, src_key, subtree).await,
            Operation::ConfirmUpdateLinked { snapshot } => self.adopt_snapshot(snapshot).await,
            Operation::RequestContact {
                req_key,
                req_name,
                subtree,
            } => self.accept_contact(sender, req_key, req_name, subtree).await,
            Operation::ConfirmContact { name, subtree } => {
                self.complete_contact(sender, name, subtree).await
            }
            other => Err(Rejection::InvalidMessage(format!("{} is not a handshake", other.kind())).into()),
        };

        match outcome {
            Ok(()) => {
                self.dispatcher.notify(DispatchEvent::Applied { sender, kind });
                Ok(Disposition::Applied)
            }
            Err(DeviceError::Rejected(reason)) => {
                self.dispatcher.reject(sender, Some(kind), reason.clone());
                Ok(Disposition::Rejected(reason))
            }
            Err(e) => Err(e),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Identity
    // ─────────────────────────────────────────────────────────────────────────

    /// Initialise this device as the first member of a new identity.
    ///
    /// Returns the device key. Calling it again is a no-op.
    pub async fn create_device(&self) -> Result<DeviceKey> {
        let _guard = self.guard.lock().await;
        self.init_identity().await
    }

    pub(crate) async fn init_identity(&self) -> Result<DeviceKey> {
        if let Some(identity) = self.identities().identity().await? {
            return Ok(identity.device);
        }

        let groups = self.groups();
        let leaf = groups.create_leaf(&self.key, &self.config.device_name).await?;
        let linked = groups.new_group(names::LINKED, false, &[leaf.clone()]).await?;
        let contacts = groups.new_group(names::CONTACTS, false, &[]).await?;

        let owned = PermissionTriple::uniform(&linked);
        for id in [&leaf, &linked, &contacts] {
            self.perms()
                .set_permissions(&ObjectKey::group(id), &owned)
                .await?;
        }
        self.identities()
            .set_identity(&Identity {
                device: self.key,
                linked,
                contacts,
            })
            .await?;

        tracing::info!(device = %self.key, "created device");
        Ok(self.key)
    }

    /// Every device of this identity, this one included.
    pub async fn get_linked_devices(&self) -> Result<BTreeSet<DeviceKey>> {
        let _guard = self.guard.lock().await;
        let identity = self.require_identity().await?;
        self.linked_devices_of(&identity).await
    }

    /// Remove this device from its identity and wipe local state.
    pub async fn delete_this_device(&self) -> Result<()> {
        let _guard = self.guard.lock().await;
        let identity = self.require_identity().await?;
        let mut outbox = Outbox::new();
        self.queue_device_removal(&identity, &mut outbox, &[], true)
            .await?;
        self.commit(outbox).await?;
        self.wipe().await
    }

    /// Remove another device of this identity.
    pub async fn delete_linked_device(&self, device: DeviceKey) -> Result<()> {
        let _guard = self.guard.lock().await;
        let identity = self.require_identity().await?;
        if device == self.key {
            let mut outbox = Outbox::new();
            self.queue_device_removal(&identity, &mut outbox, &[], true)
                .await?;
            self.commit(outbox).await?;
            return self.wipe().await;
        }
        if !self.linked_devices_of(&identity).await?.contains(&device) {
            return Err(DeviceError::NotLinked(device));
        }

        let mut outbox = Outbox::new();
        self.queue_device_removal(&identity, &mut outbox, &[device], false)
            .await?;
        self.commit(outbox).await?;
        tracing::info!(device = %device, "deleted linked device");
        Ok(())
    }

    /// Remove every device of this identity, this one last.
    pub async fn delete_all_linked_devices(&self) -> Result<()> {
        let _guard = self.guard.lock().await;
        let identity = self.require_identity().await?;
        let others: Vec<DeviceKey> = self
            .linked_devices_of(&identity)
            .await?
            .into_iter()
            .filter(|k| *k != self.key)
            .collect();

        let mut outbox = Outbox::new();
        self.queue_device_removal(&identity, &mut outbox, &others, true)
            .await?;
        self.commit(outbox).await?;
        self.wipe().await
    }

    /// Queue DeleteDevice for each of `others`, applied here, and
    /// optionally one for this device, which is only sent.
    ///
    /// Recipients are fixed before anything is applied, so removed devices
    /// still hear about their own removal.
    async fn queue_device_removal(
        &self,
        identity: &Identity,
        outbox: &mut Outbox,
        others: &[DeviceKey],
        include_self: bool,
    ) -> Result<()> {
        let mut recipients = self.linked_devices_of(identity).await?;
        recipients.extend(self.contact_devices_of(identity).await?);

        for device in others {
            outbox.local(Operation::DeleteDevice { device: *device }, &recipients);
        }
        if include_self {
            outbox.remote(Operation::DeleteDevice { device: self.key }, &recipients);
        }
        Ok(())
    }

    async fn wipe(&self) -> Result<()> {
        self.identities().clear_all().await?;
        self.dispatcher.clear_deferred();
        tracing::info!(device = %self.key, "device deleted, local state wiped");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Data
    // ─────────────────────────────────────────────────────────────────────────

    /// Create or overwrite a data item.
    ///
    /// A new item is owned by this identity. Overwriting requires write
    /// privilege. The value goes to every device that can read the item.
    pub async fn set_data(&self, prefix: &str, id: &str, value: Value) -> Result<()> {
        let _guard = self.guard.lock().await;
        let identity = self.require_identity().await?;
        let key = ObjectKey::data(prefix, id)?;

        // Only creation carries a triple; overwrites leave it untouched
        let (triple, carried) = match self.perms().get_permissions(&key).await? {
            Some(triple) => {
                if !triple_holds(self.groups(), &triple, Privilege::Write, &self.key).await? {
                    return Err(Rejection::InsufficientDataPermissions(key).into());
                }
                (triple, None)
            }
            None => {
                let triple = PermissionTriple::uniform(&identity.linked);
                (triple.clone(), Some(triple))
            }
        };

        let audience = self.resolve(&triple.groups().into_iter().collect::<Vec<_>>()).await?;
        let mut outbox = Outbox::new();
        outbox.local(
            Operation::UpdateData {
                key,
                value,
                permissions: carried,
            },
            &audience,
        );
        self.commit(outbox).await
    }

    pub async fn get_single_data(&self, prefix: &str, id: &str) -> Result<Option<Value>> {
        let key = ObjectKey::data(prefix, id)?;
        Ok(self.data().get(&key).await?)
    }

    /// Every item under a prefix, as `(id, value)` pairs.
    pub async fn get_data_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        Ok(self.data().by_prefix(prefix).await?)
    }

    /// Delete a data item here and on every device that can read it.
    pub async fn remove_data(&self, prefix: &str, id: &str) -> Result<()> {
        let _guard = self.guard.lock().await;
        self.require_identity().await?;
        let key = ObjectKey::data(prefix, id)?;

        let Some(triple) = self.perms().get_permissions(&key).await? else {
            return Err(DeviceError::NotFound(key));
        };
        if !triple_holds(self.groups(), &triple, Privilege::Write, &self.key).await? {
            return Err(Rejection::InsufficientDataPermissions(key).into());
        }

        let audience = self.resolve(&triple.groups().into_iter().collect::<Vec<_>>()).await?;
        let mut outbox = Outbox::new();
        outbox.local(Operation::DeleteData { key }, &audience);
        self.commit(outbox).await
    }

    /// The triple guarding a data item.
    pub async fn permissions(&self, prefix: &str, id: &str) -> Result<Option<PermissionTriple>> {
        let key = ObjectKey::data(prefix, id)?;
        Ok(self.perms().get_permissions(&key).await?)
    }

    /// Devices able to read a data item.
    pub async fn readers(&self, prefix: &str, id: &str) -> Result<BTreeSet<DeviceKey>> {
        let key = ObjectKey::data(prefix, id)?;
        match self.perms().get_permissions(&key).await? {
            Some(triple) => self.resolve(&triple.holders(Privilege::Read)).await,
            None => Ok(BTreeSet::new()),
        }
    }

    /// Whether a device holds a privilege on a data item.
    pub async fn has_privilege(
        &self,
        prefix: &str,
        id: &str,
        privilege: Privilege,
        device: &DeviceKey,
    ) -> Result<bool> {
        let key = ObjectKey::data(prefix, id)?;
        Ok(self.perms().holds(&key, privilege, device).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Drop the outstanding link request, if any. Returns whether one existed.
    pub async fn abort_pending_link(&self) -> Result<bool> {
        let _guard = self.guard.lock().await;
        let pending = self.identities().pending_link().await?;
        if let Some(pending) = &pending {
            self.identities().clear_pending_link().await?;
            tracing::info!(peer = %pending.key, "aborted pending link");
        }
        Ok(pending.is_some())
    }

    /// Flatten privilege chains and delete orphaned synthetic groups.
    ///
    /// Purely local; resolution results are unchanged.
    pub async fn collect_garbage(&self) -> Result<GarbageReport> {
        let _guard = self.guard.lock().await;
        let mut report = GarbageReport::default();
        for (key, _) in self.perms().all().await? {
            if !key.is_data() {
                continue;
            }
            report.compacted += self.perms().compact_chain(&key, Privilege::Write).await?;
            report.compacted += self.perms().compact_chain(&key, Privilege::Admin).await?;
        }
        report.swept = self.perms().sweep_orphans().await?.len();
        Ok(report)
    }
}
