//! Multi-device harness over the in-memory network.
//!
//! A [`Cluster`] owns named devices and delivers frames between them until
//! every inbox is empty. Delivery order is FIFO per sender and round-robin
//! across receivers, which is enough to exercise deferral without sleeps.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use trellis::{AutoConfirm, Confirm, Device, DeviceConfig, DeviceKey, Disposition, GroupId};
use trellis_core::Keypair;
use trellis_perms::Identity;
use trellis_store::MemoryStore;
use trellis_sync::{MemoryNetwork, MemoryTransport, Operation};

/// A device backed by memory storage and the memory network.
pub type MemoryDevice = Device<MemoryStore, MemoryTransport>;

/// Rounds of delivery after which a cluster is considered stuck.
const MAX_ROUNDS: usize = 1_000;

/// Install a test-friendly tracing subscriber. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing_subscriber::filter::LevelFilter::WARN)
        .try_init();
}

/// A deterministic device key.
pub fn seeded_key(seed: u8) -> DeviceKey {
    Keypair::from_seed(&[seed; 32]).device_key()
}

/// One inbound frame and what the receiver made of it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: DeviceKey,
    pub to: DeviceKey,
    pub operation: Option<Operation>,
    pub disposition: Disposition,
}

/// Named devices sharing one in-memory network.
pub struct Cluster {
    network: Arc<MemoryNetwork>,
    devices: BTreeMap<String, MemoryDevice>,
    log: Vec<Delivery>,
}

impl Cluster {
    pub fn new() -> Self {
        init_tracing();
        Self {
            network: MemoryNetwork::new(),
            devices: BTreeMap::new(),
            log: Vec::new(),
        }
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    /// Add an uninitialised device that accepts every prompt.
    pub async fn add(&mut self, name: &str) -> &MemoryDevice {
        self.add_with(name, Arc::new(AutoConfirm::accept()), DeviceConfig::default())
            .await
    }

    pub async fn add_with(
        &mut self,
        name: &str,
        confirm: Arc<dyn Confirm>,
        config: DeviceConfig,
    ) -> &MemoryDevice {
        let key = Keypair::generate().device_key();
        let transport = self.network.create_transport(key).await;
        let device = Device::new(
            Arc::new(MemoryStore::new()),
            Arc::new(transport),
            confirm,
            config.with_device_name(name),
        );
        self.devices.insert(name.to_string(), device);
        &self.devices[name]
    }

    /// Add a device and give it a fresh identity.
    pub async fn add_initialized(&mut self, name: &str) -> anyhow::Result<&MemoryDevice> {
        self.add(name).await;
        let device = self.device(name);
        device.create_device().await?;
        Ok(device)
    }

    /// The device registered under `name`.
    ///
    /// # Panics
    ///
    /// If no such device exists.
    pub fn device(&self, name: &str) -> &MemoryDevice {
        self.devices
            .get(name)
            .unwrap_or_else(|| panic!("no device named {name}"))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    /// Every frame delivered so far, in delivery order.
    pub fn log(&self) -> &[Delivery] {
        &self.log
    }

    /// Rejections recorded by `name` so far.
    pub fn rejections(&self, name: &str) -> Vec<&Delivery> {
        let key = self.device(name).key();
        self.log
            .iter()
            .filter(|d| d.to == key && matches!(d.disposition, Disposition::Rejected(_)))
            .collect()
    }

    /// Deliver frames until every inbox is empty. Returns the number delivered.
    pub async fn settle(&mut self) -> anyhow::Result<usize> {
        let mut total = 0;
        for _ in 0..MAX_ROUNDS {
            let mut delivered = 0;
            for device in self.devices.values() {
                while let Some(frame) = device.transport().try_recv().await {
                    let disposition = device
                        .on_message(frame.from, &frame.bytes)
                        .await
                        .with_context(|| format!("{} handling frame from {}", device.key(), frame.from))?;
                    self.log.push(Delivery {
                        from: frame.from,
                        to: device.key(),
                        operation: Operation::from_bytes(&frame.bytes).ok(),
                        disposition,
                    });
                    delivered += 1;
                }
            }
            if delivered == 0 {
                return Ok(total);
            }
            total += delivered;
        }
        bail!("cluster did not settle after {MAX_ROUNDS} rounds")
    }

    pub async fn identity(&self, name: &str) -> anyhow::Result<Identity> {
        self.device(name)
            .identity()
            .await?
            .ok_or_else(|| anyhow!("{name} has no identity"))
    }

    /// The LINKED group of `name`'s identity.
    pub async fn linked(&self, name: &str) -> anyhow::Result<GroupId> {
        Ok(self.identity(name).await?.linked)
    }

    /// Link `joiner` into `target`'s identity and settle.
    pub async fn link(&mut self, joiner: &str, target: &str) -> anyhow::Result<()> {
        let target_key = self.device(target).key();
        self.device(joiner).create_linked_device(target_key).await?;
        self.settle().await?;
        Ok(())
    }

    /// Make `a` and `b` contacts and settle.
    pub async fn befriend(&mut self, a: &str, b: &str) -> anyhow::Result<()> {
        let b_key = self.device(b).key();
        self.device(a).add_contact(b_key).await?;
        self.settle().await?;
        Ok(())
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cluster_settles_when_idle() {
        let mut cluster = Cluster::new();
        cluster.add_initialized("alice").await.unwrap();
        assert_eq!(cluster.settle().await.unwrap(), 0);
        assert_eq!(cluster.names().collect::<Vec<_>>(), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_cluster_records_deliveries() {
        let mut cluster = Cluster::new();
        cluster.add_initialized("alice").await.unwrap();
        cluster.add("phone").await;
        cluster.link("phone", "alice").await.unwrap();

        assert_eq!(cluster.log().len(), 2);
        assert!(cluster
            .log()
            .iter()
            .all(|d| d.disposition == Disposition::Applied));
        assert!(cluster.rejections("alice").is_empty());
    }

    #[test]
    fn test_seeded_keys_are_stable() {
        assert_eq!(seeded_key(1), seeded_key(1));
        assert_ne!(seeded_key(1), seeded_key(2));
    }
}
