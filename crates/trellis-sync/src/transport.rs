//! Transport abstraction for replicated operations.
//!
//! The transport owns encryption, sequencing, and relaying. Trellis hands it
//! an operation and a list of device keys and forgets about it: there is no
//! acknowledgement and no retry.

use async_trait::async_trait;
use trellis_core::DeviceKey;

use crate::error::SyncError;
use crate::operation::Operation;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Outbound side of the encrypted channel between devices.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an operation to each recipient. Fire-and-forget.
    async fn send_message(&self, recipients: &[DeviceKey], operation: &Operation) -> Result<()>;

    /// The key of the device this transport sends as.
    fn local_key(&self) -> DeviceKey;
}

/// An in-process network for tests and simulations.
///
/// Frames are CBOR-encoded so the receiving side goes through the same
/// decoding path as a real transport. Delivery is FIFO per sender.
pub mod memory {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, Mutex, RwLock};

    /// A frame in flight.
    #[derive(Debug, Clone)]
    pub struct Frame {
        pub from: DeviceKey,
        pub bytes: Bytes,
    }

    /// Shared routing table for the memory network.
    #[derive(Default)]
    pub struct MemoryNetwork {
        senders: RwLock<HashMap<DeviceKey, mpsc::UnboundedSender<Frame>>>,
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Create a transport connected to this network.
        ///
        /// Connecting the same key twice replaces the earlier inbox.
        pub async fn create_transport(self: &Arc<Self>, key: DeviceKey) -> MemoryTransport {
            let (tx, rx) = mpsc::unbounded_channel();
            self.senders.write().await.insert(key, tx);
            MemoryTransport {
                key,
                network: Arc::clone(self),
                receiver: Mutex::new(rx),
            }
        }

        /// Stop routing frames to a device.
        pub async fn disconnect(&self, key: &DeviceKey) {
            self.senders.write().await.remove(key);
        }

        async fn deliver(&self, from: DeviceKey, to: &DeviceKey, bytes: Bytes) -> bool {
            let senders = self.senders.read().await;
            match senders.get(to) {
                Some(sender) => sender.send(Frame { from, bytes }).is_ok(),
                None => false,
            }
        }
    }

    /// In-memory transport implementation.
    pub struct MemoryTransport {
        key: DeviceKey,
        network: Arc<MemoryNetwork>,
        receiver: Mutex<mpsc::UnboundedReceiver<Frame>>,
    }

    impl MemoryTransport {
        /// Send raw bytes, bypassing encoding. Used to inject forged frames.
        pub async fn send_raw(&self, to: &DeviceKey, bytes: Bytes) -> Result<()> {
            if self.network.deliver(self.key, to, bytes).await {
                Ok(())
            } else {
                Err(SyncError::TransportError(format!("peer not found: {to}")))
            }
        }

        /// Take the next queued frame without waiting.
        pub async fn try_recv(&self) -> Option<Frame> {
            self.receiver.lock().await.try_recv().ok()
        }

        /// Receive with timeout.
        ///
        /// Returns None if the timeout expires before a frame arrives.
        pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Frame>> {
            let mut rx = self.receiver.lock().await;
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(frame)) => Ok(Some(frame)),
                Ok(None) => Err(SyncError::TransportError("channel closed".into())),
                Err(_) => Ok(None),
            }
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send_message(&self, recipients: &[DeviceKey], operation: &Operation) -> Result<()> {
            let bytes = Bytes::from(operation.to_bytes()?);
            for recipient in recipients {
                if !self.network.deliver(self.key, recipient, bytes.clone()).await {
                    tracing::debug!(
                        from = %self.key,
                        to = %recipient,
                        kind = %operation.kind(),
                        "recipient not connected, dropping frame"
                    );
                }
            }
            Ok(())
        }

        fn local_key(&self) -> DeviceKey {
            self.key
        }
    }
}
