//! Device configuration.

use std::fmt;
use std::time::Duration;

use trellis_sync::{DispatcherConfig, Validator};

/// Configuration for a [`Device`](crate::Device).
#[derive(Clone)]
pub struct DeviceConfig {
    /// Name given to this device's leaf group.
    pub device_name: String,
    /// How long an outgoing link request waits for its confirmation.
    pub link_timeout: Duration,
    /// Maximum number of inbound operations parked on missing dependencies.
    pub max_deferred: usize,
    /// Share of the parked operations a single sender may hold.
    pub max_deferred_per_sender: usize,
    /// Capacity of the dispatch event channel.
    pub event_capacity: usize,
    /// Application check run on every data write, local or remote.
    pub validator: Option<Validator>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let dispatch = DispatcherConfig::default();
        Self {
            device_name: "device".to_string(),
            link_timeout: dispatch.link_timeout,
            max_deferred: dispatch.max_deferred,
            max_deferred_per_sender: dispatch.max_deferred_per_sender,
            event_capacity: dispatch.event_capacity,
            validator: None,
        }
    }
}

impl DeviceConfig {
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    pub fn with_link_timeout(mut self, timeout: Duration) -> Self {
        self.link_timeout = timeout;
        self
    }

    pub fn with_max_deferred(mut self, max: usize) -> Self {
        self.max_deferred = max;
        self
    }

    pub fn with_max_deferred_per_sender(mut self, max: usize) -> Self {
        self.max_deferred_per_sender = max;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub(crate) fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            link_timeout: self.link_timeout,
            max_deferred: self.max_deferred,
            max_deferred_per_sender: self.max_deferred_per_sender,
            event_capacity: self.event_capacity,
            validator: self.validator.clone(),
        }
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("device_name", &self.device_name)
            .field("link_timeout", &self.link_timeout)
            .field("max_deferred", &self.max_deferred)
            .field("max_deferred_per_sender", &self.max_deferred_per_sender)
            .field("event_capacity", &self.event_capacity)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}
