//! The operations produced by one API call, in send order.

use std::collections::BTreeSet;

use trellis_core::DeviceKey;
use trellis_sync::Operation;

#[derive(Debug)]
pub(crate) struct Outbound {
    pub operation: Operation,
    pub recipients: BTreeSet<DeviceKey>,
    /// Whether the originator applies the operation itself.
    pub apply_locally: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Outbox {
    entries: Vec<Outbound>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply here, then send to `recipients`.
    pub fn local(&mut self, operation: Operation, recipients: &BTreeSet<DeviceKey>) {
        self.entries.push(Outbound {
            operation,
            recipients: recipients.clone(),
            apply_locally: true,
        });
    }

    /// Send only. Used for state the recipients lack but we already hold.
    pub fn remote(&mut self, operation: Operation, recipients: &BTreeSet<DeviceKey>) {
        if recipients.is_empty() {
            return;
        }
        self.entries.push(Outbound {
            operation,
            recipients: recipients.clone(),
            apply_locally: false,
        });
    }

    pub fn into_entries(self) -> Vec<Outbound> {
        self.entries
    }
}
