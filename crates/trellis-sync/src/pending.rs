//! Operations waiting for state they reference.
//!
//! Devices may see an operation before the one that creates the group it
//! touches. Such operations are parked here and retried after every
//! successful apply. The queue is bounded overall and per sender. A sender
//! at its share loses its own oldest entry; otherwise a full queue drops
//! the oldest entry of anyone.

use std::collections::VecDeque;
use std::fmt;

use trellis_core::{DeviceKey, GroupId, ObjectKey};

use crate::operation::Operation;

/// Local state an operation needs before it can be authorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// A group record.
    Group(GroupId),
    /// The permission triple of an object.
    Object(ObjectKey),
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Group(id) => write!(f, "group {id}"),
            Dependency::Object(key) => write!(f, "permissions of {key}"),
        }
    }
}

/// A parked operation.
#[derive(Debug, Clone)]
pub struct Deferred {
    pub sender: DeviceKey,
    pub operation: Operation,
    pub missing: Dependency,
}

/// Bounded FIFO of parked operations.
#[derive(Debug)]
pub struct PendingQueue {
    entries: VecDeque<Deferred>,
    capacity: usize,
    per_sender: usize,
}

impl PendingQueue {
    pub fn new(capacity: usize, per_sender: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            per_sender,
        }
    }

    /// Park an entry, returning whatever had to make room for it.
    pub fn push(&mut self, entry: Deferred) -> Option<Deferred> {
        if self.capacity == 0 || self.per_sender == 0 {
            return Some(entry);
        }
        let evicted = if self.parked_by(&entry.sender) >= self.per_sender {
            self.entries
                .iter()
                .position(|e| e.sender == entry.sender)
                .and_then(|i| self.entries.remove(i))
        } else if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// Number of entries parked for one sender.
    pub fn parked_by(&self, sender: &DeviceKey) -> usize {
        self.entries.iter().filter(|e| &e.sender == sender).count()
    }

    /// Take every entry, oldest first.
    pub fn drain(&mut self) -> Vec<Deferred> {
        self.entries.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// What the parked entries are waiting for.
    pub fn missing(&self) -> impl Iterator<Item = &Dependency> {
        self.entries.iter().map(|e| &e.missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::Keypair;

    fn entry(i: usize) -> Deferred {
        entry_from(1, i)
    }

    fn entry_from(seed: u8, i: usize) -> Deferred {
        let group = GroupId::new(format!("g{i}"));
        Deferred {
            sender: Keypair::from_seed(&[seed; 32]).device_key(),
            operation: Operation::AddChild {
                group: group.clone(),
                child: GroupId::new("c"),
            },
            missing: Dependency::Group(group),
        }
    }

    #[test]
    fn test_bounded_drops_oldest() {
        let mut queue = PendingQueue::new(2, 2);
        assert!(queue.push(entry(0)).is_none());
        assert!(queue.push(entry(1)).is_none());

        let evicted = queue.push(entry(2)).unwrap();
        assert_eq!(evicted.missing, Dependency::Group(GroupId::new("g0")));
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(drained[0].missing, Dependency::Group(GroupId::new("g1")));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_capacity_parks_nothing() {
        let mut queue = PendingQueue::new(0, 4);
        assert!(queue.push(entry(0)).is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_one_sender_cannot_flush_others() {
        let mut queue = PendingQueue::new(8, 3);
        queue.push(entry_from(2, 100));
        queue.push(entry_from(3, 200));

        for i in 0..50 {
            if let Some(evicted) = queue.push(entry_from(1, i)) {
                assert_eq!(evicted.sender, entry_from(1, 0).sender);
            }
        }

        assert_eq!(queue.len(), 5);
        assert_eq!(queue.parked_by(&entry_from(1, 0).sender), 3);
        let missing: Vec<_> = queue.missing().cloned().collect();
        assert!(missing.contains(&Dependency::Group(GroupId::new("g100"))));
        assert!(missing.contains(&Dependency::Group(GroupId::new("g200"))));
        // The flooding sender keeps only its newest entries
        assert!(missing.contains(&Dependency::Group(GroupId::new("g49"))));
        assert!(!missing.contains(&Dependency::Group(GroupId::new("g46"))));
    }
}
