//! Queue of slots waiting on a denied request.
//!
//! Entries are retried strictly round-robin: the allocator pops one head
//! per loop iteration and, if the request is still unsafe, pushes it back
//! at the tail. A slot enqueued behind N others therefore sees all N retried
//! once before its own turn comes around.

use std::collections::VecDeque;

use crate::types::ResourceId;
use crate::types::SlotId;

/// A slot and the resource it is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedEntry {
    pub slot: SlotId,
    pub resource: ResourceId,
}

#[derive(Debug)]
pub struct BlockedQueue {
    entries: VecDeque<BlockedEntry>,
    capacity: usize,
}

impl BlockedQueue {
    /// `capacity` should equal the number of worker slots, since a slot
    /// holds at most one outstanding request.
    pub fn new(capacity: usize) -> Self {
        BlockedQueue {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append at the tail. Returns false, leaving the queue unchanged, if
    /// the queue is full or `slot` is already queued.
    pub fn enqueue(&mut self, slot: SlotId, resource: ResourceId) -> bool {
        if self.entries.len() >= self.capacity || self.contains(slot) {
            return false;
        }
        self.entries.push_back(BlockedEntry { slot, resource });
        true
    }

    pub fn dequeue(&mut self) -> Option<BlockedEntry> {
        self.entries.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, slot: SlotId) -> bool {
        self.entries.iter().any(|e| e.slot == slot)
    }

    /// The resource `slot` is waiting on, if queued.
    pub fn requested(&self, slot: SlotId) -> Option<ResourceId> {
        self.entries
            .iter()
            .find(|e| e.slot == slot)
            .map(|e| e.resource)
    }

    /// Drop `slot`'s entry, e.g. when it terminates while blocked.
    pub fn remove(&mut self, slot: SlotId) -> Option<BlockedEntry> {
        let pos = self.entries.iter().position(|e| e.slot == slot)?;
        self.entries.remove(pos)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockedEntry> {
        self.entries.iter()
    }
}
