// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Authoritative resource tables.
//!
//! The ledger holds the total supply of each resource type, the available
//! vector and, per worker slot, the max claim and current allocation. It has
//! a single writer, the allocator.
//!
//! Grants go through a two-phase protocol: [`ResourceLedger::tentatively_grant`]
//! applies one unit and hands back a [`TentativeGrant`] token, which must be
//! passed to either [`ResourceLedger::commit`] or [`ResourceLedger::rollback`]
//! before another grant can be attempted. Releases and reclaims are applied
//! directly since returning units can never make the state unsafe.
//!
//! Between mutations the ledger maintains, for every resource `r`:
//!
//! ```text
//! total[r] == available[r] + sum(allocated[slot][r])
//! allocated[slot][r] <= max_claim[slot][r]
//! ```
use std::fmt;

use crate::types::ResourceId;
use crate::types::SlotId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Slot index was never registered.
    UnknownSlot(SlotId),
    /// Slot has terminated.
    DeadSlot(SlotId),
    UnknownResource(ResourceId),
    /// Max claim vector has the wrong number of entries.
    ClaimShape { expected: usize, got: usize },
    /// Max claim for a resource is larger than its total supply.
    ClaimExceedsTotal {
        resource: ResourceId,
        claim: u32,
        total: u32,
    },
    /// No free slot left to register a worker in.
    CapacityExhausted(usize),
    /// Granting one more unit would exceed the slot's declared max claim.
    ExceedsClaim {
        slot: SlotId,
        resource: ResourceId,
        max: u32,
    },
    /// No unit of the resource is currently available.
    Unavailable(ResourceId),
    /// Release of a resource the slot does not hold.
    NotHeld { slot: SlotId, resource: ResourceId },
    /// A request from a slot that is already waiting on one.
    AlreadyBlocked(SlotId),
    /// A tentative grant is outstanding and has not been committed or rolled back.
    MutationPending,
    Conservation {
        resource: ResourceId,
        total: u32,
        accounted: u64,
    },
    OverClaim {
        slot: SlotId,
        resource: ResourceId,
        allocated: u32,
        max: u32,
    },
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::UnknownSlot(s) => write!(f, "unknown slot {s}"),
            LedgerError::DeadSlot(s) => write!(f, "slot {s} has terminated"),
            LedgerError::UnknownResource(r) => write!(f, "unknown resource {r}"),
            LedgerError::ClaimShape { expected, got } => {
                write!(f, "max claim has {got} entries, expected {expected}")
            }
            LedgerError::ClaimExceedsTotal {
                resource,
                claim,
                total,
            } => write!(f, "max claim {claim} for {resource} exceeds total {total}"),
            LedgerError::CapacityExhausted(cap) => {
                write!(f, "all {cap} worker slots are in use")
            }
            LedgerError::ExceedsClaim {
                slot,
                resource,
                max,
            } => write!(f, "{slot} already holds its max claim {max} of {resource}"),
            LedgerError::Unavailable(r) => write!(f, "no units of {r} available"),
            LedgerError::NotHeld { slot, resource } => {
                write!(f, "{slot} released {resource} which it does not hold")
            }
            LedgerError::AlreadyBlocked(s) => {
                write!(f, "{s} requested while already blocked")
            }
            LedgerError::MutationPending => write!(f, "a tentative grant is outstanding"),
            LedgerError::Conservation {
                resource,
                total,
                accounted,
            } => write!(
                f,
                "conservation violated for {resource}: total {total}, accounted {accounted}"
            ),
            LedgerError::OverClaim {
                slot,
                resource,
                allocated,
                max,
            } => write!(
                f,
                "{slot} holds {allocated} of {resource}, above its max claim {max}"
            ),
        }
    }
}

impl std::error::Error for LedgerError {}

/// Per-worker row of the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotEntry {
    pub max_claim: Vec<u32>,
    pub allocated: Vec<u32>,
    pub live: bool,
    pub blocked: bool,
    pub pending: Option<ResourceId>,
}

impl SlotEntry {
    fn new(max_claim: Vec<u32>) -> Self {
        let allocated = vec![0; max_claim.len()];
        Self {
            max_claim,
            allocated,
            live: true,
            blocked: false,
            pending: None,
        }
    }

    /// Remaining claim, `max_claim - allocated`, per resource.
    pub fn need(&self) -> Vec<u32> {
        self.max_claim
            .iter()
            .zip(&self.allocated)
            .map(|(max, alloc)| max.saturating_sub(*alloc))
            .collect()
    }

    pub fn total_allocated(&self) -> u32 {
        self.allocated.iter().sum()
    }
}

/// Proof of one tentatively applied unit. Consumed by commit or rollback.
#[must_use = "a tentative grant must be committed or rolled back"]
#[derive(Debug, PartialEq, Eq)]
pub struct TentativeGrant {
    slot: SlotId,
    resource: ResourceId,
}

impl TentativeGrant {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn resource(&self) -> ResourceId {
        self.resource
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLedger {
    total: Vec<u32>,
    available: Vec<u32>,
    slots: Vec<SlotEntry>,
    capacity: usize,
    recycle: bool,
    free: Vec<SlotId>,
    pending_mutation: bool,
}

impl ResourceLedger {
    /// Create a ledger with all of `total` available and room for
    /// `capacity` worker slots. Terminated slots are reused only if
    /// `recycle` is set; otherwise `capacity` bounds the lifetime count.
    pub fn new(total: Vec<u32>, capacity: usize, recycle: bool) -> Self {
        Self {
            available: total.clone(),
            total,
            slots: Vec::new(),
            capacity,
            recycle,
            free: Vec::new(),
            pending_mutation: false,
        }
    }

    pub fn num_resources(&self) -> usize {
        self.total.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total(&self) -> &[u32] {
        &self.total
    }

    pub fn available(&self) -> &[u32] {
        &self.available
    }

    pub fn slot(&self, slot: SlotId) -> Option<&SlotEntry> {
        self.slots.get(slot.index())
    }

    /// Live slots in index order.
    pub fn live_slots(&self) -> impl Iterator<Item = (SlotId, &SlotEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, e)| e.live)
            .map(|(i, e)| (SlotId(i), e))
    }

    pub fn num_live(&self) -> usize {
        self.slots.iter().filter(|e| e.live).count()
    }

    /// Whether another worker can be registered.
    pub fn has_free_slot(&self) -> bool {
        self.slots.len() < self.capacity || (self.recycle && !self.free.is_empty())
    }

    pub fn register(&mut self, max_claim: Vec<u32>) -> Result<SlotId, LedgerError> {
        if max_claim.len() != self.num_resources() {
            return Err(LedgerError::ClaimShape {
                expected: self.num_resources(),
                got: max_claim.len(),
            });
        }
        for (r, (&claim, &total)) in max_claim.iter().zip(&self.total).enumerate() {
            if claim > total {
                return Err(LedgerError::ClaimExceedsTotal {
                    resource: ResourceId(r),
                    claim,
                    total,
                });
            }
        }

        if self.slots.len() < self.capacity {
            self.slots.push(SlotEntry::new(max_claim));
            return Ok(SlotId(self.slots.len() - 1));
        }
        if self.recycle {
            if let Some(slot) = self.free.pop() {
                self.slots[slot.index()] = SlotEntry::new(max_claim);
                return Ok(slot);
            }
        }
        Err(LedgerError::CapacityExhausted(self.capacity))
    }

    fn live_entry(&self, slot: SlotId) -> Result<&SlotEntry, LedgerError> {
        match self.slots.get(slot.index()) {
            None => Err(LedgerError::UnknownSlot(slot)),
            Some(e) if !e.live => Err(LedgerError::DeadSlot(slot)),
            Some(e) => Ok(e),
        }
    }

    fn live_entry_mut(&mut self, slot: SlotId) -> Result<&mut SlotEntry, LedgerError> {
        match self.slots.get_mut(slot.index()) {
            None => Err(LedgerError::UnknownSlot(slot)),
            Some(e) if !e.live => Err(LedgerError::DeadSlot(slot)),
            Some(e) => Ok(e),
        }
    }

    fn check_resource(&self, resource: ResourceId) -> Result<(), LedgerError> {
        if resource.index() >= self.num_resources() {
            return Err(LedgerError::UnknownResource(resource));
        }
        Ok(())
    }

    /// Move one unit of `resource` from available to `slot`.
    ///
    /// Fails without touching the ledger if the slot would exceed its max
    /// claim or nothing is available. The caller must run the safety check
    /// and then commit or roll back the returned token.
    pub fn tentatively_grant(
        &mut self,
        slot: SlotId,
        resource: ResourceId,
    ) -> Result<TentativeGrant, LedgerError> {
        if self.pending_mutation {
            return Err(LedgerError::MutationPending);
        }
        self.check_resource(resource)?;
        let r = resource.index();
        let entry = self.live_entry(slot)?;
        if entry.allocated[r] >= entry.max_claim[r] {
            return Err(LedgerError::ExceedsClaim {
                slot,
                resource,
                max: entry.max_claim[r],
            });
        }
        if self.available[r] == 0 {
            return Err(LedgerError::Unavailable(resource));
        }

        self.available[r] -= 1;
        self.slots[slot.index()].allocated[r] += 1;
        self.pending_mutation = true;
        Ok(TentativeGrant { slot, resource })
    }

    /// Finalize a tentative grant. The unit is already applied.
    pub fn commit(&mut self, grant: TentativeGrant) {
        debug_assert!(self.pending_mutation);
        let TentativeGrant { slot, .. } = grant;
        if let Some(e) = self.slots.get_mut(slot.index()) {
            e.pending = None;
            e.blocked = false;
        }
        self.pending_mutation = false;
    }

    /// Reverse exactly the unit applied by `grant`.
    pub fn rollback(&mut self, grant: TentativeGrant) {
        debug_assert!(self.pending_mutation);
        let TentativeGrant { slot, resource } = grant;
        let r = resource.index();
        self.slots[slot.index()].allocated[r] -= 1;
        self.available[r] += 1;
        self.pending_mutation = false;
    }

    /// Return one unit of `resource` held by `slot`.
    pub fn release(&mut self, slot: SlotId, resource: ResourceId) -> Result<(), LedgerError> {
        self.check_resource(resource)?;
        let r = resource.index();
        let entry = self.live_entry_mut(slot)?;
        if entry.allocated[r] == 0 {
            return Err(LedgerError::NotHeld { slot, resource });
        }
        entry.allocated[r] -= 1;
        self.available[r] += 1;
        Ok(())
    }

    /// Zero `slot`'s allocation, crediting every unit back to available.
    /// Returns what was reclaimed.
    pub fn reclaim_all(&mut self, slot: SlotId) -> Result<Vec<u32>, LedgerError> {
        let entry = self.live_entry_mut(slot)?;
        let reclaimed = std::mem::replace(&mut entry.allocated, vec![0; entry.max_claim.len()]);
        for (avail, n) in self.available.iter_mut().zip(&reclaimed) {
            *avail += n;
        }
        Ok(reclaimed)
    }

    /// Reclaim everything `slot` holds and mark it terminated.
    pub fn retire(&mut self, slot: SlotId) -> Result<Vec<u32>, LedgerError> {
        let reclaimed = self.reclaim_all(slot)?;
        let entry = &mut self.slots[slot.index()];
        entry.live = false;
        entry.blocked = false;
        entry.pending = None;
        if self.recycle {
            self.free.push(slot);
        }
        Ok(reclaimed)
    }

    /// Mark `slot` as waiting on `resource`.
    pub fn block(&mut self, slot: SlotId, resource: ResourceId) -> Result<(), LedgerError> {
        let entry = self.live_entry_mut(slot)?;
        entry.blocked = true;
        entry.pending = Some(resource);
        Ok(())
    }

    pub fn set_pending(
        &mut self,
        slot: SlotId,
        resource: Option<ResourceId>,
    ) -> Result<(), LedgerError> {
        self.live_entry_mut(slot)?.pending = resource;
        Ok(())
    }

    pub fn is_blocked(&self, slot: SlotId) -> bool {
        self.slot(slot).map(|e| e.live && e.blocked).unwrap_or(false)
    }

    /// Allocation matrix of the live slots.
    pub fn snapshot(&self) -> Vec<(SlotId, Vec<u32>)> {
        self.live_slots()
            .map(|(id, e)| (id, e.allocated.clone()))
            .collect()
    }

    /// Verify conservation and no-overclaim.
    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        for (r, &total) in self.total.iter().enumerate() {
            let held: u64 = self.slots.iter().map(|e| e.allocated[r] as u64).sum();
            let accounted = held + self.available[r] as u64;
            if accounted != total as u64 {
                return Err(LedgerError::Conservation {
                    resource: ResourceId(r),
                    total,
                    accounted,
                });
            }
        }
        for (slot, e) in self.live_slots() {
            for (r, (&allocated, &max)) in e.allocated.iter().zip(&e.max_claim).enumerate() {
                if allocated > max {
                    return Err(LedgerError::OverClaim {
                        slot,
                        resource: ResourceId(r),
                        allocated,
                        max,
                    });
                }
            }
        }
        Ok(())
    }
}
