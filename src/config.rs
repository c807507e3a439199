//! Run configuration for the allocator and its collaborators.

use anyhow::bail;
use anyhow::Result;

use crate::clock::DEFAULT_QUANTUM_NS;
use crate::clock::NSEC_PER_SEC;

pub const DEFAULT_NUM_RESOURCES: usize = 20;
pub const DEFAULT_MAX_UNITS: u32 = 10;
pub const DEFAULT_MAX_CLAIM: u32 = 4;
pub const DEFAULT_MAX_RUNNING: usize = 18;
pub const DEFAULT_TOTAL_LIMIT: usize = 100;
pub const DEFAULT_SPAWN_INTERVAL_NS: u64 = 5_000;
pub const DEFAULT_MAX_EVENTS: u64 = 10_000;
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    pub num_resources: usize,
    /// Upper bound of each resource's randomized total, `1..=max`.
    pub max_units_per_resource: u32,
    /// Upper bound of each max claim entry, `1..=max`.
    pub max_claim_per_resource: u32,
    /// Live worker limit.
    pub max_running: usize,
    /// Lifetime worker creation budget.
    pub total_limit: usize,
    /// Size of the slot table.
    pub slot_capacity: usize,
    /// Reuse the slots of terminated workers.
    pub recycle_slots: bool,
    /// Upper bound of the randomized delay between spawns.
    pub spawn_interval_ns: u64,
    pub quantum_ns: u32,
    /// Handled event budget for the whole run. 0 disables.
    pub max_events: u64,
    /// Emit a ledger snapshot every this many handled events. 0 disables.
    pub snapshot_interval: u64,
    pub seed: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            num_resources: DEFAULT_NUM_RESOURCES,
            max_units_per_resource: DEFAULT_MAX_UNITS,
            max_claim_per_resource: DEFAULT_MAX_CLAIM,
            max_running: DEFAULT_MAX_RUNNING,
            total_limit: DEFAULT_TOTAL_LIMIT,
            slot_capacity: DEFAULT_TOTAL_LIMIT,
            recycle_slots: false,
            spawn_interval_ns: DEFAULT_SPAWN_INTERVAL_NS,
            quantum_ns: DEFAULT_QUANTUM_NS,
            max_events: DEFAULT_MAX_EVENTS,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            seed: 42,
        }
    }
}

impl AllocatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_resources == 0 {
            bail!("at least one resource type is required");
        }
        if self.max_units_per_resource == 0 {
            bail!("max units per resource must be positive");
        }
        if self.max_claim_per_resource == 0 {
            bail!("max claim per resource must be positive");
        }
        if self.max_running == 0 || self.total_limit == 0 || self.slot_capacity == 0 {
            bail!("worker limits must be positive");
        }
        if self.max_running > self.slot_capacity {
            bail!(
                "max running ({}) exceeds slot capacity ({})",
                self.max_running,
                self.slot_capacity
            );
        }
        if !self.recycle_slots && self.total_limit > self.slot_capacity {
            bail!(
                "total limit ({}) exceeds slot capacity ({}) without slot recycling",
                self.total_limit,
                self.slot_capacity
            );
        }
        if self.spawn_interval_ns == 0 {
            bail!("spawn interval must be positive");
        }
        if self.quantum_ns == 0 || self.quantum_ns >= NSEC_PER_SEC {
            bail!("quantum must be in 1..{}ns, got {}", NSEC_PER_SEC, self.quantum_ns);
        }
        Ok(())
    }
}
