#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use scx_banker::*;

/// Initialize a test logger. Only the first call in the process installs
/// it; later calls are ignored.
pub fn setup_test() {
    let _ = simplelog::TestLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
    );
}

/// Seed for randomized tests, from `BANKER_SEED` (default 42).
pub fn get_seed() -> u64 {
    std::env::var("BANKER_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(42)
}

/// Spawner that keeps every worker endpoint so a test can act as the
/// workers itself.
#[derive(Default)]
pub struct ScriptedSpawner {
    pub endpoints: BTreeMap<SlotId, WorkerEndpoint>,
    pub claims: BTreeMap<SlotId, Vec<u32>>,
    /// Fail every spawn once this many have succeeded.
    pub fail_after: Option<usize>,
    pub shutdowns: usize,
}

impl ScriptedSpawner {
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Default::default()
        }
    }

    pub fn endpoint(&self, slot: SlotId) -> &WorkerEndpoint {
        &self.endpoints[&slot]
    }
}

impl Spawner for ScriptedSpawner {
    fn spawn(&mut self, slot: SlotId, max_claim: &[u32], endpoint: WorkerEndpoint) -> Result<()> {
        if self.fail_after.is_some_and(|n| self.endpoints.len() >= n) {
            bail!("out of worker processes");
        }
        self.claims.insert(slot, max_claim.to_vec());
        self.endpoints.insert(slot, endpoint);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.shutdowns += 1;
    }
}

pub type TestAllocator = Allocator<ScriptedSpawner, (LogObserver, Trace)>;

/// Allocator over `totals` with automatic spawning turned off.
pub fn allocator(totals: Vec<u32>) -> TestAllocator {
    let cfg = AllocatorConfig {
        max_events: 0,
        snapshot_interval: 0,
        ..Default::default()
    };
    let mut alloc = Allocator::with_totals(
        cfg,
        totals,
        ScriptedSpawner::default(),
        (LogObserver, Trace::new()),
    )
    .unwrap();
    alloc.pause_spawning();
    alloc
}

pub fn trace(alloc: &TestAllocator) -> &Trace {
    &alloc.observer().1
}

/// Send a request from `slot` and run one loop iteration.
pub fn request(alloc: &mut TestAllocator, slot: SlotId, resource: usize) {
    alloc
        .spawner_mut()
        .endpoint(slot)
        .request(ResourceId(resource))
        .unwrap();
    assert!(alloc.step().unwrap());
}

pub fn release(alloc: &mut TestAllocator, slot: SlotId, resource: usize) {
    alloc
        .spawner_mut()
        .endpoint(slot)
        .release(ResourceId(resource))
        .unwrap();
    assert!(alloc.step().unwrap());
}

pub fn terminate(alloc: &mut TestAllocator, slot: SlotId) {
    alloc.spawner_mut().endpoint(slot).terminate().unwrap();
    assert!(alloc.step().unwrap());
}

/// Count the grants waiting for `slot`.
pub fn drain_grants(alloc: &mut TestAllocator, slot: SlotId) -> usize {
    let ep = alloc.spawner_mut().endpoint(slot);
    let mut n = 0;
    while let Ok(Some(msg)) = ep.recv_grant(Duration::ZERO) {
        assert!(msg.granted);
        assert_eq!(msg.sender, slot);
        n += 1;
    }
    n
}
