//! Worker creation: when to spawn, with what claim, and how.
//!
//! The allocator only talks to a [`Spawner`]. [`ThreadSpawner`] runs each
//! worker on its own OS thread; tests substitute spawners that hand the
//! endpoints back for scripted driving.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::warn;
use rand::Rng;

use crate::channel::WorkerEndpoint;
use crate::clock::ClockValue;
use crate::config::AllocatorConfig;
use crate::types::SlotId;
use crate::worker::run_worker;

/// Launches a worker bound to a slot.
pub trait Spawner {
    /// Start a worker for `slot` with the given max claim. Failure is fatal
    /// to the run.
    fn spawn(&mut self, slot: SlotId, max_claim: &[u32], endpoint: WorkerEndpoint) -> Result<()>;

    /// Stop and reap every worker started so far. Called once at teardown.
    fn shutdown(&mut self);
}

/// Draw each resource's total from `1..=max_units_per_resource`.
pub fn random_totals<R: Rng>(rng: &mut R, cfg: &AllocatorConfig) -> Vec<u32> {
    (0..cfg.num_resources)
        .map(|_| rng.gen_range(1..=cfg.max_units_per_resource))
        .collect()
}

/// Draw a max claim vector, each entry in `1..=max_claim_per_resource`
/// clamped to that resource's total.
pub fn random_max_claim<R: Rng>(rng: &mut R, totals: &[u32], cfg: &AllocatorConfig) -> Vec<u32> {
    totals
        .iter()
        .map(|&total| rng.gen_range(1..=cfg.max_claim_per_resource).min(total))
        .collect()
}

/// Admission policy for new workers.
///
/// A worker is due once the clock reaches the scheduled spawn time, as long
/// as fewer than `max_running` are live and the lifetime budget is not
/// spent. Each spawn schedules the next one a random delay later.
#[derive(Debug)]
pub struct SpawnPolicy {
    max_running: usize,
    total_limit: usize,
    interval_ns: u64,
    next_at: ClockValue,
    created: usize,
    paused: bool,
}

impl SpawnPolicy {
    pub fn new(cfg: &AllocatorConfig) -> Self {
        Self {
            max_running: cfg.max_running,
            total_limit: cfg.total_limit,
            interval_ns: cfg.spawn_interval_ns,
            next_at: ClockValue::ZERO,
            created: 0,
            paused: false,
        }
    }

    pub fn created(&self) -> usize {
        self.created
    }

    pub fn next_at(&self) -> ClockValue {
        self.next_at
    }

    /// Whether the lifetime creation budget is used up.
    pub fn exhausted(&self) -> bool {
        self.created >= self.total_limit
    }

    /// Stop automatic creation. Workers can still be registered explicitly.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn due(&self, now: ClockValue, live: usize) -> bool {
        !self.paused && now >= self.next_at && live < self.max_running && !self.exhausted()
    }

    /// Record a spawn at `now` and schedule the next.
    pub fn spawned<R: Rng>(&mut self, now: ClockValue, rng: &mut R) {
        self.created += 1;
        self.next_at = now.plus_nanos(rng.gen_range(1..=self.interval_ns));
    }

    /// Record a worker created outside the schedule.
    pub fn record_manual(&mut self) {
        self.created += 1;
    }
}

/// Runs each worker on a named OS thread.
pub struct ThreadSpawner {
    seed: u64,
    pause: Duration,
    stop: Arc<AtomicBool>,
    handles: Vec<(SlotId, JoinHandle<()>)>,
}

impl ThreadSpawner {
    pub fn new(seed: u64, pause: Duration) -> Self {
        Self {
            seed,
            pause,
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    /// Reap workers that already exited.
    fn reap(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) =
            self.handles.drain(..).partition(|(_, h)| h.is_finished());
        self.handles = running;
        for (slot, h) in done {
            if h.join().is_err() {
                warn!("worker {slot} panicked");
            }
        }
    }
}

impl Spawner for ThreadSpawner {
    fn spawn(&mut self, slot: SlotId, max_claim: &[u32], endpoint: WorkerEndpoint) -> Result<()> {
        self.reap();

        let max_claim = max_claim.to_vec();
        let seed = self.seed.wrapping_add(slot.0 as u64 + 1);
        let pause = self.pause;
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name(format!("worker-{}", slot.0))
            .spawn(move || run_worker(endpoint, max_claim, seed, pause, stop))
            .with_context(|| format!("Failed to spawn worker thread for {slot}"))?;
        self.handles.push((slot, handle));
        Ok(())
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        debug!("joining {} worker threads", self.handles.len());
        for (slot, h) in self.handles.drain(..) {
            if h.join().is_err() {
                warn!("worker {slot} panicked");
            }
        }
    }
}

impl Drop for ThreadSpawner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_claims_fit_totals() {
        let cfg = AllocatorConfig::default();
        let mut rng = SmallRng::seed_from_u64(11);
        for _ in 0..100 {
            let totals = random_totals(&mut rng, &cfg);
            assert_eq!(totals.len(), cfg.num_resources);
            assert!(totals.iter().all(|&t| (1..=10).contains(&t)));
            let claim = random_max_claim(&mut rng, &totals, &cfg);
            for (c, t) in claim.iter().zip(&totals) {
                assert!(*c >= 1 && c <= t && *c <= 4);
            }
        }
    }

    #[test]
    fn test_policy_limits() {
        let cfg = AllocatorConfig {
            max_running: 2,
            total_limit: 3,
            ..Default::default()
        };
        let mut rng = SmallRng::seed_from_u64(5);
        let mut policy = SpawnPolicy::new(&cfg);
        let now = ClockValue::ZERO;

        assert!(policy.due(now, 0));
        policy.spawned(now, &mut rng);
        assert!(!policy.due(now, 1));
        assert!(policy.next_at() > now);
        assert!(policy.next_at() <= now.plus_nanos(cfg.spawn_interval_ns));

        let later = now.plus_nanos(cfg.spawn_interval_ns);
        assert!(policy.due(later, 1));
        assert!(!policy.due(later, 2));

        policy.spawned(later, &mut rng);
        policy.record_manual();
        assert_eq!(policy.created(), 3);
        assert!(policy.exhausted());
        assert!(!policy.due(later.plus_nanos(1_000_000), 0));
    }

    #[test]
    fn test_paused_policy_never_due() {
        let mut policy = SpawnPolicy::new(&AllocatorConfig::default());
        policy.pause();
        assert!(!policy.due(ClockValue::new(10, 0), 0));
        assert!(!policy.exhausted());
    }
}
