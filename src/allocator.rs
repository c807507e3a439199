// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The allocator decision loop.
//!
//! Each [`Allocator::step`] runs one iteration:
//!
//! 1. Spawn a worker if the creation policy says one is due.
//! 2. Take at most one event off the request channel, without waiting.
//! 3. Handle it. A request is tentatively applied to the ledger, checked for
//!    safety and then committed (and granted) or rolled back (and blocked).
//!    Releases and terminations return units directly.
//! 4. Retry the head of the blocked queue, if there is one.
//! 5. Advance the clock.
//!
//! Every handled event and every retry also advances the clock by one
//! quantum. [`Allocator::run`] loops until interrupted, out of wall-clock
//! time, out of event budget or out of workers, then tears everything down
//! exactly once and returns a [`Report`].
use std::fmt;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::Result;
use log::debug;
use log::error;
use log::info;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::blocked::BlockedQueue;
use crate::channel::ChannelError;
use crate::channel::Event;
use crate::channel::EventKind;
use crate::channel::RequestChannel;
use crate::clock::ClockValue;
use crate::clock::SimClock;
use crate::config::AllocatorConfig;
use crate::ledger::LedgerError;
use crate::ledger::ResourceLedger;
use crate::observer::AllocEvent;
use crate::observer::Observer;
use crate::safety::SafetyChecker;
use crate::spawn::random_max_claim;
use crate::spawn::random_totals;
use crate::spawn::SpawnPolicy;
use crate::spawn::Spawner;
use crate::stats::AllocStats;
use crate::stats::Metrics;
use crate::types::ResourceId;
use crate::types::SlotId;

/// Outcome of one grant attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Granted,
    Blocked,
    Rejected(LedgerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The shutdown flag was raised.
    Interrupted,
    /// The wall-clock run time elapsed.
    TimeLimit,
    /// The handled event budget was used up.
    EventBudget,
    /// Every worker that could be created has been created and terminated.
    Completed,
    SpawnFailed(String),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Interrupted => write!(f, "interrupted"),
            ExitReason::TimeLimit => write!(f, "run time limit reached"),
            ExitReason::EventBudget => write!(f, "event budget exhausted"),
            ExitReason::Completed => write!(f, "all workers completed"),
            ExitReason::SpawnFailed(e) => write!(f, "spawn failed: {e}"),
        }
    }
}

/// Final state of a run.
#[derive(Debug, Clone)]
pub struct Report {
    pub reason: ExitReason,
    pub stats: AllocStats,
    pub clock: ClockValue,
    /// Workers still live at shutdown whose units were reclaimed.
    pub reclaimed_at_shutdown: usize,
    pub total: Vec<u32>,
    pub available: Vec<u32>,
}

impl Report {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(w, "exit: {} at logical time {}", self.reason, self.clock)?;
        self.stats.format(w)?;
        writeln!(
            w,
            "reclaimed_at_shutdown={} total={:?} available={:?}",
            self.reclaimed_at_shutdown, self.total, self.available
        )?;
        Ok(())
    }
}

pub struct Allocator<S: Spawner, O: Observer> {
    cfg: AllocatorConfig,
    ledger: ResourceLedger,
    clock: SimClock,
    safety: SafetyChecker,
    blocked: BlockedQueue,
    channel: RequestChannel,
    policy: SpawnPolicy,
    spawner: S,
    observer: O,
    rng: SmallRng,
    stats: AllocStats,
    metrics: Metrics,
    report: Option<Report>,
}

impl<S: Spawner, O: Observer> Allocator<S, O> {
    /// Build an allocator with resource totals drawn from the seeded RNG.
    pub fn new(cfg: AllocatorConfig, spawner: S, observer: O) -> Result<Self> {
        cfg.validate()?;
        let mut rng = SmallRng::seed_from_u64(cfg.seed);
        let totals = random_totals(&mut rng, &cfg);
        Self::build(cfg, totals, rng, spawner, observer)
    }

    /// Build an allocator with explicit resource totals.
    pub fn with_totals(
        mut cfg: AllocatorConfig,
        totals: Vec<u32>,
        spawner: S,
        observer: O,
    ) -> Result<Self> {
        cfg.num_resources = totals.len();
        cfg.validate()?;
        let rng = SmallRng::seed_from_u64(cfg.seed);
        Self::build(cfg, totals, rng, spawner, observer)
    }

    fn build(
        cfg: AllocatorConfig,
        totals: Vec<u32>,
        rng: SmallRng,
        spawner: S,
        observer: O,
    ) -> Result<Self> {
        let clock = SimClock::new(cfg.quantum_ns);
        let channel = RequestChannel::new(cfg.slot_capacity, clock.reader());
        info!(
            "resource totals {:?}, {} slots, max {} running, {} total",
            totals, cfg.slot_capacity, cfg.max_running, cfg.total_limit
        );
        Ok(Self {
            ledger: ResourceLedger::new(totals, cfg.slot_capacity, cfg.recycle_slots),
            clock,
            safety: SafetyChecker::new(),
            blocked: BlockedQueue::new(cfg.slot_capacity),
            channel,
            policy: SpawnPolicy::new(&cfg),
            spawner,
            observer,
            rng,
            stats: AllocStats::default(),
            metrics: Metrics::new(),
            report: None,
            cfg,
        })
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn blocked_queue(&self) -> &BlockedQueue {
        &self.blocked
    }

    pub fn channel(&self) -> &RequestChannel {
        &self.channel
    }

    pub fn now(&self) -> ClockValue {
        self.clock.now()
    }

    pub fn stats(&self) -> AllocStats {
        AllocStats {
            safety_checks: self.safety.total_checks(),
            ..self.stats.clone()
        }
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn spawner_mut(&mut self) -> &mut S {
        &mut self.spawner
    }

    /// Stop the creation policy from spawning workers on its own.
    pub fn pause_spawning(&mut self) {
        self.policy.pause();
    }

    fn emit(&mut self, event: AllocEvent) {
        self.observer.observe(self.clock.now(), &event);
    }

    fn transport_fault(&mut self, e: ChannelError) {
        self.stats.transport_faults += 1;
        self.metrics.transport_faults.increment(1);
        self.emit(AllocEvent::TransportFault {
            detail: e.to_string(),
        });
    }

    fn reject(&mut self, slot: SlotId, e: LedgerError) {
        self.stats.rejections += 1;
        self.metrics.rejections.increment(1);
        self.emit(AllocEvent::EventRejected {
            slot,
            reason: e.to_string(),
        });
    }

    /// Register a worker with `max_claim` and launch it, bypassing the
    /// creation schedule.
    pub fn add_worker(&mut self, max_claim: Vec<u32>) -> Result<SlotId> {
        let slot = self.launch(max_claim)?;
        self.policy.record_manual();
        Ok(slot)
    }

    fn launch(&mut self, max_claim: Vec<u32>) -> Result<SlotId> {
        let slot = self.ledger.register(max_claim.clone())?;
        let endpoint = match self.channel.connect(slot) {
            Ok(ep) => ep,
            Err(e) => {
                self.ledger.retire(slot)?;
                return Err(e.into());
            }
        };
        if let Err(e) = self.spawner.spawn(slot, &max_claim, endpoint) {
            self.ledger.retire(slot)?;
            self.channel.disconnect(slot);
            return Err(e);
        }

        self.stats.processes_created += 1;
        self.metrics.created.increment(1);
        self.emit(AllocEvent::ProcessCreated { slot, max_claim });
        Ok(slot)
    }

    /// Spawn a worker if one is due. Errors are spawn faults.
    fn maybe_spawn(&mut self) -> Result<()> {
        let now = self.clock.now();
        if !self.policy.due(now, self.ledger.num_live()) || !self.ledger.has_free_slot() {
            return Ok(());
        }
        let claim = random_max_claim(&mut self.rng, self.ledger.total(), &self.cfg);
        self.launch(claim)?;
        self.policy.spawned(now, &mut self.rng);
        Ok(())
    }

    /// Tentatively grant one unit, check safety, and commit or roll back.
    /// A blocked slot is pushed to the tail of the blocked queue.
    fn try_grant(&mut self, slot: SlotId, resource: ResourceId, retry: bool) -> Decision {
        let decision = match self.ledger.tentatively_grant(slot, resource) {
            Ok(grant) => {
                self.metrics.safety_checks.increment(1);
                if self.safety.is_safe(&self.ledger) {
                    self.ledger.commit(grant);
                    Decision::Granted
                } else {
                    self.ledger.rollback(grant);
                    Decision::Blocked
                }
            }
            Err(LedgerError::Unavailable(_)) => Decision::Blocked,
            Err(e) => Decision::Rejected(e),
        };

        match &decision {
            Decision::Granted => {
                self.stats.grants += 1;
                self.metrics.grants.increment(1);
                if retry {
                    self.stats.grants_after_block += 1;
                }
                self.channel.set_blocked(slot, false);
                self.emit(AllocEvent::RequestGranted {
                    slot,
                    resource,
                    retry,
                });
                if let Err(e) = self.channel.send_grant(slot, self.clock.now()) {
                    self.transport_fault(e);
                }
            }
            Decision::Blocked => {
                if !retry {
                    self.stats.denials += 1;
                    self.metrics.denials.increment(1);
                }
                if let Err(e) = self.ledger.block(slot, resource) {
                    self.reject(slot, e.clone());
                    return Decision::Rejected(e);
                }
                self.channel.set_blocked(slot, true);
                self.blocked.enqueue(slot, resource);
                self.emit(AllocEvent::RequestBlocked {
                    slot,
                    resource,
                    retry,
                });
            }
            Decision::Rejected(e) => {
                // Dead and unknown slots never recorded a pending request.
                if let Err(clear) = self.ledger.set_pending(slot, None) {
                    debug!("{slot}: no pending request to clear ({clear})");
                }
                self.channel.set_blocked(slot, false);
                self.reject(slot, e.clone());
            }
        }
        self.metrics.blocked_depth.set(self.blocked.len() as f64);
        decision
    }

    fn handle_request(
        &mut self,
        slot: SlotId,
        resource: ResourceId,
        sent_at: ClockValue,
    ) -> Decision {
        self.stats.requests += 1;
        self.metrics.requests.increment(1);
        self.emit(AllocEvent::RequestReceived {
            slot,
            resource,
            sent_at,
        });

        if self.ledger.is_blocked(slot) {
            let e = LedgerError::AlreadyBlocked(slot);
            self.reject(slot, e.clone());
            return Decision::Rejected(e);
        }
        if let Err(e) = self.ledger.set_pending(slot, Some(resource)) {
            self.reject(slot, e.clone());
            return Decision::Rejected(e);
        }
        self.try_grant(slot, resource, false)
    }

    fn handle_release(&mut self, slot: SlotId, resource: ResourceId) {
        match self.ledger.release(slot, resource) {
            Ok(()) => {
                self.stats.releases += 1;
                self.metrics.releases.increment(1);
                self.emit(AllocEvent::ReleaseReceived { slot, resource });
            }
            Err(e) => self.reject(slot, e),
        }
    }

    fn handle_terminate(&mut self, slot: SlotId) {
        match self.ledger.retire(slot) {
            Ok(reclaimed) => {
                self.blocked.remove(slot);
                self.channel.disconnect(slot);
                self.stats.processes_terminated += 1;
                self.metrics.terminated.increment(1);
                self.metrics.blocked_depth.set(self.blocked.len() as f64);
                self.emit(AllocEvent::TerminateReceived { slot, reclaimed });
            }
            Err(e) => self.reject(slot, e),
        }
    }

    /// Apply one worker event and advance the clock.
    pub fn handle_event(&mut self, event: Event) {
        match event.kind {
            EventKind::Request { slot, resource } => {
                self.handle_request(slot, resource, event.sent_at);
            }
            EventKind::Release { slot, resource } => self.handle_release(slot, resource),
            EventKind::Terminate { slot } => self.handle_terminate(slot),
        }
        self.stats.events_handled += 1;
        self.clock.tick();

        if self.cfg.snapshot_interval > 0
            && self.stats.events_handled % self.cfg.snapshot_interval == 0
        {
            let allocated = self.ledger.snapshot();
            self.emit(AllocEvent::Snapshot { allocated });
        }
    }

    /// Retry the head of the blocked queue once. Returns `None` if the queue
    /// is empty.
    pub fn retry_blocked(&mut self) -> Option<(SlotId, Decision)> {
        let entry = self.blocked.dequeue()?;
        self.stats.retries += 1;
        self.metrics.retries.increment(1);
        let decision = self.try_grant(entry.slot, entry.resource, true);
        self.clock.tick();
        Some((entry.slot, decision))
    }

    /// Run one loop iteration. Returns whether an event was handled. Errors
    /// are fatal spawn faults.
    pub fn step(&mut self) -> Result<bool> {
        self.maybe_spawn()?;

        let handled = match self.channel.try_next() {
            Ok(Some(event)) => {
                self.handle_event(event);
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.transport_fault(e);
                false
            }
        };

        if !self.blocked.is_empty() {
            self.retry_blocked();
        }
        self.clock.tick();

        debug_assert!(self.ledger.check_invariants().is_ok());
        Ok(handled)
    }

    /// Loop until `shutdown` is raised, `run_time` of wall-clock time
    /// passes, the event budget is spent, or every worker has come and
    /// gone. Tears down and reports in all cases, including a spawn fault.
    pub fn run(&mut self, shutdown: Arc<AtomicBool>, run_time: Option<Duration>) -> Report {
        let started = Instant::now();
        info!("allocator running");

        let reason = loop {
            if shutdown.load(Ordering::Relaxed) {
                break ExitReason::Interrupted;
            }
            if run_time.is_some_and(|limit| started.elapsed() >= limit) {
                break ExitReason::TimeLimit;
            }
            if self.cfg.max_events > 0 && self.stats.events_handled >= self.cfg.max_events {
                break ExitReason::EventBudget;
            }
            if self.policy.exhausted() && self.ledger.num_live() == 0 {
                break ExitReason::Completed;
            }

            match self.step() {
                Ok(true) => {}
                Ok(false) => thread::yield_now(),
                Err(e) => {
                    error!("spawn fault: {e:#}");
                    break ExitReason::SpawnFailed(format!("{e:#}"));
                }
            }
        };

        self.teardown(reason)
    }

    /// Stop workers, reclaim every live slot and build the final report.
    /// Only the first call does any work; later calls return the same
    /// report.
    pub fn teardown(&mut self, reason: ExitReason) -> Report {
        if let Some(report) = &self.report {
            return report.clone();
        }

        info!("shutting down: {reason}");
        self.channel.close();
        self.spawner.shutdown();

        let live: Vec<SlotId> = self.ledger.live_slots().map(|(id, _)| id).collect();
        for &slot in &live {
            if let Ok(reclaimed) = self.ledger.retire(slot) {
                debug!("reclaimed {reclaimed:?} from {slot}");
            }
            self.channel.disconnect(slot);
        }
        while self.blocked.dequeue().is_some() {}
        self.metrics.blocked_depth.set(0.0);

        let report = Report {
            reason,
            stats: self.stats(),
            clock: self.clock.now(),
            reclaimed_at_shutdown: live.len(),
            total: self.ledger.total().to_vec(),
            available: self.ledger.available().to_vec(),
        };
        self.report = Some(report.clone());
        report
    }
}

impl<S: Spawner, O: Observer> Drop for Allocator<S, O> {
    fn drop(&mut self) {
        if self.report.is_none() {
            self.teardown(ExitReason::Interrupted);
        }
    }
}
