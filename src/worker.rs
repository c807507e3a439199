//! Worker behavior.
//!
//! A worker holds a local copy of its own allocation and, between short
//! pauses, picks one of three actions: request a resource it still has
//! claim on, release one it holds, or terminate. It never acts while it has
//! a request outstanding or its blocked flag is raised.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::trace;
use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;

use crate::channel::ChannelError;
use crate::channel::WorkerEndpoint;
use crate::types::ResourceId;

/// Roll above this requests.
const REQUEST_ABOVE: u32 = 55;
/// Roll above this (and not above `REQUEST_ABOVE`) releases.
const RELEASE_ABOVE: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Request(ResourceId),
    Release(ResourceId),
    Terminate,
    Idle,
}

/// The worker's local view of its claim and allocation.
#[derive(Debug, Clone)]
pub struct WorkerState {
    max_claim: Vec<u32>,
    allocated: Vec<u32>,
}

impl WorkerState {
    pub fn new(max_claim: Vec<u32>) -> Self {
        let allocated = vec![0; max_claim.len()];
        Self {
            max_claim,
            allocated,
        }
    }

    pub fn allocated(&self) -> &[u32] {
        &self.allocated
    }

    /// Whether the worker holds its entire claim.
    pub fn satisfied(&self) -> bool {
        self.allocated.iter().sum::<u32>() >= self.max_claim.iter().sum::<u32>()
    }

    pub fn decide<R: Rng>(&self, rng: &mut R) -> Action {
        if self.satisfied() {
            return Action::Terminate;
        }
        let roll = rng.gen_range(1..=100);
        if roll > REQUEST_ABOVE {
            let wanted: Vec<_> = (0..self.max_claim.len())
                .filter(|&r| self.allocated[r] < self.max_claim[r])
                .collect();
            if wanted.is_empty() {
                return Action::Terminate;
            }
            Action::Request(ResourceId(wanted[rng.gen_range(0..wanted.len())]))
        } else if roll > RELEASE_ABOVE {
            let held: Vec<_> = (0..self.allocated.len())
                .filter(|&r| self.allocated[r] > 0)
                .collect();
            if held.is_empty() {
                return Action::Idle;
            }
            Action::Release(ResourceId(held[rng.gen_range(0..held.len())]))
        } else {
            Action::Terminate
        }
    }

    pub fn granted(&mut self, resource: ResourceId) {
        self.allocated[resource.index()] += 1;
    }

    pub fn released(&mut self, resource: ResourceId) {
        let n = &mut self.allocated[resource.index()];
        *n = n.saturating_sub(1);
    }
}

fn worker_loop<R: Rng>(
    endpoint: &WorkerEndpoint,
    state: &mut WorkerState,
    rng: &mut R,
    pause: Duration,
    stop: &AtomicBool,
) -> Result<(), ChannelError> {
    let mut waiting_on: Option<ResourceId> = None;

    while !stop.load(Ordering::Relaxed) {
        if let Some(resource) = waiting_on {
            if endpoint.recv_grant(pause)?.is_some() {
                state.granted(resource);
                waiting_on = None;
            }
            continue;
        }
        if endpoint.is_blocked() {
            thread::sleep(pause);
            continue;
        }

        match state.decide(rng) {
            Action::Request(r) => {
                endpoint.request(r)?;
                waiting_on = Some(r);
            }
            Action::Release(r) => {
                endpoint.release(r)?;
                state.released(r);
            }
            Action::Terminate => return endpoint.terminate(),
            Action::Idle => {}
        }
        thread::sleep(pause);
    }
    Ok(())
}

/// Drive one worker until it terminates, its channel closes or `stop` is
/// raised.
pub fn run_worker(
    endpoint: WorkerEndpoint,
    max_claim: Vec<u32>,
    seed: u64,
    pause: Duration,
    stop: Arc<AtomicBool>,
) {
    let slot = endpoint.slot();
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut state = WorkerState::new(max_claim);

    match worker_loop(&endpoint, &mut state, &mut rng, pause, &stop) {
        Ok(()) => trace!("{slot} exiting, held {:?}", state.allocated()),
        Err(e) => trace!("{slot} exiting: {e}"),
    }
}
