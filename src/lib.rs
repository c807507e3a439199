// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! scx_banker - Simulated resource allocator with Banker's deadlock avoidance.
//!
//! A single allocator thread owns a table of finite, multi-unit resource
//! types and hands units out to a population of concurrently running worker
//! threads. Every request is tentatively applied and checked with the
//! Banker's safety algorithm before it is granted; requests that would make
//! the system unsafe are parked on a FIFO queue and retried round-robin.
//!
//! # Architecture
//!
//! - **Clock**: logical time advanced by a fixed quantum per handled event
//! - **Ledger**: totals, available vector, per-slot claims and allocations
//! - **Safety**: Banker's algorithm over the ledger
//! - **Blocked queue**: denied requests awaiting a retry
//! - **Channel**: worker events in, targeted grants out, shared blocked flags
//! - **Allocator**: the decision loop tying the above together
//! - **Spawn / Worker**: creation policy and randomized worker behavior
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use scx_banker::*;
//!
//! let cfg = AllocatorConfig::default();
//! let spawner = ThreadSpawner::new(cfg.seed, Duration::from_micros(100));
//! let mut alloc = Allocator::new(cfg, spawner, LogObserver).unwrap();
//! let report = alloc.run(Arc::new(AtomicBool::new(false)), Some(Duration::from_secs(2)));
//! report.format(&mut std::io::stdout()).unwrap();
//! ```

#[macro_use]
extern crate static_assertions;

pub mod allocator;
pub mod blocked;
pub mod channel;
pub mod clock;
pub mod config;
pub mod ledger;
pub mod observer;
pub mod safety;
pub mod spawn;
pub mod stats;
pub mod types;
pub mod worker;

pub use allocator::{Allocator, Decision, ExitReason, Report};
pub use blocked::{BlockedEntry, BlockedQueue};
pub use channel::{
    BlockedFlags, ChannelError, Event, EventKind, Message, RequestChannel, WorkerEndpoint,
};
pub use clock::{ClockReader, ClockValue, SimClock};
pub use config::AllocatorConfig;
pub use ledger::{LedgerError, ResourceLedger, SlotEntry, TentativeGrant};
pub use observer::{AllocEvent, LogObserver, Observer, Trace};
pub use safety::{safe_sequence, SafetyChecker};
pub use spawn::{SpawnPolicy, Spawner, ThreadSpawner};
pub use stats::{AllocStats, Metrics};
pub use types::{ResourceId, SlotId};
