// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;
use scx_banker::Allocator;
use scx_banker::AllocatorConfig;
use scx_banker::ExitReason;
use scx_banker::LogObserver;
use scx_banker::ThreadSpawner;

/// scx_banker: a simulated resource allocator using the Banker's algorithm.
///
/// The allocator owns a fixed supply of several resource types and spawns
/// worker threads over time, each with a randomized maximum claim. Workers
/// randomly request, release and give back resources. Every request is
/// granted only if the resulting state is still safe, meaning all live
/// workers could still run to their full claim in some order. Unsafe
/// requests block the worker until a later retry succeeds.
///
/// The run ends when the run time elapses, the event budget is spent, every
/// worker has been created and terminated, or on Ctrl-C. A summary of the
/// allocator's decisions is printed at exit.
#[derive(Debug, Parser)]
struct Opts {
    /// Number of resource types.
    #[clap(short = 'r', long, default_value = "20")]
    resources: usize,

    /// Upper bound of each resource type's randomized total.
    #[clap(short = 'u', long, default_value = "10")]
    max_units: u32,

    /// Upper bound of each entry of a worker's randomized max claim.
    #[clap(short = 'c', long, default_value = "4")]
    max_claim: u32,

    /// Maximum number of workers alive at once.
    #[clap(short = 'm', long, default_value = "18")]
    max_running: usize,

    /// Maximum number of workers created over the whole run.
    #[clap(short = 'n', long, default_value = "100")]
    total_limit: usize,

    /// Size of the worker slot table. Defaults to the total limit.
    #[clap(long)]
    slots: Option<usize>,

    /// Reuse the slots of terminated workers.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    recycle_slots: bool,

    /// Upper bound of the randomized logical delay between spawns, in
    /// nanoseconds.
    #[clap(short = 'i', long, default_value = "5000")]
    spawn_interval_ns: u64,

    /// Logical time advanced per handled event, in nanoseconds.
    #[clap(short = 'q', long, default_value = "5000")]
    quantum_ns: u32,

    /// Stop after this many handled events. 0 disables.
    #[clap(short = 'e', long, default_value = "10000")]
    max_events: u64,

    /// Log a ledger snapshot every this many handled events. 0 disables.
    #[clap(long, default_value = "20")]
    snapshot_interval: u64,

    /// Wall-clock run time limit in seconds. 0 disables.
    #[clap(short = 't', long, default_value = "2.0")]
    run_time: f64,

    /// Pause between worker actions in microseconds.
    #[clap(short = 'p', long, default_value = "100")]
    worker_pause_us: u64,

    /// Seed for resource totals, claims, spawn times and worker behavior.
    #[clap(short = 's', long, env = "BANKER_SEED", default_value = "42")]
    seed: u64,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,
}

impl Opts {
    fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig {
            num_resources: self.resources,
            max_units_per_resource: self.max_units,
            max_claim_per_resource: self.max_claim,
            max_running: self.max_running,
            total_limit: self.total_limit,
            slot_capacity: self.slots.unwrap_or(self.total_limit),
            recycle_slots: self.recycle_slots,
            spawn_interval_ns: self.spawn_interval_ns,
            quantum_ns: self.quantum_ns,
            max_events: self.max_events,
            snapshot_interval: self.snapshot_interval,
            seed: self.seed,
        }
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    if opts.run_time < 0.0 {
        bail!("run time must not be negative");
    }
    let cfg = opts.allocator_config();
    cfg.validate().context("Invalid allocator configuration")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("Failed to install Prometheus recorder")?;
    }

    let run_time = (opts.run_time > 0.0).then(|| Duration::from_secs_f64(opts.run_time));
    let spawner = ThreadSpawner::new(cfg.seed, Duration::from_micros(opts.worker_pause_us));
    if cfg.max_events == 0 && run_time.is_none() {
        info!(
            "no event budget or run time limit, running until {} workers complete",
            cfg.total_limit
        );
    }

    let mut alloc = Allocator::new(cfg, spawner, LogObserver)?;
    let report = alloc.run(shutdown, run_time);
    report.format(&mut std::io::stdout())?;

    if let ExitReason::SpawnFailed(e) = &report.reason {
        bail!("Worker spawn failed: {}", e);
    }
    Ok(())
}
