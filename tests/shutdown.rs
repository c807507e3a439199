use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use scx_banker::*;

mod common;
use common::*;

fn small_config(seed: u64) -> AllocatorConfig {
    AllocatorConfig {
        num_resources: 6,
        max_running: 4,
        total_limit: 10,
        slot_capacity: 10,
        max_events: 2000,
        seed,
        ..Default::default()
    }
}

#[test]
fn test_spawn_failure_shuts_down_cleanly() {
    setup_test();
    let mut alloc = Allocator::new(
        small_config(get_seed()),
        ScriptedSpawner::failing_after(2),
        (LogObserver, Trace::new()),
    )
    .unwrap();

    let report = alloc.run(Arc::new(AtomicBool::new(false)), None);
    assert!(matches!(report.reason, ExitReason::SpawnFailed(_)));
    assert_eq!(report.stats.processes_created, 2);
    assert_eq!(report.reclaimed_at_shutdown, 2);
    assert_eq!(report.available, report.total);
    assert_eq!(alloc.spawner_mut().shutdowns, 1);
    assert_eq!(alloc.ledger().num_live(), 0);
}

#[test]
fn test_teardown_runs_once() {
    setup_test();
    let mut alloc = allocator(vec![3, 3]);
    let a = alloc.add_worker(vec![2, 2]).unwrap();
    request(&mut alloc, a, 0);
    request(&mut alloc, a, 1);

    let first = alloc.teardown(ExitReason::Interrupted);
    let second = alloc.teardown(ExitReason::TimeLimit);
    assert_eq!(alloc.spawner_mut().shutdowns, 1);
    assert_eq!(first.reason, ExitReason::Interrupted);
    assert_eq!(second.reason, ExitReason::Interrupted);
    assert_eq!(first.stats, second.stats);
    assert_eq!(first.reclaimed_at_shutdown, 1);
    assert_eq!(first.available, vec![3, 3]);
    assert_eq!(first.stats.grants, 2);

    // Workers see the channel go away.
    let ep = alloc.spawner_mut().endpoint(a);
    assert_eq!(
        ep.recv_grant(Duration::ZERO).unwrap().map(|m| m.granted),
        Some(true)
    );
    ep.recv_grant(Duration::ZERO).unwrap();
    assert_eq!(
        ep.recv_grant(Duration::ZERO),
        Err(ChannelError::Disconnected)
    );
}

#[test]
fn test_interrupt_before_first_step() {
    setup_test();
    let mut alloc = Allocator::new(
        small_config(get_seed()),
        ScriptedSpawner::default(),
        (LogObserver, Trace::new()),
    )
    .unwrap();
    let report = alloc.run(Arc::new(AtomicBool::new(true)), None);
    assert_eq!(report.reason, ExitReason::Interrupted);
    assert_eq!(report.stats, AllocStats::default());
    assert_eq!(report.clock, ClockValue::ZERO);
}

#[test]
fn test_event_budget_ends_run() {
    setup_test();
    let mut cfg = small_config(get_seed());
    cfg.max_events = 3;
    let mut alloc = Allocator::with_totals(
        cfg,
        vec![2],
        ScriptedSpawner::default(),
        (LogObserver, Trace::new()),
    )
    .unwrap();
    alloc.pause_spawning();
    let a = alloc.add_worker(vec![2]).unwrap();
    let ep = alloc.spawner_mut().endpoint(a);
    ep.request(ResourceId(0)).unwrap();
    ep.release(ResourceId(0)).unwrap();
    ep.terminate().unwrap();

    let report = alloc.run(Arc::new(AtomicBool::new(false)), Some(Duration::from_secs(10)));
    assert_eq!(report.reason, ExitReason::EventBudget);
    assert_eq!(report.stats.events_handled, 3);
    assert_eq!(report.stats.processes_terminated, 1);
    assert_eq!(report.reclaimed_at_shutdown, 0);
}

#[test]
fn test_time_limit_reclaims_live_workers() {
    setup_test();
    let mut alloc = allocator(vec![3, 2]);
    let a = alloc.add_worker(vec![2, 2]).unwrap();
    let b = alloc.add_worker(vec![1, 0]).unwrap();
    request(&mut alloc, a, 1);
    request(&mut alloc, b, 0);
    assert_eq!(alloc.ledger().available(), &[2, 1]);

    let report = alloc.run(Arc::new(AtomicBool::new(false)), Some(Duration::ZERO));
    assert_eq!(report.reason, ExitReason::TimeLimit);
    assert_eq!(report.reclaimed_at_shutdown, 2);
    assert_eq!(report.available, report.total);
    assert_eq!(report.stats.grants, 2);
    assert_eq!(report.stats.processes_terminated, 0);
    assert_eq!(alloc.spawner_mut().shutdowns, 1);
    assert_eq!(alloc.ledger().num_live(), 0);
}

#[test]
fn test_run_completes_when_every_worker_exits() {
    setup_test();
    let cfg = AllocatorConfig {
        max_running: 2,
        total_limit: 2,
        slot_capacity: 2,
        max_events: 0,
        snapshot_interval: 0,
        seed: get_seed(),
        ..Default::default()
    };
    let mut alloc = Allocator::with_totals(
        cfg,
        vec![4, 4],
        ScriptedSpawner::default(),
        (LogObserver, Trace::new()),
    )
    .unwrap();

    for _ in 0..100 {
        if alloc.spawner_mut().endpoints.len() == 2 {
            break;
        }
        alloc.step().unwrap();
    }
    let slots: Vec<_> = alloc.spawner_mut().endpoints.keys().copied().collect();
    assert_eq!(slots.len(), 2);
    for &slot in &slots {
        alloc.spawner_mut().endpoint(slot).terminate().unwrap();
    }

    let report = alloc.run(Arc::new(AtomicBool::new(false)), Some(Duration::from_secs(10)));
    assert_eq!(report.reason, ExitReason::Completed);
    assert_eq!(report.stats.processes_created, 2);
    assert_eq!(report.stats.processes_terminated, 2);
    assert_eq!(report.reclaimed_at_shutdown, 0);
    assert_eq!(report.available, report.total);
}

/// Full run with real worker threads.
#[test]
fn test_threaded_run() {
    setup_test();
    let seed = get_seed();
    let spawner = ThreadSpawner::new(seed, Duration::from_micros(50));
    let mut alloc =
        Allocator::new(small_config(seed), spawner, (LogObserver, Trace::new())).unwrap();

    let report = alloc.run(Arc::new(AtomicBool::new(false)), Some(Duration::from_secs(5)));
    assert!(matches!(
        report.reason,
        ExitReason::EventBudget | ExitReason::Completed | ExitReason::TimeLimit
    ));
    assert_eq!(report.available, report.total);

    let stats = &report.stats;
    assert!(stats.processes_created >= 1 && stats.processes_created <= 10);
    assert!(stats.processes_terminated <= stats.processes_created);
    assert!(stats.grants <= stats.requests);
    assert!(stats.safety_checks >= stats.grants);
    assert_eq!(stats.rejections, 0);

    let mut out = Vec::new();
    report.format(&mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("safety_checks="));
}
