//! End-to-end behavior of the concurrency core: cohort barriers, permit
//! gating and failure isolation.

#[macro_use]
mod common;

use common::*;
use pipeline_concurrency::{ResourceUnit, TaskError, WorkUnit};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

#[test]
fn scenario_a_third_caller_waits_for_release() {
    init_test("scenario_a_third_caller_waits_for_release");
    let core = test_core(2);
    let threads = ResourceUnit::new("threads", 1);

    test_section!("three callers start together");
    let gate = Arc::new(Barrier::new(3));
    let acquired = Arc::new(AtomicUsize::new(0));
    let callers: Vec<_> = (0..3)
        .map(|_| {
            let (core, unit) = (core.clone(), threads.clone());
            let (gate, acquired) = (Arc::clone(&gate), Arc::clone(&acquired));
            thread::spawn(move || {
                gate.wait();
                core.acquire(&unit);
                acquired.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    test_section!("exactly two proceed");
    assert!(eventually(Duration::from_secs(2), || {
        acquired.load(Ordering::SeqCst) == 2
    }));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(acquired.load(Ordering::SeqCst), 2, "third caller must be blocked");
    assert_eq!(core.resources().available("threads"), Some(0));

    test_section!("release wakes third caller");
    core.release(&threads);
    assert!(eventually(Duration::from_secs(2), || {
        acquired.load(Ordering::SeqCst) == 3
    }));
    for caller in callers {
        caller.join().expect("caller panicked");
    }
    assert_eq!(core.resources().available("threads"), Some(0));

    core.release(&threads);
    assert_eq!(core.resources().available("threads"), Some(1));
    core.release(&threads);
    assert_eq!(core.resources().available("threads"), Some(2));
    test_complete!("scenario_a_third_caller_waits_for_release");
}

#[test]
fn scenario_b_memory_units_block_when_short() {
    init_test("scenario_b_memory_units_block_when_short");
    let core = test_core(2);
    core.set_limit("memory", 10).unwrap();
    let unit = ResourceUnit::new("memory", 4);

    core.acquire(&unit);
    assert_eq!(core.resources().available("memory"), Some(6));
    core.acquire(&unit);
    assert_eq!(core.resources().available("memory"), Some(2));

    let blocked = {
        let (core, unit) = (core.clone(), unit.clone());
        run_within(Duration::from_millis(100), move || core.acquire(&unit))
    };
    assert!(blocked.is_none(), "third acquire should block with 2 available");

    // The blocked thread above is still waiting; this release satisfies it.
    core.release(&unit);
    let drained = eventually(Duration::from_secs(2), || {
        core.resources()
            .snapshot_of("memory")
            .is_some_and(|s| s.permits.acquisitions == 3 && s.permits.waiters == 0)
    });
    assert!(drained, "the waiting acquire should take the released permits");
    assert_eq!(core.resources().available("memory"), Some(2));
    test_complete!("scenario_b_memory_units_block_when_short");
}

#[test]
fn scenario_c_oversized_request_stays_blocked() {
    init_test("scenario_c_oversized_request_stays_blocked");
    let core = test_core(2);
    core.set_limit("gpu", 2).unwrap();

    let c = core.clone();
    let result = run_within(Duration::from_millis(300), move || {
        c.acquire(&ResourceUnit::new("gpu", 5));
    });
    assert!(result.is_none(), "acquire of 5 against capacity 2 must not return");

    // A request larger than capacity does not hold up smaller ones.
    assert!(core.resources().try_acquire(&ResourceUnit::new("gpu", 2)));
    test_complete!("scenario_c_oversized_request_stays_blocked");
}

#[test]
fn scenario_d_failures_do_not_abort_siblings() {
    init_test("scenario_d_failures_do_not_abort_siblings");
    let core = test_core(2);
    let finished = Arc::new(AtomicUsize::new(0));

    let units: Vec<Box<dyn WorkUnit>> = (0..5)
        .map(|i| {
            let finished = Arc::clone(&finished);
            Box::new(move || -> Result<(), TaskError> {
                thread::sleep(Duration::from_millis(10));
                if i % 2 == 1 {
                    return Err(format!("unit {i} failed").into());
                }
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }) as Box<dyn WorkUnit>
        })
        .collect();

    let report = core.execute_units(units);
    assert_eq!(report.total, 5);
    assert_eq!(report.failed, 2);
    assert_eq!(finished.load(Ordering::SeqCst), 3);
    test_complete!("scenario_d_failures_do_not_abort_siblings", failed = report.failed);
}

#[test]
fn barrier_never_releases_early() {
    init_test("barrier_never_releases_early");
    let core = test_core(4);
    for n in [1usize, 7, 32] {
        let counter = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..n)
            .map(|i| {
                let counter = Arc::clone(&counter);
                move || {
                    thread::sleep(Duration::from_millis((i % 5) as u64));
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .collect();
        core.execute(tasks);
        let seen = counter.load(Ordering::SeqCst);
        assert_with_log!(seen == n, "counter at return", n, seen);
    }
    test_complete!("barrier_never_releases_early");
}

#[test]
fn empty_cohort_returns_immediately() {
    init_test("empty_cohort_returns_immediately");
    let core = test_core(2);
    let report = run_within(Duration::from_secs(1), move || {
        let report = core.execute(Vec::<fn()>::new());
        (report, core.pool_stats().submitted)
    })
    .expect("execute([]) should not block");
    assert_eq!(report.0.total, 0);
    assert_eq!(report.1, 0);
    test_complete!("empty_cohort_returns_immediately");
}

#[test]
fn concurrent_cohorts_are_independent() {
    init_test("concurrent_cohorts_are_independent");
    let core = test_core(2);
    let gate = Arc::new(AtomicBool::new(false));

    let slow = {
        let (core, gate) = (core.clone(), Arc::clone(&gate));
        thread::spawn(move || {
            core.execute((0..3).map(|_| {
                let gate = Arc::clone(&gate);
                move || {
                    while !gate.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(2));
                    }
                }
            }))
        })
    };

    // A second cohort finishes while the first is still held open.
    let fast_count = Arc::new(AtomicUsize::new(0));
    let fc = Arc::clone(&fast_count);
    let fast = core.execute((0..4).map(move |_| {
        let fc = Arc::clone(&fc);
        move || {
            fc.fetch_add(1, Ordering::SeqCst);
        }
    }));
    assert_eq!(fast.total, 4);
    assert_eq!(fast_count.load(Ordering::SeqCst), 4);
    assert!(!slow.is_finished());

    gate.store(true, Ordering::SeqCst);
    let slow = slow.join().expect("slow cohort panicked");
    assert_eq!(slow.total, 3);
    assert_ne!(slow.id, fast.id);
    test_complete!("concurrent_cohorts_are_independent");
}

#[test]
fn physical_threads_exceed_core_count() {
    init_test("physical_threads_exceed_core_count");
    let core = test_core(2);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(6));

    let tasks: Vec<_> = (0..6)
        .map(|_| {
            let (running, peak, barrier) =
                (Arc::clone(&running), Arc::clone(&peak), Arc::clone(&barrier));
            move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                // All six must be running at once for this to return.
                barrier.wait();
                running.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .collect();
    core.execute(tasks);
    assert_eq!(peak.load(Ordering::SeqCst), 6);
    assert!(core.pool_stats().largest_pool_size >= 6);
    test_complete!("physical_threads_exceed_core_count");
}

#[test]
fn default_resource_caps_logical_concurrency() {
    init_test("default_resource_caps_logical_concurrency");
    let core = test_core(2);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let (core, active, peak) = (core.clone(), Arc::clone(&active), Arc::clone(&peak));
            move || {
                let unit = core.default_unit(1);
                core.acquire(&unit);
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(15));
                active.fetch_sub(1, Ordering::SeqCst);
                core.release(&unit);
            }
        })
        .collect();
    core.execute(tasks);
    let peak = peak.load(Ordering::SeqCst);
    assert_with_log!(peak <= 2, "peak logical concurrency", 2usize, peak);
    assert_eq!(core.resources().available("threads"), Some(2));
    test_complete!("default_resource_caps_logical_concurrency");
}

#[test]
fn unit_outcomes_can_be_collected_by_caller() {
    init_test("unit_outcomes_can_be_collected_by_caller");
    let core = test_core(3);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let errors = Arc::clone(&errors);
            move || {
                if i == 2 {
                    errors.lock().unwrap().push(format!("stage {i} rejected input"));
                }
            }
        })
        .collect();
    let report = core.execute(tasks);
    assert_eq!(report.failed, 0);
    assert_eq!(errors.lock().unwrap().as_slice(), ["stage 2 rejected input"]);
    test_complete!("unit_outcomes_can_be_collected_by_caller");
}

#[test]
fn panicking_unit_still_counts_down() {
    init_test("panicking_unit_still_counts_down");
    let core = test_core(2);
    let ok = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<Box<dyn FnOnce() + Send>> = vec![
        Box::new(|| panic!("stage exploded")),
        Box::new({
            let ok = Arc::clone(&ok);
            move || {
                ok.fetch_add(1, Ordering::SeqCst);
            }
        }),
    ];
    let report = run_within(Duration::from_secs(5), move || core.execute(tasks))
        .expect("execute should return despite a panic");
    assert_eq!(report.failed, 1);
    assert_eq!(ok.load(Ordering::SeqCst), 1);
    test_complete!("panicking_unit_still_counts_down");
}
