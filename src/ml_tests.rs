//! Lock family tests: resource locks, spin gates, exclusion regions.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::ml::{Exclusion, ResourceLocks, SpinGate, LOCK_AST, LOCK_FILE, LOCK_PMAP};
use crate::testkit::disp;

#[test]
fn resource_lock_excludes_across_tasks() {
    disp();
    let ml = Arc::new(ResourceLocks::new());
    let counter = Arc::new(AtomicU32::new(0));
    let mut joins = Vec::new();
    for _ in 0..4 {
        let ml = ml.clone();
        let counter = counter.clone();
        joins.push(thread::spawn(move || {
            for _ in 0..50 {
                ml.lock(LOCK_FILE);
                let v = counter.load(Ordering::SeqCst);
                thread::yield_now();
                counter.store(v + 1, Ordering::SeqCst);
                ml.unlock(LOCK_FILE);
            }
        }));
    }
    for j in joins {
        j.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 200);
}

#[test]
fn ascending_acquisition_is_legal() {
    disp();
    let ml = ResourceLocks::new();
    ml.lock(LOCK_FILE);
    ml.lock(LOCK_AST);
    ml.lock(LOCK_PMAP);
    assert!(ml.holds(LOCK_AST));
    ml.unlock(LOCK_PMAP);
    ml.unlock(LOCK_AST);
    ml.unlock(LOCK_FILE);
    assert!(!ml.holds(LOCK_FILE));
}

#[test]
#[should_panic(expected = "out of order")]
fn descending_acquisition_is_fatal() {
    disp();
    let ml = ResourceLocks::new();
    ml.lock(LOCK_AST);
    ml.lock(LOCK_FILE);
}

#[test]
#[should_panic(expected = "not held")]
fn unlocking_unheld_lock_is_fatal() {
    disp();
    let ml = ResourceLocks::new();
    ml.unlock(LOCK_AST);
}

#[test]
fn with_runs_under_lock() {
    disp();
    let ml = ResourceLocks::new();
    let r = ml.with(LOCK_FILE, || {
        assert!(ml.holds(LOCK_FILE));
        7
    });
    assert_eq!(r, 7);
    assert!(!ml.holds(LOCK_FILE));
}

#[test]
fn spin_gate_token_round_trip() {
    let gate = SpinGate::new();
    let token = gate.lock();
    gate.unlock(token);
    let token = gate.lock();
    gate.unlock(token);
}

#[test]
fn exclusion_basics() {
    disp();
    let x = Exclusion::new();
    assert!(!x.check());
    x.start();
    assert!(x.check());
    x.stop();
    assert!(!x.check());
}

#[test]
fn exclusion_cond_start_fails_when_occupied() {
    disp();
    let x = Exclusion::new();
    assert!(x.cond_start());
    assert!(!x.cond_start());
    x.cond_stop();
    assert!(!x.check());
    assert!(x.cond_start());
    x.cond_stop();
}

#[test]
fn exclusion_blocks_and_hands_off() {
    disp();
    let x = Arc::new(Exclusion::new());
    let in_region = Arc::new(AtomicU32::new(0));
    x.start();
    let (x2, in2) = (x.clone(), in_region.clone());
    let waiter = thread::spawn(move || {
        x2.start();
        in2.store(1, Ordering::SeqCst);
        x2.stop();
    });
    thread::sleep(Duration::from_millis(30));
    assert_eq!(in_region.load(Ordering::SeqCst), 0, "entered while occupied");
    x.stop();
    waiter.join().unwrap();
    assert_eq!(in_region.load(Ordering::SeqCst), 1);
    assert!(!x.check());
}

#[test]
fn exclusion_reinit() {
    disp();
    let x = Exclusion::new();
    x.start();
    x.init();
    assert!(!x.check());
    x.start();
    x.stop();
}
