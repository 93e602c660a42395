//! Deferred execution manager tests, including signal delivery.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::config::{KernelConfig, OverrunPolicy};
use crate::dxm::{helper_unwired, SignalRec};
use crate::status::Status;
use crate::testkit::{fixture, fixture_with};
use crate::Kernel;

fn counting_cb(_k: &Kernel, _data: &[u8]) {}

#[test]
fn callbacks_run_in_order_with_payload() {
    static ORDER_RUNS: AtomicU32 = AtomicU32::new(0);
    static ORDER_LAST: AtomicU32 = AtomicU32::new(0);
    fn order_cb(_k: &Kernel, data: &[u8]) {
        ORDER_RUNS.fetch_add(1, Ordering::SeqCst);
        ORDER_LAST.store(data[0] as u32, Ordering::SeqCst);
    }
    let fix = fixture();
    let k = &fix.k;
    k.dxm
        .add_callback(&k.dxm.unwired, order_cb, &[11, 2, 3], false)
        .unwrap();
    k.dxm
        .add_callback(&k.dxm.unwired, order_cb, &[22], false)
        .unwrap();
    assert_eq!(k.dxm.unwired.depth(), 2);
    k.dxm.unwired.scan(k);
    assert_eq!(ORDER_RUNS.load(Ordering::SeqCst), 2);
    assert_eq!(ORDER_LAST.load(Ordering::SeqCst), 22);
    assert_eq!(k.dxm.unwired.depth(), 0);
}

#[test]
fn enqueue_advances_queue_ec() {
    let fix = fixture();
    let k = &fix.k;
    let before = k.dxm.wired.ec.read();
    k.dxm
        .add_callback(&k.dxm.wired, counting_cb, &[], false)
        .unwrap();
    assert_eq!(k.dxm.wired.ec.read(), before + 1);
    k.dxm.wired.scan(k);
}

#[test]
fn duplicate_entries_collapse_when_asked() {
    let fix = fixture();
    let k = &fix.k;
    k.dxm
        .add_callback(&k.dxm.unwired, counting_cb, &[7, 7], true)
        .unwrap();
    k.dxm
        .add_callback(&k.dxm.unwired, counting_cb, &[7, 7], true)
        .unwrap();
    // Same callback, different payload: not a duplicate.
    k.dxm
        .add_callback(&k.dxm.unwired, counting_cb, &[7, 8], true)
        .unwrap();
    assert_eq!(k.dxm.unwired.depth(), 2);
    k.dxm.unwired.scan(k);
}

#[test]
#[should_panic(expected = "datum too large")]
fn oversized_payload_is_fatal() {
    let fix = fixture();
    let k = &fix.k;
    let too_big = [0u8; 13];
    let _ = k
        .dxm
        .add_callback(&k.dxm.unwired, counting_cb, &too_big, false);
}

#[test]
fn overflow_drop_policy_counts_overruns() {
    let mut cfg = KernelConfig::small();
    cfg.overrun_policy = OverrunPolicy::DropAndLog;
    let fix = fixture_with(cfg);
    let k = &fix.k;
    let mut status = Ok(());
    for i in 0..k.cfg.dxm_queue_depth {
        status = k
            .dxm
            .add_callback(&k.dxm.unwired, counting_cb, &[i as u8], false);
        if status.is_err() {
            break;
        }
    }
    assert_eq!(status.unwrap_err(), Status::DxmNoMoreQueueSlots);
    assert_eq!(k.dxm.overruns(), 1);
    k.dxm.unwired.scan(k);
}

#[test]
fn signals_deliver_through_unwired_queue() {
    static SIG_SEEN: AtomicU32 = AtomicU32::new(0);
    static SIG_P4: AtomicU32 = AtomicU32::new(0);
    fn sig_handler(_k: &Kernel, rec: &SignalRec) {
        SIG_SEEN.fetch_add(1, Ordering::SeqCst);
        SIG_P4.store(rec.p4, Ordering::SeqCst);
    }
    let fix = fixture();
    let k = &fix.k;
    k.dxm.register_signal_handler(4, sig_handler);
    k.dxm.add_signal(4, 9, 10, 0xDEAD_BEEF, false).unwrap();
    k.dxm.unwired.scan(k);
    assert_eq!(SIG_SEEN.load(Ordering::SeqCst), 1);
    assert_eq!(SIG_P4.load(Ordering::SeqCst), 0xDEAD_BEEF);
}

#[test]
fn helper_drains_queue_as_ec_advances() {
    static HELPER_RUNS: AtomicUsize = AtomicUsize::new(0);
    fn helper_cb(_k: &Kernel, _data: &[u8]) {
        HELPER_RUNS.fetch_add(1, Ordering::SeqCst);
    }
    let fix = fixture();
    let k = fix.k.clone();
    let k2 = k.clone();
    // The helper loops forever; leave it parked on its event count when
    // the test ends.
    thread::spawn(move || helper_unwired(&k2));
    thread::sleep(Duration::from_millis(20));
    k.dxm
        .add_callback(&k.dxm.unwired, helper_cb, &[1], false)
        .unwrap();
    k.dxm
        .add_callback(&k.dxm.unwired, helper_cb, &[2], false)
        .unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while HELPER_RUNS.load(Ordering::SeqCst) < 2 {
        assert!(std::time::Instant::now() < deadline, "helper never ran");
        thread::sleep(Duration::from_millis(5));
    }
}
