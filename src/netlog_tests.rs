//! Telemetry ring tests.

use std::sync::atomic::Ordering;

use crate::netlog::{LogKind, ENTRIES_PER_PAGE};
use crate::testkit::{fixture, local_uid};

#[test]
fn disabled_kinds_cost_nothing() {
    let fix = fixture();
    let k = &fix.k;
    k.netlog.cntl(0);
    k.netlog
        .log_it(k.net.as_ref(), LogKind::PageIn, 1, local_uid(1), [0; 4]);
    assert_eq!(k.netlog.buffered(), 0);
}

#[test]
fn full_pages_flush_to_the_net() {
    let fix = fixture();
    let k = &fix.k;
    k.netlog.cntl(1 << (LogKind::LockGrant as u32));
    assert!(k.netlog.enabled(LogKind::LockGrant));
    assert!(!k.netlog.enabled(LogKind::PageIn));

    for i in 0..ENTRIES_PER_PAGE - 1 {
        k.netlog.log_it(
            k.net.as_ref(),
            LogKind::LockGrant,
            1,
            local_uid(i as u32),
            [i as u16, 0, 0, 0],
        );
    }
    assert_eq!(k.netlog.buffered(), ENTRIES_PER_PAGE - 1);
    assert_eq!(fix.net.log_pages.load(Ordering::Relaxed), 0);

    // The 39th entry fills the page; recording flips to the other
    // buffer while the full page goes out.
    k.netlog
        .log_it(k.net.as_ref(), LogKind::LockGrant, 1, local_uid(99), [0; 4]);
    assert_eq!(fix.net.log_pages.load(Ordering::Relaxed), 1);
    assert_eq!(k.netlog.buffered(), 0);
}
