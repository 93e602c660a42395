//! File lock manager tests.

use std::sync::atomic::Ordering;

use crate::flock::{self, mode, LockRequest, UnlockRequest};
use crate::status::Status;
use crate::testkit::{fixture, local_uid, remote_uid, stage_file};

#[test]
fn lock_unlock_round_trip_preserves_free_list() {
    let fix = fixture();
    let k = &fix.k;
    let uid = stage_file(&fix, 1, 0);
    let free = k.flock.free_count();
    let grant = k
        .flock
        .priv_lock(k, LockRequest::new(uid, 1, mode::READ))
        .unwrap();
    assert!(grant.slot > 0);
    assert_eq!(k.flock.free_count(), free - 1);
    k.flock
        .priv_unlock(k, UnlockRequest::new(uid, 1, grant.slot, mode::READ))
        .unwrap();
    assert_eq!(k.flock.free_count(), free);
}

#[test]
fn write_conflict_then_release_then_retry() {
    let fix = fixture();
    let k = &fix.k;
    let uid = stage_file(&fix, 2, 0);

    let g1 = k
        .flock
        .priv_lock(k, LockRequest::new(uid, 1, mode::WRITE))
        .unwrap();

    // A second writer collides.
    assert_eq!(
        k.flock
            .priv_lock(k, LockRequest::new(uid, 2, mode::WRITE))
            .unwrap_err(),
        Status::FileObjectInUse
    );

    k.flock
        .priv_unlock(k, UnlockRequest::new(uid, 1, g1.slot, mode::WRITE))
        .unwrap();
    assert!(k.flock.local_read_lock(uid).is_none());

    let g2 = k
        .flock
        .priv_lock(k, LockRequest::new(uid, 2, mode::WRITE))
        .unwrap();
    assert!(g2.slot > 0);
    k.flock
        .priv_unlock(k, UnlockRequest::new(uid, 2, g2.slot, mode::WRITE))
        .unwrap();
}

#[test]
fn compatibility_matrix() {
    let fix = fixture();
    let k = &fix.k;
    let uid = stage_file(&fix, 3, 0);

    // Readers share.
    let r1 = k
        .flock
        .priv_lock(k, LockRequest::new(uid, 1, mode::READ))
        .unwrap();
    let r2 = k
        .flock
        .priv_lock(k, LockRequest::new(uid, 2, mode::READ))
        .unwrap();
    // A writer collides with readers.
    assert_eq!(
        k.flock
            .priv_lock(k, LockRequest::new(uid, 3, mode::WRITE))
            .unwrap_err(),
        Status::FileObjectInUse
    );
    k.flock
        .priv_unlock(k, UnlockRequest::new(uid, 1, r1.slot, mode::READ))
        .unwrap();
    k.flock
        .priv_unlock(k, UnlockRequest::new(uid, 2, r2.slot, mode::READ))
        .unwrap();

    // Cowriters tolerate each other but not readers.
    let c1 = k
        .flock
        .priv_lock(k, LockRequest::new(uid, 1, mode::COWRITE))
        .unwrap();
    let c2 = k
        .flock
        .priv_lock(k, LockRequest::new(uid, 2, mode::COWRITE))
        .unwrap();
    assert_eq!(
        k.flock
            .priv_lock(k, LockRequest::new(uid, 3, mode::READ))
            .unwrap_err(),
        Status::FileObjectInUse
    );
    k.flock
        .priv_unlock(k, UnlockRequest::new(uid, 1, c1.slot, mode::COWRITE))
        .unwrap();
    k.flock
        .priv_unlock(k, UnlockRequest::new(uid, 2, c2.slot, mode::COWRITE))
        .unwrap();
}

#[test]
fn illegal_requests_are_rejected() {
    let fix = fixture();
    let k = &fix.k;
    let uid = stage_file(&fix, 4, 0);
    let mut req = LockRequest::new(uid, 1, 6);
    assert_eq!(
        k.flock.priv_lock(k, req).unwrap_err(),
        Status::FileIllegalLockRequest
    );
    req = LockRequest::new(uid, 1, mode::READ);
    req.side = 2;
    assert_eq!(
        k.flock.priv_lock(k, req).unwrap_err(),
        Status::FileIllegalLockRequest
    );
    // Pseudo-modes are not lockable.
    assert_eq!(
        k.flock
            .priv_lock(k, LockRequest::new(uid, 1, mode::MARK_DELETE))
            .unwrap_err(),
        Status::FileIllegalLockRequest
    );
}

#[test]
fn read_only_volume_refuses_writers() {
    let fix = fixture();
    let k = &fix.k;
    let uid = stage_file(&fix, 5, 1);
    fix.vtoc.set_read_only(1, true);
    assert_eq!(
        k.flock
            .priv_lock(k, LockRequest::new(uid, 1, mode::WRITE))
            .unwrap_err(),
        Status::FileVolMountedReadOnly
    );
    // Readers are fine.
    let g = k
        .flock
        .priv_lock(k, LockRequest::new(uid, 1, mode::READ))
        .unwrap();
    k.flock
        .priv_unlock(k, UnlockRequest::new(uid, 1, g.slot, mode::READ))
        .unwrap();
}

#[test]
fn full_bypass_short_circuits() {
    let fix = fixture();
    let k = &fix.k;
    let uid = stage_file(&fix, 6, 0);
    k.flock.set_full_bypass(true);
    assert_eq!(
        k.flock
            .priv_lock(k, LockRequest::new(uid, 1, mode::READ))
            .unwrap_err(),
        Status::FileLocalLockTableFull
    );
    k.flock.set_full_bypass(false);
}

#[test]
fn unlock_mode_zero_releases_all_holds() {
    let fix = fixture();
    let k = &fix.k;
    let uid = stage_file(&fix, 7, 0);
    let free = k.flock.free_count();
    k.flock
        .priv_lock(k, LockRequest::new(uid, 1, mode::READ))
        .unwrap();
    k.flock
        .priv_lock(k, LockRequest::new(uid, 1, mode::READ))
        .unwrap();
    assert_eq!(k.flock.free_count(), free - 2);
    let modified = k
        .flock
        .priv_unlock(k, UnlockRequest::new(uid, 1, 0, 0))
        .unwrap();
    assert!(modified);
    assert_eq!(k.flock.free_count(), free);
    assert!(!k.flock.local_lock_verify(uid, 1, 0));
}

#[test]
fn unlock_without_hold_reports_not_locked() {
    let fix = fixture();
    let k = &fix.k;
    let uid = stage_file(&fix, 8, 0);
    assert_eq!(
        k.flock
            .priv_unlock(k, UnlockRequest::new(uid, 1, 0, mode::READ))
            .unwrap_err(),
        Status::FileObjectNotLockedByThisProcess
    );
}

#[test]
fn exclusive_release_purifies_object() {
    let fix = fixture();
    let k = &fix.k;
    let uid = stage_file(&fix, 9, 0);
    let g = k
        .flock
        .priv_lock(k, LockRequest::new(uid, 1, mode::WRITE))
        .unwrap();
    let dtv_before = k.ast.get_dtv(k, uid).unwrap();
    crate::time::tick_advance(5);
    k.flock
        .priv_unlock(k, UnlockRequest::new(uid, 1, g.slot, mode::WRITE))
        .unwrap();
    let dtv_after = k.ast.get_dtv(k, uid).unwrap();
    assert!(dtv_after.high > dtv_before.high, "unlock flushed timestamps");
}

#[test]
fn change_upgrades_mode_in_place() {
    let fix = fixture();
    let k = &fix.k;
    let uid = stage_file(&fix, 10, 0);
    let g = k
        .flock
        .priv_lock(k, LockRequest::new(uid, 1, mode::READ))
        .unwrap();
    let mut change = LockRequest::new(uid, 1, mode::WRITE);
    change.change = true;
    change.slot = g.slot;
    let g2 = k.flock.priv_lock(k, change).unwrap();
    assert_eq!(g2.slot, g.slot);
    // Now a reader elsewhere collides.
    assert_eq!(
        k.flock
            .priv_lock(k, LockRequest::new(uid, 2, mode::READ))
            .unwrap_err(),
        Status::FileObjectInUse
    );
    k.flock
        .priv_unlock(k, UnlockRequest::new(uid, 1, g.slot, mode::WRITE))
        .unwrap();
}

#[test]
fn remote_objects_delegate_to_partner() {
    let fix = fixture();
    let k = &fix.k;
    let uid = remote_uid(7, 3);
    fix.net
        .stage_attrs(7, uid, crate::ast::ObjAttrs::default());

    let g = k
        .flock
        .priv_lock(k, LockRequest::new(uid, 1, mode::WRITE))
        .unwrap();
    assert!(g.remote);
    assert!(g.slot > 0);
    let view = k.flock.local_read_lock(uid).unwrap();
    assert!(view.remote);

    fix.remote.mark_delete_pending(uid);
    k.flock
        .priv_unlock(k, UnlockRequest::new(uid, 1, g.slot, mode::WRITE))
        .unwrap();
    // The partner said the file was marked for deletion.
    assert!(!k.ast.cached_once(uid));
}

#[test]
fn unlock_all_sweeps_every_asid() {
    let fix = fixture();
    let k = &fix.k;
    let u1 = stage_file(&fix, 11, 0);
    let u2 = stage_file(&fix, 12, 0);
    let free = k.flock.free_count();
    k.flock
        .priv_lock(k, LockRequest::new(u1, 1, mode::READ))
        .unwrap();
    k.flock
        .priv_lock(k, LockRequest::new(u2, 2, mode::READ))
        .unwrap();
    k.flock.priv_unlock_all(k, None).unwrap();
    assert_eq!(k.flock.free_count(), free);
    assert_eq!(fix.remote.unlock_alls.load(Ordering::Relaxed), 1);
}

#[test]
fn unlock_all_single_asid_leaves_others() {
    let fix = fixture();
    let k = &fix.k;
    let u1 = stage_file(&fix, 13, 0);
    let u2 = stage_file(&fix, 14, 0);
    k.flock
        .priv_lock(k, LockRequest::new(u1, 1, mode::READ))
        .unwrap();
    let g2 = k
        .flock
        .priv_lock(k, LockRequest::new(u2, 2, mode::READ))
        .unwrap();
    k.flock.priv_unlock_all(k, Some(1)).unwrap();
    assert!(!k.flock.local_lock_verify(u1, 1, 0));
    assert!(k.flock.local_lock_verify(u2, 2, mode::READ));
    k.flock
        .priv_unlock(k, UnlockRequest::new(u2, 2, g2.slot, mode::READ))
        .unwrap();
}

#[test]
fn queries_see_held_locks() {
    let fix = fixture();
    let k = &fix.k;
    let uid = stage_file(&fix, 15, 0);
    let g = k
        .flock
        .priv_lock(k, LockRequest::new(uid, 3, mode::READ))
        .unwrap();

    assert!(k.flock.local_lock_verify(uid, 3, mode::READ));
    assert!(!k.flock.local_lock_verify(uid, 4, mode::READ));
    assert!(k.flock.local_read_lock(uid).is_some());

    let mut seen = 0;
    let mut next = 0;
    while let Some((view, n)) = k.flock.read_lock_entryi(next) {
        if view.uid == uid {
            seen += 1;
        }
        next = n;
    }
    assert_eq!(seen, 1);

    k.flock
        .priv_unlock(k, UnlockRequest::new(uid, 3, g.slot, mode::READ))
        .unwrap();
}

#[test]
fn mark_delete_then_delete_int() {
    let fix = fixture();
    let k = &fix.k;
    let uid = stage_file(&fix, 16, 0);
    // Pseudo-mode 8 on unlock sets the attribute and releases nothing.
    let modified = k
        .flock
        .priv_unlock(k, UnlockRequest::new(uid, 1, 0, mode::MARK_DELETE))
        .unwrap();
    assert!(!modified);
    assert!(
        k.ast
            .get_common_attributes(k, uid)
            .unwrap()
            .delete_on_unlock
    );
    flock::delete_int(k, uid).unwrap();
    assert_eq!(
        k.ast.get_attributes(k, uid).unwrap_err(),
        Status::FileObjectNotFound
    );
}

#[test]
fn mode_nine_is_a_no_op() {
    let fix = fixture();
    let k = &fix.k;
    let uid = stage_file(&fix, 17, 0);
    let modified = k
        .flock
        .priv_unlock(k, UnlockRequest::new(uid, 1, 0, mode::NONE))
        .unwrap();
    assert!(!modified);
}

#[test]
fn writeback_bridges_flush() {
    let fix = fixture();
    let k = &fix.k;
    let uid = stage_file(&fix, 18, 0);
    let aste = k.ast.activate_and_wire(k, uid, 0).unwrap();
    k.ast
        .touch(k, aste, crate::ast::TouchMode::Write, 0, 3)
        .unwrap();
    assert_eq!(flock::fw_partial(k, uid, 0).unwrap(), 3);
    k.ast
        .touch(k, aste, crate::ast::TouchMode::Write, 4, 1)
        .unwrap();
    assert_eq!(flock::fw_pages(k, uid, &[4]).unwrap(), 1);
    assert_eq!(flock::fw_file(k, uid).unwrap(), 0);
    k.ast.unwire(k, aste);
}
