//! Area subsystem tests.

use crate::area::{handle_gen, handle_id, AreaFlags, AreaHandle};
use crate::ast::SegFlags;
use crate::config::{PAGE_SIZE, SEG_SIZE};
use crate::status::Status;
use crate::testkit::fixture;
use crate::uid::Uid;
use crate::Kernel;

/// Whether one page of an area's backing segment map is materialized.
fn page_installed(k: &Kernel, h: AreaHandle, seg: u16, page: usize) -> bool {
    let uid = Uid::anon(handle_id(h), handle_gen(h));
    let map = k.ast.get_seg_map(k, uid, seg).unwrap();
    map[page].flags.contains(SegFlags::INSTALLED)
}

#[test]
fn create_delete_round_trip_preserves_free_count() {
    let fix = fixture();
    let k = &fix.k;
    let free = k.area.n_free();
    let owner_len = k.area.owner_list_len(1);
    let h = k.area.create(k, 2 * SEG_SIZE, PAGE_SIZE, false).unwrap();
    assert_eq!(k.area.n_free(), free - 1);
    assert_eq!(k.area.owner_list_len(1), owner_len + 1);
    k.area.delete(k, h).unwrap();
    assert_eq!(k.area.n_free(), free);
    assert_eq!(k.area.owner_list_len(1), owner_len);
}

#[test]
fn sizes_round_up_to_segment_and_page() {
    let fix = fixture();
    let k = &fix.k;
    let h = k.area.create(k, SEG_SIZE + 1, 100, false).unwrap();
    let (virt, commit, _, _, _) = k.area.inspect(handle_id(h)).unwrap();
    assert_eq!(virt, 2 * SEG_SIZE);
    assert_eq!(commit, PAGE_SIZE);
    k.area.delete(k, h).unwrap();
}

#[test]
fn bad_ids_and_stale_generations_are_rejected() {
    let fix = fixture();
    let k = &fix.k;
    assert_eq!(k.area.delete(k, 0).unwrap_err(), Status::AreaNotActive);
    assert_eq!(
        k.area.delete(k, 0x0001_FFFF).unwrap_err(),
        Status::AreaNotActive
    );
    let h = k.area.create(k, SEG_SIZE, 0, false).unwrap();
    let stale = (handle_gen(h) as u32 + 1) << 16 | handle_id(h) as u32;
    assert_eq!(k.area.delete(k, stale).unwrap_err(), Status::AreaNotActive);
    k.area.delete(k, h).unwrap();
    // The handle is dead after deletion.
    assert_eq!(k.area.delete(k, h).unwrap_err(), Status::AreaNotActive);
}

#[test]
fn non_owner_cannot_delete() {
    let fix = fixture();
    let k = &fix.k;
    fix.procs.set_asid(1);
    let h = k.area.create(k, SEG_SIZE, 0, false).unwrap();
    fix.procs.set_asid(2);
    assert_eq!(k.area.delete(k, h).unwrap_err(), Status::AreaNotOwner);
    fix.procs.set_asid(1);
    k.area.delete(k, h).unwrap();
}

#[test]
fn create_from_deduplicates_on_uid_and_caller() {
    let fix = fixture();
    let k = &fix.k;
    let free = k.area.n_free();
    let dups = k.area.cr_dup();
    let id1 = k
        .area
        .create_from(k, 0xAAAA_BBBB, SEG_SIZE, PAGE_SIZE, 42)
        .unwrap();
    let id2 = k
        .area
        .create_from(k, 0xAAAA_BBBB, SEG_SIZE, PAGE_SIZE, 42)
        .unwrap();
    assert_eq!(id1, id2);
    assert_eq!(k.area.cr_dup(), dups + 1);
    assert_eq!(k.area.n_free(), free - 1);
    // A different caller id is a different area.
    let id3 = k
        .area
        .create_from(k, 0xAAAA_BBBB, SEG_SIZE, PAGE_SIZE, 43)
        .unwrap();
    assert_ne!(id1, id3);
    assert_eq!(k.area.n_free(), free - 2);
}

#[test]
fn touch_grows_commit_and_sets_bitmap() {
    let fix = fixture();
    let k = &fix.k;
    let h = k.area.create(k, 2 * SEG_SIZE, 0, false).unwrap();
    k.area.touch(k, h, 0, 0).unwrap();
    let (_, commit, _, flags, bitmap) = k.area.inspect(handle_id(h)).unwrap();
    // Growth is at least four pages.
    assert!(commit >= 4 * PAGE_SIZE);
    assert!(flags.contains(AreaFlags::TOUCHED));
    assert_eq!(bitmap & 1, 1);
    k.area.delete(k, h).unwrap();
}

#[test]
fn grow_and_grow_to_resize() {
    let fix = fixture();
    let k = &fix.k;
    let h = k.area.create(k, SEG_SIZE, 0, false).unwrap();
    k.area
        .grow(k, handle_gen(h), handle_id(h), 3 * SEG_SIZE, 2 * PAGE_SIZE)
        .unwrap();
    let (virt, commit, _, _, _) = k.area.inspect(handle_id(h)).unwrap();
    assert_eq!(virt, 3 * SEG_SIZE);
    assert_eq!(commit, 2 * PAGE_SIZE);
    // The index-addressed variant skips the generation check.
    k.area
        .grow_to(k, handle_id(h), 4 * SEG_SIZE, 2 * PAGE_SIZE)
        .unwrap();
    let (virt, _, _, _, _) = k.area.inspect(handle_id(h)).unwrap();
    assert_eq!(virt, 4 * SEG_SIZE);
    k.area.delete(k, h).unwrap();
}

#[test]
fn copy_skips_stack_region_and_keeps_shape() {
    let fix = fixture();
    let k = &fix.k;
    fix.procs.set_asid(1);
    k.area.set_stack_low(0);

    // Reversed parent with three touched segments.
    let h = k.area.create(k, 3 * SEG_SIZE, 0, true).unwrap();
    let src_id = handle_id(h);
    for seg in 0..3 {
        k.area.touch(k, h, seg, 0).unwrap();
    }
    let (src_virt, _, _, src_flags, src_bitmap) = k.area.inspect(src_id).unwrap();
    assert!(src_flags.contains(AreaFlags::REVERSED));
    assert_eq!(src_bitmap, 0b111);

    let pages_before = fix.net.pages_in.load(std::sync::atomic::Ordering::Relaxed);
    let _ = pages_before;
    let child = 2;
    let h2 = k
        .area
        .copy(k, handle_gen(h), src_id, child, SEG_SIZE)
        .unwrap();
    let dst_id = handle_id(h2);
    let (dst_virt, _, dst_owner, dst_flags, dst_bitmap) = k.area.inspect(dst_id).unwrap();
    assert_eq!(dst_virt, src_virt);
    assert_eq!(dst_owner, child);
    assert_eq!(dst_bitmap, src_bitmap, "copy keeps the segment shape");
    assert!(dst_flags.contains(AreaFlags::REVERSED));
    assert!(!dst_flags.contains(AreaFlags::IN_TRANS));

    let (src_virt_after, _, _, src_flags_after, src_bitmap_after) =
        k.area.inspect(src_id).unwrap();
    assert_eq!(src_virt_after, src_virt);
    assert_eq!(src_bitmap_after, src_bitmap);
    assert!(!src_flags_after.contains(AreaFlags::IN_TRANS));

    // Source still belongs to the parent; delete both.
    k.area.delete(k, h).unwrap();
    fix.procs.set_asid(child);
    k.area.delete(k, h2).unwrap();
}

#[test]
fn copy_then_delete_leaves_source_intact() {
    let fix = fixture();
    let k = &fix.k;
    fix.procs.set_asid(1);
    let h = k.area.create(k, SEG_SIZE, 0, false).unwrap();
    k.area.touch(k, h, 0, 0).unwrap();
    let (virt, _, _, _, bitmap) = k.area.inspect(handle_id(h)).unwrap();
    let h2 = k
        .area
        .copy(k, handle_gen(h), handle_id(h), 1, 0)
        .unwrap();
    k.area.delete(k, h2).unwrap();
    let (virt_after, _, _, _, bitmap_after) = k.area.inspect(handle_id(h)).unwrap();
    assert_eq!(virt, virt_after);
    assert_eq!(bitmap, bitmap_after);
    k.area.delete(k, h).unwrap();
}

#[test]
fn invalidate_edge_cases() {
    let fix = fixture();
    let k = &fix.k;
    let h = k.area.create(k, 2 * SEG_SIZE, 0, false).unwrap();
    // Untouched area: immediate no-op even with a bad generation.
    k.area.invalidate(k, 0, handle_id(h), 0, 0, 4).unwrap();
    k.area.touch(k, h, 0, 0).unwrap();
    // Count zero is a no-op: the page stays materialized.
    k.area
        .invalidate(k, handle_gen(h), handle_id(h), 0, 0, 0)
        .unwrap();
    assert!(page_installed(k, h, 0, 0));
    k.area.delete(k, h).unwrap();
}

#[test]
fn invalidate_frees_exact_forward_range() {
    let fix = fixture();
    let k = &fix.k;
    fix.procs.set_asid(1);
    let h = k.area.create(k, 2 * SEG_SIZE, 0, false).unwrap();
    let (gen, id) = (handle_gen(h), handle_id(h));
    k.area.touch(k, h, 0, 0).unwrap();
    k.area.touch(k, h, 0, 1).unwrap();
    k.area.touch(k, h, 1, 0).unwrap();
    let outstanding = fix.pages.outstanding();

    // Pages 1..=32: drops page 1 of segment 0 and page 0 of segment 1,
    // keeps page 0 of segment 0.
    k.area.invalidate(k, gen, id, 0, 1, 32).unwrap();
    assert!(page_installed(k, h, 0, 0));
    assert!(!page_installed(k, h, 0, 1));
    assert!(!page_installed(k, h, 1, 0));
    assert_eq!(fix.pages.outstanding(), outstanding - 2);
    // Neither segment was fully covered: both bitmap bits survive.
    let (_, _, _, _, bitmap) = k.area.inspect(id).unwrap();
    assert_eq!(bitmap, 0b11);

    // A whole-segment range gives up its bitmap bit.
    k.area.invalidate(k, gen, id, 1, 0, 32).unwrap();
    let (_, _, _, _, bitmap) = k.area.inspect(id).unwrap();
    assert_eq!(bitmap, 0b01);
    assert_eq!(fix.pages.outstanding(), outstanding - 2);

    k.area.delete(k, h).unwrap();
}

#[test]
fn invalidate_reversed_splits_head_run_and_tail() {
    let fix = fixture();
    let k = &fix.k;
    fix.procs.set_asid(1);
    let h = k.area.create(k, 3 * SEG_SIZE, 0, true).unwrap();
    let (gen, id) = (handle_gen(h), handle_id(h));
    for (seg, page) in [(0, 0), (0, 28), (0, 29), (1, 10), (1, 11), (2, 0)] {
        k.area.touch(k, h, seg, page).unwrap();
    }
    let outstanding = fix.pages.outstanding();

    // Offset 3 into the head segment leaves 29 pages there; the other
    // 11 of the 40 spill into the next segment from its base. Freed:
    // segment 0 pages 0..=28 and segment 1 pages 0..=10.
    k.area.invalidate(k, gen, id, 0, 3, 40).unwrap();
    assert!(!page_installed(k, h, 0, 0));
    assert!(!page_installed(k, h, 0, 28));
    assert!(page_installed(k, h, 0, 29));
    assert!(!page_installed(k, h, 1, 10));
    assert!(page_installed(k, h, 1, 11));
    assert!(page_installed(k, h, 2, 0));
    assert_eq!(fix.pages.outstanding(), outstanding - 3);
    // No segment was fully covered, so the shape is intact.
    let (_, _, _, _, bitmap) = k.area.inspect(id).unwrap();
    assert_eq!(bitmap, 0b111);

    // Aligned full-segment run: segments 1 and 2 drain completely and
    // give up their bitmap bits.
    k.area.invalidate(k, gen, id, 1, 0, 64).unwrap();
    assert!(!page_installed(k, h, 1, 11));
    assert!(!page_installed(k, h, 2, 0));
    assert!(page_installed(k, h, 0, 29));
    assert_eq!(fix.pages.outstanding(), outstanding - 5);
    let (_, _, _, _, bitmap) = k.area.inspect(id).unwrap();
    assert_eq!(bitmap, 0b001);

    k.area.delete(k, h).unwrap();
}

#[test]
fn transfer_moves_ownership_between_lists() {
    let fix = fixture();
    let k = &fix.k;
    fix.procs.set_asid(1);
    let h = k.area.create(k, SEG_SIZE, 0, false).unwrap();
    assert_eq!(k.area.owner_list_len(1), 1);
    k.area.transfer(k, h, 3, 5, SEG_SIZE).unwrap();
    assert_eq!(k.area.owner_list_len(1), 0);
    assert_eq!(k.area.owner_list_len(3), 1);
    let (_, _, owner, _, _) = k.area.inspect(handle_id(h)).unwrap();
    assert_eq!(owner, 3);
    fix.procs.set_asid(3);
    k.area.delete(k, h).unwrap();
}

#[test]
fn free_asid_reclaims_every_area() {
    let fix = fixture();
    let k = &fix.k;
    fix.procs.set_asid(4);
    let free = k.area.n_free();
    for _ in 0..3 {
        k.area.create(k, SEG_SIZE, 0, false).unwrap();
    }
    assert_eq!(k.area.owner_list_len(4), 3);
    k.area.free_asid(k, 4).unwrap();
    assert_eq!(k.area.owner_list_len(4), 0);
    assert_eq!(k.area.n_free(), free);
}

#[test]
fn shutdown_reclaims_remote_backed_areas() {
    let fix = fixture();
    let k = &fix.k;
    let free = k.area.n_free();
    k.area
        .create_from(k, 0xCCCC_0001, SEG_SIZE, 0, 7)
        .unwrap();
    k.area
        .create_from(k, 0xCCCC_0002, SEG_SIZE, 0, 8)
        .unwrap();
    k.area.shutdown(k).unwrap();
    assert_eq!(k.area.n_free(), free);
}

#[test]
fn exhausting_the_table_reports_none_free() {
    let fix = fixture();
    let k = &fix.k;
    let mut handles = Vec::new();
    loop {
        match k.area.create(k, SEG_SIZE, 0, false) {
            Ok(h) => handles.push(h),
            Err(e) => {
                assert_eq!(e, Status::AreaNoneFree);
                break;
            }
        }
    }
    for h in handles {
        k.area.delete(k, h).unwrap();
    }
}
