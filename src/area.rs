//! Area subsystem
//!
//! Multi-segment virtual address regions. An area is 0 or more segments
//! with a virtual size, a committed size, an owner address space, an
//! allocated-segment bitmap (inline for the first 64 segments, overflow
//! table beyond), and optionally remote backing on a partner node for
//! diskless operation. Handles carry a generation so stale ids are
//! rejected. Reversed areas grow from high segments toward low ones,
//! with the bitmap indexed in the growth direction.
//!
//! The free list, owner lists and UID hash are protected by the Area
//! resource lock; per-entry size/ownership changes serialize through the
//! IN_TRANS flag and its event count.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use log::debug;

use spinning_top::Spinlock;

use crate::ast::TouchMode;
use crate::config::{KernelConfig, PAGES_PER_SEG, PAGE_SIZE, SEG_SIZE};
use crate::ec::Ec;
use crate::glue::VolIdx;
use crate::ml::LOCK_AREA;
use crate::status::Status;
use crate::uid::{Asid, Uid};
use crate::Kernel;

bitflags::bitflags! {
    /// Per-area flags.
    pub struct AreaFlags: u8 {
        const ACTIVE   = 0x01;
        const SHARED   = 0x02;
        const REVERSED = 0x04;
        const IN_TRANS = 0x08;
        const TOUCHED  = 0x10;
    }
}

/// Area handle: `(generation << 16) | id`, id 1-based.
pub type AreaHandle = u32;

fn make_handle(gen: u16, id: u16) -> AreaHandle {
    (gen as u32) << 16 | id as u32
}

/// Id half of a handle.
pub fn handle_id(h: AreaHandle) -> u16 {
    (h & 0xFFFF) as u16
}

/// Generation half of a handle.
pub fn handle_gen(h: AreaHandle) -> u16 {
    (h >> 16) as u16
}

struct AreaEntry {
    generation: u16,
    virt_size: u32,
    commit_size: u32,
    owner_asid: Asid,
    remote_uid: u32,
    remote_volx: VolIdx,
    caller_id: u32,
    flags: AreaFlags,
    bitmap: u64,
    /// Overflow bitmap words for areas beyond 64 segments.
    ext_bitmap: Vec<u64>,
    first_bste: i16,
    first_seg: u16,
    next: Option<u16>,
    prev: Option<u16>,
    uid_next: Option<u16>,
}

impl AreaEntry {
    fn vacant() -> Self {
        Self {
            generation: 0,
            virt_size: 0,
            commit_size: 0,
            owner_asid: 0,
            remote_uid: 0,
            remote_volx: 0,
            caller_id: 0,
            flags: AreaFlags::empty(),
            bitmap: 0,
            ext_bitmap: Vec::new(),
            first_bste: -1,
            first_seg: 0,
            next: None,
            prev: None,
            uid_next: None,
        }
    }

    fn bit(&self, seg: u32) -> bool {
        if seg < 64 {
            self.bitmap & (1u64 << seg) != 0
        } else {
            let word = (seg as usize - 64) / 64;
            self.ext_bitmap
                .get(word)
                .map(|w| w & (1u64 << ((seg - 64) % 64)) != 0)
                .unwrap_or(false)
        }
    }

    fn set_bit(&mut self, seg: u32, on: bool) {
        if seg < 64 {
            if on {
                self.bitmap |= 1u64 << seg;
            } else {
                self.bitmap &= !(1u64 << seg);
            }
        } else {
            let word = (seg as usize - 64) / 64;
            if word >= self.ext_bitmap.len() {
                if !on {
                    return;
                }
                self.ext_bitmap.resize(word + 1, 0);
            }
            let mask = 1u64 << ((seg - 64) % 64);
            if on {
                self.ext_bitmap[word] |= mask;
            } else {
                self.ext_bitmap[word] &= !mask;
            }
        }
    }

    fn n_segs(&self) -> u32 {
        (self.virt_size + SEG_SIZE - 1) / SEG_SIZE
    }
}

struct AreaInner {
    entries: Vec<AreaEntry>,
    free_head: Option<u16>,
    n_free: u16,
    n_areas: u16,
    asid_lists: Vec<Option<u16>>,
    uid_buckets: Vec<Option<u16>>,
    caller_seq: u32,
    cr_dup: u16,
    del_dup: u16,
    partner_pkt_size: u16,
    stack_low: u32,
}

/// The area table.
pub struct AreaTable {
    inner: Spinlock<AreaInner>,
    /// Advanced whenever an area leaves the in-transition state.
    pub in_trans_ec: Ec,
    /// Partner node for remote backing; 0 when the node has local disk.
    partner_node: AtomicU32,
}

impl AreaTable {
    pub fn new(cfg: &KernelConfig) -> Self {
        let n = cfg.area_entries;
        let mut entries = Vec::with_capacity(n);
        for i in 0..n {
            let mut e = AreaEntry::vacant();
            e.next = if i + 1 < n { Some(i as u16 + 1) } else { None };
            entries.push(e);
        }
        let mut asid_lists = Vec::new();
        asid_lists.resize(cfg.max_asids, None);
        let mut uid_buckets = Vec::new();
        uid_buckets.resize(cfg.area_uid_buckets, None);
        Self {
            inner: Spinlock::new(AreaInner {
                entries,
                free_head: if n > 0 { Some(0) } else { None },
                n_free: n as u16,
                n_areas: n as u16,
                asid_lists,
                uid_buckets,
                caller_seq: 1,
                cr_dup: 0,
                del_dup: 0,
                partner_pkt_size: 0,
                stack_low: 0,
            }),
            in_trans_ec: Ec::new(),
            partner_node: AtomicU32::new(0),
        }
    }

    /// Declare the partner node used for remote backing (diskless boot).
    pub fn set_partner(&self, node: u32) {
        self.partner_node.store(node, Ordering::Release);
    }

    /// Low bound of the stack region skipped by fork copies.
    pub fn set_stack_low(&self, va: u32) {
        self.inner.lock().stack_low = va;
    }

    // ------------------------------------------------------------------
    // Validation and in-transition waiting
    // ------------------------------------------------------------------

    fn wait_in_trans(&self, k: &Kernel) {
        let target = self.in_trans_ec.read() + 1;
        k.ml.unlock(LOCK_AREA);
        self.in_trans_ec.wait(target);
        k.ml.lock(LOCK_AREA);
    }

    fn id_in_range(&self, id: u16) -> bool {
        let inner = self.inner.lock();
        id != 0 && id <= inner.n_areas
    }

    /// Wait out IN_TRANS and validate `(gen, id)` under the Area lock.
    /// On success the entry is left marked IN_TRANS. `check_gen` is
    /// false for the index-addressed remote variants.
    fn claim(
        &self,
        k: &Kernel,
        id: u16,
        gen: u16,
        check_gen: bool,
        check_owner: bool,
    ) -> Result<(), Status> {
        k.ml.lock(LOCK_AREA);
        let r = loop {
            let mut inner = self.inner.lock();
            let e = &mut inner.entries[id as usize - 1];
            if e.flags.contains(AreaFlags::IN_TRANS) {
                drop(inner);
                self.wait_in_trans(k);
                continue;
            }
            if check_gen && (!e.flags.contains(AreaFlags::ACTIVE) || e.generation != gen) {
                break Err(Status::AreaNotActive);
            }
            if check_owner {
                let asid = k.proc.as_id();
                if e.remote_uid == 0 && asid != 0 && asid != e.owner_asid {
                    break Err(Status::AreaNotOwner);
                }
            }
            e.flags.insert(AreaFlags::IN_TRANS);
            break Ok(());
        };
        k.ml.unlock(LOCK_AREA);
        r
    }

    fn release_claim(&self, k: &Kernel, id: u16) {
        k.ml.lock(LOCK_AREA);
        {
            let mut inner = self.inner.lock();
            inner.entries[id as usize - 1]
                .flags
                .remove(AreaFlags::IN_TRANS);
        }
        k.ml.unlock(LOCK_AREA);
        self.in_trans_ec.advance();
    }

    // ------------------------------------------------------------------
    // Segment backing through the AST
    // ------------------------------------------------------------------

    fn backing_uid(&self, id: u16) -> Uid {
        let inner = self.inner.lock();
        Uid::anon(id, inner.entries[id as usize - 1].generation)
    }

    /// Wired ASTE for one logical segment of an area.
    fn get_aste(&self, k: &Kernel, id: u16, seg: u32) -> Result<u16, Status> {
        let uid = self.backing_uid(id);
        k.ast.activate_and_wire(k, uid, seg as u16)
    }

    /// Free the pages of logical pages `start..=end` of an area,
    /// clearing bitmap bits for fully covered segments.
    fn free_segments(
        &self,
        k: &Kernel,
        id: u16,
        start_page: u32,
        end_page: u32,
        clear_bitmap: bool,
    ) -> Result<(), Status> {
        if end_page < start_page {
            return Ok(());
        }
        let uid = self.backing_uid(id);
        k.ast
            .invalidate(k, uid, start_page, end_page - start_page + 1)?;
        // Fully covered segments give up their bitmap bit; `clear_bitmap`
        // additionally drops partially covered edges (teardown path).
        let first_full = if clear_bitmap {
            start_page / PAGES_PER_SEG
        } else {
            (start_page + PAGES_PER_SEG - 1) / PAGES_PER_SEG
        };
        let last_full = if clear_bitmap {
            (end_page + PAGES_PER_SEG) / PAGES_PER_SEG
        } else {
            (end_page + 1) / PAGES_PER_SEG
        };
        let mut inner = self.inner.lock();
        let e = &mut inner.entries[id as usize - 1];
        let mut seg = first_full;
        while seg < last_full {
            e.set_bit(seg, false);
            seg += 1;
        }
        Ok(())
    }

    /// Set sizes, freeing segments on shrink. Callers hold the claim.
    fn resize(
        &self,
        k: &Kernel,
        id: u16,
        virt_size: u32,
        commit_size: u32,
    ) -> Result<(), Status> {
        let (old_virt, _old_commit) = {
            let inner = self.inner.lock();
            let e = &inner.entries[id as usize - 1];
            (e.virt_size, e.commit_size)
        };
        let virt = (virt_size + SEG_SIZE - 1) & !(SEG_SIZE - 1);
        let commit = ((commit_size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)).min(virt);
        if virt < old_virt && old_virt > 0 {
            let start = virt / PAGE_SIZE;
            let end = old_virt / PAGE_SIZE - 1;
            self.free_segments(k, id, start, end, true)?;
        }
        let mut inner = self.inner.lock();
        let e = &mut inner.entries[id as usize - 1];
        e.virt_size = virt;
        e.commit_size = commit;
        if virt == 0 {
            e.bitmap = 0;
            e.ext_bitmap.clear();
        } else if old_virt == 0 && e.flags.contains(AreaFlags::REVERSED) {
            // A reversed area's first segment sits at its high end.
            e.first_seg = (e.n_segs() - 1) as u16;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    fn pop_free(&self, inner: &mut AreaInner) -> Result<u16, Status> {
        let Some(idx) = inner.free_head else {
            return Err(Status::AreaNoneFree);
        };
        inner.free_head = inner.entries[idx as usize].next;
        inner.entries[idx as usize].next = None;
        inner.n_free -= 1;
        Ok(idx)
    }

    fn link_owner(inner: &mut AreaInner, idx: u16, asid: Asid) {
        let head = inner.asid_lists[asid as usize];
        inner.entries[idx as usize].next = head;
        inner.entries[idx as usize].prev = None;
        if let Some(h) = head {
            inner.entries[h as usize].prev = Some(idx);
        }
        inner.asid_lists[asid as usize] = Some(idx);
    }

    fn unlink_owner(inner: &mut AreaInner, idx: u16) {
        let (next, prev, asid) = {
            let e = &inner.entries[idx as usize];
            (e.next, e.prev, e.owner_asid)
        };
        if let Some(n) = next {
            inner.entries[n as usize].prev = prev;
        }
        match prev {
            Some(p) => inner.entries[p as usize].next = next,
            None => inner.asid_lists[asid as usize] = next,
        }
        inner.entries[idx as usize].next = None;
        inner.entries[idx as usize].prev = None;
    }

    fn internal_create(
        &self,
        k: &Kernel,
        virt_size: u32,
        commit_size: u32,
        remote_uid: u32,
        owner_asid: Asid,
        alloc_remote: bool,
        reversed: bool,
        locked: bool,
    ) -> Result<AreaHandle, Status> {
        if !locked {
            k.ml.lock(LOCK_AREA);
        }
        let created = (|| {
            let mut inner = self.inner.lock();
            let idx = self.pop_free(&mut inner)?;
            if remote_uid == 0 {
                Self::link_owner(&mut inner, idx, owner_asid);
            }
            let seq = inner.caller_seq;
            inner.caller_seq += 1;
            let e = &mut inner.entries[idx as usize];
            e.virt_size = 0;
            e.commit_size = 0;
            e.remote_uid = remote_uid;
            e.remote_volx = 0;
            e.owner_asid = owner_asid;
            e.generation = e.generation.wrapping_add(1).max(1);
            e.flags = AreaFlags::ACTIVE | AreaFlags::SHARED;
            if reversed {
                e.flags |= AreaFlags::REVERSED;
            }
            e.first_bste = -1;
            e.first_seg = 0;
            e.caller_id = seq;
            e.bitmap = 0;
            e.ext_bitmap.clear();
            Ok((idx, e.generation))
        })();
        if !locked {
            k.ml.unlock(LOCK_AREA);
        }
        let (idx, gen) = created?;
        let id = idx + 1;
        let handle = make_handle(gen, id);

        // Diskless nodes carry their areas on the partner.
        let partner = self.partner_node.load(Ordering::Acquire);
        if partner != 0 && alloc_remote {
            let overhead = (virt_size / SEG_SIZE / 4 + 1) * PAGE_SIZE;
            let total = virt_size + overhead;
            let caller_id = {
                let inner = self.inner.lock();
                inner.entries[idx as usize].caller_id
            };
            match k
                .remote
                .create_area(partner, total, commit_size + overhead, caller_id, reversed)
            {
                Ok(volx) => {
                    let mut inner = self.inner.lock();
                    inner.entries[idx as usize].remote_volx = volx;
                    if inner.partner_pkt_size == 0 {
                        inner.partner_pkt_size = k.net.pkt_size(partner);
                        k.pages.remote_pool(inner.partner_pkt_size as usize);
                    }
                }
                Err(e) => {
                    self.internal_delete(k, id, remote_uid == 0)?;
                    return Err(e);
                }
            }
        }

        if virt_size != 0 {
            if let Err(e) = self.resize(k, id, virt_size, commit_size) {
                self.internal_delete(k, id, remote_uid == 0)?;
                return Err(e);
            }
        }
        debug!("area: created {} ({} bytes)", id, virt_size);
        Ok(handle)
    }

    /// Create a new area in the calling address space.
    pub fn create(
        &self,
        k: &Kernel,
        virt_size: u32,
        commit_size: u32,
        reversed: bool,
    ) -> Result<AreaHandle, Status> {
        self.internal_create(
            k,
            virt_size,
            commit_size,
            0,
            k.proc.as_id(),
            true,
            reversed,
            false,
        )
    }

    /// Create an area backed by `remote_uid`, deduplicating on
    /// `(remote_uid, caller_id)`: an existing match is returned instead
    /// of a new area and the dedup counter rises.
    pub fn create_from(
        &self,
        k: &Kernel,
        remote_uid: u32,
        virt_size: u32,
        commit_size: u32,
        caller_id: u32,
    ) -> Result<u16, Status> {
        k.ml.lock(LOCK_AREA);
        let bucket = remote_uid as usize % {
            let inner = self.inner.lock();
            inner.uid_buckets.len()
        };
        {
            let mut inner = self.inner.lock();
            let mut cur = inner.uid_buckets[bucket];
            while let Some(i) = cur {
                let e = &inner.entries[i as usize];
                if e.remote_uid == remote_uid && e.caller_id == caller_id {
                    inner.cr_dup += 1;
                    k.ml.unlock(LOCK_AREA);
                    return Ok(i + 1);
                }
                cur = inner.entries[i as usize].uid_next;
            }
        }
        let handle =
            match self.internal_create(k, virt_size, commit_size, remote_uid, 0, false, false, true)
            {
                Ok(h) => h,
                Err(e) => {
                    k.ml.unlock(LOCK_AREA);
                    return Err(e);
                }
            };
        let id = handle_id(handle);
        {
            let mut inner = self.inner.lock();
            let head = inner.uid_buckets[bucket];
            let e = &mut inner.entries[id as usize - 1];
            e.caller_id = caller_id;
            e.uid_next = head;
            inner.uid_buckets[bucket] = Some(id - 1);
        }
        k.ml.unlock(LOCK_AREA);
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    fn internal_delete(&self, k: &Kernel, id: u16, unlink: bool) -> Result<(), Status> {
        let (active, virt, remote_volx, caller_id) = {
            let inner = self.inner.lock();
            let e = &inner.entries[id as usize - 1];
            (
                e.flags.contains(AreaFlags::ACTIVE),
                e.virt_size,
                e.remote_volx,
                e.caller_id,
            )
        };
        if !active {
            return Ok(());
        }
        if virt != 0 {
            self.resize(k, id, 0, 0)?;
        }
        if remote_volx != 0 {
            let partner = self.partner_node.load(Ordering::Acquire);
            k.remote.delete_area(partner, remote_volx, caller_id)?;
        }
        {
            let mut inner = self.inner.lock();
            inner.entries[id as usize - 1].flags.remove(AreaFlags::ACTIVE);
        }
        if unlink {
            k.ml.lock(LOCK_AREA);
            {
                let mut inner = self.inner.lock();
                let idx = id - 1;
                inner.entries[idx as usize].flags.remove(AreaFlags::IN_TRANS);
                Self::unlink_owner(&mut inner, idx);
                let head = inner.free_head;
                inner.entries[idx as usize].next = head;
                inner.free_head = Some(idx);
                inner.n_free += 1;
            }
            k.ml.unlock(LOCK_AREA);
        }
        Ok(())
    }

    fn unlink_uid_chain(&self, id: u16) {
        let mut inner = self.inner.lock();
        let idx = id - 1;
        let bucket = inner.entries[idx as usize].remote_uid as usize % inner.uid_buckets.len();
        let mut cur = inner.uid_buckets[bucket];
        if cur == Some(idx) {
            inner.uid_buckets[bucket] = inner.entries[idx as usize].uid_next;
            return;
        }
        while let Some(p) = cur {
            let next = inner.entries[p as usize].uid_next;
            if next == Some(idx) {
                inner.entries[p as usize].uid_next = inner.entries[idx as usize].uid_next;
                return;
            }
            cur = next;
        }
    }

    /// Delete an area. The caller must own it (or it must be
    /// remote-backed).
    pub fn delete(&self, k: &Kernel, handle: AreaHandle) -> Result<(), Status> {
        let id = handle_id(handle);
        if !self.id_in_range(id) {
            return Err(Status::AreaNotActive);
        }
        self.claim(k, id, handle_gen(handle), true, true)?;
        let remote_linked = {
            let inner = self.inner.lock();
            inner.entries[id as usize - 1].remote_uid != 0
        };
        if remote_linked {
            self.unlink_uid_chain(id);
        }
        let r = self.internal_delete(k, id, true);
        self.in_trans_ec.advance();
        r
    }

    /// Delete variant for remote callers: the entry is not linked in an
    /// owner list, so nothing is unlinked.
    pub fn delete_from(&self, k: &Kernel, handle: AreaHandle) -> Result<(), Status> {
        let id = handle_id(handle);
        if !self.id_in_range(id) {
            return Err(Status::AreaNotActive);
        }
        self.claim(k, id, handle_gen(handle), true, false)?;
        self.unlink_uid_chain(id);
        let r = self.internal_delete(k, id, false);
        {
            let mut inner = self.inner.lock();
            let idx = id - 1;
            inner.entries[idx as usize].flags.remove(AreaFlags::IN_TRANS);
            if r.is_ok() {
                inner.del_dup += 1;
                let head = inner.free_head;
                inner.entries[idx as usize].next = head;
                inner.free_head = Some(idx);
                inner.n_free += 1;
            }
        }
        self.in_trans_ec.advance();
        r
    }

    // ------------------------------------------------------------------
    // Copy
    // ------------------------------------------------------------------

    /// Duplicate an area for `new_asid`, skipping segments inside the
    /// stack region `[stack_low, stack_limit)`. Returns the new handle.
    pub fn copy(
        &self,
        k: &Kernel,
        gen: u16,
        src_id: u16,
        new_asid: Asid,
        stack_limit: u32,
    ) -> Result<AreaHandle, Status> {
        if !self.id_in_range(src_id) {
            return Err(Status::AreaNotActive);
        }
        let (src_virt, src_commit, reversed, src_flags, src_remote_uid, src_first_seg) = {
            let inner = self.inner.lock();
            let e = &inner.entries[src_id as usize - 1];
            if !e.flags.contains(AreaFlags::ACTIVE) || e.generation != gen {
                return Err(Status::AreaNotActive);
            }
            let asid = k.proc.as_id();
            if e.remote_uid == 0 && asid != 0 && asid != e.owner_asid {
                return Err(Status::AreaNotOwner);
            }
            (
                e.virt_size,
                e.commit_size,
                e.flags.contains(AreaFlags::REVERSED),
                e.flags,
                e.remote_uid,
                e.first_seg,
            )
        };

        let dst_handle =
            self.internal_create(k, src_virt, src_commit, 0, new_asid, true, reversed, false)?;
        let dst_id = handle_id(dst_handle);
        if src_virt == 0 {
            return Ok(dst_handle);
        }
        {
            let mut inner = self.inner.lock();
            let e = &mut inner.entries[dst_id as usize - 1];
            e.flags |= src_flags & (AreaFlags::SHARED | AreaFlags::TOUCHED);
            e.remote_uid = src_remote_uid;
            e.first_bste = new_asid as i16;
            e.first_seg = src_first_seg;
        }

        self.claim(k, src_id, gen, true, false)?;

        // The copy keeps the source's segment shape; only page contents
        // inside the stack region are skipped.
        {
            let mut inner = self.inner.lock();
            let (bm, ext) = {
                let s = &inner.entries[src_id as usize - 1];
                (s.bitmap, s.ext_bitmap.clone())
            };
            let d = &mut inner.entries[dst_id as usize - 1];
            d.bitmap = bm;
            d.ext_bitmap = ext;
        }

        let n_segs = {
            let inner = self.inner.lock();
            inner.entries[src_id as usize - 1].n_segs()
        };
        let (stack_low_seg, stack_high_seg) = {
            let inner = self.inner.lock();
            (inner.stack_low / SEG_SIZE, stack_limit / SEG_SIZE)
        };

        let mut result = Ok(dst_handle);
        for seg in 0..n_segs {
            let present = {
                let inner = self.inner.lock();
                inner.entries[src_id as usize - 1].bit(seg)
            };
            if !present {
                continue;
            }
            // Address-space segment this logical slot occupies; reversed
            // areas walk downward from their first segment.
            let as_seg = if reversed {
                (src_first_seg as u32).saturating_sub(seg)
            } else {
                src_first_seg as u32 + seg
            };
            if as_seg >= stack_low_seg && as_seg < stack_high_seg {
                continue;
            }
            let step = (|| {
                let src_aste = self.get_aste(k, src_id, seg)?;
                let dst_aste = match self.get_aste(k, dst_id, seg) {
                    Ok(a) => a,
                    Err(e) => {
                        k.ast.unwire(k, src_aste);
                        return Err(e);
                    }
                };
                let r = k.ast.copy_area(k, src_aste, dst_aste, seg as u16);
                k.ast.unwire(k, src_aste);
                k.ast.unwire(k, dst_aste);
                r
            })();
            match step {
                Ok(()) => {}
                Err(e) => {
                    let _ = self.internal_delete(k, dst_id, true);
                    result = Err(e);
                    break;
                }
            }
        }

        self.release_claim(k, src_id);
        result
    }

    // ------------------------------------------------------------------
    // Growth and invalidation
    // ------------------------------------------------------------------

    /// Grow (or shrink) an area, validating its generation.
    pub fn grow(
        &self,
        k: &Kernel,
        gen: u16,
        id: u16,
        virt_size: u32,
        commit_size: u32,
    ) -> Result<(), Status> {
        if !self.id_in_range(id) {
            return Err(Status::AreaNotActive);
        }
        self.claim(k, id, gen, true, true)?;
        let r = self.resize(k, id, virt_size, commit_size);
        self.release_claim(k, id);
        r
    }

    /// Index-addressed grow used by the remote file server; no
    /// generation check.
    pub fn grow_to(
        &self,
        k: &Kernel,
        id: u16,
        virt_size: u32,
        commit_size: u32,
    ) -> Result<(), Status> {
        if !self.id_in_range(id) {
            return Err(Status::AreaNotActive);
        }
        self.claim(k, id, 0, false, true)?;
        let r = self.resize(k, id, virt_size, commit_size);
        self.release_claim(k, id);
        r
    }

    /// Discard pages of an area. `count == 0`, an untouched area, or a
    /// zero-sized area are no-ops. Reversed areas invert the segment
    /// index and split partial head/tail segments.
    pub fn invalidate(
        &self,
        k: &Kernel,
        gen: u16,
        id: u16,
        seg: u16,
        page: u16,
        count: u32,
    ) -> Result<(), Status> {
        if !self.id_in_range(id) {
            return Err(Status::AreaNotActive);
        }
        {
            let inner = self.inner.lock();
            let e = &inner.entries[id as usize - 1];
            if count == 0 || !e.flags.contains(AreaFlags::TOUCHED) || e.virt_size == 0 {
                return Ok(());
            }
        }
        self.claim(k, id, gen, true, true)?;
        let (virt_size, reversed) = {
            let inner = self.inner.lock();
            let e = &inner.entries[id as usize - 1];
            (e.virt_size, e.flags.contains(AreaFlags::REVERSED))
        };
        let max_page = (virt_size - 1) / PAGE_SIZE;

        let r = (|| {
            if !reversed {
                let start = page as u32 + seg as u32 * PAGES_PER_SEG;
                if start > max_page {
                    return Ok(());
                }
                let end = (start + count - 1).min(max_page);
                self.free_segments(k, id, start, end, false)
            } else {
                // Reversed: the caller's segment index counts down from
                // the top; partial head and tail segments are split off
                // from the full-segment middle run.
                let mut remaining = count;
                let mut logical_seg = seg as u32;
                let mut page_off = page as u32;
                let seg_span_end = logical_seg * PAGES_PER_SEG + PAGES_PER_SEG - 1 - page_off;
                if seg_span_end > max_page {
                    page_off = PAGES_PER_SEG - 1 - (max_page % PAGES_PER_SEG);
                }
                if page_off != 0 {
                    let seg_start = logical_seg * PAGES_PER_SEG;
                    let take = remaining.min(PAGES_PER_SEG - page_off);
                    self.free_segments(k, id, seg_start, seg_start + take - 1, false)?;
                    remaining -= take;
                    logical_seg += 1;
                }
                if remaining >= PAGES_PER_SEG {
                    let full = remaining / PAGES_PER_SEG;
                    let start = logical_seg * PAGES_PER_SEG;
                    let end = (logical_seg + full) * PAGES_PER_SEG - 1;
                    self.free_segments(k, id, start, end, false)?;
                    remaining -= full * PAGES_PER_SEG;
                    logical_seg += full;
                }
                if remaining != 0 {
                    let start = logical_seg * PAGES_PER_SEG;
                    self.free_segments(k, id, start, start + remaining - 1, false)?;
                }
                Ok(())
            }
        })();
        self.release_claim(k, id);
        r
    }

    // ------------------------------------------------------------------
    // Touch and association
    // ------------------------------------------------------------------

    /// Bring one page of an area into memory, growing the committed size
    /// when the touched page lies beyond it (by at least four pages,
    /// capped at the virtual size).
    pub fn touch(&self, k: &Kernel, handle: AreaHandle, seg: u16, page: u16) -> Result<(), Status> {
        let id = handle_id(handle);
        if !self.id_in_range(id) {
            return Err(Status::AreaNotActive);
        }
        {
            let inner = self.inner.lock();
            let e = &inner.entries[id as usize - 1];
            if !e.flags.contains(AreaFlags::ACTIVE)
                || (e.generation != handle_gen(handle) && e.remote_uid == 0)
            {
                return Err(Status::AreaNotActive);
            }
        }
        let (commit, virt, reversed) = {
            let inner = self.inner.lock();
            let e = &inner.entries[id as usize - 1];
            (
                e.commit_size,
                e.virt_size,
                e.flags.contains(AreaFlags::REVERSED),
            )
        };
        let committed_pages = commit / PAGE_SIZE;
        let touched_page = if reversed {
            seg as u32 * PAGES_PER_SEG + (PAGES_PER_SEG - 1 - page as u32)
        } else {
            seg as u32 * PAGES_PER_SEG + page as u32
        };
        let needed = touched_page as i64 - committed_pages as i64 + 1;
        if needed > 0 {
            let grow_pages = needed.max(4) as u32;
            let target = (commit + grow_pages * PAGE_SIZE).min(virt);
            self.claim(k, id, handle_gen(handle), true, false)?;
            let r = self.resize(k, id, virt, target);
            self.release_claim(k, id);
            r?;
        }
        let aste = self.get_aste(k, id, seg as u32)?;
        let r = k.ast.touch_area(k, aste, TouchMode::Write, page, 1);
        k.ast.unwire(k, aste);
        r?;
        let mut inner = self.inner.lock();
        let e = &mut inner.entries[id as usize - 1];
        e.flags.insert(AreaFlags::TOUCHED);
        e.set_bit(seg as u32, true);
        Ok(())
    }

    /// Associate a backing address with one page of an area segment.
    pub fn assoc(
        &self,
        k: &Kernel,
        gen: u16,
        id: u16,
        seg: u16,
        page: u16,
        disk: u32,
    ) -> Result<(), Status> {
        if !self.id_in_range(id) {
            return Err(Status::AreaNotActive);
        }
        {
            let inner = self.inner.lock();
            let e = &inner.entries[id as usize - 1];
            if !e.flags.contains(AreaFlags::ACTIVE) || e.generation != gen {
                return Err(Status::AreaNotActive);
            }
        }
        let aste = self.get_aste(k, id, seg as u32)?;
        let r = k.ast.assoc_page(k, aste, page, disk);
        k.ast.unwire(k, aste);
        r
    }

    /// Record the initial backing-store linkage of an area.
    pub fn thread_bstes(
        &self,
        k: &Kernel,
        handle: AreaHandle,
        first_bste: i16,
        first_seg: u16,
    ) -> Result<(), Status> {
        let id = handle_id(handle);
        if !self.id_in_range(id) {
            return Err(Status::AreaNotActive);
        }
        let _ = k;
        let mut inner = self.inner.lock();
        let e = &mut inner.entries[id as usize - 1];
        if !e.flags.contains(AreaFlags::ACTIVE) || e.generation != handle_gen(handle) {
            return Err(Status::AreaNotActive);
        }
        e.first_bste = first_bste;
        e.first_seg = first_seg;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transfer and teardown
    // ------------------------------------------------------------------

    /// Move an area to another address space, adjusting its size and
    /// first segment. Returns the previous first segment. On a failed
    /// grow the ownership fields are reverted.
    pub fn transfer(
        &self,
        k: &Kernel,
        handle: AreaHandle,
        new_asid: Asid,
        new_seg: u16,
        new_virt: u32,
    ) -> Result<u16, Status> {
        let id = handle_id(handle);
        if !self.id_in_range(id) {
            return Err(Status::AreaNotActive);
        }
        k.ml.lock(LOCK_AREA);
        loop {
            let inner = self.inner.lock();
            let e = &inner.entries[id as usize - 1];
            if e.flags.contains(AreaFlags::IN_TRANS) {
                drop(inner);
                self.wait_in_trans(k);
                continue;
            }
            if !e.flags.contains(AreaFlags::ACTIVE) {
                k.ml.unlock(LOCK_AREA);
                return Err(Status::AreaNotActive);
            }
            if e.owner_asid != k.proc.as_id() {
                k.ml.unlock(LOCK_AREA);
                return Err(Status::AreaNotOwner);
            }
            break;
        }
        {
            let mut inner = self.inner.lock();
            inner.entries[id as usize - 1].flags.insert(AreaFlags::IN_TRANS);
        }
        k.ml.unlock(LOCK_AREA);

        let (old_virt, old_commit, reversed, old_asid) = {
            let inner = self.inner.lock();
            let e = &inner.entries[id as usize - 1];
            (
                e.virt_size,
                e.commit_size,
                e.flags.contains(AreaFlags::REVERSED),
                e.owner_asid,
            )
        };

        let finish = |r: Result<u16, Status>| {
            self.release_claim(k, id);
            r
        };

        if new_virt < old_virt {
            if let Err(e) = self.resize(k, id, new_virt, old_commit) {
                return finish(Err(e));
            }
        }

        let prev_seg = {
            let mut inner = self.inner.lock();
            let e = &mut inner.entries[id as usize - 1];
            let adjustment = if reversed {
                ((e.virt_size + SEG_SIZE - 1) / SEG_SIZE).saturating_sub(1) as u16
            } else {
                0
            };
            let prev = e.first_seg;
            e.first_bste = new_asid as i16;
            e.first_seg = new_seg + adjustment;
            prev
        };

        if old_virt < new_virt {
            if let Err(err) = self.resize(k, id, new_virt, old_commit) {
                let mut inner = self.inner.lock();
                let e = &mut inner.entries[id as usize - 1];
                e.first_bste = old_asid as i16;
                e.first_seg = prev_seg;
                drop(inner);
                return finish(Err(err));
            }
        }

        k.ml.lock(LOCK_AREA);
        {
            let mut inner = self.inner.lock();
            Self::unlink_owner(&mut inner, id - 1);
            Self::link_owner(&mut inner, id - 1, new_asid);
            inner.entries[id as usize - 1].owner_asid = new_asid;
        }
        k.ml.unlock(LOCK_AREA);
        finish(Ok(prev_seg))
    }

    /// Delete every area owned by `asid`.
    pub fn free_asid(&self, k: &Kernel, asid: Asid) -> Result<(), Status> {
        loop {
            let head = {
                let inner = self.inner.lock();
                inner.asid_lists[asid as usize]
            };
            let Some(idx) = head else { break };
            let id = idx + 1;
            self.claim(k, id, 0, false, false)?;
            self.internal_delete(k, id, true)?;
            self.in_trans_ec.advance();
        }
        Ok(())
    }

    /// Free all address spaces and reclaim remaining remote-backed
    /// areas.
    pub fn shutdown(&self, k: &Kernel) -> Result<(), Status> {
        let n_asids = {
            let inner = self.inner.lock();
            inner.asid_lists.len()
        };
        for asid in 0..n_asids {
            self.free_asid(k, asid as Asid)?;
        }
        let n_buckets = {
            let inner = self.inner.lock();
            inner.uid_buckets.len()
        };
        for bucket in 0..n_buckets {
            loop {
                let head = {
                    let inner = self.inner.lock();
                    inner.uid_buckets[bucket]
                };
                let Some(idx) = head else { break };
                let id = idx + 1;
                let gen = {
                    let inner = self.inner.lock();
                    inner.entries[idx as usize].generation
                };
                self.delete_from(k, make_handle(gen, id))?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Free entries remaining.
    pub fn n_free(&self) -> u16 {
        self.inner.lock().n_free
    }

    /// Create-from dedup hits.
    pub fn cr_dup(&self) -> u16 {
        self.inner.lock().cr_dup
    }

    /// Length of an owner's area list.
    pub fn owner_list_len(&self, asid: Asid) -> usize {
        let inner = self.inner.lock();
        let mut n = 0;
        let mut cur = inner.asid_lists[asid as usize];
        while let Some(idx) = cur {
            n += 1;
            cur = inner.entries[idx as usize].next;
        }
        n
    }

    /// (virt_size, commit_size, owner, flags, inline bitmap) of an area.
    pub fn inspect(&self, id: u16) -> Option<(u32, u32, Asid, AreaFlags, u64)> {
        if !self.id_in_range(id) {
            return None;
        }
        let inner = self.inner.lock();
        let e = &inner.entries[id as usize - 1];
        Some((e.virt_size, e.commit_size, e.owner_asid, e.flags, e.bitmap))
    }
}
