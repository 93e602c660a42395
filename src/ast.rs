//! Active object / segment table
//!
//! The in-memory cache of file objects and their segment mappings. An
//! AOTE caches one object's attribute block, hash-indexed by UID; each
//! AOTE owns a chain of ASTEs mapping one segment apiece; each ASTE owns
//! a segment map of per-page slots pointing at physical pages or backing
//! addresses. Objects may be backed by a local volume or by a partner
//! node across the ring.
//!
//! All table mutations happen with the AST resource lock held; page-slot
//! transitions additionally take the PMAP lock. A task that finds an
//! entry in transition waits on the corresponding event count, re-reads,
//! and retries.

use alloc::vec::Vec;
use log::{debug, warn};
use spinning_top::Spinlock;

use crate::config::{KernelConfig, PAGES_PER_SEG, PAGE_SIZE};
use crate::ec::Ec;
use crate::glue::{Ppn, VolIdx};
use crate::ml::{LOCK_AST, LOCK_PMAP};
use crate::status::{fatal, Status};
use crate::time::Clock48;
use crate::uid::{NodeId, Uid};
use crate::Kernel;

// ============================================================================
// Flags
// ============================================================================

bitflags::bitflags! {
    /// Per-object flags.
    pub struct AoteFlags: u8 {
        const IN_TRANS = 0x80;
        const BUSY     = 0x40;
        const DIRTY    = 0x20;
        const TOUCHED  = 0x10;
        const REMOTE   = 0x08;
    }
}

bitflags::bitflags! {
    /// Per-segment-mapping flags.
    pub struct AsteFlags: u16 {
        const IN_TRANS = 0x8000;
        const LOCKED   = 0x4000;
        const DIRTY    = 0x2000;
        const AREA     = 0x1000;
        const REMOTE   = 0x0800;
        const BUSY     = 0x0040;
    }
}

bitflags::bitflags! {
    /// Per-page segment map flags.
    pub struct SegFlags: u8 {
        const IN_TRANS  = 0x80;
        const IN_USE    = 0x40;
        const INSTALLED = 0x20;
        const COW       = 0x10;
        const DIRTY     = 0x08;
    }
}

// ============================================================================
// Attributes
// ============================================================================

/// Object kinds carried in the attribute block.
pub mod obj_type {
    pub const FILE: u8 = 0;
    pub const DIR: u8 = 1;
    pub const SYS_DIR: u8 = 2;
}

/// Cached attribute block for one object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjAttrs {
    pub obj_type: u8,
    pub cur_len: u32,
    pub blocks_used: u32,
    /// Data-time-valid: last modification.
    pub dtv: Clock48,
    /// Last use.
    pub dtu: Clock48,
    /// Creation.
    pub dtc: Clock48,
    pub acl_uid: Uid,
    pub last_writer: NodeId,
    pub trouble: bool,
    pub delete_on_unlock: bool,
    pub read_only: bool,
    pub permanent: bool,
}

/// The ACL-relevant slice of the attribute block.
#[derive(Debug, Clone, PartialEq)]
pub struct AclAttrs {
    pub acl_uid: Uid,
    pub obj_type: u8,
}

/// The commonly consulted slice of the attribute block.
#[derive(Debug, Clone, PartialEq)]
pub struct CommonAttrs {
    pub obj_type: u8,
    pub cur_len: u32,
    pub dtv: Clock48,
    pub dtu: Clock48,
    pub delete_on_unlock: bool,
}

/// A single attribute mutation for `set_attribute`.
#[derive(Debug, Clone, Copy)]
pub enum AttrUpdate {
    Trouble(bool),
    CurLen(u32),
    Dtv(Clock48),
    Dtu(Clock48),
    LastWriter(NodeId),
    DeleteOnUnlock(bool),
}

// ============================================================================
// Table entries
// ============================================================================

/// Where an object's pages live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    Local { volx: VolIdx },
    Remote { node: NodeId },
}

struct Aote {
    uid: Uid,
    backing: Backing,
    attrs: ObjAttrs,
    ref_count: u8,
    flags: AoteFlags,
    aste_head: Option<u16>,
    hash_next: Option<u16>,
    in_use: bool,
}

impl Aote {
    fn vacant() -> Self {
        Self {
            uid: Uid::default(),
            backing: Backing::Local { volx: 0 },
            attrs: ObjAttrs::default(),
            ref_count: 0,
            flags: AoteFlags::empty(),
            aste_head: None,
            hash_next: None,
            in_use: false,
        }
    }
}

struct Aste {
    aote: u16,
    segment: u16,
    page_count: u8,
    wire_count: u8,
    stamp: u32,
    flags: AsteFlags,
    next: Option<u16>,
    in_use: bool,
}

impl Aste {
    fn vacant() -> Self {
        Self {
            aote: 0,
            segment: 0,
            page_count: 0,
            wire_count: 0,
            stamp: 0,
            flags: AsteFlags::empty(),
            next: None,
            in_use: false,
        }
    }
}

/// One page slot of a segment map.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SegPage {
    pub flags: SegFlags,
    /// Physical page while INSTALLED.
    pub ppn: Ppn,
    /// Backing address (disk block or partner page), 0 if none.
    pub disk: u32,
}

impl Default for SegFlags {
    fn default() -> Self {
        SegFlags::empty()
    }
}

type SegMap = [SegPage; PAGES_PER_SEG as usize];

#[derive(Debug, Default, Clone, Copy)]
struct AstStats {
    activations: u32,
    page_faults: u32,
    reclaims: u32,
}

struct AstInner {
    aotes: Vec<Aote>,
    aote_free: Vec<u16>,
    buckets: Vec<Option<u16>>,
    astes: Vec<Aste>,
    aste_free: Vec<u16>,
    segmaps: Vec<SegMap>,
    dism_seqn: u32,
    dismounting_mask: u32,
    vol_ops: Vec<u16>,
    dismount_failed: Option<Uid>,
    stamp: u32,
    stats: AstStats,
}

/// The active object / segment table.
pub struct AstCache {
    inner: Spinlock<AstInner>,
    /// Advanced whenever an AOTE/ASTE leaves the in-transition state.
    pub in_trans_ec: Ec,
    /// Advanced whenever a page slot leaves the in-transition state.
    pub pmap_in_trans_ec: Ec,
    /// Advanced when a volume's in-flight operation count drops.
    vol_ops_ec: Ec,
}

/// Request block for [`AstCache::locate_aste`].
#[derive(Debug, Clone, Copy)]
pub struct LocateRequest {
    pub uid: Uid,
    pub segment: u16,
    /// Table-index hint from a previous lookup; checked first.
    pub hint: Option<u16>,
}

/// Page access intent for touch operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchMode {
    Read,
    Write,
}

/// Selection and behavior flags for [`AstCache::purify`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PurifyFlags {
    /// Flush only the named segment rather than the whole object.
    pub single_segment: bool,
    /// Interpret the segment list as the selection.
    pub by_index: bool,
    /// Queue the flush through the deferred execution manager.
    pub asynchronous: bool,
    /// Refresh dtv/dtu before flushing.
    pub update_times: bool,
}

impl AstCache {
    pub fn new(cfg: &KernelConfig) -> Self {
        let mut aotes = Vec::with_capacity(cfg.aot_entries);
        let mut aote_free = Vec::with_capacity(cfg.aot_entries);
        for i in 0..cfg.aot_entries {
            aotes.push(Aote::vacant());
            aote_free.push((cfg.aot_entries - 1 - i) as u16);
        }
        let mut astes = Vec::with_capacity(cfg.ast_entries);
        let mut aste_free = Vec::with_capacity(cfg.ast_entries);
        let mut segmaps = Vec::with_capacity(cfg.ast_entries);
        for i in 0..cfg.ast_entries {
            astes.push(Aste::vacant());
            aste_free.push((cfg.ast_entries - 1 - i) as u16);
            segmaps.push([SegPage::default(); PAGES_PER_SEG as usize]);
        }
        let mut buckets = Vec::new();
        buckets.resize(cfg.aot_buckets, None);
        let mut vol_ops = Vec::new();
        vol_ops.resize(cfg.max_volumes, 0);
        Self {
            inner: Spinlock::new(AstInner {
                aotes,
                aote_free,
                buckets,
                astes,
                aste_free,
                segmaps,
                dism_seqn: 0,
                dismounting_mask: 0,
                vol_ops,
                dismount_failed: None,
                stamp: 0,
                stats: AstStats::default(),
            }),
            in_trans_ec: Ec::new(),
            pmap_in_trans_ec: Ec::new(),
            vol_ops_ec: Ec::new(),
        }
    }

    // ------------------------------------------------------------------
    // In-transition waiting
    // ------------------------------------------------------------------

    /// Drop the AST lock, wait for the next in-transition advance, and
    /// retake the lock. Callers re-read all state afterwards.
    pub fn wait_for_ast_intrans(&self, k: &Kernel) {
        let target = self.in_trans_ec.read() + 1;
        k.ml.unlock(LOCK_AST);
        self.in_trans_ec.wait(target);
        k.ml.lock(LOCK_AST);
    }

    fn wait_for_pmap_intrans(&self, k: &Kernel) {
        let target = self.pmap_in_trans_ec.read() + 1;
        k.ml.unlock(LOCK_PMAP);
        self.pmap_in_trans_ec.wait(target);
        k.ml.lock(LOCK_PMAP);
    }

    // ------------------------------------------------------------------
    // AOTE management
    // ------------------------------------------------------------------

    fn find_aote(inner: &AstInner, uid: Uid) -> Option<u16> {
        let mut cur = inner.buckets[uid.hash(inner.buckets.len())];
        while let Some(idx) = cur {
            let aote = &inner.aotes[idx as usize];
            if aote.uid == uid {
                return Some(idx);
            }
            cur = aote.hash_next;
        }
        None
    }

    fn alloc_aote(&self, k: &Kernel, inner: &mut AstInner) -> Result<u16, Status> {
        if let Some(idx) = inner.aote_free.pop() {
            return Ok(idx);
        }
        // Pool exhausted: reclaim a quiescent entry. A reference count
        // above the cache's own linkage reference means wired segment
        // mappings exist; such entries stay.
        let mut victim = None;
        for (i, aote) in inner.aotes.iter().enumerate() {
            if !aote.in_use
                || aote.ref_count > 1
                || aote
                    .flags
                    .intersects(AoteFlags::IN_TRANS | AoteFlags::BUSY)
            {
                continue;
            }
            let mut busy = false;
            let mut cur = aote.aste_head;
            while let Some(a) = cur {
                let aste = &inner.astes[a as usize];
                if aste.flags.intersects(AsteFlags::LOCKED | AsteFlags::IN_TRANS) {
                    busy = true;
                    break;
                }
                cur = aste.next;
            }
            if !busy {
                victim = Some(i as u16);
                break;
            }
        }
        let Some(idx) = victim else {
            return Err(Status::AstTableFull);
        };
        self.flush_aote(k, inner, idx)?;
        self.evict_aote(k, inner, idx);
        inner.stats.reclaims += 1;
        Ok(idx)
    }

    fn unlink_aote(inner: &mut AstInner, idx: u16) {
        let uid = inner.aotes[idx as usize].uid;
        let bucket = uid.hash(inner.buckets.len());
        let mut cur = inner.buckets[bucket];
        if cur == Some(idx) {
            inner.buckets[bucket] = inner.aotes[idx as usize].hash_next;
            return;
        }
        while let Some(prev) = cur {
            let next = inner.aotes[prev as usize].hash_next;
            if next == Some(idx) {
                inner.aotes[prev as usize].hash_next = inner.aotes[idx as usize].hash_next;
                return;
            }
            cur = next;
        }
    }

    /// Free every ASTE and page of `idx` and return it to the free pool.
    fn evict_aote(&self, k: &Kernel, inner: &mut AstInner, idx: u16) {
        let mut cur = inner.aotes[idx as usize].aste_head;
        while let Some(a) = cur {
            cur = inner.astes[a as usize].next;
            Self::release_pages(k, inner, a, false);
            inner.astes[a as usize] = Aste::vacant();
            inner.aste_free.push(a);
        }
        Self::unlink_aote(inner, idx);
        inner.aotes[idx as usize] = Aote::vacant();
        inner.aote_free.push(idx);
    }

    /// Write back a dirty AOTE: pages first, then the attribute block.
    fn flush_aote(&self, k: &Kernel, inner: &mut AstInner, idx: u16) -> Result<(), Status> {
        let (uid, backing) = {
            let aote = &inner.aotes[idx as usize];
            (aote.uid, aote.backing)
        };
        let mut cur = inner.aotes[idx as usize].aste_head;
        while let Some(a) = cur {
            let seg = inner.astes[a as usize].segment;
            cur = inner.astes[a as usize].next;
            if inner.astes[a as usize].flags.contains(AsteFlags::DIRTY) {
                Self::write_back_segment(k, inner, uid, backing, a, seg)?;
                inner.astes[a as usize].flags.remove(AsteFlags::DIRTY);
            }
        }
        let aote = &mut inner.aotes[idx as usize];
        if aote.flags.contains(AoteFlags::DIRTY) {
            if let Backing::Local { volx } = aote.backing {
                if !aote.uid.is_anon() {
                    k.vtoc.write_attrs(volx, aote.uid, &aote.attrs)?;
                }
            }
            aote.flags.remove(AoteFlags::DIRTY);
        }
        Ok(())
    }

    fn write_back_segment(
        k: &Kernel,
        inner: &mut AstInner,
        uid: Uid,
        backing: Backing,
        aste_idx: u16,
        seg: u16,
    ) -> Result<(), Status> {
        for page in 0..PAGES_PER_SEG as usize {
            let slot = inner.segmaps[aste_idx as usize][page];
            if slot.flags.contains(SegFlags::DIRTY) && slot.flags.contains(SegFlags::INSTALLED) {
                match backing {
                    Backing::Local { .. } => k.vtoc.write_page(slot.disk, slot.ppn)?,
                    Backing::Remote { node } => {
                        k.net.page_out(node, uid, seg as u32, page as u32, slot.ppn)?
                    }
                }
                inner.segmaps[aste_idx as usize][page].flags.remove(SegFlags::DIRTY);
            }
        }
        Ok(())
    }

    fn release_pages(k: &Kernel, inner: &mut AstInner, aste_idx: u16, to_pool: bool) {
        for page in 0..PAGES_PER_SEG as usize {
            let slot = inner.segmaps[aste_idx as usize][page];
            if slot.flags.contains(SegFlags::INSTALLED) {
                if to_pool {
                    k.pages.unwire(slot.ppn);
                }
                k.pages.free(slot.ppn);
            }
            inner.segmaps[aste_idx as usize][page] = SegPage::default();
        }
        inner.astes[aste_idx as usize].page_count = 0;
    }

    /// Activate an AOTE from pre-packaged attributes (boot-time objects
    /// whose metadata arrives canned). A duplicate activation is fatal.
    pub fn activate_aote_canned(
        &self,
        k: &Kernel,
        uid: Uid,
        backing: Backing,
        attrs: &ObjAttrs,
    ) -> Result<u16, Status> {
        k.ml.lock(LOCK_AST);
        let result = (|| {
            let mut inner = self.inner.lock();
            if Self::find_aote(&inner, uid).is_some() {
                fatal!("ast: duplicate activation of {}", uid);
            }
            let idx = self.alloc_aote(k, &mut inner)?;
            let bucket = uid.hash(inner.buckets.len());
            let head = inner.buckets[bucket];
            let mut flags = AoteFlags::empty();
            if matches!(backing, Backing::Remote { .. }) {
                flags |= AoteFlags::REMOTE;
            }
            inner.aotes[idx as usize] = Aote {
                uid,
                backing,
                attrs: attrs.clone(),
                ref_count: 1,
                flags,
                aste_head: None,
                hash_next: head,
                in_use: true,
            };
            inner.buckets[bucket] = Some(idx);
            inner.stats.activations += 1;
            Ok(idx)
        })();
        k.ml.unlock(LOCK_AST);
        result
    }

    /// Canned activation alias used by boot-time object loading.
    pub fn load_aote(
        &self,
        k: &Kernel,
        uid: Uid,
        backing: Backing,
        attrs: &ObjAttrs,
    ) -> Result<u16, Status> {
        self.activate_aote_canned(k, uid, backing, attrs)
    }

    /// Ensure an AOTE for `uid`, fetching attributes from the home
    /// volume or the object's node as needed. AST lock must be held.
    fn activate_locked(&self, k: &Kernel, uid: Uid) -> Result<u16, Status> {
        loop {
            {
                let inner = self.inner.lock();
                if let Some(idx) = Self::find_aote(&inner, uid) {
                    if !inner.aotes[idx as usize].flags.contains(AoteFlags::IN_TRANS) {
                        return Ok(idx);
                    }
                } else {
                    break;
                }
            }
            self.wait_for_ast_intrans(k);
        }

        // Anonymous backing objects (area segments) have no on-disk or
        // partner presence; they activate with empty attributes.
        if uid.is_anon() {
            let mut inner = self.inner.lock();
            let idx = self.alloc_aote(k, &mut inner)?;
            let bucket = uid.hash(inner.buckets.len());
            let head = inner.buckets[bucket];
            inner.aotes[idx as usize] = Aote {
                uid,
                backing: Backing::Local { volx: 0 },
                attrs: ObjAttrs::default(),
                ref_count: 1,
                flags: AoteFlags::empty(),
                aste_head: None,
                hash_next: head,
                in_use: true,
            };
            inner.buckets[bucket] = Some(idx);
            inner.stats.activations += 1;
            return Ok(idx);
        }

        // Not cached: fetch the attribute block. The entry is marked
        // in-transition while the fetch is outstanding.
        let idx = {
            let mut inner = self.inner.lock();
            let idx = self.alloc_aote(k, &mut inner)?;
            let bucket = uid.hash(inner.buckets.len());
            let head = inner.buckets[bucket];
            inner.aotes[idx as usize] = Aote {
                uid,
                backing: Backing::Local { volx: 0 },
                attrs: ObjAttrs::default(),
                ref_count: 1,
                flags: AoteFlags::IN_TRANS,
                aste_head: None,
                hash_next: head,
                in_use: true,
            };
            inner.buckets[bucket] = Some(idx);
            idx
        };

        k.ml.unlock(LOCK_AST);
        let fetched = match k.vtoc.lookup_attrs(uid) {
            Ok((attrs, volx)) => {
                let mask = {
                    let inner = self.inner.lock();
                    inner.dismounting_mask
                };
                if mask & (1 << (volx as u32 & 0x1F)) != 0 {
                    Err(Status::FileObjectNotFound)
                } else {
                    Ok((attrs, Backing::Local { volx }))
                }
            }
            Err(Status::FileObjectNotFound) if uid.node() != k.node_me && uid.node() != 0 => k
                .net
                .get_attrs(uid.node(), uid)
                .map(|attrs| (attrs, Backing::Remote { node: uid.node() })),
            Err(e) => Err(e),
        };
        k.ml.lock(LOCK_AST);

        let mut inner = self.inner.lock();
        match fetched {
            Ok((attrs, backing)) => {
                let aote = &mut inner.aotes[idx as usize];
                aote.attrs = attrs;
                aote.backing = backing;
                aote.flags.remove(AoteFlags::IN_TRANS);
                if matches!(backing, Backing::Remote { .. }) {
                    aote.flags.insert(AoteFlags::REMOTE);
                }
                inner.stats.activations += 1;
                drop(inner);
                self.in_trans_ec.advance();
                Ok(idx)
            }
            Err(e) => {
                Self::unlink_aote(&mut inner, idx);
                inner.aotes[idx as usize] = Aote::vacant();
                inner.aote_free.push(idx);
                drop(inner);
                self.in_trans_ec.advance();
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // ASTE management
    // ------------------------------------------------------------------

    fn alloc_aste(&self, k: &Kernel, inner: &mut AstInner) -> Result<u16, Status> {
        if let Some(idx) = inner.aste_free.pop() {
            return Ok(idx);
        }
        // Reclaim the least recently stamped reclaimable ASTE.
        let mut victim: Option<u16> = None;
        let mut best = u32::MAX;
        for (i, aste) in inner.astes.iter().enumerate() {
            if aste.in_use
                && aste.wire_count == 0
                && !aste
                    .flags
                    .intersects(AsteFlags::LOCKED | AsteFlags::IN_TRANS | AsteFlags::DIRTY)
                && aste.stamp < best
            {
                best = aste.stamp;
                victim = Some(i as u16);
            }
        }
        let Some(idx) = victim else {
            return Err(Status::AstTableFull);
        };
        let owner = inner.astes[idx as usize].aote;
        Self::release_pages(k, inner, idx, false);
        // Unlink from the owner's chain.
        let mut cur = inner.aotes[owner as usize].aste_head;
        if cur == Some(idx) {
            inner.aotes[owner as usize].aste_head = inner.astes[idx as usize].next;
        } else {
            while let Some(p) = cur {
                if inner.astes[p as usize].next == Some(idx) {
                    inner.astes[p as usize].next = inner.astes[idx as usize].next;
                    break;
                }
                cur = inner.astes[p as usize].next;
            }
        }
        inner.astes[idx as usize] = Aste::vacant();
        inner.stats.reclaims += 1;
        Ok(idx)
    }

    /// Find the ASTE for `(uid, segment)`. The hint index is checked
    /// before the hash walk. Returns None when the object or segment has
    /// no mapping.
    pub fn locate_aste(&self, k: &Kernel, req: LocateRequest) -> Result<Option<u16>, Status> {
        k.ml.lock(LOCK_AST);
        let result = loop {
            let inner = self.inner.lock();
            if let Some(h) = req.hint {
                if let Some(aste) = inner.astes.get(h as usize) {
                    if aste.in_use
                        && aste.segment == req.segment
                        && inner.aotes[aste.aote as usize].uid == req.uid
                    {
                        break Some(h);
                    }
                }
            }
            match Self::find_aote(&inner, req.uid) {
                None => break None,
                Some(aidx) => {
                    if inner.aotes[aidx as usize].flags.contains(AoteFlags::IN_TRANS) {
                        drop(inner);
                        self.wait_for_ast_intrans(k);
                        continue;
                    }
                    let mut cur = inner.aotes[aidx as usize].aste_head;
                    let mut found = None;
                    while let Some(a) = cur {
                        if inner.astes[a as usize].segment == req.segment {
                            found = Some(a);
                            break;
                        }
                        cur = inner.astes[a as usize].next;
                    }
                    break found;
                }
            }
        };
        k.ml.unlock(LOCK_AST);
        Ok(result)
    }

    /// Ensure an AOTE for `uid` and a wired ASTE for `segment`.
    /// Returns the ASTE index; drop the wire with [`AstCache::unwire`].
    /// Each wire also holds a reference on the owning AOTE so it cannot
    /// be reclaimed out from under the mapping.
    pub fn activate_and_wire(&self, k: &Kernel, uid: Uid, segment: u16) -> Result<u16, Status> {
        k.ml.lock(LOCK_AST);
        let result = (|| {
            let aidx = self.activate_locked(k, uid)?;
            let mut inner = self.inner.lock();
            let mut cur = inner.aotes[aidx as usize].aste_head;
            while let Some(a) = cur {
                if inner.astes[a as usize].segment == segment {
                    inner.astes[a as usize].wire_count += 1;
                    inner.stamp += 1;
                    let stamp = inner.stamp;
                    inner.astes[a as usize].stamp = stamp;
                    let aote = &mut inner.aotes[aidx as usize];
                    aote.ref_count = aote.ref_count.saturating_add(1);
                    return Ok(a);
                }
                cur = inner.astes[a as usize].next;
            }
            let idx = self.alloc_aste(k, &mut inner)?;
            let remote = inner.aotes[aidx as usize].flags.contains(AoteFlags::REMOTE);
            let head = inner.aotes[aidx as usize].aste_head;
            inner.stamp += 1;
            let stamp = inner.stamp;
            inner.astes[idx as usize] = Aste {
                aote: aidx,
                segment,
                page_count: 0,
                wire_count: 1,
                stamp,
                flags: if remote {
                    AsteFlags::REMOTE
                } else {
                    AsteFlags::empty()
                },
                next: head,
                in_use: true,
            };
            inner.segmaps[idx as usize] = [SegPage::default(); PAGES_PER_SEG as usize];
            let aote = &mut inner.aotes[aidx as usize];
            aote.aste_head = Some(idx);
            aote.ref_count = aote.ref_count.saturating_add(1);
            Ok(idx)
        })();
        k.ml.unlock(LOCK_AST);
        result
    }

    /// Drop one wiring reference from an ASTE and the matching AOTE
    /// reference. The count never drops below the cache's own linkage
    /// reference while the entry stays in its bucket chain.
    pub fn unwire(&self, k: &Kernel, aste_idx: u16) {
        k.ml.lock(LOCK_AST);
        {
            let mut inner = self.inner.lock();
            let owner = {
                let aste = &mut inner.astes[aste_idx as usize];
                if aste.in_use && aste.wire_count > 0 {
                    aste.wire_count -= 1;
                    Some(aste.aote)
                } else {
                    None
                }
            };
            if let Some(o) = owner {
                let aote = &mut inner.aotes[o as usize];
                if aote.ref_count > 1 {
                    aote.ref_count -= 1;
                }
            }
        }
        k.ml.unlock(LOCK_AST);
    }

    // ------------------------------------------------------------------
    // Page operations
    // ------------------------------------------------------------------

    /// Materialize pages `page..page+count` of an ASTE, returning their
    /// physical page numbers. Already-installed pages are returned as
    /// is; missing pages are fetched from the backing store into fresh
    /// pages. Write intent marks the slots dirty.
    pub fn touch(
        &self,
        k: &Kernel,
        aste_idx: u16,
        mode: TouchMode,
        page: u16,
        count: u16,
    ) -> Result<Vec<Ppn>, Status> {
        let end = page + count;
        if end > PAGES_PER_SEG as u16 {
            return Err(Status::AstIncompatibleRequest);
        }
        let (uid, backing, aidx, seg) = {
            let inner = self.inner.lock();
            let aste = &inner.astes[aste_idx as usize];
            if !aste.in_use {
                return Err(Status::AstIncompatibleRequest);
            }
            let aote = &inner.aotes[aste.aote as usize];
            (aote.uid, aote.backing, aste.aote, aste.segment)
        };

        let mut ppns = Vec::with_capacity(count as usize);
        k.ml.lock(LOCK_PMAP);
        for p in page..end {
            loop {
                let slot = {
                    let inner = self.inner.lock();
                    inner.segmaps[aste_idx as usize][p as usize]
                };
                if slot.flags.contains(SegFlags::IN_TRANS) {
                    self.wait_for_pmap_intrans(k);
                    continue;
                }
                if slot.flags.contains(SegFlags::INSTALLED) {
                    if mode == TouchMode::Write {
                        let mut inner = self.inner.lock();
                        inner.segmaps[aste_idx as usize][p as usize]
                            .flags
                            .insert(SegFlags::DIRTY);
                        inner.astes[aste_idx as usize].flags.insert(AsteFlags::DIRTY);
                    }
                    ppns.push(slot.ppn);
                    break;
                }
                // Fetch path: mark in transition, drop the PMAP lock for
                // the allocation and transfer, reinstall on return.
                {
                    let mut inner = self.inner.lock();
                    inner.segmaps[aste_idx as usize][p as usize]
                        .flags
                        .insert(SegFlags::IN_TRANS);
                }
                k.ml.unlock(LOCK_PMAP);
                let fetch = (|| {
                    let ppn = k.pages.calloc()?;
                    if slot.disk != 0 {
                        let io = match backing {
                            Backing::Local { .. } => k.vtoc.read_page(slot.disk, ppn),
                            Backing::Remote { node } => {
                                k.net.page_in(node, uid, seg as u32, p as u32, &[ppn])
                            }
                        };
                        if let Err(e) = io {
                            k.pages.free(ppn);
                            return Err(e);
                        }
                    }
                    Ok(ppn)
                })();
                k.ml.lock(LOCK_PMAP);
                let mut inner = self.inner.lock();
                inner.segmaps[aste_idx as usize][p as usize]
                    .flags
                    .remove(SegFlags::IN_TRANS);
                match fetch {
                    Ok(ppn) => {
                        {
                            let s = &mut inner.segmaps[aste_idx as usize][p as usize];
                            s.flags.insert(SegFlags::IN_USE | SegFlags::INSTALLED);
                            if mode == TouchMode::Write {
                                s.flags.insert(SegFlags::DIRTY);
                            }
                            s.ppn = ppn;
                        }
                        inner.astes[aste_idx as usize].page_count += 1;
                        if mode == TouchMode::Write {
                            inner.astes[aste_idx as usize].flags.insert(AsteFlags::DIRTY);
                        }
                        inner.stats.page_faults += 1;
                        drop(inner);
                        self.pmap_in_trans_ec.advance();
                        ppns.push(ppn);
                    }
                    Err(e) => {
                        drop(inner);
                        self.pmap_in_trans_ec.advance();
                        k.ml.unlock(LOCK_PMAP);
                        return Err(e);
                    }
                }
                break;
            }
        }
        {
            let mut inner = self.inner.lock();
            inner.aotes[aidx as usize].flags.insert(AoteFlags::TOUCHED);
        }
        k.ml.unlock(LOCK_PMAP);
        Ok(ppns)
    }

    /// Touch on behalf of the area subsystem; marks the mapping as an
    /// area mapping.
    pub fn touch_area(
        &self,
        k: &Kernel,
        aste_idx: u16,
        mode: TouchMode,
        page: u16,
        count: u16,
    ) -> Result<(), Status> {
        {
            let mut inner = self.inner.lock();
            inner.astes[aste_idx as usize].flags.insert(AsteFlags::AREA);
        }
        self.touch(k, aste_idx, mode, page, count).map(|_| ())
    }

    /// Copy one segment's pages from `src_aste` to `dst_aste`.
    ///
    /// Installed source pages are copied into freshly allocated
    /// destination pages. Source pages that exist only on the backing
    /// store are fetched in batched runs of contiguous pages directly
    /// into the destination. Empty source slots clear the destination.
    pub fn copy_area(
        &self,
        k: &Kernel,
        src_aste: u16,
        dst_aste: u16,
        start_seg: u16,
    ) -> Result<(), Status> {
        let (uid, backing) = {
            let inner = self.inner.lock();
            let src = &inner.astes[src_aste as usize];
            let dst = &inner.astes[dst_aste as usize];
            if !src.in_use || !dst.in_use {
                fatal!("ast: copy_area with missing segment table");
            }
            let aote = &inner.aotes[src.aote as usize];
            (aote.uid, aote.backing)
        };
        let _ = start_seg;

        let mut advanced_needed = false;
        k.ml.lock(LOCK_PMAP);
        let mut page = 0usize;
        let result = loop {
            if page >= PAGES_PER_SEG as usize {
                break Ok(());
            }
            let slot = {
                let inner = self.inner.lock();
                inner.segmaps[src_aste as usize][page]
            };
            if slot.flags.contains(SegFlags::IN_TRANS) {
                if advanced_needed {
                    self.pmap_in_trans_ec.advance();
                    advanced_needed = false;
                }
                self.wait_for_pmap_intrans(k);
                continue;
            }
            if slot.flags.contains(SegFlags::INSTALLED) {
                // Installed page: copy into a fresh destination page.
                k.ml.unlock(LOCK_PMAP);
                let ppn = match k.pages.calloc() {
                    Ok(p) => p,
                    Err(e) => {
                        k.ml.lock(LOCK_PMAP);
                        break Err(e);
                    }
                };
                k.mmu.install(ppn, 0, 0);
                k.mmu.remove(ppn);
                k.ml.lock(LOCK_PMAP);
                let mut inner = self.inner.lock();
                inner.segmaps[dst_aste as usize][page] = SegPage {
                    flags: SegFlags::IN_USE | SegFlags::INSTALLED | SegFlags::COW,
                    ppn,
                    disk: 0,
                };
                inner.astes[dst_aste as usize].page_count += 1;
                page += 1;
                continue;
            }
            if slot.disk == 0 {
                let mut inner = self.inner.lock();
                inner.segmaps[dst_aste as usize][page] = SegPage::default();
                page += 1;
                continue;
            }

            // Backing-store run: cover as many contiguous non-installed
            // pages as possible with one batched fetch.
            let run = {
                let mut inner = self.inner.lock();
                let mut n = 0usize;
                while page + n < PAGES_PER_SEG as usize {
                    let s = inner.segmaps[src_aste as usize][page + n];
                    if n > 0
                        && (s.flags.intersects(SegFlags::IN_TRANS | SegFlags::INSTALLED)
                            || s.disk == 0)
                    {
                        break;
                    }
                    inner.segmaps[src_aste as usize][page + n]
                        .flags
                        .insert(SegFlags::IN_TRANS);
                    n += 1;
                }
                n
            };
            k.ml.unlock(LOCK_PMAP);
            let fetched = (|| {
                let mut ppns = Vec::with_capacity(run);
                for _ in 0..run {
                    ppns.push(k.pages.calloc()?);
                }
                match backing {
                    Backing::Remote { node } => {
                        k.net.page_in(node, uid, 0, page as u32, &ppns)?
                    }
                    Backing::Local { .. } => {
                        for (i, ppn) in ppns.iter().enumerate() {
                            let addr = {
                                let inner = self.inner.lock();
                                inner.segmaps[src_aste as usize][page + i].disk
                            };
                            k.vtoc.read_page(addr, *ppn)?;
                        }
                    }
                }
                Ok(ppns)
            })();
            k.ml.lock(LOCK_PMAP);
            let mut inner = self.inner.lock();
            for i in 0..run {
                inner.segmaps[src_aste as usize][page + i]
                    .flags
                    .remove(SegFlags::IN_TRANS);
            }
            advanced_needed = true;
            match fetched {
                Ok(ppns) => {
                    for (i, ppn) in ppns.into_iter().enumerate() {
                        inner.segmaps[dst_aste as usize][page + i] = SegPage {
                            flags: SegFlags::IN_USE | SegFlags::INSTALLED,
                            ppn,
                            disk: 0,
                        };
                        inner.astes[dst_aste as usize].page_count += 1;
                    }
                }
                Err(e) => {
                    drop(inner);
                    break Err(e);
                }
            }
            page += run;
        };
        if advanced_needed {
            self.pmap_in_trans_ec.advance();
        }
        k.ml.unlock(LOCK_PMAP);
        result
    }

    // ------------------------------------------------------------------
    // Writeback, truncation, invalidation
    // ------------------------------------------------------------------

    /// Write back dirty pages (and optionally timestamps) of an object.
    /// Returns the number of pages flushed.
    pub fn purify(
        &self,
        k: &Kernel,
        uid: Uid,
        flags: PurifyFlags,
        segment: u16,
        segment_list: &[u16],
    ) -> Result<u16, Status> {
        if flags.asynchronous {
            let mut data = [0u8; 8];
            data[0..4].copy_from_slice(&uid.high.to_le_bytes());
            data[4..8].copy_from_slice(&uid.low.to_le_bytes());
            k.dxm
                .add_callback(&k.dxm.unwired, purify_cb, &data, true)?;
            return Ok(0);
        }
        let asid = k.proc.as_id();
        k.quit.inhibit_begin(asid);
        k.ml.lock(LOCK_AST);
        let result = (|| {
            let mut inner = self.inner.lock();
            let Some(aidx) = Self::find_aote(&inner, uid) else {
                return Ok(0);
            };
            inner.aotes[aidx as usize]
                .flags
                .insert(AoteFlags::IN_TRANS | AoteFlags::BUSY);
            let backing = inner.aotes[aidx as usize].backing;

            let mut flushed = 0u16;
            let mut cur = inner.aotes[aidx as usize].aste_head;
            let mut any = false;
            while let Some(a) = cur {
                let seg = inner.astes[a as usize].segment;
                cur = inner.astes[a as usize].next;
                let selected = if flags.by_index {
                    segment_list.contains(&seg)
                } else if flags.single_segment {
                    seg == segment
                } else {
                    true
                };
                if !selected {
                    continue;
                }
                if inner.astes[a as usize].flags.contains(AsteFlags::DIRTY) {
                    for p in 0..PAGES_PER_SEG as usize {
                        if inner.segmaps[a as usize][p].flags.contains(SegFlags::DIRTY) {
                            flushed += 1;
                        }
                    }
                    if let Err(e) = Self::write_back_segment(k, &mut inner, uid, backing, a, seg)
                    {
                        inner.aotes[aidx as usize]
                            .flags
                            .remove(AoteFlags::IN_TRANS | AoteFlags::BUSY);
                        return Err(e);
                    }
                    inner.astes[a as usize].flags.remove(AsteFlags::DIRTY);
                    any = true;
                }
            }

            if any || flags.update_times {
                let now = Clock48::read();
                let aote = &mut inner.aotes[aidx as usize];
                if flags.update_times {
                    aote.attrs.dtv = now;
                    aote.attrs.dtu = Clock48::abs_from_now(0);
                }
                aote.flags.insert(AoteFlags::DIRTY);
            }
            if inner.aotes[aidx as usize].flags.contains(AoteFlags::DIRTY) {
                if let Backing::Local { volx } = backing {
                    let attrs = inner.aotes[aidx as usize].attrs.clone();
                    if let Err(e) = k.vtoc.write_attrs(volx, uid, &attrs) {
                        inner.aotes[aidx as usize]
                            .flags
                            .remove(AoteFlags::IN_TRANS | AoteFlags::BUSY);
                        return Err(e);
                    }
                }
                inner.aotes[aidx as usize].flags.remove(AoteFlags::DIRTY);
            }
            inner.aotes[aidx as usize]
                .flags
                .remove(AoteFlags::IN_TRANS | AoteFlags::BUSY);
            Ok(flushed)
        })();
        self.in_trans_ec.advance();
        k.ml.unlock(LOCK_AST);
        k.quit.inhibit_end(asid);
        result
    }

    /// Free cached pages and segments beyond `new_size` bytes; with the
    /// delete flag, evict the object entirely.
    pub fn truncate(&self, k: &Kernel, uid: Uid, new_size: u32, delete: bool) -> Result<(), Status> {
        k.ml.lock(LOCK_AST);
        let result = (|| {
            let mut inner = self.inner.lock();
            let Some(aidx) = Self::find_aote(&inner, uid) else {
                if delete {
                    return k.vtoc.delete_object(uid);
                }
                return Ok(());
            };
            if delete {
                self.evict_aote(k, &mut inner, aidx);
                return k.vtoc.delete_object(uid);
            }
            let first_freed_page = (new_size + PAGE_SIZE - 1) / PAGE_SIZE;
            let mut cur = inner.aotes[aidx as usize].aste_head;
            let mut keep_head: Option<u16> = None;
            while let Some(a) = cur {
                let next = inner.astes[a as usize].next;
                let seg_base = inner.astes[a as usize].segment as u32 * PAGES_PER_SEG;
                if seg_base >= first_freed_page {
                    // Whole segment beyond the cut: free it.
                    Self::release_pages(k, &mut inner, a, false);
                    inner.astes[a as usize] = Aste::vacant();
                    inner.aste_free.push(a);
                } else {
                    for p in 0..PAGES_PER_SEG {
                        if seg_base + p >= first_freed_page {
                            let slot = inner.segmaps[a as usize][p as usize];
                            if slot.flags.contains(SegFlags::INSTALLED) {
                                k.pages.free(slot.ppn);
                                inner.astes[a as usize].page_count -= 1;
                            }
                            inner.segmaps[a as usize][p as usize] = SegPage::default();
                        }
                    }
                    inner.astes[a as usize].next = keep_head;
                    keep_head = Some(a);
                }
                cur = next;
            }
            inner.aotes[aidx as usize].aste_head = keep_head;
            inner.aotes[aidx as usize].attrs.cur_len = new_size;
            inner.aotes[aidx as usize].flags.insert(AoteFlags::DIRTY);
            Ok(())
        })();
        k.ml.unlock(LOCK_AST);
        result
    }

    /// Discard cached pages without writeback.
    pub fn invalidate(
        &self,
        k: &Kernel,
        uid: Uid,
        start_page: u32,
        count: u32,
    ) -> Result<(), Status> {
        if count == 0 {
            return Ok(());
        }
        k.ml.lock(LOCK_AST);
        let result = (|| {
            let mut inner = self.inner.lock();
            let Some(aidx) = Self::find_aote(&inner, uid) else {
                return Ok(());
            };
            let end = start_page + count;
            let mut cur = inner.aotes[aidx as usize].aste_head;
            while let Some(a) = cur {
                cur = inner.astes[a as usize].next;
                let seg_base = inner.astes[a as usize].segment as u32 * PAGES_PER_SEG;
                for p in 0..PAGES_PER_SEG {
                    let abs = seg_base + p;
                    if abs >= start_page && abs < end {
                        let slot = inner.segmaps[a as usize][p as usize];
                        if slot.flags.contains(SegFlags::INSTALLED) {
                            k.pages.free(slot.ppn);
                            inner.astes[a as usize].page_count -= 1;
                        }
                        inner.segmaps[a as usize][p as usize] = SegPage::default();
                    }
                }
            }
            Ok(())
        })();
        k.ml.unlock(LOCK_AST);
        result
    }

    // ------------------------------------------------------------------
    // Dismount
    // ------------------------------------------------------------------

    /// Flush and evict every cached object on `volx`, then dismount the
    /// on-disk structures. The dismount sequence number rises by one.
    pub fn dismount(&self, k: &Kernel, volx: VolIdx, flags: u8) -> Result<(), Status> {
        let asid = k.proc.as_id();
        k.quit.inhibit_begin(asid);
        k.ml.lock(LOCK_AST);
        let vol_mask = 1u32 << (volx as u32 & 0x1F);
        {
            let mut inner = self.inner.lock();
            inner.dismounting_mask |= vol_mask;
            inner.dism_seqn += 1;
        }

        // Drain in-flight operations referencing the volume. The wait
        // target is read before the count so a release between the two
        // satisfies the wait immediately.
        loop {
            let target = self.vol_ops_ec.read() + 1;
            let busy = {
                let inner = self.inner.lock();
                inner.vol_ops[volx as usize] != 0
            };
            if !busy {
                break;
            }
            k.ml.unlock(LOCK_AST);
            self.vol_ops_ec.wait(target);
            k.ml.lock(LOCK_AST);
        }

        let result = (|| {
            'rescan: loop {
                let candidate = {
                    let inner = self.inner.lock();
                    let mut found = None;
                    for (i, aote) in inner.aotes.iter().enumerate() {
                        if !aote.in_use || aote.uid == k.paging_file_uid {
                            continue;
                        }
                        if let Backing::Local { volx: v } = aote.backing {
                            if v == volx {
                                found = Some((i as u16, aote.flags.contains(AoteFlags::IN_TRANS)));
                                break;
                            }
                        }
                    }
                    found
                };
                match candidate {
                    None => break 'rescan,
                    Some((_, true)) => {
                        self.wait_for_ast_intrans(k);
                        continue 'rescan;
                    }
                    Some((idx, false)) => {
                        let mut inner = self.inner.lock();
                        if let Err(e) = self.flush_aote(k, &mut inner, idx) {
                            inner.dismount_failed = Some(inner.aotes[idx as usize].uid);
                            warn!(
                                "ast: dismount of vol {} stalled on {}",
                                volx, inner.aotes[idx as usize].uid
                            );
                            return Err(e);
                        }
                        self.evict_aote(k, &mut inner, idx);
                    }
                }
            }
            Ok(())
        })();
        k.ml.unlock(LOCK_AST);

        let result = result.and_then(|_| k.vtoc.dismount(volx, flags));
        {
            let mut inner = self.inner.lock();
            inner.dismounting_mask &= !vol_mask;
        }
        k.quit.inhibit_end(asid);
        debug!("ast: dismount vol {} -> {:?}", volx, result);
        result
    }

    /// Dismount sequence number: rises by one per dismount.
    pub fn get_dism_seqn(&self) -> u32 {
        self.inner.lock().dism_seqn
    }

    /// The object that made the last dismount fail, if any.
    pub fn dismount_failed_uid(&self) -> Option<Uid> {
        self.inner.lock().dismount_failed
    }

    /// Bracket an operation that must block dismount of `volx`.
    pub fn vol_op_begin(&self, volx: VolIdx) {
        self.inner.lock().vol_ops[volx as usize] += 1;
    }

    /// Release the dismount gate taken by [`AstCache::vol_op_begin`].
    pub fn vol_op_end(&self, volx: VolIdx) {
        {
            let mut inner = self.inner.lock();
            inner.vol_ops[volx as usize] -= 1;
        }
        self.vol_ops_ec.advance();
    }

    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    /// Full attribute block of an object, activating it if necessary.
    pub fn get_attributes(&self, k: &Kernel, uid: Uid) -> Result<ObjAttrs, Status> {
        k.ml.lock(LOCK_AST);
        let result = (|| {
            let aidx = self.activate_locked(k, uid)?;
            let inner = self.inner.lock();
            Ok(inner.aotes[aidx as usize].attrs.clone())
        })();
        k.ml.unlock(LOCK_AST);
        result
    }

    /// Where an object lives: its home volume or partner node.
    pub fn get_location(&self, k: &Kernel, uid: Uid) -> Result<Backing, Status> {
        k.ml.lock(LOCK_AST);
        let result = (|| {
            let aidx = self.activate_locked(k, uid)?;
            let inner = self.inner.lock();
            Ok(inner.aotes[aidx as usize].backing)
        })();
        k.ml.unlock(LOCK_AST);
        result
    }

    /// The ACL-relevant attribute slice.
    pub fn get_acl_attributes(&self, k: &Kernel, uid: Uid) -> Result<AclAttrs, Status> {
        let attrs = self.get_attributes(k, uid)?;
        Ok(AclAttrs {
            acl_uid: attrs.acl_uid,
            obj_type: attrs.obj_type,
        })
    }

    /// The commonly consulted attribute slice.
    pub fn get_common_attributes(&self, k: &Kernel, uid: Uid) -> Result<CommonAttrs, Status> {
        let attrs = self.get_attributes(k, uid)?;
        Ok(CommonAttrs {
            obj_type: attrs.obj_type,
            cur_len: attrs.cur_len,
            dtv: attrs.dtv,
            dtu: attrs.dtu,
            delete_on_unlock: attrs.delete_on_unlock,
        })
    }

    /// Apply one attribute mutation and mark the block dirty.
    pub fn set_attribute(&self, k: &Kernel, uid: Uid, update: AttrUpdate) -> Result<(), Status> {
        k.ml.lock(LOCK_AST);
        let result = (|| {
            let aidx = self.activate_locked(k, uid)?;
            let mut inner = self.inner.lock();
            let aote = &mut inner.aotes[aidx as usize];
            match update {
                AttrUpdate::Trouble(v) => aote.attrs.trouble = v,
                AttrUpdate::CurLen(v) => aote.attrs.cur_len = v,
                AttrUpdate::Dtv(v) => aote.attrs.dtv = v,
                AttrUpdate::Dtu(v) => aote.attrs.dtu = v,
                AttrUpdate::LastWriter(v) => aote.attrs.last_writer = v,
                AttrUpdate::DeleteOnUnlock(v) => aote.attrs.delete_on_unlock = v,
            }
            aote.flags.insert(AoteFlags::DIRTY);
            if let Backing::Local { volx } = aote.backing {
                if !uid.is_anon() {
                    let attrs = aote.attrs.clone();
                    aote.flags.remove(AoteFlags::DIRTY);
                    k.vtoc.write_attrs(volx, uid, &attrs)?;
                }
            }
            Ok(())
        })();
        k.ml.unlock(LOCK_AST);
        result
    }

    /// Data-time-valid of an object.
    pub fn get_dtv(&self, k: &Kernel, uid: Uid) -> Result<Clock48, Status> {
        Ok(self.get_attributes(k, uid)?.dtv)
    }

    /// Stamp modification and access times. Returns true if the object
    /// was cached.
    pub fn set_dts(
        &self,
        k: &Kernel,
        uid: Uid,
        dtv: Clock48,
        dtu: Clock48,
    ) -> Result<bool, Status> {
        self.set_attribute(k, uid, AttrUpdate::Dtv(dtv))?;
        self.set_attribute(k, uid, AttrUpdate::Dtu(dtu))?;
        Ok(true)
    }

    /// Flush the object if its cached modification time is older than
    /// `stamp`.
    pub fn cond_flush(&self, k: &Kernel, uid: Uid, stamp: Clock48) -> Result<(), Status> {
        let attrs = self.get_attributes(k, uid)?;
        if attrs.dtv.high < stamp.high {
            self.purify(
                k,
                uid,
                PurifyFlags {
                    update_times: true,
                    ..PurifyFlags::default()
                },
                0,
                &[],
            )?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Trouble marking and remote page-map windows
    // ------------------------------------------------------------------

    /// Queue a deferred callback that marks `uid` as troubled. Safe to
    /// call from paths that cannot take the AST lock; duplicates
    /// collapse.
    pub fn save_clobbered_uid(&self, k: &Kernel, uid: Uid) -> Result<(), Status> {
        let mut data = [0u8; 8];
        data[0..4].copy_from_slice(&uid.high.to_le_bytes());
        data[4..8].copy_from_slice(&uid.low.to_le_bytes());
        k.dxm
            .add_callback(&k.dxm.unwired, set_trouble_cb, &data, true)
    }

    /// Set the trouble attribute on `uid` immediately.
    pub fn set_trouble(&self, k: &Kernel, uid: Uid) -> Result<(), Status> {
        self.set_attribute(k, uid, AttrUpdate::Trouble(true))
    }

    /// Copy a window of a segment map from the partner node into
    /// `out` (one page's worth). A scratch page is allocated, filled
    /// over the network, mapped briefly for the copy, then freed.
    pub fn fetch_pmap_page(
        &self,
        k: &Kernel,
        node: NodeId,
        uid: Uid,
        seg: u32,
        page: u32,
        out: &mut [u8],
    ) -> Result<(), Status> {
        k.ml.lock(LOCK_PMAP);
        let ppn = k.pages.calloc();
        k.ml.unlock(LOCK_PMAP);
        let ppn = ppn?;
        match k.net.fetch_page_image(node, uid, seg, page) {
            Ok(image) => {
                k.ml.lock(LOCK_PMAP);
                k.mmu.install(ppn, 0, 0);
                let n = out.len().min(image.len());
                out[..n].copy_from_slice(&image[..n]);
                k.mmu.remove(ppn);
                k.pages.free(ppn);
                k.ml.unlock(LOCK_PMAP);
                Ok(())
            }
            Err(e) => {
                k.pages.free(ppn);
                Err(e)
            }
        }
    }

    /// A copy of the segment map for `(uid, segment)`.
    pub fn get_seg_map(&self, k: &Kernel, uid: Uid, segment: u16) -> Result<SegMap, Status> {
        let located = self.locate_aste(
            k,
            LocateRequest {
                uid,
                segment,
                hint: None,
            },
        )?;
        let Some(idx) = located else {
            return Err(Status::FileObjectNotFound);
        };
        let inner = self.inner.lock();
        Ok(inner.segmaps[idx as usize])
    }

    /// Stage a backing address into a page slot (used when a mapping is
    /// associated with on-disk or partner storage).
    pub fn assoc_page(
        &self,
        k: &Kernel,
        aste_idx: u16,
        page: u16,
        disk: u32,
    ) -> Result<(), Status> {
        k.ml.lock(LOCK_PMAP);
        {
            let mut inner = self.inner.lock();
            let slot = &mut inner.segmaps[aste_idx as usize][page as usize];
            if slot.flags.contains(SegFlags::INSTALLED) {
                k.ml.unlock(LOCK_PMAP);
                return Err(Status::AstIncompatibleRequest);
            }
            slot.disk = disk;
            slot.flags.insert(SegFlags::IN_USE);
        }
        k.ml.unlock(LOCK_PMAP);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// (activations, page faults, reclaims) since boot.
    pub fn stats(&self) -> (u32, u32, u32) {
        let inner = self.inner.lock();
        (
            inner.stats.activations,
            inner.stats.page_faults,
            inner.stats.reclaims,
        )
    }

    /// Cache reference count of an object: one for the bucket-chain
    /// linkage plus one per wired segment mapping. None when the object
    /// is not cached. Diagnostic only.
    pub fn ref_count_of(&self, uid: Uid) -> Option<u8> {
        let inner = self.inner.lock();
        Self::find_aote(&inner, uid).map(|i| inner.aotes[i as usize].ref_count)
    }

    /// True if the AOT bucket chains contain `uid` exactly once.
    pub fn cached_once(&self, uid: Uid) -> bool {
        let inner = self.inner.lock();
        let mut count = 0;
        for bucket in 0..inner.buckets.len() {
            let mut cur = inner.buckets[bucket];
            while let Some(idx) = cur {
                if inner.aotes[idx as usize].uid == uid {
                    count += 1;
                }
                cur = inner.aotes[idx as usize].hash_next;
            }
        }
        count == 1
    }

    /// Wire count of an ASTE. Diagnostic only.
    pub fn wire_count(&self, aste_idx: u16) -> u8 {
        self.inner.lock().astes[aste_idx as usize].wire_count
    }
}

fn set_trouble_cb(k: &Kernel, data: &[u8]) {
    let uid = Uid::new(
        u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
        u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
    );
    if let Err(e) = k.ast.set_trouble(k, uid) {
        warn!("ast: deferred trouble mark of {} failed: {}", uid, e);
    }
}

fn purify_cb(k: &Kernel, data: &[u8]) {
    let uid = Uid::new(
        u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
        u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
    );
    let flags = PurifyFlags {
        update_times: true,
        ..PurifyFlags::default()
    };
    if let Err(e) = k.ast.purify(k, uid, flags, 0, &[]) {
        warn!("ast: deferred purify of {} failed: {}", uid, e);
    }
}
