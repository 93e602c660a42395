//! File lock manager
//!
//! A hashed table of lock entries implementing reader/writer semantics
//! across the ring. Local locks are granted against a fixed mode
//! compatibility matrix after rights and volume checks; locks on objects
//! homed elsewhere are delegated to the owning node's remote-file
//! service, with one retry when the location hint proves stale. Each
//! address space addresses its own locks through a small per-ASID slot
//! array. All table mutations happen under the file-lock resource lock.

use alloc::vec::Vec;
use hashbrown::HashMap;
use log::debug;
use spinning_top::Spinlock;

use crate::ast::{AttrUpdate, Backing, PurifyFlags};
use crate::config::KernelConfig;
use crate::glue::Rights;
use crate::ml::LOCK_FILE;
use crate::netlog::LogKind;
use crate::status::Status;
use crate::uid::{Asid, NodeId, Uid};
use crate::Kernel;

// ============================================================================
// Modes
// ============================================================================

/// Public lock modes.
pub mod mode {
    /// Shared read.
    pub const READ: u8 = 1;
    /// Exclusive write.
    pub const WRITE: u8 = 2;
    /// Concurrent write among cowriters on one node.
    pub const COWRITE: u8 = 3;
    /// Shared read without unlock-time purify.
    pub const PROTECTED_READ: u8 = 4;
    /// Exclusive read.
    pub const EXCL_READ: u8 = 5;
    /// Pseudo-mode: set delete-on-unlock.
    pub const MARK_DELETE: u8 = 8;
    /// Pseudo-mode: no-op unlock.
    pub const NONE: u8 = 9;
}

/// Canonical (conflict-matrix) modes.
mod canon {
    pub const SR: u8 = 1;
    pub const EX: u8 = 2;
    pub const CW: u8 = 3;
    pub const XR: u8 = 4;
}

const N_MODES: usize = 11;

/// `mode_table[side][mode]` gives the canonical mode; 0 is illegal.
/// The network side of a cowrite behaves as a shared read.
const MODE_TABLE: [[u8; N_MODES]; 2] = [
    [
        0, canon::SR, canon::EX, canon::CW, canon::SR, canon::XR, 0, 0, 0, 0, 0,
    ],
    [
        0, canon::SR, canon::EX, canon::SR, canon::SR, canon::XR, 0, 0, 0, 0, 0,
    ],
];

const fn bit(m: u8) -> u8 {
    1 << m
}

/// `compat_mask[canonical]`: set bits name the canonical modes this
/// mode conflicts with.
const COMPAT_MASK: [u8; 5] = [
    0,
    // SR: conflicts with writers and exclusive readers.
    bit(canon::EX) | bit(canon::CW) | bit(canon::XR),
    // EX: conflicts with everything.
    bit(canon::SR) | bit(canon::EX) | bit(canon::CW) | bit(canon::XR),
    // CW: cowriters tolerate each other, nothing else.
    bit(canon::SR) | bit(canon::EX) | bit(canon::XR),
    // XR: conflicts with everything.
    bit(canon::SR) | bit(canon::EX) | bit(canon::CW) | bit(canon::XR),
];

fn requires_write(public_mode: u8) -> bool {
    public_mode == mode::WRITE || public_mode == mode::COWRITE
}

fn required_rights(public_mode: u8) -> Rights {
    if requires_write(public_mode) {
        Rights::READ | Rights::WRITE
    } else {
        Rights::READ
    }
}

fn exclusive(canonical: u8) -> bool {
    canonical == canon::EX || canonical == canon::CW || canonical == canon::XR
}

// ============================================================================
// Table state
// ============================================================================

bitflags::bitflags! {
    /// Per-entry flags.
    pub struct LockFlags: u8 {
        /// Lock delegated to (or held for) another node.
        const REMOTE    = 0x01;
        /// Remote grant outstanding.
        const PENDING   = 0x02;
        /// Shared entry (refcount reflects multiple holders).
        const SHARED    = 0x04;
        /// Object lives on a read-only volume.
        const READ_ONLY = 0x08;
    }
}

#[derive(Clone)]
struct LockEntry {
    uid: Uid,
    node: NodeId,
    context: u32,
    sequence: u16,
    refcount: u8,
    mode: u8,
    side: u8,
    rights: Rights,
    flags: LockFlags,
    next: Option<u16>,
    in_use: bool,
}

impl LockEntry {
    fn vacant() -> Self {
        Self {
            uid: Uid::default(),
            node: 0,
            context: 0,
            sequence: 0,
            refcount: 0,
            mode: 0,
            side: 0,
            rights: Rights::empty(),
            flags: LockFlags::empty(),
            next: None,
            in_use: false,
        }
    }
}

/// Read-only view of one lock entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockView {
    pub uid: Uid,
    pub node: NodeId,
    pub mode: u8,
    pub side: u8,
    pub refcount: u8,
    pub sequence: u16,
    pub remote: bool,
}

struct LotInner {
    entries: Vec<LockEntry>,
    free_head: Option<u16>,
    lot_high: u16,
    lot_seqn: u32,
    full_bypass: bool,
    buckets: Vec<Option<u16>>,
    /// Per-ASID slot arrays; slot values are entry index + 1, 0 = empty.
    proc_slots: Vec<Vec<u16>>,
    proc_counts: Vec<u16>,
}

/// The file lock manager.
pub struct LockTable {
    inner: Spinlock<LotInner>,
    /// Object location hints learned from past lookups.
    hints: Spinlock<HashMap<Uid, NodeId>>,
}

/// A lock request.
#[derive(Debug, Clone, Copy)]
pub struct LockRequest {
    pub uid: Uid,
    pub asid: Asid,
    /// 0 or 1.
    pub side: u8,
    /// Public mode.
    pub mode: u8,
    /// Consult the ACL evaluator.
    pub check_rights: bool,
    /// Request arrived from another node on behalf of `node`/`context`.
    pub from_remote: bool,
    /// Upgrade/change an existing lock.
    pub change: bool,
    pub context: u32,
    pub node: NodeId,
    pub sequence: u16,
    /// Explicit per-ASID slot for change operations, 0 to search.
    pub slot: u16,
}

impl LockRequest {
    pub fn new(uid: Uid, asid: Asid, mode: u8) -> Self {
        Self {
            uid,
            asid,
            side: 0,
            mode,
            check_rights: false,
            from_remote: false,
            change: false,
            context: 0,
            node: 0,
            sequence: 0,
            slot: 0,
        }
    }
}

/// Result of a granted lock.
#[derive(Debug, Clone, Copy)]
pub struct LockGrant {
    /// Per-ASID slot naming the lock (0 for remote-requester entries).
    pub slot: u16,
    pub rights: Rights,
    /// The object is homed on another node.
    pub remote: bool,
}

/// An unlock request.
#[derive(Debug, Clone, Copy)]
pub struct UnlockRequest {
    pub uid: Uid,
    pub asid: Asid,
    /// Slot to release; 0 searches the caller's slots.
    pub slot: u16,
    /// Public mode to match; 0 releases any (and iterates).
    pub mode: u8,
    pub from_remote: bool,
    pub context: u32,
    pub node: NodeId,
    pub sequence: u16,
}

impl UnlockRequest {
    pub fn new(uid: Uid, asid: Asid, slot: u16, mode: u8) -> Self {
        Self {
            uid,
            asid,
            slot,
            mode,
            from_remote: false,
            context: 0,
            node: 0,
            sequence: 0,
        }
    }
}

impl LockTable {
    pub fn new(cfg: &KernelConfig) -> Self {
        let n = cfg.lock_entries;
        let mut entries = Vec::with_capacity(n);
        for i in 0..n {
            let mut e = LockEntry::vacant();
            e.next = if i + 1 < n { Some(i as u16 + 1) } else { None };
            entries.push(e);
        }
        let mut buckets = Vec::new();
        buckets.resize(cfg.lock_buckets, None);
        let mut proc_slots = Vec::with_capacity(cfg.max_asids);
        for _ in 0..cfg.max_asids {
            let mut slots = Vec::new();
            slots.resize(cfg.lock_slots_per_asid + 1, 0u16);
            proc_slots.push(slots);
        }
        let mut proc_counts = Vec::new();
        proc_counts.resize(cfg.max_asids, 0);
        Self {
            inner: Spinlock::new(LotInner {
                entries,
                free_head: if n > 0 { Some(0) } else { None },
                lot_high: 0,
                lot_seqn: 0,
                full_bypass: false,
                buckets,
                proc_slots,
                proc_counts,
            }),
            hints: Spinlock::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Hints
    // ------------------------------------------------------------------

    /// Record where `uid` was last found.
    pub fn hint_add(&self, uid: Uid, node: NodeId) {
        self.hints.lock().insert(uid, node);
    }

    fn hint_get(&self, uid: Uid) -> Option<NodeId> {
        self.hints.lock().get(&uid).copied()
    }

    fn hint_drop(&self, uid: Uid) {
        self.hints.lock().remove(&uid);
    }

    // ------------------------------------------------------------------
    // Entry plumbing (callers hold the file-lock resource lock)
    // ------------------------------------------------------------------

    fn alloc_entry(inner: &mut LotInner) -> Result<u16, Status> {
        let Some(idx) = inner.free_head else {
            return Err(Status::FileLocalLockTableFull);
        };
        inner.free_head = inner.entries[idx as usize].next;
        inner.entries[idx as usize].next = None;
        if idx + 1 > inner.lot_high {
            inner.lot_high = idx + 1;
        }
        Ok(idx)
    }

    fn free_entry(inner: &mut LotInner, idx: u16) {
        let head = inner.free_head;
        inner.entries[idx as usize] = LockEntry::vacant();
        inner.entries[idx as usize].next = head;
        inner.free_head = Some(idx);
    }

    fn link_entry(inner: &mut LotInner, idx: u16, bucket: usize) {
        let head = inner.buckets[bucket];
        inner.entries[idx as usize].next = head;
        inner.buckets[bucket] = Some(idx);
    }

    fn unlink_entry(inner: &mut LotInner, idx: u16, bucket: usize) {
        let mut cur = inner.buckets[bucket];
        if cur == Some(idx) {
            inner.buckets[bucket] = inner.entries[idx as usize].next;
            return;
        }
        while let Some(p) = cur {
            let next = inner.entries[p as usize].next;
            if next == Some(idx) {
                inner.entries[p as usize].next = inner.entries[idx as usize].next;
                return;
            }
            cur = next;
        }
    }

    fn take_proc_slot(inner: &mut LotInner, asid: Asid, idx: u16) -> Result<u16, Status> {
        let slots = &mut inner.proc_slots[asid as usize];
        for s in 1..slots.len() {
            if slots[s] == 0 {
                slots[s] = idx + 1;
                if s as u16 > inner.proc_counts[asid as usize] {
                    inner.proc_counts[asid as usize] = s as u16;
                }
                return Ok(s as u16);
            }
        }
        Err(Status::FileLocalLockTableFull)
    }

    /// Any other entry on `uid` whose canonical mode conflicts with
    /// `canonical`?
    fn conflicts(inner: &LotInner, uid: Uid, canonical: u8, skip: Option<u16>) -> bool {
        let bucket = uid.hash(inner.buckets.len());
        let mut cur = inner.buckets[bucket];
        while let Some(i) = cur {
            let e = &inner.entries[i as usize];
            if Some(i) != skip && e.in_use && e.uid == uid && e.refcount > 0 {
                if COMPAT_MASK[canonical as usize] & bit(e.mode) != 0 {
                    return true;
                }
            }
            cur = e.next;
        }
        false
    }

    fn other_lock_exists(inner: &LotInner, uid: Uid) -> bool {
        let bucket = uid.hash(inner.buckets.len());
        let mut cur = inner.buckets[bucket];
        while let Some(i) = cur {
            let e = &inner.entries[i as usize];
            if e.in_use && e.uid == uid && e.refcount > 0 {
                return true;
            }
            cur = e.next;
        }
        false
    }

    // ------------------------------------------------------------------
    // Lock
    // ------------------------------------------------------------------

    /// Acquire (or change) a lock on `uid`.
    pub fn priv_lock(&self, k: &Kernel, req: LockRequest) -> Result<LockGrant, Status> {
        {
            let inner = self.inner.lock();
            if inner.full_bypass {
                return Err(Status::FileLocalLockTableFull);
            }
        }
        let canonical = Self::validate_mode(req.side, req.mode)?;
        if req.change {
            return self.change_lock(k, req, canonical);
        }

        // Locate the object: explicit remote origin pins it local (we
        // are the home node serving a partner); otherwise consult the
        // hint cache and the object cache.
        if req.from_remote {
            return self.local_lock(k, req, canonical);
        }
        let node = match self.hint_get(req.uid) {
            Some(n) => n,
            None => match k.ast.get_location(k, req.uid) {
                Ok(Backing::Local { .. }) => k.node_me,
                Ok(Backing::Remote { node }) => node,
                Err(e) => return Err(e),
            },
        };
        if node != k.node_me && node != 0 {
            self.remote_lock(k, req, canonical, node)
        } else {
            self.local_lock(k, req, canonical)
        }
    }

    fn validate_mode(side: u8, public_mode: u8) -> Result<u8, Status> {
        if side > 1 || public_mode as usize >= N_MODES {
            return Err(Status::FileIllegalLockRequest);
        }
        let canonical = MODE_TABLE[side as usize][public_mode as usize];
        if canonical == 0 {
            return Err(Status::FileIllegalLockRequest);
        }
        Ok(canonical)
    }

    fn check_rights(&self, k: &Kernel, req: &LockRequest) -> Result<Rights, Status> {
        if !req.check_rights {
            return Ok(Rights::all());
        }
        let rights = k.acl.rights(req.uid)?;
        if rights.is_empty() {
            return Err(Status::NoRights);
        }
        let needed = required_rights(req.mode);
        if !rights.contains(needed) {
            return Err(Status::InsufficientRights);
        }
        Ok(rights)
    }

    fn local_lock(&self, k: &Kernel, req: LockRequest, canonical: u8) -> Result<LockGrant, Status> {
        // Attribute checks happen before the lock table is touched.
        let attrs = k.ast.get_attributes(k, req.uid)?;
        let location = k.ast.get_location(k, req.uid)?;
        let read_only = attrs.read_only
            || match location {
                Backing::Local { volx } => k.vtoc.vol_read_only(volx),
                Backing::Remote { .. } => false,
            };
        if read_only && requires_write(req.mode) {
            return Err(Status::FileVolMountedReadOnly);
        }
        let rights = self.check_rights(k, &req)?;

        k.ml.lock(LOCK_FILE);
        let result = (|| {
            let mut inner = self.inner.lock();
            if Self::conflicts(&inner, req.uid, canonical, None) {
                return Err(Status::FileObjectInUse);
            }
            let idx = Self::alloc_entry(&mut inner)?;
            let mut flags = LockFlags::empty();
            if read_only {
                flags |= LockFlags::READ_ONLY;
            }
            if req.from_remote {
                flags |= LockFlags::REMOTE;
            }
            inner.entries[idx as usize] = LockEntry {
                uid: req.uid,
                node: if req.from_remote { req.node } else { k.node_me },
                context: req.context,
                sequence: req.sequence,
                refcount: 1,
                mode: canonical,
                side: req.side,
                rights,
                flags,
                next: None,
                in_use: true,
            };
            let bucket = req.uid.hash(inner.buckets.len());
            Self::link_entry(&mut inner, idx, bucket);
            let slot = if req.from_remote {
                0
            } else {
                match Self::take_proc_slot(&mut inner, req.asid, idx) {
                    Ok(s) => s,
                    Err(e) => {
                        Self::unlink_entry(&mut inner, idx, bucket);
                        Self::free_entry(&mut inner, idx);
                        return Err(e);
                    }
                }
            };
            Ok(LockGrant {
                slot,
                rights,
                remote: false,
            })
        })();
        k.ml.unlock(LOCK_FILE);

        match &result {
            Ok(grant) => k.netlog.log_it(
                k.net.as_ref(),
                LogKind::LockGrant,
                k.proc.current_pid() as u8,
                req.uid,
                [req.mode as u16, req.side as u16, grant.slot, 0],
            ),
            Err(Status::FileObjectInUse) => k.netlog.log_it(
                k.net.as_ref(),
                LogKind::LockConflict,
                k.proc.current_pid() as u8,
                req.uid,
                [req.mode as u16, req.side as u16, 0, 0],
            ),
            Err(_) => {}
        }
        result
    }

    fn remote_lock(
        &self,
        k: &Kernel,
        req: LockRequest,
        canonical: u8,
        mut node: NodeId,
    ) -> Result<LockGrant, Status> {
        k.ml.lock(LOCK_FILE);
        let (idx, context) = {
            let mut inner = self.inner.lock();
            let idx = match Self::alloc_entry(&mut inner) {
                Ok(i) => i,
                Err(e) => {
                    drop(inner);
                    k.ml.unlock(LOCK_FILE);
                    return Err(e);
                }
            };
            inner.lot_seqn += 1;
            (idx, inner.lot_seqn)
        };
        k.ml.unlock(LOCK_FILE);

        // One retry after refreshing a stale location hint.
        let mut grant = None;
        let mut last_err = Status::NetworkFailure;
        for attempt in 0..2 {
            match k
                .remote
                .lock(node, req.uid, req.side, canonical, 0, context)
            {
                Ok(g) => {
                    grant = Some(g);
                    break;
                }
                Err(Status::RemoteRefused) if attempt == 0 => {
                    self.hint_drop(req.uid);
                    last_err = Status::RemoteRefused;
                    node = match k.ast.get_location(k, req.uid) {
                        Ok(Backing::Remote { node }) => node,
                        _ => break,
                    };
                }
                Err(e) => {
                    last_err = e;
                    break;
                }
            }
        }

        k.ml.lock(LOCK_FILE);
        let result = (|| {
            let mut inner = self.inner.lock();
            let Some(g) = grant else {
                inner.lot_seqn = inner.lot_seqn.wrapping_sub(1);
                Self::free_entry(&mut inner, idx);
                return Err(last_err);
            };
            inner.entries[idx as usize] = LockEntry {
                uid: req.uid,
                node,
                context,
                sequence: g.sequence,
                refcount: 1,
                mode: canonical,
                side: req.side,
                rights: g.rights,
                flags: LockFlags::REMOTE,
                next: None,
                in_use: true,
            };
            let bucket = req.uid.hash(inner.buckets.len());
            Self::link_entry(&mut inner, idx, bucket);
            let slot = match Self::take_proc_slot(&mut inner, req.asid, idx) {
                Ok(s) => s,
                Err(e) => {
                    Self::unlink_entry(&mut inner, idx, bucket);
                    Self::free_entry(&mut inner, idx);
                    return Err(e);
                }
            };
            Ok(LockGrant {
                slot,
                rights: g.rights,
                remote: true,
            })
        })();
        k.ml.unlock(LOCK_FILE);
        if result.is_ok() {
            self.hint_add(req.uid, node);
        }
        result
    }

    fn change_lock(&self, k: &Kernel, req: LockRequest, canonical: u8) -> Result<LockGrant, Status> {
        // Flush before downgrading an exclusive hold.
        if req.mode != mode::PROTECTED_READ {
            k.ast
                .purify(k, req.uid, PurifyFlags::default(), 0, &[])?;
        }

        k.ml.lock(LOCK_FILE);
        let result = (|| {
            let mut inner = self.inner.lock();

            let (found, slot) = if req.from_remote {
                let bucket = req.uid.hash(inner.buckets.len());
                let mut cur = inner.buckets[bucket];
                let mut found = None;
                while let Some(i) = cur {
                    let e = &inner.entries[i as usize];
                    if e.in_use
                        && e.uid == req.uid
                        && e.node == req.node
                        && e.context == req.context
                        && (req.sequence == 0 || e.sequence == req.sequence)
                    {
                        found = Some(i);
                        break;
                    }
                    cur = e.next;
                }
                (found, 0u16)
            } else if req.slot != 0 {
                let slots = &inner.proc_slots[req.asid as usize];
                let v = slots.get(req.slot as usize).copied().unwrap_or(0);
                if v != 0 && inner.entries[v as usize - 1].uid == req.uid {
                    (Some(v - 1), req.slot)
                } else {
                    (None, 0)
                }
            } else {
                let count = inner.proc_counts[req.asid as usize];
                let mut found = None;
                let mut slot = 0u16;
                for s in 1..=count as usize {
                    let v = inner.proc_slots[req.asid as usize][s];
                    if v != 0 && inner.entries[v as usize - 1].uid == req.uid {
                        found = Some(v - 1);
                        slot = s as u16;
                        break;
                    }
                }
                (found, slot)
            };

            let Some(mut idx) = found else {
                return Err(Status::FileIllegalLockRequest);
            };

            if inner.entries[idx as usize].flags.contains(LockFlags::READ_ONLY)
                && requires_write(req.mode)
            {
                return Err(Status::FileVolMountedReadOnly);
            }
            if !inner.entries[idx as usize]
                .rights
                .contains(required_rights(req.mode))
            {
                return Err(Status::InsufficientRights);
            }
            if Self::conflicts(&inner, req.uid, canonical, Some(idx)) {
                return Err(Status::FileObjectInUse);
            }

            // A shared entry splits: other holders keep the old entry.
            if inner.entries[idx as usize].refcount >= 2 {
                let new_idx = Self::alloc_entry(&mut inner)?;
                let mut copy = inner.entries[idx as usize].clone();
                copy.refcount = 1;
                copy.next = None;
                inner.entries[idx as usize].refcount -= 1;
                inner.entries[new_idx as usize] = copy;
                let bucket = req.uid.hash(inner.buckets.len());
                Self::link_entry(&mut inner, new_idx, bucket);
                if slot != 0 {
                    inner.proc_slots[req.asid as usize][slot as usize] = new_idx + 1;
                }
                idx = new_idx;
            }

            let remote = inner.entries[idx as usize].flags.contains(LockFlags::REMOTE);
            let (node, context) = {
                let e = &inner.entries[idx as usize];
                (e.node, e.context)
            };
            if remote && !req.from_remote {
                drop(inner);
                k.ml.unlock(LOCK_FILE);
                let g = match k.remote.lock(node, req.uid, req.side, canonical, 1, context) {
                    Ok(g) => g,
                    Err(e) => {
                        k.ml.lock(LOCK_FILE);
                        return Err(e);
                    }
                };
                k.ml.lock(LOCK_FILE);
                let mut inner = self.inner.lock();
                let e = &mut inner.entries[idx as usize];
                e.mode = canonical;
                e.sequence = g.sequence;
                let rights = e.rights;
                return Ok(LockGrant {
                    slot,
                    rights,
                    remote: true,
                });
            }

            let e = &mut inner.entries[idx as usize];
            e.mode = canonical;
            e.sequence = req.sequence;
            let rights = e.rights;
            Ok(LockGrant {
                slot,
                rights,
                remote,
            })
        })();
        k.ml.unlock(LOCK_FILE);
        result
    }

    // ------------------------------------------------------------------
    // Unlock
    // ------------------------------------------------------------------

    /// Release a lock. Returns true if an entry was released. Mode 0
    /// releases every matching lock the caller holds on the file.
    pub fn priv_unlock(&self, k: &Kernel, req: UnlockRequest) -> Result<bool, Status> {
        if req.mode == mode::NONE {
            return Ok(false);
        }
        if req.mode == mode::MARK_DELETE {
            let common = k.ast.get_common_attributes(k, req.uid)?;
            if !common.delete_on_unlock {
                k.ast
                    .set_attribute(k, req.uid, AttrUpdate::DeleteOnUnlock(true))?;
            }
            return Ok(false);
        }

        let mut modified = false;
        loop {
            let released = self.unlock_one(k, &req)?;
            let Some((was_exclusive, was_remote, node, context, sequence)) = released else {
                break;
            };
            modified = true;

            if was_exclusive {
                let others = {
                    let inner = self.inner.lock();
                    Self::other_lock_exists(&inner, req.uid)
                };
                if !others && !was_remote {
                    k.ast.purify(
                        k,
                        req.uid,
                        PurifyFlags {
                            update_times: true,
                            ..PurifyFlags::default()
                        },
                        0,
                        &[],
                    )?;
                    k.ast
                        .set_attribute(k, req.uid, AttrUpdate::LastWriter(0))?;
                }
            }
            if was_remote && !req.from_remote {
                let reply = k
                    .remote
                    .unlock(node, req.uid, req.mode, context, sequence)?;
                if reply.delete_pending {
                    k.ast.truncate(k, req.uid, 0, true)?;
                }
            }
            k.netlog.log_it(
                k.net.as_ref(),
                LogKind::Unlock,
                k.proc.current_pid() as u8,
                req.uid,
                [req.mode as u16, 0, req.slot, 0],
            );

            if req.mode != 0 || req.slot != 0 {
                break;
            }
        }
        if !modified && !req.from_remote {
            return Err(Status::FileObjectNotLockedByThisProcess);
        }
        Ok(modified)
    }

    /// Release one matching entry; None when no entry matches.
    #[allow(clippy::type_complexity)]
    fn unlock_one(
        &self,
        k: &Kernel,
        req: &UnlockRequest,
    ) -> Result<Option<(bool, bool, NodeId, u32, u16)>, Status> {
        k.ml.lock(LOCK_FILE);
        let r = (|| {
            let mut inner = self.inner.lock();
            let canonical_req = if req.mode == 0 {
                0
            } else {
                match MODE_TABLE[0].get(req.mode as usize) {
                    Some(&c) if c != 0 => c,
                    _ => return Err(Status::FileIllegalLockRequest),
                }
            };

            let (idx, slot) = if req.from_remote {
                let bucket = req.uid.hash(inner.buckets.len());
                let mut cur = inner.buckets[bucket];
                let mut found = None;
                while let Some(i) = cur {
                    let e = &inner.entries[i as usize];
                    if e.in_use
                        && e.uid == req.uid
                        && e.node == req.node
                        && e.context == req.context
                        && (req.mode == 0 || e.mode == canonical_req)
                        && (req.sequence == 0 || e.sequence == req.sequence)
                        && e.refcount > 0
                    {
                        found = Some(i);
                        break;
                    }
                    cur = e.next;
                }
                (found, 0u16)
            } else if req.slot == 0 {
                let count = inner.proc_counts[req.asid as usize];
                let mut found = None;
                let mut slot = 0u16;
                for s in 1..=count as usize {
                    let v = inner.proc_slots[req.asid as usize][s];
                    if v != 0 {
                        let e = &inner.entries[v as usize - 1];
                        if e.uid == req.uid && (req.mode == 0 || e.mode == canonical_req) {
                            found = Some(v - 1);
                            slot = s as u16;
                            break;
                        }
                    }
                }
                (found, slot)
            } else {
                let v = inner.proc_slots[req.asid as usize]
                    .get(req.slot as usize)
                    .copied()
                    .unwrap_or(0);
                if v != 0 {
                    let e = &inner.entries[v as usize - 1];
                    if e.uid == req.uid && (req.mode == 0 || e.mode == canonical_req) {
                        (Some(v - 1), req.slot)
                    } else {
                        (None, 0)
                    }
                } else {
                    (None, 0)
                }
            };

            let Some(idx) = idx else {
                return Ok(None);
            };

            let e = &mut inner.entries[idx as usize];
            let was_exclusive = exclusive(e.mode);
            let was_remote = e.flags.contains(LockFlags::REMOTE);
            let node = e.node;
            let context = e.context;
            let sequence = e.sequence;
            e.refcount -= 1;
            let emptied = e.refcount == 0;
            if slot != 0 {
                inner.proc_slots[req.asid as usize][slot as usize] = 0;
            }
            if emptied {
                let bucket = req.uid.hash(inner.buckets.len());
                Self::unlink_entry(&mut inner, idx, bucket);
                Self::free_entry(&mut inner, idx);
            }
            Ok(Some((
                was_exclusive && emptied,
                was_remote,
                node,
                context,
                sequence,
            )))
        })();
        k.ml.unlock(LOCK_FILE);
        r
    }

    /// Release every lock held by one ASID, or by all when `asid` is
    /// None. Shared entries lose one reference in place; sole holders go
    /// through the full unlock path. With None, remote locks are swept
    /// too.
    pub fn priv_unlock_all(&self, k: &Kernel, asid: Option<Asid>) -> Result<(), Status> {
        let (start, end) = match asid {
            Some(a) => (a, a),
            None => (0, {
                let inner = self.inner.lock();
                (inner.proc_counts.len() - 1) as Asid
            }),
        };
        for a in start..=end {
            let count = {
                let inner = self.inner.lock();
                inner.proc_counts[a as usize]
            };
            for s in 1..=count {
                let action = {
                    k.ml.lock(LOCK_FILE);
                    let mut inner = self.inner.lock();
                    let v = inner.proc_slots[a as usize][s as usize];
                    let act = if v == 0 {
                        None
                    } else if inner.entries[v as usize - 1].refcount >= 2 {
                        inner.entries[v as usize - 1].refcount -= 1;
                        inner.proc_slots[a as usize][s as usize] = 0;
                        None
                    } else {
                        Some(inner.entries[v as usize - 1].uid)
                    };
                    drop(inner);
                    k.ml.unlock(LOCK_FILE);
                    act
                };
                if let Some(uid) = action {
                    let _ = self.priv_unlock(k, UnlockRequest::new(uid, a, s, 0));
                }
            }
            let mut inner = self.inner.lock();
            inner.proc_counts[a as usize] = 0;
        }
        if asid.is_none() {
            k.remote.unlock_all();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries and iteration
    // ------------------------------------------------------------------

    /// Iterate lock entries in table order, starting at `start`.
    /// Returns the view and the next index to pass back, or None at the
    /// end of the table.
    pub fn read_lock_entryi(&self, start: u16) -> Option<(LockView, u16)> {
        let inner = self.inner.lock();
        let mut i = start;
        while (i as usize) < inner.entries.len() && i < inner.lot_high {
            let e = &inner.entries[i as usize];
            if e.in_use && e.refcount > 0 {
                return Some((
                    LockView {
                        uid: e.uid,
                        node: e.node,
                        mode: e.mode,
                        side: e.side,
                        refcount: e.refcount,
                        sequence: e.sequence,
                        remote: e.flags.contains(LockFlags::REMOTE),
                    },
                    i + 1,
                ));
            }
            i += 1;
        }
        None
    }

    /// First lock entry on `uid`, if any.
    pub fn local_read_lock(&self, uid: Uid) -> Option<LockView> {
        let inner = self.inner.lock();
        let bucket = uid.hash(inner.buckets.len());
        let mut cur = inner.buckets[bucket];
        while let Some(i) = cur {
            let e = &inner.entries[i as usize];
            if e.in_use && e.uid == uid && e.refcount > 0 {
                return Some(LockView {
                    uid: e.uid,
                    node: e.node,
                    mode: e.mode,
                    side: e.side,
                    refcount: e.refcount,
                    sequence: e.sequence,
                    remote: e.flags.contains(LockFlags::REMOTE),
                });
            }
            cur = e.next;
        }
        None
    }

    /// True if `asid` holds a lock on `uid` with the given public mode
    /// (0 matches any mode).
    pub fn local_lock_verify(&self, uid: Uid, asid: Asid, public_mode: u8) -> bool {
        let inner = self.inner.lock();
        let canonical = if public_mode == 0 {
            0
        } else {
            MODE_TABLE[0].get(public_mode as usize).copied().unwrap_or(0)
        };
        let count = inner.proc_counts[asid as usize];
        for s in 1..=count as usize {
            let v = inner.proc_slots[asid as usize][s];
            if v != 0 {
                let e = &inner.entries[v as usize - 1];
                if e.uid == uid && (public_mode == 0 || e.mode == canonical) {
                    return true;
                }
            }
        }
        false
    }

    /// Free-list length. Diagnostic only.
    pub fn free_count(&self) -> usize {
        let inner = self.inner.lock();
        let mut n = 0;
        let mut cur = inner.free_head;
        while let Some(i) = cur {
            n += 1;
            cur = inner.entries[i as usize].next;
        }
        n
    }

    /// Set or clear the table-full bypass flag.
    pub fn set_full_bypass(&self, on: bool) {
        self.inner.lock().full_bypass = on;
    }
}

// ============================================================================
// Writeback bridges and deferred delete
// ============================================================================

/// Flush a whole file synchronously.
pub fn fw_file(k: &Kernel, uid: Uid) -> Result<u16, Status> {
    k.ast.purify(
        k,
        uid,
        PurifyFlags {
            update_times: true,
            ..PurifyFlags::default()
        },
        0,
        &[],
    )
}

/// Flush the segments covering the given page list.
pub fn fw_pages(k: &Kernel, uid: Uid, pages: &[u32]) -> Result<u16, Status> {
    let mut segs: Vec<u16> = Vec::new();
    for p in pages {
        let seg = (p / crate::config::PAGES_PER_SEG) as u16;
        if !segs.contains(&seg) {
            segs.push(seg);
        }
    }
    k.ast.purify(
        k,
        uid,
        PurifyFlags {
            by_index: true,
            ..PurifyFlags::default()
        },
        0,
        &segs,
    )
}

/// Flush a single segment.
pub fn fw_partial(k: &Kernel, uid: Uid, segment: u16) -> Result<u16, Status> {
    k.ast.purify(
        k,
        uid,
        PurifyFlags {
            single_segment: true,
            ..PurifyFlags::default()
        },
        segment,
        &[],
    )
}

/// Execute a pending delete-on-unlock: truncate to zero and remove the
/// object. No-op if the attribute is not set.
pub fn delete_int(k: &Kernel, uid: Uid) -> Result<(), Status> {
    let common = k.ast.get_common_attributes(k, uid)?;
    if !common.delete_on_unlock {
        return Ok(());
    }
    debug!("flock: executing deferred delete of {}", uid);
    k.ast.truncate(k, uid, 0, true)
}
