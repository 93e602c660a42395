//! Level-2 (indexed) event counts
//!
//! The user-exposed layer over level-1 event counts. A level-2 handle is
//! either a small index into the registration table (2..=high), a pool
//! handle (0x101 onward) naming a level-1 event count owned by the
//! handle, or a direct reference. The table and bitmaps are mutated only
//! under the EC2 resource lock.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spinning_top::Spinlock;

use crate::config::KernelConfig;
use crate::ec::{self, Ec};
use crate::ml::{ResourceLocks, LOCK_EC2};
use crate::sched::QuitControl;
use crate::status::Status;
use crate::uid::Asid;

/// First pool handle value.
pub const POOL_BASE: u32 = 0x101;

/// A level-2 event count reference.
#[derive(Clone)]
pub enum Ec2 {
    /// Registration-table or pool index.
    Indexed(u32),
    /// Direct reference, bypassing the tables.
    Direct(Arc<Ec>),
}

impl Ec2 {
    /// Initialize. Only meaningful for direct references; indexed
    /// handles name table-owned event counts initialized elsewhere.
    pub fn init(&self) {
        if let Ec2::Direct(ec) = self {
            ec.init();
        }
    }
}

struct RegTable {
    slots: Vec<Option<Arc<Ec>>>,
    /// Highest registered index; registration starts at 2.
    high: u32,
}

struct Pool {
    ecs: Vec<Arc<Ec>>,
    refcounts: Vec<i16>,
    allocated: u32,
    pending_release: u32,
}

/// Level-2 event count tables.
pub struct Ec2Table {
    regs: Spinlock<RegTable>,
    pool: Spinlock<Pool>,
    pool_entries: u32,
}

impl Ec2Table {
    pub fn new(cfg: &KernelConfig) -> Self {
        let pool_entries = (cfg.ec2_pool_entries as u32).min(32);
        let mut ecs = Vec::with_capacity(pool_entries as usize);
        for _ in 0..pool_entries {
            ecs.push(Arc::new(Ec::new()));
        }
        Self {
            regs: Spinlock::new(RegTable {
                slots: {
                    let mut v = Vec::new();
                    v.resize(cfg.ec2_registrations.max(2), None);
                    v
                },
                high: 1,
            }),
            pool: Spinlock::new(Pool {
                refcounts: {
                    let mut v = Vec::new();
                    v.resize(pool_entries as usize, 0);
                    v
                },
                ecs,
                allocated: 0,
                pending_release: 0,
            }),
            pool_entries,
        }
    }

    /// Reinitialize all level-2 state (system startup).
    pub fn init_s(&self, ml: &ResourceLocks) {
        ml.with(LOCK_EC2, || {
            let mut regs = self.regs.lock();
            for slot in regs.slots.iter_mut() {
                *slot = None;
            }
            regs.high = 1;
            let mut pool = self.pool.lock();
            pool.allocated = 0;
            pool.pending_release = 0;
            for rc in pool.refcounts.iter_mut() {
                *rc = 0;
            }
            for ec in pool.ecs.iter() {
                ec.init();
            }
        });
    }

    /// Register a level-1 event count for indexed access. Registering an
    /// already-registered count returns its existing handle.
    pub fn register_ec1(&self, ml: &ResourceLocks, ec1: &Arc<Ec>) -> Result<u32, Status> {
        ml.with(LOCK_EC2, || {
            let mut regs = self.regs.lock();
            for idx in 2..=regs.high {
                if let Some(existing) = &regs.slots[idx as usize] {
                    if Arc::ptr_eq(existing, ec1) {
                        return Ok(idx);
                    }
                }
            }
            if regs.high as usize + 1 >= regs.slots.len() {
                return Err(Status::Ec2RegistrationFull);
            }
            regs.high += 1;
            let high = regs.high;
            regs.slots[high as usize] = Some(ec1.clone());
            Ok(high)
        })
    }

    /// Allocate a pool-owned level-1 event count. Pending-release slots
    /// whose reference count has decayed to zero are reused first.
    pub fn allocate_ec1(&self, ml: &ResourceLocks) -> Result<u32, Status> {
        ml.with(LOCK_EC2, || {
            let mut pool = self.pool.lock();
            for idx in 0..self.pool_entries {
                let mask = 1u32 << idx;
                if pool.pending_release & mask != 0 {
                    if pool.refcounts[idx as usize] == 0 {
                        pool.allocated |= mask;
                        pool.pending_release &= !mask;
                        pool.ecs[idx as usize].init();
                        return Ok(POOL_BASE + idx);
                    }
                    continue;
                }
                if pool.allocated & mask == 0 {
                    pool.allocated |= mask;
                    pool.refcounts[idx as usize] = 0;
                    pool.ecs[idx as usize].init();
                    return Ok(POOL_BASE + idx);
                }
            }
            Err(Status::Ec2UnableToAllocateLevel1Eventcount)
        })
    }

    /// Release a pool handle. With outstanding references the slot is
    /// woken and parked as pending-release; the next allocation probe
    /// that sees the reference count at zero reclaims it.
    pub fn release_ec1(&self, ml: &ResourceLocks, handle: u32) -> Result<(), Status> {
        let ec_to_wake = ml.with(LOCK_EC2, || {
            if handle < POOL_BASE || handle >= POOL_BASE + self.pool_entries {
                return Err(Status::Ec2BadEventCount);
            }
            let idx = handle - POOL_BASE;
            let mask = 1u32 << idx;
            let mut pool = self.pool.lock();
            if pool.allocated & mask == 0 {
                return Err(Status::Ec2Level1EcNotAllocated);
            }
            if pool.refcounts[idx as usize] == 0 {
                pool.allocated &= !mask;
                Ok(None)
            } else {
                pool.pending_release |= mask;
                Ok(Some(pool.ecs[idx as usize].clone()))
            }
        })?;
        if let Some(ec) = ec_to_wake {
            ec.advance_all();
        }
        Ok(())
    }

    /// Resolve a handle to its level-1 event count.
    pub fn get_ec1_addr(&self, ml: &ResourceLocks, ec2: &Ec2) -> Result<Arc<Ec>, Status> {
        match ec2 {
            Ec2::Direct(ec) => Ok(ec.clone()),
            Ec2::Indexed(handle) => ml.with(LOCK_EC2, || self.lookup(*handle)),
        }
    }

    fn lookup(&self, handle: u32) -> Result<Arc<Ec>, Status> {
        let regs = self.regs.lock();
        if handle >= 2 && handle <= regs.high {
            return regs.slots[handle as usize]
                .clone()
                .ok_or(Status::Ec2BadEventCount);
        }
        drop(regs);
        if handle >= POOL_BASE && handle < POOL_BASE + self.pool_entries {
            let idx = handle - POOL_BASE;
            let pool = self.pool.lock();
            if pool.allocated & (1 << idx) == 0 {
                return Err(Status::Ec2Level1EcNotAllocated);
            }
            return Ok(pool.ecs[idx as usize].clone());
        }
        Err(Status::Ec2BadEventCount)
    }

    /// Current value of a level-2 event count.
    pub fn read(&self, ml: &ResourceLocks, ec2: &Ec2) -> Result<i32, Status> {
        Ok(self.get_ec1_addr(ml, ec2)?.read())
    }

    /// Value accessor used by the user-call layer; distinct entry point
    /// so callers that tolerate a stale read keep it.
    pub fn get_val(&self, ml: &ResourceLocks, ec2: &Ec2) -> Result<i32, Status> {
        self.read(ml, ec2)
    }

    /// Advance the underlying level-1 event count.
    pub fn advance(&self, ml: &ResourceLocks, ec2: &Ec2) -> Result<(), Status> {
        self.get_ec1_addr(ml, ec2)?.advance();
        Ok(())
    }

    /// Wake every waiter on the underlying level-1 event count.
    pub fn wakeup(&self, ml: &ResourceLocks, ec2: &Ec2) -> Result<(), Status> {
        self.get_ec1_addr(ml, ec2)?.advance_all();
        Ok(())
    }

    /// Wait on up to N level-2 event counts for the given targets.
    ///
    /// The caller's per-ASID quit event count joins the wait; an
    /// asynchronous quit surfaces as `Ec2AsyncFaultWhileWaiting`.
    /// Returns the 1-based index of the handle that satisfied the wait.
    pub fn wait(
        &self,
        ml: &ResourceLocks,
        quit: &QuitControl,
        asid: Asid,
        ec2s: &[Ec2],
        targets: &[i32],
    ) -> Result<usize, Status> {
        if ec2s.is_empty() || ec2s.len() != targets.len() {
            return Err(Status::Ec2BadEventCount);
        }
        let mut resolved: Vec<Arc<Ec>> = Vec::with_capacity(ec2s.len() + 1);
        let mut pool_refs: Vec<u32> = Vec::new();
        for ec2 in ec2s {
            resolved.push(self.get_ec1_addr(ml, ec2)?);
            if let Ec2::Indexed(h) = ec2 {
                if *h >= POOL_BASE && *h < POOL_BASE + self.pool_entries {
                    pool_refs.push(*h - POOL_BASE);
                }
            }
        }
        // Pool slots referenced by a waiter must not be reclaimed out
        // from under it.
        if !pool_refs.is_empty() {
            ml.with(LOCK_EC2, || {
                let mut pool = self.pool.lock();
                for idx in &pool_refs {
                    pool.refcounts[*idx as usize] += 1;
                }
            });
        }

        let quit_ec = quit.quit_ec(asid).clone();
        let quit_target = quit.quit_target(asid);
        resolved.push(quit_ec);

        let mut all_targets: Vec<i32> = Vec::with_capacity(targets.len() + 1);
        all_targets.extend_from_slice(targets);
        all_targets.push(quit_target);

        let refs: Vec<&Ec> = resolved.iter().map(|a| a.as_ref()).collect();
        let which = ec::waitn(&refs, &all_targets);

        if !pool_refs.is_empty() {
            ml.with(LOCK_EC2, || {
                let mut pool = self.pool.lock();
                for idx in &pool_refs {
                    pool.refcounts[*idx as usize] -= 1;
                }
            });
        }

        if which == resolved.len() {
            Err(Status::Ec2AsyncFaultWhileWaiting)
        } else {
            Ok(which)
        }
    }

    /// Allocation bitmap snapshot. Diagnostic only.
    pub fn pool_bitmap(&self) -> (u32, u32) {
        let pool = self.pool.lock();
        (pool.allocated, pool.pending_release)
    }
}
