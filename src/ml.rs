//! Lock family
//!
//! Three mechanisms with different rules:
//!
//! - **Resource locks**: numbered, blocking locks protecting the big
//!   shared tables. Acquisition order is a global total order by id; a
//!   task holding lock `i` may only take locks with id greater than `i`,
//!   and violations are fatal.
//! - **Spin gates**: brief, non-suspending mutual exclusion. The token
//!   returned by `lock` stands in for the saved interrupt state and must
//!   be handed back to `unlock`.
//! - **Exclusion regions**: semaphore-like regions with blocking entry,
//!   exempt from the numeric ordering rule.

use alloc::vec::Vec;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};
use spinning_top::lock_api::RawMutex;
use spinning_top::{RawSpinlock, Spinlock};

use crate::config::{MAX_RESOURCE_LOCKS, MAX_TASKS};
use crate::ec::Ec;
use crate::sched::dispatcher;
use crate::status::fatal;

/// Resource lock identifier, 0..32.
pub type LockId = u8;

// Lock numbering. Order encodes the legal nesting: unwired helper <
// file lock < EC2 < area < wired helper < AST < PMAP.
pub const LOCK_UNWIRED: LockId = 3;
pub const LOCK_FILE: LockId = 5;
pub const LOCK_EC2: LockId = 6;
pub const LOCK_AREA: LockId = 8;
pub const LOCK_WIRED: LockId = 13;
pub const LOCK_AST: LockId = 18;
pub const LOCK_PMAP: LockId = 20;

struct RLock {
    held: Spinlock<bool>,
    ec: Ec,
}

/// The node's numbered resource locks plus per-task held-set tracking.
pub struct ResourceLocks {
    locks: Vec<RLock>,
    held: Vec<AtomicU32>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        let mut locks = Vec::with_capacity(MAX_RESOURCE_LOCKS);
        for _ in 0..MAX_RESOURCE_LOCKS {
            locks.push(RLock {
                held: Spinlock::new(false),
                ec: Ec::new(),
            });
        }
        let mut held = Vec::with_capacity(MAX_TASKS);
        for _ in 0..MAX_TASKS {
            held.push(AtomicU32::new(0));
        }
        Self { locks, held }
    }

    fn held_mask(&self) -> &AtomicU32 {
        let tid = dispatcher().current() as usize;
        if tid >= self.held.len() {
            fatal!("task id {} outside lock tracking range", tid);
        }
        &self.held[tid]
    }

    /// Acquire resource lock `id`, suspending if it is held.
    pub fn lock(&self, id: LockId) {
        let id = id as usize;
        if id >= MAX_RESOURCE_LOCKS {
            fatal!("resource lock id {} out of range", id);
        }
        let mask = self.held_mask();
        if mask.load(Ordering::Acquire) >> id != 0 {
            fatal!("resource lock {} acquired out of order", id);
        }
        let lock = &self.locks[id];
        loop {
            // The release target is read before the held test so an
            // unlock between the test and the wait satisfies the wait
            // immediately instead of being lost.
            let target = lock.ec.read() + 1;
            {
                let mut held = lock.held.lock();
                if !*held {
                    *held = true;
                    break;
                }
            }
            lock.ec.wait(target);
        }
        mask.fetch_or(1 << id, Ordering::AcqRel);
    }

    /// Release resource lock `id` and wake one waiter.
    pub fn unlock(&self, id: LockId) {
        let id = id as usize;
        let mask = self.held_mask();
        if mask.load(Ordering::Acquire) & (1 << id) == 0 {
            fatal!("resource lock {} released but not held", id);
        }
        mask.fetch_and(!(1 << id), Ordering::AcqRel);
        *self.locks[id].held.lock() = false;
        self.locks[id].ec.advance();
    }

    /// True if the calling task holds `id`.
    pub fn holds(&self, id: LockId) -> bool {
        self.held_mask().load(Ordering::Acquire) & (1 << id as usize) != 0
    }

    /// Run `f` with lock `id` held.
    pub fn with<R>(&self, id: LockId, f: impl FnOnce() -> R) -> R {
        self.lock(id);
        let r = f();
        self.unlock(id);
        r
    }
}

impl Default for ResourceLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that a spin gate is held. Not sendable; give it back to
/// [`SpinGate::unlock`].
pub struct SpinToken {
    _not_send: PhantomData<*const ()>,
}

/// Brief, non-suspending mutual exclusion. No waits may occur while a
/// token is outstanding.
pub struct SpinGate {
    raw: RawSpinlock,
}

impl SpinGate {
    pub const fn new() -> Self {
        Self {
            raw: RawSpinlock::INIT,
        }
    }

    pub fn lock(&self) -> SpinToken {
        self.raw.lock();
        SpinToken {
            _not_send: PhantomData,
        }
    }

    pub fn unlock(&self, token: SpinToken) {
        let _ = token;
        unsafe { self.raw.unlock() }
    }
}

impl Default for SpinGate {
    fn default() -> Self {
        Self::new()
    }
}

struct ExclState {
    /// -1 free; >= 0 occupied, value = waiter count.
    count: i16,
    /// Ticket for FIFO hand-off to blocked entrants.
    next_ticket: i32,
}

/// Semaphore-like exclusion region.
pub struct Exclusion {
    state: Spinlock<ExclState>,
    ec: Ec,
}

impl Exclusion {
    pub const fn new() -> Self {
        Self {
            state: Spinlock::new(ExclState {
                count: -1,
                next_ticket: 1,
            }),
            ec: Ec::new(),
        }
    }

    /// Reset to the free state.
    pub fn init(&self) {
        let mut st = self.state.lock();
        st.count = -1;
        st.next_ticket = 1;
        self.ec.init();
    }

    /// Enter the region, blocking while it is occupied.
    pub fn start(&self) {
        let ticket = {
            let mut st = self.state.lock();
            st.count += 1;
            if st.count == 0 {
                return;
            }
            let t = st.next_ticket;
            st.next_ticket += 1;
            t
        };
        self.ec.wait(ticket);
    }

    /// Leave the region, handing it to the oldest waiter if any.
    pub fn stop(&self) {
        let wake = {
            let mut st = self.state.lock();
            st.count -= 1;
            st.count >= 0
        };
        if wake {
            self.ec.advance();
        }
    }

    /// True while the region is occupied.
    pub fn check(&self) -> bool {
        self.state.lock().count >= 0
    }

    /// Enter without blocking; false if occupied.
    pub fn cond_start(&self) -> bool {
        let mut st = self.state.lock();
        if st.count >= 0 {
            false
        } else {
            st.count = 0;
            true
        }
    }

    /// Leave a region entered with `cond_start`. Does not wake waiters;
    /// conditional entry admits none.
    pub fn cond_stop(&self) {
        self.state.lock().count -= 1;
    }
}

impl Default for Exclusion {
    fn default() -> Self {
        Self::new()
    }
}
