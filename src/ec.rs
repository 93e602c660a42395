//! Level-1 event counts
//!
//! The kernel's fundamental wait/wake primitive: a monotonically
//! advancing value plus a chain of waiters, each holding a target value.
//! `advance` increments the value and makes every waiter whose target has
//! been reached runnable, granting a priority boost proportional to how
//! long it waited. Waits are race-free against concurrent advances via
//! the dispatcher's prepare/commit protocol.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use spinning_top::Spinlock;

use crate::sched::{dispatcher, Boost, Tid};
use crate::time;

static BOOST_CLAMP: AtomicU32 = AtomicU32::new(18);

/// Set the wait-duration threshold separating linear boosts from the
/// maximum boost.
pub fn set_boost_clamp(ticks: u32) {
    BOOST_CLAMP.store(ticks, Ordering::Relaxed);
}

fn boost_for(start: u32) -> Boost {
    let waited = time::now().wrapping_sub(start);
    if waited == 0 {
        Boost::None
    } else if waited < BOOST_CLAMP.load(Ordering::Relaxed) {
        Boost::Add(waited as u16)
    } else {
        Boost::Max
    }
}

#[derive(Debug)]
struct Waiter {
    target: i32,
    tid: Tid,
    start: u32,
}

/// A level-1 event count.
#[derive(Debug)]
pub struct Ec {
    value: AtomicI32,
    waiters: Spinlock<Vec<Waiter>>,
}

impl Ec {
    pub const fn new() -> Self {
        Self {
            value: AtomicI32::new(0),
            waiters: Spinlock::new(Vec::new()),
        }
    }

    /// Reset to value 0 with an empty waiter chain.
    pub fn init(&self) {
        let mut w = self.waiters.lock();
        w.clear();
        self.value.store(0, Ordering::Release);
    }

    /// Current value. No lock needed.
    pub fn read(&self) -> i32 {
        self.value.load(Ordering::Acquire)
    }

    fn wake_satisfied(&self, value: i32) {
        let mut w = self.waiters.lock();
        w.retain(|waiter| {
            if value.wrapping_sub(waiter.target) >= 0 {
                dispatcher().make_ready(waiter.tid, boost_for(waiter.start));
                false
            } else {
                true
            }
        });
    }

    /// Increment the value, wake eligible waiters, and invoke the
    /// dispatcher.
    pub fn advance(&self) {
        self.advance_without_dispatch();
        dispatcher().dispatch();
    }

    /// Increment the value and wake eligible waiters without a
    /// reschedule hint. Used from enqueue paths that must not dispatch.
    pub fn advance_without_dispatch(&self) {
        let value = self.value.fetch_add(1, Ordering::AcqRel) + 1;
        self.wake_satisfied(value);
    }

    /// Wake every waiter by saturating the value.
    pub fn advance_all(&self) {
        self.value.store(i32::MAX, Ordering::Release);
        self.wake_satisfied(i32::MAX);
        dispatcher().dispatch();
    }

    /// Wait for this event count alone to reach `target`.
    pub fn wait(&self, target: i32) {
        waitn(&[self], &[target]);
    }

    /// Number of linked waiters. Diagnostic only.
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    fn link(&self, target: i32, tid: Tid) {
        self.waiters.lock().push(Waiter {
            target,
            tid,
            start: time::now(),
        });
    }

    fn unlink(&self, tid: Tid) {
        self.waiters.lock().retain(|w| w.tid != tid);
    }
}

impl Default for Ec {
    fn default() -> Self {
        Self::new()
    }
}

/// Suspend the calling task until one of `ecs` reaches its target.
///
/// Returns the 1-based index of the event count that satisfied the wait.
/// If several are already satisfied the lowest index wins, and a wait
/// whose target is already met returns without yielding.
pub fn waitn(ecs: &[&Ec], targets: &[i32]) -> usize {
    assert!(!ecs.is_empty() && ecs.len() == targets.len());
    let d = dispatcher();
    let tid = d.current();
    loop {
        d.prepare_wait();
        for (i, ec) in ecs.iter().enumerate() {
            if ec.read().wrapping_sub(targets[i]) >= 0 {
                return i + 1;
            }
        }
        for (i, ec) in ecs.iter().enumerate() {
            ec.link(targets[i], tid);
        }
        // Re-check after linking: an advance between the first check and
        // the link would otherwise be lost.
        let mut satisfied = None;
        for (i, ec) in ecs.iter().enumerate() {
            if ec.read().wrapping_sub(targets[i]) >= 0 {
                satisfied = Some(i + 1);
                break;
            }
        }
        if satisfied.is_none() {
            d.commit_wait();
        }
        for ec in ecs {
            ec.unlink(tid);
        }
        if let Some(i) = satisfied {
            return i;
        }
    }
}
