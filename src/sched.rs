//! Task control seam
//!
//! The scheduler itself lives outside the core; the core reaches it
//! through [`Dispatcher`]. The contract is small: identify the calling
//! task, suspend it, and make a task runnable again with an optional
//! priority boost. The prepare/commit split makes event-count waits free
//! of lost wake-ups: a task arms the wait, links itself on the waiter
//! chains, re-checks, and only then commits; a wake arriving anywhere in
//! between turns the commit into a no-op.
//!
//! Per-ASID quit delivery also lives here: an asynchronous quit advances
//! the target's quit event count, and compound waits that include it
//! surface the cancellation to the caller.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use once_cell::race::OnceBox;

use crate::ec::Ec;
use crate::status::fatal;
use crate::uid::Asid;

/// Kernel task identifier.
pub type Tid = u16;

/// Priority adjustment applied when a waiter is woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boost {
    /// Waiter was not actually blocked; no adjustment.
    None,
    /// Short wait: linear bonus of this many ticks.
    Add(u16),
    /// Long wait: bump to the task's maximum priority.
    Max,
}

/// External task-control interface.
pub trait Dispatcher: Send + Sync {
    /// Task id of the caller.
    fn current(&self) -> Tid;

    /// Arm a wait for the current task (clear its wake flag).
    fn prepare_wait(&self);

    /// Yield until the wake flag is set. Returns immediately if a wake
    /// arrived since `prepare_wait`.
    fn commit_wait(&self);

    /// Make `tid` runnable, applying the wake-up boost unless the task
    /// is wake-inhibited.
    fn make_ready(&self, tid: Tid, boost: Boost);

    /// Reschedule hint invoked after an advance-with-dispatch.
    fn dispatch(&self) {}
}

/// Placeholder dispatcher used before one is installed. Waits that would
/// actually block are invariant violations under it.
struct NullDispatcher;

impl Dispatcher for NullDispatcher {
    fn current(&self) -> Tid {
        0
    }
    fn prepare_wait(&self) {}
    fn commit_wait(&self) {
        fatal!("blocking wait with no dispatcher installed");
    }
    fn make_ready(&self, _tid: Tid, _boost: Boost) {}
}

static DISPATCHER: OnceBox<Box<dyn Dispatcher>> = OnceBox::new();
static NULL_DISPATCHER: NullDispatcher = NullDispatcher;

/// Install the node's dispatcher. First installation wins; later calls
/// report failure by returning the rejected dispatcher.
pub fn install_dispatcher(d: Box<dyn Dispatcher>) -> Result<(), Box<dyn Dispatcher>> {
    DISPATCHER.set(Box::new(d)).map_err(|b| *b)
}

/// The installed dispatcher, or the null dispatcher if none is set.
pub fn dispatcher() -> &'static dyn Dispatcher {
    match DISPATCHER.get() {
        Some(b) => b.as_ref(),
        None => &NULL_DISPATCHER,
    }
}

struct QuitState {
    ec: Arc<Ec>,
    value: AtomicI32,
    inhibit: AtomicU32,
}

/// Per-ASID asynchronous quit delivery.
pub struct QuitControl {
    states: Vec<QuitState>,
}

impl QuitControl {
    pub fn new(max_asids: usize) -> Self {
        let mut states = Vec::with_capacity(max_asids);
        for _ in 0..max_asids {
            states.push(QuitState {
                ec: Arc::new(Ec::new()),
                value: AtomicI32::new(0),
                inhibit: AtomicU32::new(0),
            });
        }
        Self { states }
    }

    /// The quit event count for `asid`, for inclusion in compound waits.
    pub fn quit_ec(&self, asid: Asid) -> &Arc<Ec> {
        &self.states[asid as usize].ec
    }

    /// Value a compound wait should use as the quit target: one past the
    /// quits already delivered.
    pub fn quit_target(&self, asid: Asid) -> i32 {
        self.states[asid as usize].value.load(Ordering::Acquire) + 1
    }

    /// Deliver an asynchronous quit to `asid`, waking any cancellable
    /// waiter it has.
    pub fn signal_quit(&self, asid: Asid) {
        let st = &self.states[asid as usize];
        if st.inhibit.load(Ordering::Acquire) != 0 {
            return;
        }
        st.value.fetch_add(1, Ordering::AcqRel);
        st.ec.advance();
    }

    /// Enter a region that must not be quit-aborted.
    pub fn inhibit_begin(&self, asid: Asid) {
        self.states[asid as usize]
            .inhibit
            .fetch_add(1, Ordering::AcqRel);
    }

    /// Leave a quit-inhibited region.
    pub fn inhibit_end(&self, asid: Asid) {
        self.states[asid as usize]
            .inhibit
            .fetch_sub(1, Ordering::AcqRel);
    }
}
