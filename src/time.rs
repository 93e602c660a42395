//! Clock and timers
//!
//! A monotonic tick counter drives wait-time accounting (priority boosts
//! on event-count wake-up), attribute timestamps, and timer expirations.
//! The tick source is external: whoever owns the hardware timer calls
//! [`tick_advance`]; everything in the core only reads.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spinning_top::Spinlock;

use crate::ec::Ec;
use crate::status::Status;

static TICKS: AtomicU32 = AtomicU32::new(0);

/// Current tick count.
pub fn now() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Advance the monotonic clock by `n` ticks.
pub fn tick_advance(n: u32) -> u32 {
    TICKS.fetch_add(n, Ordering::Relaxed) + n
}

/// 48-bit clock value as stored in object attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Clock48 {
    pub high: u32,
    pub low: u16,
}

impl Clock48 {
    /// Read the current clock.
    pub fn read() -> Self {
        Self {
            high: now(),
            low: 0,
        }
    }

    /// Absolute time `delta` ticks from now.
    pub fn abs_from_now(delta: u32) -> Self {
        Self {
            high: now().wrapping_add(delta),
            low: 0,
        }
    }
}

struct TimerEntry {
    expiry: u32,
    ec: Arc<Ec>,
}

/// Pending timer expirations, advanced from the tick path.
pub struct Timers {
    pending: Spinlock<Vec<TimerEntry>>,
}

impl Timers {
    pub fn new() -> Self {
        Self {
            pending: Spinlock::new(Vec::new()),
        }
    }

    /// Arrange for `ec` to be advanced once `delay` ticks from now.
    pub fn schedule(&self, delay: u32, ec: Arc<Ec>) {
        self.pending.lock().push(TimerEntry {
            expiry: now().wrapping_add(delay.max(1)),
            ec,
        });
    }

    /// Move the clock forward and fire every timer that has expired.
    pub fn tick(&self, n: u32) {
        let t = tick_advance(n);
        let mut fired = Vec::new();
        {
            let mut pending = self.pending.lock();
            let mut i = 0;
            while i < pending.len() {
                if t.wrapping_sub(pending[i].expiry) < u32::MAX / 2 {
                    fired.push(pending.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for entry in fired {
            entry.ec.advance();
        }
    }

    /// Number of timers still pending.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

/// What satisfied a [`wait2`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait2Result {
    /// The caller's event count reached its target.
    Event,
    /// The timer expired first.
    Timeout,
}

/// Wait on `ec` reaching `target`, bounded by a timer of `delay` ticks.
///
/// Event-count waits take no timeout themselves; this pairs the caller's
/// event count with a private timer event count and reports which fired.
pub fn wait2(
    timers: &Timers,
    ec: &Ec,
    target: i32,
    delay: u32,
) -> Result<Wait2Result, Status> {
    let timer_ec = Arc::new(Ec::new());
    timers.schedule(delay, timer_ec.clone());
    let timer_target = 1;
    let which = crate::ec::waitn(&[ec, timer_ec.as_ref()], &[target, timer_target]);
    Ok(if which == 1 {
        Wait2Result::Event
    } else {
        Wait2Result::Timeout
    })
}
