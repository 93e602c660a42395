//! Deferred Execution Manager
//!
//! Two fixed-capacity ring queues of small callbacks, drained by helper
//! tasks that each run with a specific resource lock held (wired: high;
//! unwired: low) so callbacks always execute in a known lock context.
//! Entries carry at most [`DXM_MAX_DATA`] payload bytes; a larger datum
//! is a programming error and fatal. Signal delivery rides the unwired
//! queue as an ordinary callback.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use log::warn;
use spinning_top::Spinlock;

use crate::config::{KernelConfig, OverrunPolicy, DXM_MAX_DATA};
use crate::ec::Ec;
use crate::ml::{LOCK_UNWIRED, LOCK_WIRED};
use crate::status::{fatal, Status};
use crate::Kernel;

/// Deferred callback. Receives the kernel and the entry's payload bytes.
pub type DxCallback = fn(&Kernel, &[u8]);

/// Handler invoked when a queued signal is dispatched.
pub type SignalHandler = fn(&Kernel, &SignalRec);

#[derive(Clone, Copy)]
struct DxEntry {
    cb: DxCallback,
    len: u8,
    data: [u8; DXM_MAX_DATA],
}

struct QInner {
    entries: Vec<Option<DxEntry>>,
    head: usize,
    tail: usize,
    mask: usize,
}

/// One deferred-execution ring queue.
pub struct DxQueue {
    name: &'static str,
    inner: Spinlock<QInner>,
    /// Advanced (without dispatch) on every enqueue; the helper waits
    /// here.
    pub ec: Ec,
}

impl DxQueue {
    fn new(name: &'static str, depth: usize) -> Self {
        let depth = depth.next_power_of_two().max(2);
        let mut entries = Vec::with_capacity(depth);
        entries.resize_with(depth, || None);
        Self {
            name,
            inner: Spinlock::new(QInner {
                entries,
                head: 0,
                tail: 0,
                mask: depth - 1,
            }),
            ec: Ec::new(),
        }
    }

    fn enqueue(
        &self,
        cb: DxCallback,
        data: &[u8],
        check_dup: bool,
        policy: OverrunPolicy,
        overruns: &AtomicU32,
    ) -> Result<(), Status> {
        if data.len() > DXM_MAX_DATA {
            fatal!("dxm: datum too large ({} bytes)", data.len());
        }
        let mut payload = [0u8; DXM_MAX_DATA];
        payload[..data.len()].copy_from_slice(data);

        {
            let mut q = self.inner.lock();
            if check_dup {
                let mut idx = q.head;
                while idx != q.tail {
                    if let Some(entry) = &q.entries[idx] {
                        if entry.cb as usize == cb as usize
                            && entry.len as usize == data.len()
                            && entry.data[..data.len()] == payload[..data.len()]
                        {
                            return Ok(());
                        }
                    }
                    idx = (idx + 1) & q.mask;
                }
            }
            let next_tail = (q.tail + 1) & q.mask;
            if next_tail == q.head {
                overruns.fetch_add(1, Ordering::Relaxed);
                match policy {
                    OverrunPolicy::Abort => fatal!("dxm: no room in {} queue", self.name),
                    OverrunPolicy::DropAndLog => {
                        warn!("dxm: {} queue overrun, callback dropped", self.name);
                        return Err(Status::DxmNoMoreQueueSlots);
                    }
                }
            }
            let tail = q.tail;
            q.entries[tail] = Some(DxEntry {
                cb,
                len: data.len() as u8,
                data: payload,
            });
            q.tail = next_tail;
        }
        self.ec.advance_without_dispatch();
        Ok(())
    }

    /// Drain the queue, invoking each callback with the lock released.
    pub fn scan(&self, kernel: &Kernel) {
        loop {
            let entry = {
                let mut q = self.inner.lock();
                if q.head == q.tail {
                    return;
                }
                let head = q.head;
                let entry = q.entries[head].take();
                q.head = (head + 1) & q.mask;
                entry
            };
            if let Some(entry) = entry {
                (entry.cb)(kernel, &entry.data[..entry.len as usize]);
            }
        }
    }

    /// Entries currently queued. Diagnostic only.
    pub fn depth(&self) -> usize {
        let q = self.inner.lock();
        (q.tail.wrapping_sub(q.head)) & q.mask
    }
}

/// A queued signal record (10 payload bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalRec {
    pub signo: u16,
    pub p2: u16,
    pub p3: u16,
    pub p4: u32,
}

impl SignalRec {
    fn pack(&self) -> [u8; 10] {
        let mut b = [0u8; 10];
        b[0..2].copy_from_slice(&self.signo.to_le_bytes());
        b[2..4].copy_from_slice(&self.p3.to_le_bytes());
        b[4..8].copy_from_slice(&self.p4.to_le_bytes());
        b[8..10].copy_from_slice(&self.p2.to_le_bytes());
        b
    }

    fn unpack(data: &[u8]) -> Self {
        Self {
            signo: u16::from_le_bytes([data[0], data[1]]),
            p3: u16::from_le_bytes([data[2], data[3]]),
            p4: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            p2: u16::from_le_bytes([data[8], data[9]]),
        }
    }
}

fn signal_dispatch_cb(kernel: &Kernel, data: &[u8]) {
    let rec = SignalRec::unpack(data);
    let handler = {
        let table = kernel.dxm.signals.lock();
        table.get(rec.signo as usize).copied().flatten()
    };
    match handler {
        Some(h) => h(kernel, &rec),
        None => warn!("dxm: signal {} has no handler", rec.signo),
    }
}

/// The deferred execution manager: both queues plus the signal table.
pub struct Dxm {
    pub wired: DxQueue,
    pub unwired: DxQueue,
    overruns: AtomicU32,
    policy: OverrunPolicy,
    signals: Spinlock<Vec<Option<SignalHandler>>>,
}

impl Dxm {
    pub fn new(cfg: &KernelConfig) -> Self {
        let mut signals = Vec::new();
        signals.resize(cfg.signal_table_entries, None);
        Self {
            wired: DxQueue::new("wired", cfg.dxm_queue_depth),
            unwired: DxQueue::new("unwired", cfg.dxm_queue_depth),
            overruns: AtomicU32::new(0),
            policy: cfg.overrun_policy,
            signals: Spinlock::new(signals),
        }
    }

    /// Reinitialize both queue event counts (system startup).
    pub fn init(&self) {
        self.wired.ec.init();
        self.unwired.ec.init();
    }

    /// Queue a callback with up to 12 bytes of payload. With `check_dup`
    /// set, an identical pending entry makes this a silent no-op.
    pub fn add_callback(
        &self,
        queue: &DxQueue,
        cb: DxCallback,
        data: &[u8],
        check_dup: bool,
    ) -> Result<(), Status> {
        queue.enqueue(cb, data, check_dup, self.policy, &self.overruns)
    }

    /// Total queue overrun events since boot.
    pub fn overruns(&self) -> u32 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Register the handler dispatched for `signo`.
    pub fn register_signal_handler(&self, signo: u16, handler: SignalHandler) {
        let mut table = self.signals.lock();
        if (signo as usize) < table.len() {
            table[signo as usize] = Some(handler);
        }
    }

    /// Package a signal and queue its delivery on the unwired queue.
    pub fn add_signal(
        &self,
        signo: u16,
        p2: u16,
        p3: u16,
        p4: u32,
        check_dup: bool,
    ) -> Result<(), Status> {
        let rec = SignalRec { signo, p2, p3, p4 };
        self.add_callback(&self.unwired, signal_dispatch_cb, &rec.pack(), check_dup)
    }
}

/// Wired helper task body: runs forever with the wired lock held,
/// draining the wired queue as its event count advances.
pub fn helper_wired(kernel: &Kernel) -> ! {
    kernel.ml.lock(LOCK_WIRED);
    helper_common(kernel, &kernel.dxm.wired)
}

/// Unwired helper task body.
pub fn helper_unwired(kernel: &Kernel) -> ! {
    kernel.ml.lock(LOCK_UNWIRED);
    helper_common(kernel, &kernel.dxm.unwired)
}

fn helper_common(kernel: &Kernel, queue: &DxQueue) -> ! {
    let mut target = 1i32;
    loop {
        queue.ec.wait(target);
        queue.scan(kernel);
        target += 1;
    }
}
