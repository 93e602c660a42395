//! Telemetry ring
//!
//! A small double-buffered event log. Entries accumulate in one page
//! while the other is being sent; a page holds 39 fixed 26-byte records
//! and is handed to the network layer the moment it fills. A per-kind
//! enable mask gates recording so disabled kinds cost one load.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spinning_top::Spinlock;

use crate::glue::NetIo;
use crate::time;
use crate::uid::Uid;

/// Records per page.
pub const ENTRIES_PER_PAGE: usize = 39;

/// Serialized record size in bytes.
pub const ENTRY_SIZE: usize = 26;

/// Event kinds recorded by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    PageIn = 1,
    PageOut = 2,
    Activate = 3,
    Dismount = 4,
    AreaCreate = 5,
    AreaDelete = 6,
    LockGrant = 0x12,
    LockConflict = 0x13,
    Unlock = 0x14,
    NameResolve = 0x15,
}

/// One log record.
#[derive(Debug, Clone, Copy)]
pub struct LogEntry {
    pub kind: u8,
    pub pid: u8,
    pub stamp: u32,
    pub uid: Uid,
    pub p3: u16,
    pub p4: u8,
    pub p5: u16,
    pub p6: u16,
    pub p7: u16,
    pub p8: u16,
}

impl LogEntry {
    fn serialize(&self, out: &mut [u8]) {
        out[0] = self.kind;
        out[1] = self.pid;
        out[2..6].copy_from_slice(&self.stamp.to_le_bytes());
        out[6..10].copy_from_slice(&self.uid.high.to_le_bytes());
        out[10..14].copy_from_slice(&self.uid.low.to_le_bytes());
        out[14..16].copy_from_slice(&self.p3.to_le_bytes());
        out[16] = self.p4;
        out[18..20].copy_from_slice(&self.p5.to_le_bytes());
        out[20..22].copy_from_slice(&self.p6.to_le_bytes());
        out[22..24].copy_from_slice(&self.p7.to_le_bytes());
        out[24..26].copy_from_slice(&self.p8.to_le_bytes());
    }
}

struct Buffers {
    pages: [Vec<LogEntry>; 2],
    current: usize,
}

/// The telemetry ring.
pub struct NetLog {
    kinds_mask: AtomicU32,
    buffers: Spinlock<Buffers>,
    pub pages_sent: AtomicU32,
}

impl NetLog {
    pub fn new() -> Self {
        Self {
            kinds_mask: AtomicU32::new(0),
            buffers: Spinlock::new(Buffers {
                pages: [
                    Vec::with_capacity(ENTRIES_PER_PAGE),
                    Vec::with_capacity(ENTRIES_PER_PAGE),
                ],
                current: 0,
            }),
            pages_sent: AtomicU32::new(0),
        }
    }

    /// Set which kinds are recorded (bit per kind value).
    pub fn cntl(&self, kinds_mask: u32) {
        self.kinds_mask.store(kinds_mask, Ordering::Release);
    }

    /// True if `kind` is enabled.
    pub fn enabled(&self, kind: LogKind) -> bool {
        self.kinds_mask.load(Ordering::Acquire) & (1 << (kind as u32 & 0x1F)) != 0
    }

    /// Record one event. Full pages are serialized and handed to the
    /// network layer while recording switches to the other page.
    pub fn log_it(
        &self,
        net: &dyn NetIo,
        kind: LogKind,
        pid: u8,
        uid: Uid,
        params: [u16; 4],
    ) {
        if !self.enabled(kind) {
            return;
        }
        let entry = LogEntry {
            kind: kind as u8,
            pid,
            stamp: time::now(),
            uid,
            p3: params[0],
            p4: params[1] as u8,
            p5: params[2],
            p6: params[3],
            p7: 0,
            p8: 0,
        };
        let full = {
            let mut bufs = self.buffers.lock();
            let cur = bufs.current;
            bufs.pages[cur].push(entry);
            if bufs.pages[cur].len() >= ENTRIES_PER_PAGE {
                bufs.current = 1 - cur;
                Some(core::mem::take(&mut bufs.pages[cur]))
            } else {
                None
            }
        };
        if let Some(page) = full {
            let mut raw = Vec::new();
            raw.resize(page.len() * ENTRY_SIZE, 0u8);
            for (i, e) in page.iter().enumerate() {
                e.serialize(&mut raw[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE]);
            }
            net.send_log_page(&raw);
            self.pages_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Entries buffered in the accumulating page. Diagnostic only.
    pub fn buffered(&self) -> usize {
        let bufs = self.buffers.lock();
        bufs.pages[bufs.current].len()
    }
}

impl Default for NetLog {
    fn default() -> Self {
        Self::new()
    }
}
