//! Kernel configuration
//!
//! Tunable table sizes and policy constants for the kernel core. Every
//! fixed pool in the system (active object table, area table, lock table,
//! event count pools, deferred execution queues) is sized from here, so a
//! node can be configured for small diskless workstations or large file
//! servers without touching the subsystems themselves.

/// Bytes per page. Segment maps carry one entry per page.
pub const PAGE_SIZE: u32 = 1024;

/// Pages per segment. A segment is the unit of mapping and of the area
/// bitmap.
pub const PAGES_PER_SEG: u32 = 32;

/// Bytes per segment (32 KiB with the default page size).
pub const SEG_SIZE: u32 = PAGE_SIZE * PAGES_PER_SEG;

/// Maximum number of resource locks (held-mask is a single word).
pub const MAX_RESOURCE_LOCKS: usize = 32;

/// Maximum number of kernel tasks the lock/held bookkeeping can track.
pub const MAX_TASKS: usize = 256;

/// Maximum pathname length accepted by the naming resolver.
pub const MAX_PNAME_LEN: usize = 256;

/// Maximum payload bytes carried by a deferred-execution queue entry.
pub const DXM_MAX_DATA: usize = 12;

/// Policy for a full deferred-execution queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrunPolicy {
    /// Treat overflow as a fatal invariant violation and crash.
    Abort,
    /// Count the overrun, log it, and drop the callback.
    DropAndLog,
}

/// Tunable parameters for one kernel instance.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Number of address spaces (processes) the node supports.
    pub max_asids: usize,
    /// Active object table entries.
    pub aot_entries: usize,
    /// Active segment table entries.
    pub ast_entries: usize,
    /// Hash buckets for the AOT UID index.
    pub aot_buckets: usize,
    /// Area table entries.
    pub area_entries: usize,
    /// Hash buckets for remote-UID area lookup.
    pub area_uid_buckets: usize,
    /// File lock table entries.
    pub lock_entries: usize,
    /// Per-process file lock slots.
    pub lock_slots_per_asid: usize,
    /// Hash buckets for the file lock table.
    pub lock_buckets: usize,
    /// Registered level-1 event count table size.
    pub ec2_registrations: usize,
    /// Pool-allocated level-1 event counts (handles 0x101..).
    pub ec2_pool_entries: usize,
    /// Entries per deferred-execution queue (power of two).
    pub dxm_queue_depth: usize,
    /// Signal dispatch table size.
    pub signal_table_entries: usize,
    /// Behavior when a deferred-execution queue fills.
    pub overrun_policy: OverrunPolicy,
    /// Wait durations below this many ticks earn a linear priority bonus
    /// on wake-up; longer waits get the maximum boost.
    pub boost_clamp: u32,
    /// Number of mountable volumes tracked by the AST layer.
    pub max_volumes: usize,
    /// Ticks a cached remote name server stays valid.
    pub name_server_ttl: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_asids: 58,
            aot_entries: 280,
            ast_entries: 504,
            aot_buckets: 64,
            area_entries: 128,
            area_uid_buckets: 11,
            lock_entries: 200,
            lock_slots_per_asid: 150,
            lock_buckets: 11,
            ec2_registrations: 256,
            ec2_pool_entries: 32,
            dxm_queue_depth: 64,
            signal_table_entries: 32,
            overrun_policy: OverrunPolicy::Abort,
            boost_clamp: 18,
            max_volumes: 16,
            name_server_ttl: 600,
        }
    }
}

impl KernelConfig {
    /// Configuration shrunk to sizes convenient for unit tests.
    pub fn small() -> Self {
        Self {
            max_asids: 8,
            aot_entries: 16,
            ast_entries: 32,
            aot_buckets: 8,
            area_entries: 12,
            area_uid_buckets: 5,
            lock_entries: 24,
            lock_slots_per_asid: 10,
            lock_buckets: 5,
            ec2_registrations: 16,
            ec2_pool_entries: 32,
            dxm_queue_depth: 8,
            signal_table_entries: 8,
            max_volumes: 4,
            ..Self::default()
        }
    }
}
