//! Collaborator interfaces
//!
//! The core reaches everything outside this crate's scope through the
//! object-safe traits here: on-disk volume metadata (VTOC), the physical
//! page pool, the MMU, ring-network I/O, the remote-file service, the
//! ACL rights evaluator, the directory store, and process control. Each
//! trait has an in-memory double in [`mem`] used by tests and by
//! single-node bring-up.

use alloc::string::String;
use alloc::vec::Vec;

use crate::ast::ObjAttrs;
use crate::status::Status;
use crate::uid::{Asid, NodeId, Uid};

/// Physical page number.
pub type Ppn = u32;

/// On-disk block address.
pub type DiskAddr = u32;

/// Mounted volume index.
pub type VolIdx = u16;

bitflags::bitflags! {
    /// Access rights bits as produced by the ACL evaluator.
    pub struct Rights: u32 {
        const READ    = 0x01;
        const WRITE   = 0x02;
        const EXECUTE = 0x04;
        const DELETE  = 0x08;
        const OWNER   = 0x10;
    }
}

/// Volume table of contents: the on-disk side of object metadata.
pub trait Vtoc: Send + Sync {
    /// Root and node-data directory UIDs for a mounted volume.
    fn get_name_dirs(&self, volx: VolIdx) -> Result<(Uid, Uid), Status>;
    /// Map a logical volume UID to its mount index.
    fn lvuid_to_volx(&self, lvuid: Uid) -> Result<VolIdx, Status>;
    /// Fetch an object's attribute block and home volume.
    fn lookup_attrs(&self, uid: Uid) -> Result<(ObjAttrs, VolIdx), Status>;
    /// Write back an object's attribute block.
    fn write_attrs(&self, volx: VolIdx, uid: Uid, attrs: &ObjAttrs) -> Result<(), Status>;
    /// Read one page image from disk into a physical page.
    fn read_page(&self, addr: DiskAddr, ppn: Ppn) -> Result<(), Status>;
    /// Write one physical page back to disk.
    fn write_page(&self, addr: DiskAddr, ppn: Ppn) -> Result<(), Status>;
    /// True if the volume is mounted read-only.
    fn vol_read_only(&self, volx: VolIdx) -> bool;
    /// Final dismount of the on-disk structures.
    fn dismount(&self, volx: VolIdx, flags: u8) -> Result<(), Status>;
    /// Remove an object's on-disk presence entirely.
    fn delete_object(&self, uid: Uid) -> Result<(), Status>;
}

/// Physical page allocation.
pub trait PagePool: Send + Sync {
    /// Allocate a zero-filled page.
    fn calloc(&self) -> Result<Ppn, Status>;
    /// Return a page to the pool.
    fn free(&self, ppn: Ppn);
    /// Drop a wiring reference.
    fn unwire(&self, ppn: Ppn);
    /// Advise the pool of the remote partner's transfer size.
    fn remote_pool(&self, size: usize);
}

/// MMU primitives.
pub trait Mmu: Send + Sync {
    fn install(&self, ppn: Ppn, va: u32, flags: u16);
    fn remove(&self, ppn: Ppn);
}

/// A remote naming request as carried on the wire.
#[derive(Debug, Clone)]
pub struct NameRequest {
    pub opcode: u16,
    pub dir_uid: Uid,
    pub name: String,
}

/// Reply to a remote naming request.
#[derive(Debug, Clone)]
pub struct NameReply {
    pub entry_kind: u16,
    pub uid: Uid,
    pub name: String,
}

/// Ring-network I/O.
pub trait NetIo: Send + Sync {
    /// Fetch an object's attributes from a partner node.
    fn get_attrs(&self, node: NodeId, uid: Uid) -> Result<ObjAttrs, Status>;
    /// Batched read-ahead of contiguous pages into the given physical
    /// pages.
    fn page_in(
        &self,
        node: NodeId,
        uid: Uid,
        seg: u32,
        first_page: u32,
        ppns: &[Ppn],
    ) -> Result<(), Status>;
    /// Write one physical page back to its home on a partner node.
    fn page_out(
        &self,
        node: NodeId,
        uid: Uid,
        seg: u32,
        page: u32,
        ppn: Ppn,
    ) -> Result<(), Status>;
    /// Fetch a raw page image (used for page-map windows).
    fn fetch_page_image(
        &self,
        node: NodeId,
        uid: Uid,
        seg: u32,
        page: u32,
    ) -> Result<Vec<u8>, Status>;
    /// One naming RPC round trip.
    fn name_rpc(&self, node: NodeId, req: &NameRequest) -> Result<NameReply, Status>;
    /// Broadcast for a naming server; returns the responding node.
    fn locate_server(&self) -> Result<NodeId, Status>;
    /// Hand off a full telemetry page.
    fn send_log_page(&self, page: &[u8]);
    /// Preferred transfer size when talking to `node`.
    fn pkt_size(&self, node: NodeId) -> u16;
}

/// Grant returned by a successful remote lock.
#[derive(Debug, Clone, Copy)]
pub struct RemoteGrant {
    pub sequence: u16,
    pub rights: Rights,
}

/// Reply to a remote unlock.
#[derive(Debug, Clone, Copy)]
pub struct RemoteUnlockReply {
    /// The remote node marked the object for deletion.
    pub delete_pending: bool,
}

/// Remote file service on a partner node.
pub trait RemoteFile: Send + Sync {
    fn create_area(
        &self,
        node: NodeId,
        total_size: u32,
        commit_size: u32,
        caller_id: u32,
        reversed: bool,
    ) -> Result<VolIdx, Status>;
    fn delete_area(&self, node: NodeId, remote_volx: VolIdx, caller_id: u32)
        -> Result<(), Status>;
    fn lock(
        &self,
        node: NodeId,
        uid: Uid,
        side: u8,
        mode: u8,
        flags: u16,
        context: u32,
    ) -> Result<RemoteGrant, Status>;
    fn unlock(
        &self,
        node: NodeId,
        uid: Uid,
        mode: u8,
        context: u32,
        sequence: u16,
    ) -> Result<RemoteUnlockReply, Status>;
    fn unlock_all(&self);
    fn local_read_lock(&self, node: NodeId, uid: Uid) -> Result<Option<RemoteGrant>, Status>;
    fn acl_create(&self, node: NodeId, data: &[u8]) -> Result<Uid, Status>;
}

/// ACL rights evaluation.
pub trait Acl: Send + Sync {
    fn rights(&self, uid: Uid) -> Result<Rights, Status>;
    fn rights_check(&self, holder: Uid, target: Uid) -> Result<Rights, Status>;
    /// Copy a container's default ACL onto a freshly created object.
    fn copy(&self, src_dir: Uid, dst: Uid) -> Result<(), Status>;
    fn enter_super(&self);
    fn exit_super(&self);
}

/// Kind of a directory entry, as returned by lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Soft link to another pathname.
    Link(String),
}

/// One directory entry.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub kind: EntryKind,
    pub uid: Uid,
}

/// Directory contents and file object lifecycle.
pub trait DirStore: Send + Sync {
    fn get_entry(&self, dir: Uid, name: &str) -> Result<DirEntryInfo, Status>;
    fn add(&self, dir: Uid, name: &str, uid: Uid, kind: EntryKind) -> Result<(), Status>;
    fn remove(&self, dir: Uid, name: &str) -> Result<(), Status>;
    fn create_file(&self, parent_dir: Uid) -> Result<Uid, Status>;
    fn delete_file(&self, uid: Uid) -> Result<(), Status>;
    /// True if `uid` names a directory object.
    fn is_directory(&self, uid: Uid) -> bool;
}

/// Process control: the slice of the process subsystem the core calls.
pub trait ProcCtl: Send + Sync {
    /// Address space of the calling task.
    fn as_id(&self) -> Asid;
    /// Process id of the calling task.
    fn current_pid(&self) -> u32;
    /// Address space of the process named by `uid`, if any.
    fn find_asid(&self, uid: Uid) -> Option<Asid>;
    /// Deliver a signal to the process group named by `uid`.
    fn signal_pgroup(&self, uid: Uid, signo: u16);
}

pub mod mem {
    //! In-memory collaborator doubles.

    use alloc::collections::BTreeMap;
    use alloc::string::{String, ToString};
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};
    use spinning_top::Spinlock;

    use super::*;
    use crate::ast::ObjAttrs;

    /// VTOC double backed by maps.
    pub struct MemVtoc {
        objects: Spinlock<BTreeMap<Uid, (ObjAttrs, VolIdx)>>,
        name_dirs: Spinlock<BTreeMap<VolIdx, (Uid, Uid)>>,
        lvuids: Spinlock<BTreeMap<Uid, VolIdx>>,
        read_only: Spinlock<BTreeMap<VolIdx, bool>>,
        dismounted: Spinlock<BTreeMap<VolIdx, ()>>,
        pub page_reads: AtomicU32,
        pub page_writes: AtomicU32,
        pub dismounts: AtomicU32,
    }

    impl MemVtoc {
        pub fn new() -> Self {
            Self {
                objects: Spinlock::new(BTreeMap::new()),
                name_dirs: Spinlock::new(BTreeMap::new()),
                lvuids: Spinlock::new(BTreeMap::new()),
                read_only: Spinlock::new(BTreeMap::new()),
                dismounted: Spinlock::new(BTreeMap::new()),
                page_reads: AtomicU32::new(0),
                page_writes: AtomicU32::new(0),
                dismounts: AtomicU32::new(0),
            }
        }

        pub fn insert_object(&self, uid: Uid, attrs: ObjAttrs, volx: VolIdx) {
            self.objects.lock().insert(uid, (attrs, volx));
        }

        pub fn set_name_dirs(&self, volx: VolIdx, root: Uid, node_data: Uid) {
            self.name_dirs.lock().insert(volx, (root, node_data));
        }

        pub fn set_lvuid(&self, lvuid: Uid, volx: VolIdx) {
            self.lvuids.lock().insert(lvuid, volx);
        }

        pub fn set_read_only(&self, volx: VolIdx, ro: bool) {
            self.read_only.lock().insert(volx, ro);
        }

        pub fn attrs_of(&self, uid: Uid) -> Option<ObjAttrs> {
            self.objects.lock().get(&uid).map(|(a, _)| a.clone())
        }
    }

    impl Default for MemVtoc {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Vtoc for MemVtoc {
        fn get_name_dirs(&self, volx: VolIdx) -> Result<(Uid, Uid), Status> {
            self.name_dirs
                .lock()
                .get(&volx)
                .copied()
                .ok_or(Status::VolNotMounted)
        }

        fn lvuid_to_volx(&self, lvuid: Uid) -> Result<VolIdx, Status> {
            self.lvuids
                .lock()
                .get(&lvuid)
                .copied()
                .ok_or(Status::VolNotMounted)
        }

        fn lookup_attrs(&self, uid: Uid) -> Result<(ObjAttrs, VolIdx), Status> {
            let found = self
                .objects
                .lock()
                .get(&uid)
                .cloned()
                .ok_or(Status::FileObjectNotFound)?;
            if self.dismounted.lock().contains_key(&found.1) {
                return Err(Status::FileObjectNotFound);
            }
            Ok(found)
        }

        fn write_attrs(&self, volx: VolIdx, uid: Uid, attrs: &ObjAttrs) -> Result<(), Status> {
            self.objects.lock().insert(uid, (attrs.clone(), volx));
            Ok(())
        }

        fn read_page(&self, _addr: DiskAddr, _ppn: Ppn) -> Result<(), Status> {
            self.page_reads.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn write_page(&self, _addr: DiskAddr, _ppn: Ppn) -> Result<(), Status> {
            self.page_writes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn vol_read_only(&self, volx: VolIdx) -> bool {
            self.read_only.lock().get(&volx).copied().unwrap_or(false)
        }

        fn dismount(&self, volx: VolIdx, _flags: u8) -> Result<(), Status> {
            self.dismounted.lock().insert(volx, ());
            self.dismounts.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn delete_object(&self, uid: Uid) -> Result<(), Status> {
            self.objects.lock().remove(&uid);
            Ok(())
        }
    }

    /// Page pool double: monotonically numbered pages plus a free count.
    pub struct MemPagePool {
        next: AtomicU32,
        outstanding: AtomicU32,
    }

    impl MemPagePool {
        pub fn new() -> Self {
            Self {
                next: AtomicU32::new(1),
                outstanding: AtomicU32::new(0),
            }
        }

        pub fn outstanding(&self) -> u32 {
            self.outstanding.load(Ordering::Relaxed)
        }
    }

    impl Default for MemPagePool {
        fn default() -> Self {
            Self::new()
        }
    }

    impl PagePool for MemPagePool {
        fn calloc(&self) -> Result<Ppn, Status> {
            self.outstanding.fetch_add(1, Ordering::Relaxed);
            Ok(self.next.fetch_add(1, Ordering::Relaxed))
        }

        fn free(&self, _ppn: Ppn) {
            self.outstanding.fetch_sub(1, Ordering::Relaxed);
        }

        fn unwire(&self, _ppn: Ppn) {}

        fn remote_pool(&self, _size: usize) {}
    }

    /// MMU double: counts installs and removes.
    pub struct NullMmu {
        pub installs: AtomicU32,
        pub removes: AtomicU32,
    }

    impl NullMmu {
        pub fn new() -> Self {
            Self {
                installs: AtomicU32::new(0),
                removes: AtomicU32::new(0),
            }
        }
    }

    impl Default for NullMmu {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Mmu for NullMmu {
        fn install(&self, _ppn: Ppn, _va: u32, _flags: u16) {
            self.installs.fetch_add(1, Ordering::Relaxed);
        }

        fn remove(&self, _ppn: Ppn) {
            self.removes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Network double. Remote objects and naming entries can be staged;
    /// everything else fails with a network error.
    pub struct MemNet {
        remote_attrs: Spinlock<BTreeMap<(NodeId, Uid), ObjAttrs>>,
        name_entries: Spinlock<BTreeMap<(Uid, String), (u16, Uid)>>,
        server_node: Spinlock<Option<NodeId>>,
        pub pages_in: AtomicU32,
        pub pages_out: AtomicU32,
        pub log_pages: AtomicU32,
    }

    impl MemNet {
        pub fn new() -> Self {
            Self {
                remote_attrs: Spinlock::new(BTreeMap::new()),
                name_entries: Spinlock::new(BTreeMap::new()),
                server_node: Spinlock::new(None),
                pages_in: AtomicU32::new(0),
                pages_out: AtomicU32::new(0),
                log_pages: AtomicU32::new(0),
            }
        }

        pub fn stage_attrs(&self, node: NodeId, uid: Uid, attrs: ObjAttrs) {
            self.remote_attrs.lock().insert((node, uid), attrs);
        }

        pub fn stage_name(&self, dir: Uid, name: &str, kind: u16, uid: Uid) {
            self.name_entries
                .lock()
                .insert((dir, name.to_string()), (kind, uid));
        }

        pub fn set_server(&self, node: NodeId) {
            *self.server_node.lock() = Some(node);
        }
    }

    impl Default for MemNet {
        fn default() -> Self {
            Self::new()
        }
    }

    impl NetIo for MemNet {
        fn get_attrs(&self, node: NodeId, uid: Uid) -> Result<ObjAttrs, Status> {
            self.remote_attrs
                .lock()
                .get(&(node, uid))
                .cloned()
                .ok_or(Status::FileObjectNotFound)
        }

        fn page_in(
            &self,
            _node: NodeId,
            _uid: Uid,
            _seg: u32,
            _first_page: u32,
            ppns: &[Ppn],
        ) -> Result<(), Status> {
            self.pages_in.fetch_add(ppns.len() as u32, Ordering::Relaxed);
            Ok(())
        }

        fn page_out(
            &self,
            _node: NodeId,
            _uid: Uid,
            _seg: u32,
            _page: u32,
            _ppn: Ppn,
        ) -> Result<(), Status> {
            self.pages_out.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn fetch_page_image(
            &self,
            _node: NodeId,
            _uid: Uid,
            _seg: u32,
            _page: u32,
        ) -> Result<Vec<u8>, Status> {
            let mut v = Vec::new();
            v.resize(crate::config::PAGE_SIZE as usize, 0);
            Ok(v)
        }

        fn name_rpc(&self, _node: NodeId, req: &NameRequest) -> Result<NameReply, Status> {
            self.name_entries
                .lock()
                .get(&(req.dir_uid, req.name.clone()))
                .map(|(kind, uid)| NameReply {
                    entry_kind: *kind,
                    uid: *uid,
                    name: req.name.clone(),
                })
                .ok_or(Status::NamingNameNotFound)
        }

        fn locate_server(&self) -> Result<NodeId, Status> {
            (*self.server_node.lock()).ok_or(Status::NamingServerNotFound)
        }

        fn send_log_page(&self, _page: &[u8]) {
            self.log_pages.fetch_add(1, Ordering::Relaxed);
        }

        fn pkt_size(&self, _node: NodeId) -> u16 {
            1024
        }
    }

    /// Remote-file double granting every request.
    pub struct MemRemote {
        seq: AtomicU16,
        pub areas_created: AtomicU32,
        pub areas_deleted: AtomicU32,
        pub unlock_alls: AtomicU32,
        delete_pending: Spinlock<BTreeMap<Uid, bool>>,
    }

    impl MemRemote {
        pub fn new() -> Self {
            Self {
                seq: AtomicU16::new(1),
                areas_created: AtomicU32::new(0),
                areas_deleted: AtomicU32::new(0),
                unlock_alls: AtomicU32::new(0),
                delete_pending: Spinlock::new(BTreeMap::new()),
            }
        }

        pub fn mark_delete_pending(&self, uid: Uid) {
            self.delete_pending.lock().insert(uid, true);
        }
    }

    impl Default for MemRemote {
        fn default() -> Self {
            Self::new()
        }
    }

    impl RemoteFile for MemRemote {
        fn create_area(
            &self,
            _node: NodeId,
            _total_size: u32,
            _commit_size: u32,
            _caller_id: u32,
            _reversed: bool,
        ) -> Result<VolIdx, Status> {
            self.areas_created.fetch_add(1, Ordering::Relaxed);
            Ok(1)
        }

        fn delete_area(
            &self,
            _node: NodeId,
            _remote_volx: VolIdx,
            _caller_id: u32,
        ) -> Result<(), Status> {
            self.areas_deleted.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn lock(
            &self,
            _node: NodeId,
            _uid: Uid,
            _side: u8,
            _mode: u8,
            _flags: u16,
            _context: u32,
        ) -> Result<RemoteGrant, Status> {
            Ok(RemoteGrant {
                sequence: self.seq.fetch_add(1, Ordering::Relaxed),
                rights: Rights::all(),
            })
        }

        fn unlock(
            &self,
            _node: NodeId,
            uid: Uid,
            _mode: u8,
            _context: u32,
            _sequence: u16,
        ) -> Result<RemoteUnlockReply, Status> {
            let pending = self.delete_pending.lock().remove(&uid).unwrap_or(false);
            Ok(RemoteUnlockReply {
                delete_pending: pending,
            })
        }

        fn unlock_all(&self) {
            self.unlock_alls.fetch_add(1, Ordering::Relaxed);
        }

        fn local_read_lock(&self, _node: NodeId, _uid: Uid) -> Result<Option<RemoteGrant>, Status> {
            Ok(None)
        }

        fn acl_create(&self, _node: NodeId, _data: &[u8]) -> Result<Uid, Status> {
            Err(Status::RemoteRefused)
        }
    }

    /// ACL double granting full rights.
    pub struct PermitAcl {
        pub copies: AtomicU32,
    }

    impl PermitAcl {
        pub fn new() -> Self {
            Self {
                copies: AtomicU32::new(0),
            }
        }
    }

    impl Default for PermitAcl {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Acl for PermitAcl {
        fn rights(&self, _uid: Uid) -> Result<Rights, Status> {
            Ok(Rights::all())
        }

        fn rights_check(&self, _holder: Uid, _target: Uid) -> Result<Rights, Status> {
            Ok(Rights::all())
        }

        fn copy(&self, _src_dir: Uid, _dst: Uid) -> Result<(), Status> {
            self.copies.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn enter_super(&self) {}
        fn exit_super(&self) {}
    }

    /// Directory store double.
    pub struct MemDirStore {
        entries: Spinlock<BTreeMap<(Uid, String), DirEntryInfo>>,
        dirs: Spinlock<BTreeMap<Uid, ()>>,
        next_uid: AtomicU32,
    }

    impl MemDirStore {
        pub fn new() -> Self {
            Self {
                entries: Spinlock::new(BTreeMap::new()),
                dirs: Spinlock::new(BTreeMap::new()),
                next_uid: AtomicU32::new(0x1000),
            }
        }

        /// Register a directory object so traversal accepts it.
        pub fn add_directory(&self, uid: Uid) {
            self.dirs.lock().insert(uid, ());
        }
    }

    impl Default for MemDirStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl DirStore for MemDirStore {
        fn get_entry(&self, dir: Uid, name: &str) -> Result<DirEntryInfo, Status> {
            self.entries
                .lock()
                .get(&(dir, name.to_string()))
                .cloned()
                .ok_or(Status::NamingNameNotFound)
        }

        fn add(&self, dir: Uid, name: &str, uid: Uid, kind: EntryKind) -> Result<(), Status> {
            let mut entries = self.entries.lock();
            let key = (dir, name.to_string());
            if entries.contains_key(&key) {
                return Err(Status::NamingAlreadyExists);
            }
            if kind == EntryKind::Directory {
                self.dirs.lock().insert(uid, ());
            }
            entries.insert(key, DirEntryInfo { kind, uid });
            Ok(())
        }

        fn remove(&self, dir: Uid, name: &str) -> Result<(), Status> {
            self.entries
                .lock()
                .remove(&(dir, name.to_string()))
                .map(|_| ())
                .ok_or(Status::NamingNameNotFound)
        }

        fn create_file(&self, _parent_dir: Uid) -> Result<Uid, Status> {
            let low = self.next_uid.fetch_add(1, Ordering::Relaxed);
            Ok(Uid::new(0x5000_0000, low))
        }

        fn delete_file(&self, _uid: Uid) -> Result<(), Status> {
            Ok(())
        }

        fn is_directory(&self, uid: Uid) -> bool {
            self.dirs.lock().contains_key(&uid)
        }
    }

    /// Process-control double with a settable current ASID.
    pub struct FixedProc {
        asid: AtomicU16,
        pid: AtomicU32,
        pgroups: Spinlock<BTreeMap<Uid, Asid>>,
        pub signals_sent: AtomicU32,
    }

    impl FixedProc {
        pub fn new() -> Self {
            Self {
                asid: AtomicU16::new(1),
                pid: AtomicU32::new(1),
                pgroups: Spinlock::new(BTreeMap::new()),
                signals_sent: AtomicU32::new(0),
            }
        }

        pub fn set_asid(&self, asid: Asid) {
            self.asid.store(asid, Ordering::Relaxed);
        }

        pub fn register_pgroup(&self, uid: Uid, asid: Asid) {
            self.pgroups.lock().insert(uid, asid);
        }
    }

    impl Default for FixedProc {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ProcCtl for FixedProc {
        fn as_id(&self) -> Asid {
            self.asid.load(Ordering::Relaxed)
        }

        fn current_pid(&self) -> u32 {
            self.pid.load(Ordering::Relaxed)
        }

        fn find_asid(&self, uid: Uid) -> Option<Asid> {
            self.pgroups.lock().get(&uid).copied()
        }

        fn signal_pgroup(&self, _uid: Uid, _signo: u16) {
            self.signals_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}
