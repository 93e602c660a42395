//! Naming resolver
//!
//! Pathname parsing and traversal over the directory store, with
//! per-address-space working and naming directories and a remote-name
//! client for directories homed on other nodes. Paths classify as
//! relative, absolute (`/`), network (`//`), or node-data
//! (`` `node_data ``); traversal walks one component at a time through
//! directory entries, following links a bounded number of hops.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use log::debug;
use spinning_top::Spinlock;

use crate::config::MAX_PNAME_LEN;
use crate::glue::{DirEntryInfo, EntryKind, NameRequest};
use crate::status::Status;
use crate::time;
use crate::uid::{Asid, NodeId, Uid, UID_NIL};
use crate::Kernel;

/// Classification of a pathname's starting point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    Relative,
    Absolute,
    Network,
    NodeData,
    Error,
}

const NODE_DATA_PREFIX: &str = "`node_data";
const MAX_LINK_HOPS: u8 = 8;

/// Remote naming opcodes.
mod op {
    pub const GET_ENTRY: u16 = 1;
}

#[derive(Clone, Copy)]
struct AsidDirs {
    wdir: Uid,
    ndir: Uid,
    wdir_mapped: bool,
    ndir_mapped: bool,
}

impl AsidDirs {
    fn empty() -> Self {
        Self {
            wdir: UID_NIL,
            ndir: UID_NIL,
            wdir_mapped: false,
            ndir_mapped: false,
        }
    }
}

#[derive(Clone, Copy, Default)]
struct WellKnown {
    /// Network root (`//`).
    net_root: Uid,
    /// This node's root (`/`).
    node_root: Uid,
    node_data: Uid,
    com: Uid,
    /// Fallback root used before volumes are mounted.
    canned_root: Uid,
}

/// Per-node naming state.
pub struct NameState {
    wk: Spinlock<WellKnown>,
    dirs: Spinlock<Vec<AsidDirs>>,
    /// Cached naming server and its expiry tick.
    server: Spinlock<Option<(NodeId, u32)>>,
    server_ttl: u32,
}

impl NameState {
    pub fn new(max_asids: usize, server_ttl: u32) -> Self {
        let mut dirs = Vec::with_capacity(max_asids);
        for _ in 0..max_asids {
            dirs.push(AsidDirs::empty());
        }
        Self {
            wk: Spinlock::new(WellKnown::default()),
            dirs: Spinlock::new(dirs),
            server: Spinlock::new(None),
            server_ttl,
        }
    }

    // ------------------------------------------------------------------
    // Well-known UIDs
    // ------------------------------------------------------------------

    /// Install the well-known directory UIDs.
    pub fn set_well_known(
        &self,
        net_root: Uid,
        node_root: Uid,
        node_data: Uid,
        com: Uid,
        canned_root: Uid,
    ) {
        *self.wk.lock() = WellKnown {
            net_root,
            node_root,
            node_data,
            com,
            canned_root,
        };
    }

    /// Populate the well-known UIDs from a mounted volume.
    pub fn boot_from_vtoc(&self, k: &Kernel, volx: u16) -> Result<(), Status> {
        let (root, node_data) = k.vtoc.get_name_dirs(volx)?;
        let mut wk = self.wk.lock();
        wk.node_root = root;
        wk.node_data = node_data;
        if wk.net_root.is_nil() {
            wk.net_root = root;
        }
        Ok(())
    }

    pub fn get_root_uid(&self) -> Uid {
        self.wk.lock().net_root
    }

    pub fn get_node_uid(&self) -> Uid {
        let wk = self.wk.lock();
        if wk.node_root.is_nil() {
            wk.canned_root
        } else {
            wk.node_root
        }
    }

    pub fn get_node_data_uid(&self) -> Uid {
        self.wk.lock().node_data
    }

    pub fn get_com_uid(&self) -> Uid {
        self.wk.lock().com
    }

    // ------------------------------------------------------------------
    // Lexical operations
    // ------------------------------------------------------------------

    /// Validate length and classify a pathname. Returns the type and the
    /// number of leading characters consumed by the prefix.
    pub fn validate(path: &str) -> (PathType, usize) {
        if path.len() > MAX_PNAME_LEN {
            return (PathType::Error, 0);
        }
        let bytes = path.as_bytes();
        if bytes.is_empty() {
            return (PathType::Relative, 0);
        }
        if bytes[0] == b'/' {
            if bytes.len() >= 2 && bytes[1] == b'/' {
                return (PathType::Network, 2);
            }
            return (PathType::Absolute, 1);
        }
        if bytes[0] == b'`' {
            if path == NODE_DATA_PREFIX {
                return (PathType::NodeData, NODE_DATA_PREFIX.len());
            }
            if path.len() > NODE_DATA_PREFIX.len()
                && path.starts_with(NODE_DATA_PREFIX)
                && bytes[NODE_DATA_PREFIX.len()] == b'/'
            {
                return (PathType::NodeData, NODE_DATA_PREFIX.len() + 1);
            }
            return (PathType::Error, 0);
        }
        (PathType::Relative, 0)
    }

    /// Split a path into `(dirname, leaf)` at the last separator. Root
    /// (`/`) and network (`//`) prefixes are preserved in the dirname.
    pub fn split_path(path: &str) -> (&str, &str) {
        match path.rfind('/') {
            None => ("", path),
            Some(pos) => {
                let mut dir_end = pos;
                // Keep the leading "/" or "//" when the split lands there.
                let prefix = if path.starts_with("//") {
                    2
                } else if path.starts_with('/') {
                    1
                } else {
                    0
                };
                if dir_end < prefix {
                    dir_end = prefix;
                }
                (&path[..dir_end.max(prefix)], &path[pos + 1..])
            }
        }
    }

    /// Component equality ignoring trailing spaces on either side.
    pub fn nameq(a: &str, b: &str) -> bool {
        if a.is_empty() || b.is_empty() {
            return false;
        }
        let a = a.trim_end_matches(' ');
        let b = b.trim_end_matches(' ');
        a == b
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    /// Resolve a pathname to the UID it names.
    pub fn resolve(&self, k: &Kernel, path: &str) -> Result<Uid, Status> {
        let r = self.resolve_internal(k, path, 0).map(|(_, uid)| uid);
        // A directory missing mid-path reads as name-not-found to
        // callers.
        match r {
            Err(Status::NamingDirNotFoundInPathname) => Err(Status::NamingNameNotFound),
            other => other,
        }
    }

    /// Resolve a pathname to `(parent_dir, leaf)` UIDs.
    pub fn resolve_with_dir(&self, k: &Kernel, path: &str) -> Result<(Uid, Uid), Status> {
        self.resolve_internal(k, path, 0)
    }

    fn seed(&self, k: &Kernel, ptype: PathType) -> Result<Uid, Status> {
        let wk = *self.wk.lock();
        Ok(match ptype {
            PathType::Absolute => {
                if wk.node_root.is_nil() {
                    wk.canned_root
                } else {
                    wk.node_root
                }
            }
            PathType::Network => wk.net_root,
            PathType::NodeData => wk.node_data,
            PathType::Relative => {
                let dirs = self.dirs.lock();
                dirs[k.proc.as_id() as usize].wdir
            }
            PathType::Error => return Err(Status::NamingInvalidPathname),
        })
    }

    fn resolve_internal(
        &self,
        k: &Kernel,
        path: &str,
        depth: u8,
    ) -> Result<(Uid, Uid), Status> {
        if depth > MAX_LINK_HOPS {
            return Err(Status::NamingInvalidPathname);
        }
        let (ptype, consumed) = Self::validate(path);
        let mut current = self.seed(k, ptype)?;
        let mut dir = current;
        let rest = &path[consumed..];

        let components: Vec<&str> = rest.split('/').filter(|c| !c.is_empty()).collect();
        // Upward references are rejected outright, before any lookup.
        if components.iter().any(|c| *c == "..") {
            return Err(Status::NamingInvalidPathname);
        }
        let n = components.len();
        for (i, comp) in components.iter().enumerate() {
            if *comp == "." {
                continue;
            }
            dir = current;
            let entry = self.lookup_entry(k, dir, comp)?;
            match entry.kind {
                EntryKind::Directory => current = entry.uid,
                EntryKind::File => {
                    if i + 1 < n {
                        return Err(Status::NamingNotADirectory);
                    }
                    current = entry.uid;
                }
                EntryKind::Link(target) => {
                    let (_, uid) = self.resolve_internal(k, &target, depth + 1)?;
                    current = uid;
                }
            }
        }
        Ok((dir, current))
    }

    fn lookup_entry(&self, k: &Kernel, dir: Uid, name: &str) -> Result<DirEntryInfo, Status> {
        if dir.is_nil() {
            return Err(Status::NamingDirNotFoundInPathname);
        }
        // Directories on another node resolve through the naming
        // server.
        if dir.node() != 0 && dir.node() != k.node_me && !k.dirs.is_directory(dir) {
            return self.remote_lookup(k, dir, name);
        }
        k.dirs.get_entry(dir, name.trim_end_matches(' '))
    }

    // ------------------------------------------------------------------
    // Remote names
    // ------------------------------------------------------------------

    fn cached_server(&self) -> Option<NodeId> {
        let server = self.server.lock();
        match *server {
            Some((node, expiry)) if time::now() < expiry => Some(node),
            _ => None,
        }
    }

    fn cache_server(&self, node: NodeId) {
        *self.server.lock() = Some((node, time::now().wrapping_add(self.server_ttl)));
    }

    /// One remote directory lookup: ask the cached server, re-locating
    /// it once on an unknown or stale server.
    fn remote_lookup(&self, k: &Kernel, dir: Uid, name: &str) -> Result<DirEntryInfo, Status> {
        let req = NameRequest {
            opcode: op::GET_ENTRY,
            dir_uid: dir,
            name: name.trim_end_matches(' ').to_string(),
        };
        let first = match self.cached_server() {
            Some(node) => node,
            None => {
                let node = if dir.node() != 0 {
                    dir.node()
                } else {
                    k.net.locate_server()?
                };
                self.cache_server(node);
                node
            }
        };
        match k.net.name_rpc(first, &req) {
            Ok(reply) => Ok(Self::reply_to_entry(reply)),
            Err(Status::NamingNameNotFound) => Err(Status::NamingNameNotFound),
            Err(_) => {
                // Stale or dead server: broadcast and retry once.
                let node = k.net.locate_server()?;
                self.cache_server(node);
                let reply = k.net.name_rpc(node, &req)?;
                Ok(Self::reply_to_entry(reply))
            }
        }
    }

    fn reply_to_entry(reply: crate::glue::NameReply) -> DirEntryInfo {
        DirEntryInfo {
            kind: match reply.entry_kind {
                1 => EntryKind::Directory,
                _ => EntryKind::File,
            },
            uid: reply.uid,
        }
    }

    // ------------------------------------------------------------------
    // File creation and removal
    // ------------------------------------------------------------------

    /// Create a file at `path`: resolve the parent, create the object,
    /// copy the parent's default ACL, and enter the leaf. A failure
    /// after creation deletes the object again.
    pub fn cr_file(&self, k: &Kernel, path: &str) -> Result<Uid, Status> {
        let (dirname, leaf) = Self::split_path(path);
        if leaf.is_empty() {
            return Err(Status::NamingInvalidPathname);
        }
        let parent = if dirname.is_empty() {
            let dirs = self.dirs.lock();
            dirs[k.proc.as_id() as usize].wdir
        } else {
            self.resolve(k, dirname)?
        };
        let uid = k.dirs.create_file(parent)?;
        let entered = (|| {
            k.acl.copy(parent, uid)?;
            k.dirs.add(parent, leaf, uid, EntryKind::File)
        })();
        match entered {
            Ok(()) => {
                debug!("name: created {} as {}", path, uid);
                Ok(uid)
            }
            Err(e) => {
                let _ = k.dirs.delete_file(uid);
                Err(e)
            }
        }
    }

    /// Remove the directory entry for `path`, verifying it names
    /// `file_uid`.
    pub fn drop(&self, k: &Kernel, path: &str, file_uid: Uid) -> Result<(), Status> {
        let (dirname, leaf) = Self::split_path(path);
        if leaf.is_empty() {
            return Err(Status::NamingInvalidPathname);
        }
        let parent = if dirname.is_empty() {
            let dirs = self.dirs.lock();
            dirs[k.proc.as_id() as usize].wdir
        } else {
            self.resolve(k, dirname)?
        };
        let entry = k.dirs.get_entry(parent, leaf)?;
        if !file_uid.is_nil() && entry.uid != file_uid {
            return Err(Status::NamingNameNotFound);
        }
        k.dirs.remove(parent, leaf)
    }

    // ------------------------------------------------------------------
    // Per-ASID directory state
    // ------------------------------------------------------------------

    /// Set the working directory by pathname.
    pub fn set_wdir(&self, k: &Kernel, path: &str) -> Result<(), Status> {
        let uid = self.resolve(k, path)?;
        self.set_wdir_uid(k, uid)
    }

    /// Set the working directory by UID, checking access and remapping
    /// the cached directory.
    pub fn set_wdir_uid(&self, k: &Kernel, uid: Uid) -> Result<(), Status> {
        if !k.dirs.is_directory(uid) {
            return Err(Status::NamingNotADirectory);
        }
        k.acl.rights(uid)?;
        let asid = k.proc.as_id() as usize;
        let mut dirs = self.dirs.lock();
        dirs[asid].wdir = uid;
        dirs[asid].wdir_mapped = true;
        Ok(())
    }

    /// Set the naming directory by pathname.
    pub fn set_ndir(&self, k: &Kernel, path: &str) -> Result<(), Status> {
        let uid = self.resolve(k, path)?;
        self.set_ndir_uid(k, uid)
    }

    /// Set the naming directory by UID.
    pub fn set_ndir_uid(&self, k: &Kernel, uid: Uid) -> Result<(), Status> {
        if !k.dirs.is_directory(uid) {
            return Err(Status::NamingNotADirectory);
        }
        k.acl.rights(uid)?;
        let asid = k.proc.as_id() as usize;
        let mut dirs = self.dirs.lock();
        dirs[asid].ndir = uid;
        dirs[asid].ndir_mapped = true;
        Ok(())
    }

    pub fn get_wdir(&self, asid: Asid) -> Uid {
        self.dirs.lock()[asid as usize].wdir
    }

    pub fn get_ndir(&self, asid: Asid) -> Uid {
        self.dirs.lock()[asid as usize].ndir
    }

    /// Populate a new address space's directories from the caller's,
    /// checking access to each.
    pub fn init_asid(&self, k: &Kernel, new_asid: Asid) -> Result<(), Status> {
        let src = {
            let dirs = self.dirs.lock();
            dirs[k.proc.as_id() as usize]
        };
        k.acl.enter_super();
        let r = (|| {
            if !src.wdir.is_nil() {
                k.acl.rights(src.wdir)?;
            }
            if !src.ndir.is_nil() {
                k.acl.rights(src.ndir)?;
            }
            Ok(())
        })();
        k.acl.exit_super();
        r?;
        let mut dirs = self.dirs.lock();
        dirs[new_asid as usize] = AsidDirs {
            wdir: src.wdir,
            ndir: src.ndir,
            wdir_mapped: !src.wdir.is_nil(),
            ndir_mapped: !src.ndir.is_nil(),
        };
        Ok(())
    }

    /// Clone naming state from `parent` to `child` at fork.
    pub fn fork(&self, k: &Kernel, parent: Asid, child: Asid) -> Result<(), Status> {
        let src = {
            let dirs = self.dirs.lock();
            dirs[parent as usize]
        };
        let _ = k;
        let mut dirs = self.dirs.lock();
        dirs[child as usize] = src;
        Ok(())
    }

    /// Tear down an address space's naming state.
    pub fn free_asid(&self, k: &Kernel, asid: Asid) {
        let _ = k;
        let mut dirs = self.dirs.lock();
        dirs[asid as usize] = AsidDirs::empty();
    }
}
