//! Core kernel subsystems of a single-image distributed object OS.
//!
//! Every file, directory, process and mailbox is named by a 64-bit UID
//! valid across the whole ring network. This crate implements the
//! in-memory object cache (AST), the virtual-memory area manager, the
//! file lock manager, event-count synchronization, deferred execution,
//! the supporting lock primitives, and the naming resolver. Scheduling,
//! disk layout, the MMU, packet I/O, ACL evaluation and process
//! lifecycle are collaborators reached through the traits in [`glue`].
//!
//! A [`Kernel`] owns every table; collaborators are injected at
//! construction. The in-memory doubles in [`glue::mem`] make a
//! self-contained single-node instance.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod area;
pub mod ast;
pub mod config;
pub mod dxm;
pub mod ec;
pub mod ec2;
pub mod flock;
pub mod glue;
pub mod ml;
pub mod name;
pub mod netlog;
pub mod sched;
pub mod status;
pub mod time;
pub mod uid;

#[cfg(test)]
mod testkit;

#[cfg(test)]
mod area_tests;
#[cfg(test)]
mod dxm_tests;
#[cfg(test)]
mod flock_tests;
#[cfg(test)]
mod ml_tests;
#[cfg(test)]
mod name_tests;
#[cfg(test)]
mod netlog_tests;

use alloc::sync::Arc;

use crate::area::AreaTable;
use crate::ast::AstCache;
use crate::config::KernelConfig;
use crate::dxm::Dxm;
use crate::ec2::Ec2Table;
use crate::flock::LockTable;
use crate::glue::{Acl, DirStore, Mmu, NetIo, PagePool, ProcCtl, RemoteFile, Vtoc};
use crate::ml::ResourceLocks;
use crate::name::NameState;
use crate::netlog::NetLog;
use crate::sched::QuitControl;
use crate::time::Timers;
use crate::uid::{NodeId, Uid, UID_NIL};

/// Everything outside this crate's scope, injected at construction.
pub struct Collaborators {
    pub vtoc: Arc<dyn Vtoc>,
    pub pages: Arc<dyn PagePool>,
    pub mmu: Arc<dyn Mmu>,
    pub net: Arc<dyn NetIo>,
    pub remote: Arc<dyn RemoteFile>,
    pub acl: Arc<dyn Acl>,
    pub dirs: Arc<dyn DirStore>,
    pub proc: Arc<dyn ProcCtl>,
}

/// One node's kernel core: every table plus its collaborators.
pub struct Kernel {
    pub cfg: KernelConfig,
    /// This node's ring address.
    pub node_me: NodeId,
    /// The paging file survives volume dismount.
    pub paging_file_uid: Uid,

    pub ml: ResourceLocks,
    pub ec2: Ec2Table,
    pub dxm: Dxm,
    pub ast: AstCache,
    pub area: AreaTable,
    pub flock: LockTable,
    pub name: NameState,
    pub netlog: NetLog,
    pub timers: Timers,
    pub quit: QuitControl,

    pub vtoc: Arc<dyn Vtoc>,
    pub pages: Arc<dyn PagePool>,
    pub mmu: Arc<dyn Mmu>,
    pub net: Arc<dyn NetIo>,
    pub remote: Arc<dyn RemoteFile>,
    pub acl: Arc<dyn Acl>,
    pub dirs: Arc<dyn DirStore>,
    pub proc: Arc<dyn ProcCtl>,
}

impl Kernel {
    pub fn new(cfg: KernelConfig, node_me: NodeId, collab: Collaborators) -> Self {
        ec::set_boost_clamp(cfg.boost_clamp);
        Self {
            ml: ResourceLocks::new(),
            ec2: Ec2Table::new(&cfg),
            dxm: Dxm::new(&cfg),
            ast: AstCache::new(&cfg),
            area: AreaTable::new(&cfg),
            flock: LockTable::new(&cfg),
            name: NameState::new(cfg.max_asids, cfg.name_server_ttl),
            netlog: NetLog::new(),
            timers: Timers::new(),
            quit: QuitControl::new(cfg.max_asids),
            cfg,
            node_me,
            paging_file_uid: UID_NIL,
            vtoc: collab.vtoc,
            pages: collab.pages,
            mmu: collab.mmu,
            net: collab.net,
            remote: collab.remote,
            acl: collab.acl,
            dirs: collab.dirs,
            proc: collab.proc,
        }
    }

    /// System-startup initialization of the event-count and deferred
    /// execution layers.
    pub fn init_subsystems(&self) {
        self.ec2.init_s(&self.ml);
        self.dxm.init();
    }
}
