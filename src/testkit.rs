//! Test fixtures
//!
//! A threaded dispatcher that maps OS test threads onto task ids so
//! blocking event-count waits really block, plus a kernel fixture wired
//! to the in-memory collaborator doubles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, Thread, ThreadId};
use std::time::Duration;

use crate::ast::ObjAttrs;
use crate::config::KernelConfig;
use crate::glue::mem::{
    FixedProc, MemDirStore, MemNet, MemPagePool, MemRemote, MemVtoc, NullMmu, PermitAcl,
};
use crate::sched::{self, Boost, Dispatcher, Tid};
use crate::uid::{NodeId, Uid};
use crate::{Collaborators, Kernel};

pub const NODE_ME: NodeId = 0x42;

struct TaskCell {
    woken: AtomicBool,
    thread: Thread,
}

/// Dispatcher for hosted tests: each OS thread becomes a task; waits
/// park the thread, wakes unpark it.
pub struct ThreadedDispatcher {
    threads: Mutex<HashMap<ThreadId, Tid>>,
    cells: Mutex<HashMap<Tid, Arc<TaskCell>>>,
    next: AtomicU16,
    pub boosts: Mutex<Vec<(Tid, Boost)>>,
}

impl ThreadedDispatcher {
    fn new() -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            cells: Mutex::new(HashMap::new()),
            next: AtomicU16::new(1),
            boosts: Mutex::new(Vec::new()),
        }
    }

    fn cell_for_current(&self) -> (Tid, Arc<TaskCell>) {
        let id = thread::current().id();
        {
            let threads = self.threads.lock().unwrap();
            if let Some(tid) = threads.get(&id) {
                let cells = self.cells.lock().unwrap();
                return (*tid, cells[tid].clone());
            }
        }
        let tid = self.next.fetch_add(1, Ordering::Relaxed);
        let cell = Arc::new(TaskCell {
            woken: AtomicBool::new(false),
            thread: thread::current(),
        });
        self.threads.lock().unwrap().insert(id, tid);
        self.cells.lock().unwrap().insert(tid, cell.clone());
        (tid, cell)
    }

    /// Boosts recorded for `tid` so far.
    pub fn boosts_for(&self, tid: Tid) -> Vec<Boost> {
        self.boosts
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == tid)
            .map(|(_, b)| *b)
            .collect()
    }
}

impl Dispatcher for ThreadedDispatcher {
    fn current(&self) -> Tid {
        self.cell_for_current().0
    }

    fn prepare_wait(&self) {
        self.cell_for_current().1.woken.store(false, Ordering::SeqCst);
    }

    fn commit_wait(&self) {
        let (_, cell) = self.cell_for_current();
        while !cell.woken.load(Ordering::SeqCst) {
            thread::park_timeout(Duration::from_millis(2));
        }
    }

    fn make_ready(&self, tid: Tid, boost: Boost) {
        self.boosts.lock().unwrap().push((tid, boost));
        let cell = self.cells.lock().unwrap().get(&tid).cloned();
        if let Some(cell) = cell {
            cell.woken.store(true, Ordering::SeqCst);
            cell.thread.unpark();
        }
    }
}

struct Forward;

impl Dispatcher for Forward {
    fn current(&self) -> Tid {
        disp().current()
    }
    fn prepare_wait(&self) {
        disp().prepare_wait()
    }
    fn commit_wait(&self) {
        disp().commit_wait()
    }
    fn make_ready(&self, tid: Tid, boost: Boost) {
        disp().make_ready(tid, boost)
    }
}

static DISP: OnceLock<ThreadedDispatcher> = OnceLock::new();

/// The process-wide test dispatcher, installing it on first use.
pub fn disp() -> &'static ThreadedDispatcher {
    let d = DISP.get_or_init(ThreadedDispatcher::new);
    let _ = sched::install_dispatcher(Box::new(Forward));
    d
}

/// A kernel over in-memory doubles, with typed handles to each double.
pub struct Fix {
    pub k: Arc<Kernel>,
    pub vtoc: Arc<MemVtoc>,
    pub pages: Arc<MemPagePool>,
    pub mmu: Arc<NullMmu>,
    pub net: Arc<MemNet>,
    pub remote: Arc<MemRemote>,
    pub acl: Arc<PermitAcl>,
    pub dirs: Arc<MemDirStore>,
    pub procs: Arc<FixedProc>,
}

pub fn fixture() -> Fix {
    fixture_with(KernelConfig::small())
}

pub fn fixture_with(cfg: KernelConfig) -> Fix {
    disp();
    let vtoc = Arc::new(MemVtoc::new());
    let pages = Arc::new(MemPagePool::new());
    let mmu = Arc::new(NullMmu::new());
    let net = Arc::new(MemNet::new());
    let remote = Arc::new(MemRemote::new());
    let acl = Arc::new(PermitAcl::new());
    let dirs = Arc::new(MemDirStore::new());
    let procs = Arc::new(FixedProc::new());
    let k = Kernel::new(
        cfg,
        NODE_ME,
        Collaborators {
            vtoc: vtoc.clone(),
            pages: pages.clone(),
            mmu: mmu.clone(),
            net: net.clone(),
            remote: remote.clone(),
            acl: acl.clone(),
            dirs: dirs.clone(),
            proc: procs.clone(),
        },
    );
    Fix {
        k: Arc::new(k),
        vtoc,
        pages,
        mmu,
        net,
        remote,
        acl,
        dirs,
        procs,
    }
}

/// A UID homed on this node (node field zero).
pub fn local_uid(n: u32) -> Uid {
    Uid::new(0x1000 + n, n & 0xFFF)
}

/// A UID homed on `node`.
pub fn remote_uid(node: NodeId, n: u32) -> Uid {
    Uid::new(0x2000 + n, (node << 12) | (n & 0xFFF))
}

/// Stage a file object on `volx` in the VTOC double.
pub fn stage_file(fix: &Fix, n: u32, volx: u16) -> Uid {
    let uid = local_uid(n);
    fix.vtoc.insert_object(uid, ObjAttrs::default(), volx);
    uid
}
