//! The process context.
//!
//! [`Env`] replaces the usual pile of singletons (capability space, CPU
//! topology, current protection domain, parent portals) with one explicit,
//! cheaply clonable value threaded through every constructor. The current
//! CPU is supplied per thread through a thread-local set by the runtime's
//! own threads.
//!
//! [`Env::new`] boots the in-process parent: one portal worker per logical
//! CPU serving the service registry and the dataspace manager.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use spinning_top::Spinlock;

use ibex_abi::cpu::{CpuId, MAX_CPUS};
use ibex_abi::exit::{decode_exit, encode_exit, ThreadExit};
use ibex_abi::{CapRange, CapSel};

use crate::caps::{CapAllocator, CAP_BASE, CAP_END};
use crate::error::{Error, Result};
use crate::ipc::portal;
use crate::parent::{self, Parent, ParentRt};
use crate::space::ObjSpace;
use crate::utcb::UtcbFrame;

thread_local! {
    static CURRENT_CPU: Cell<Option<CpuId>> = const { Cell::new(None) };
}

/// Pin the calling thread to a logical CPU id. The runtime's workers call
/// this on startup.
pub(crate) fn set_current_cpu(cpu: CpuId) {
    CURRENT_CPU.with(|c| c.set(Some(cpu)));
}

/// The process context: capability space, object space, CPU topology and
/// the connection to the parent.
#[derive(Clone)]
pub struct Env {
    inner: Arc<EnvInner>,
}

pub(crate) struct EnvInner {
    cpus: usize,
    caps: CapAllocator,
    space: ObjSpace,
    parent: Parent,
    parent_pts: Spinlock<Vec<CapSel>>,
    parent_rt: Mutex<Option<ParentRt>>,
    next_tid: AtomicU64,
    live_threads: Mutex<usize>,
    threads_cond: Condvar,
    exit_addr: Mutex<Option<u64>>,
    reclaims: Mutex<Vec<ThreadExit>>,
}

impl Env {
    /// Boot a process context with `cpu_count` logical CPUs.
    ///
    /// # Panics
    ///
    /// Panics when `cpu_count` is outside `1..=MAX_CPUS` or the parent
    /// cannot be brought up; there is no process to speak of without it.
    pub fn new(cpu_count: usize) -> Env {
        assert!(
            (1..=MAX_CPUS).contains(&cpu_count),
            "cpu count out of range"
        );
        let env = Env {
            inner: Arc::new(EnvInner {
                cpus: cpu_count,
                caps: CapAllocator::new(CAP_BASE, CAP_END),
                space: ObjSpace::new(),
                parent: Parent::new(),
                parent_pts: Spinlock::new(Vec::new()),
                parent_rt: Mutex::new(None),
                next_tid: AtomicU64::new(1),
                live_threads: Mutex::new(0),
                threads_cond: Condvar::new(),
                exit_addr: Mutex::new(None),
                reclaims: Mutex::new(Vec::new()),
            }),
        };
        parent::boot(&env).expect("parent boot failed");
        set_current_cpu(0);
        env
    }

    pub(crate) fn from_inner(inner: Arc<EnvInner>) -> Env {
        Env { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<EnvInner> {
        Arc::downgrade(&self.inner)
    }

    /// Number of logical CPUs.
    pub fn cpu_count(&self) -> usize {
        self.inner.cpus
    }

    /// The logical CPU the calling thread runs on. Threads not spawned by
    /// the runtime count as CPU 0.
    pub fn current_cpu(&self) -> CpuId {
        CURRENT_CPU.with(|c| c.get()).unwrap_or(0)
    }

    /// The process-wide capability-selector allocator.
    pub fn caps(&self) -> &CapAllocator {
        &self.inner.caps
    }

    pub(crate) fn space(&self) -> &ObjSpace {
        &self.inner.space
    }

    pub(crate) fn parent(&self) -> &Parent {
        &self.inner.parent
    }

    /// The parent's registration portal for `cpu`.
    pub fn parent_pt(&self, cpu: CpuId) -> Result<CapSel> {
        self.inner
            .parent_pts
            .lock()
            .get(cpu)
            .copied()
            .ok_or(Error::ArgsInvalid)
    }

    pub(crate) fn set_parent_rt(&self, pts: Vec<CapSel>, rt: ParentRt) {
        *self.inner.parent_pts.lock() = pts;
        *self.inner.parent_rt.lock() = Some(rt);
    }

    /// Invoke the portal behind `sel` with `frame`.
    pub fn call(&self, sel: CapSel, frame: &mut UtcbFrame) -> Result<()> {
        portal::invoke(self, sel, frame)
    }

    /// Revoke every selector in `range`, killing the objects behind them
    /// for all holders. Subsequent use fails with
    /// [`Error::Abort`](crate::Error::Abort).
    pub fn revoke(&self, range: CapRange) {
        self.inner.space.revoke(range);
    }

    pub(crate) fn next_tid(&self) -> u64 {
        self.inner.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn thread_started(&self) {
        *self.inner.live_threads.lock() += 1;
    }

    pub(crate) fn thread_finished(&self) {
        let mut live = self.inner.live_threads.lock();
        *live -= 1;
        if *live == 0 {
            self.inner.threads_cond.notify_all();
        }
    }

    /// Block until every started global thread has terminated.
    pub fn join_all(&self) {
        let mut live = self.inner.live_threads.lock();
        while *live > 0 {
            self.inner.threads_cond.wait(&mut live);
        }
    }

    /// Announce a voluntary process exit with `code`.
    ///
    /// The first exit wins; later calls are ignored. The code is carried as
    /// the exit-sentinel fault address it would produce.
    pub fn exit(&self, code: u32) {
        let mut addr = self.inner.exit_addr.lock();
        if addr.is_none() {
            *addr = Some(encode_exit(code));
        }
    }

    /// The announced exit code, if any.
    pub fn exit_status(&self) -> Option<u32> {
        self.inner.exit_addr.lock().and_then(decode_exit)
    }

    /// Record a thread's exit-landing report.
    pub(crate) fn reclaim(&self, exit: ThreadExit) {
        self.inner.reclaims.lock().push(exit);
    }

    /// Exit-landing reports collected so far (stack/UTCB reclaim records).
    pub fn reclaimed(&self) -> Vec<ThreadExit> {
        self.inner.reclaims.lock().clone()
    }
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        if let Some(rt) = self.parent_rt.get_mut().take() {
            rt.shutdown();
        }
    }
}
