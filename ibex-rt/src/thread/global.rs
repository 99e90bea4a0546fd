//! Application threads with their own scheduling context.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use ibex_abi::cpu::CpuId;
use ibex_abi::exit::ThreadExit;
use ibex_abi::Qpd;

use crate::env::{set_current_cpu, Env};
use crate::error::{Error, Result};

enum GtState {
    Created(Box<dyn FnOnce() + Send>),
    Running,
    Done,
}

struct GtShared {
    env: Env,
    tid: u64,
    name: String,
    cpu: CpuId,
    state: Mutex<GtState>,
    cond: Condvar,
}

/// A thread that owns time: created with an entry function and a CPU, it
/// only starts running once [`GlobalThread::start`] attaches a scheduling
/// context.
///
/// When the entry function returns, the landing path reports the thread's
/// stack and message buffer for reclaim through the thread-exit sentinel
/// and the thread destroys itself; that is the only way a global thread
/// ends.
pub struct GlobalThread {
    shared: Arc<GtShared>,
}

impl GlobalThread {
    /// Create a thread for `entry` on `cpu`. It does not run until
    /// [`GlobalThread::start`] is called.
    pub fn create(
        env: &Env,
        cpu: CpuId,
        name: &str,
        entry: impl FnOnce() + Send + 'static,
    ) -> Result<GlobalThread> {
        if cpu >= env.cpu_count() {
            return Err(Error::ArgsInvalid);
        }
        Ok(GlobalThread {
            shared: Arc::new(GtShared {
                env: env.clone(),
                tid: env.next_tid(),
                name: name.to_string(),
                cpu,
                state: Mutex::new(GtState::Created(Box::new(entry))),
                cond: Condvar::new(),
            }),
        })
    }

    /// Attach a scheduling context and start running. Can only be done
    /// once; a second call fails with [`Error::Exists`].
    pub fn start(&self, qpd: Qpd) -> Result<()> {
        if qpd.quantum == 0 {
            return Err(Error::ArgsInvalid);
        }
        let entry = {
            let mut state = self.shared.state.lock();
            match std::mem::replace(&mut *state, GtState::Running) {
                GtState::Created(entry) => entry,
                other => {
                    *state = other;
                    return Err(Error::Exists);
                }
            }
        };

        let shared = self.shared.clone();
        shared.env.thread_started();
        let spawned = std::thread::Builder::new()
            .name(format!("{}@cpu{}", shared.name, shared.cpu))
            .spawn(move || {
                set_current_cpu(shared.cpu);
                entry();
                // Landing: report stack and message buffer for reclaim
                // (owned by the thread itself, hence zero), then die.
                shared.env.reclaim(ThreadExit {
                    tid: shared.tid,
                    stack: 0,
                    utcb: 0,
                });
                *shared.state.lock() = GtState::Done;
                shared.cond.notify_all();
                shared.env.thread_finished();
            });
        if spawned.is_err() {
            self.shared.env.thread_finished();
            *self.shared.state.lock() = GtState::Done;
            return Err(Error::Failure);
        }
        Ok(())
    }

    /// Block until this thread has terminated.
    pub fn join(&self) {
        let mut state = self.shared.state.lock();
        while !matches!(*state, GtState::Done) {
            self.shared.cond.wait(&mut state);
        }
    }

    /// The thread id used in the exit protocol.
    pub fn tid(&self) -> u64 {
        self.shared.tid
    }

    /// The thread's name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The CPU the thread is bound to.
    pub fn cpu(&self) -> CpuId {
        self.shared.cpu
    }
}
