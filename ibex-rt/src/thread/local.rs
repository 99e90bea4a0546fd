//! Portal-serving worker threads.
//!
//! A local thread is bound to one logical CPU and does nothing but serve
//! portal calls, one at a time in arrival order. Callers block on a reply
//! slot until their call has been processed; this is what makes a portal
//! call synchronous.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use spinning_top::Spinlock;

use ibex_abi::cpu::CpuId;
use ibex_abi::error::ErrorCode;
use ibex_abi::{next_pow2, CapRange};

use crate::env::{set_current_cpu, Env, EnvInner};
use crate::error::{Error, Result};
use crate::ipc::portal::{deliver_typed, PortalObj};
use crate::utcb::{FrameData, UtcbFrame};

/// One queued portal invocation.
pub(crate) struct CallMsg {
    pub portal: Arc<PortalObj>,
    pub data: FrameData,
    pub reply: Arc<ReplySlot>,
}

/// Completion slot the caller blocks on.
pub(crate) struct ReplySlot {
    state: Mutex<Option<Result<FrameData>>>,
    cond: Condvar,
}

impl ReplySlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    pub fn complete(&self, result: Result<FrameData>) {
        *self.state.lock() = Some(result);
        self.cond.notify_all();
    }

    pub fn wait(&self) -> Result<FrameData> {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = state.take() {
                return result;
            }
            self.cond.wait(&mut state);
        }
    }
}

/// State shared between a local thread handle, its worker, and the portals
/// bound to it.
pub(crate) struct LtShared {
    cpu: CpuId,
    queue: Mutex<VecDeque<CallMsg>>,
    cond: Condvar,
    stopped: AtomicBool,
    /// Receive window delegated items land in; configured via
    /// `accept_delegates`.
    window: Spinlock<Option<CapRange>>,
}

impl LtShared {
    pub fn new(cpu: CpuId) -> Arc<Self> {
        Arc::new(Self {
            cpu,
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            stopped: AtomicBool::new(false),
            window: Spinlock::new(None),
        })
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn window(&self) -> Option<CapRange> {
        *self.window.lock()
    }

    pub fn set_window(&self, range: Option<CapRange>) {
        *self.window.lock() = range;
    }

    /// Enqueue a call; fails with `Abort` once the thread is stopping.
    pub fn submit(&self, msg: CallMsg) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Abort);
        }
        self.queue.lock().push_back(msg);
        self.cond.notify_one();
        Ok(())
    }

    /// Worker side: next call, or `None` when stopped and drained.
    fn next(&self) -> Option<CallMsg> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(msg) = queue.pop_front() {
                return Some(msg);
            }
            if self.stopped.load(Ordering::Acquire) {
                return None;
            }
            self.cond.wait(&mut queue);
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _queue = self.queue.lock();
        self.cond.notify_all();
    }
}

/// Spawn the worker loop for `shared`.
///
/// The worker holds the environment only weakly: once the last user handle
/// is gone, queued work completes with `Abort` and the loop winds down
/// during environment teardown.
pub(crate) fn spawn_worker(
    env: Weak<EnvInner>,
    shared: Arc<LtShared>,
    name: String,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            set_current_cpu(shared.cpu());
            while let Some(msg) = shared.next() {
                match env.upgrade() {
                    Some(inner) => {
                        let env = Env::from_inner(inner);
                        process_call(&env, &shared, msg);
                    }
                    None => msg.reply.complete(Err(Error::Abort)),
                }
            }
        })
        .map_err(|_| Error::Failure)
}

/// Serve one portal invocation: land the typed items in the window, run the
/// bound handler, and hand the frame back.
fn process_call(env: &Env, shared: &LtShared, msg: CallMsg) {
    let window = shared.window();
    let (delegated, translated) = match deliver_typed(env, window, &msg.data.typed) {
        Ok(items) => items,
        Err(err) => {
            msg.reply.complete(Err(err));
            return;
        }
    };

    let mut frame = UtcbFrame::for_handler(msg.data.words, delegated, translated);
    let func = msg.portal.func.clone();
    let id = msg.portal.id();
    let panicked = catch_unwind(AssertUnwindSafe(|| func(id, &mut frame))).is_err();
    if panicked {
        log::error!("portal handler for sel {id} panicked");
        frame.drop_delegations(env);
        frame.clear();
        frame.put(ErrorCode::Failure);
    }
    msg.reply.complete(Ok(frame.take_outgoing()));
}

/// A thread that only receives portal calls on one logical CPU.
///
/// It has no scheduling context of its own; it runs exactly when a portal
/// bound to it is invoked.
pub struct LocalThread {
    env: Env,
    shared: Arc<LtShared>,
    handle: Option<JoinHandle<()>>,
}

impl LocalThread {
    /// Spawn a portal worker for `cpu`.
    pub fn spawn(env: &Env, cpu: CpuId, name: &str) -> Result<LocalThread> {
        if cpu >= env.cpu_count() {
            return Err(Error::ArgsInvalid);
        }
        let shared = LtShared::new(cpu);
        let handle = spawn_worker(
            env.downgrade(),
            shared.clone(),
            format!("{name}@cpu{cpu}"),
        )?;
        Ok(LocalThread {
            env: env.clone(),
            shared,
            handle: Some(handle),
        })
    }

    /// The CPU this thread serves.
    pub fn cpu(&self) -> CpuId {
        self.shared.cpu()
    }

    /// Designate a receive window big enough for `count` delegated
    /// selectors per call. Replaces any previous window.
    pub fn accept_delegates(&self, count: u64) -> Result<()> {
        let size = next_pow2(count.max(1));
        let base = self.env.caps().allocate(size, size)?;
        let old = self.shared.window();
        self.shared.set_window(Some(CapRange::new(base, size)));
        if let Some(old) = old {
            self.drop_window(old);
        }
        Ok(())
    }

    fn drop_window(&self, range: CapRange) {
        for sel in range.base..range.end() {
            self.env.space().remove(sel);
        }
        self.env.caps().free(range.base, range.count);
    }

    pub(crate) fn shared(&self) -> &Arc<LtShared> {
        &self.shared
    }
}

impl Drop for LocalThread {
    fn drop(&mut self) {
        self.shared.stop();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
        if let Some(window) = self.shared.window() {
            self.drop_window(window);
        }
    }
}
