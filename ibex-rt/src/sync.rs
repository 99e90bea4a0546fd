//! Counting kernel semaphores.
//!
//! An [`Sm`] wraps a kernel semaphore object: `up` adds a unit and wakes a
//! waiter, `down` blocks until a unit is available. Revocation surfaces
//! asymmetrically, matching how peer death is observed: `up` on a revoked
//! semaphore fails with [`Error::Abort`], while a blocked `down` returns
//! normally (the caller re-checks its shared state and finds the peer
//! gone).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use ibex_abi::CapSel;

use crate::caps::Dispose;
use crate::env::Env;
use crate::error::{Error, Result};
use crate::space::KObject;

/// Kernel-side semaphore state.
pub(crate) struct SemObj {
    count: Mutex<u64>,
    cond: Condvar,
    revoked: AtomicBool,
}

impl SemObj {
    pub fn new(initial: u64) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
            revoked: AtomicBool::new(false),
        }
    }

    pub fn up(&self) -> Result<()> {
        if self.is_revoked() {
            return Err(Error::Abort);
        }
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
        Ok(())
    }

    pub fn down(&self) {
        let mut count = self.count.lock();
        loop {
            if self.is_revoked() {
                return;
            }
            if *count > 0 {
                *count -= 1;
                return;
            }
            self.cond.wait(&mut count);
        }
    }

    pub fn try_down(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
        // Take the lock so a waiter between its check and its wait cannot
        // miss the wakeup.
        let _count = self.count.lock();
        self.cond.notify_all();
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }
}

/// A counting semaphore identified by a capability selector.
pub struct Sm {
    env: Env,
    sel: CapSel,
    obj: Arc<SemObj>,
    dispose: Dispose,
}

impl Sm {
    /// Create a fresh semaphore with the given initial count.
    pub fn create(env: &Env, initial: u64) -> Result<Sm> {
        let sel = env.caps().allocate(1, 1)?;
        let obj = Arc::new(SemObj::new(initial));
        env.space().install(sel, KObject::Sem(obj.clone()));
        Ok(Sm {
            env: env.clone(),
            sel,
            obj,
            dispose: Dispose::Free,
        })
    }

    /// Wrap a received selector without taking ownership of it.
    pub fn attach(env: &Env, sel: CapSel) -> Result<Sm> {
        let obj = env.space().sem(sel)?;
        Ok(Sm {
            env: env.clone(),
            sel,
            obj,
            dispose: Dispose::Keep,
        })
    }

    /// Re-home a received selector: copy the capability to a freshly
    /// allocated selector this object owns.
    ///
    /// Receive windows are reused by later calls on the same thread, so a
    /// handler that wants to keep a delegated semaphore must adopt it
    /// before returning.
    pub fn adopt(env: &Env, sel: CapSel) -> Result<Sm> {
        let obj = env.space().sem(sel)?;
        let own = env.caps().allocate(1, 1)?;
        env.space().install(own, KObject::Sem(obj.clone()));
        Ok(Sm {
            env: env.clone(),
            sel: own,
            obj,
            dispose: Dispose::Free,
        })
    }

    /// The selector naming this semaphore.
    pub fn sel(&self) -> CapSel {
        self.sel
    }

    /// Add one unit, waking a blocked `down`.
    pub fn up(&self) -> Result<()> {
        self.obj.up()
    }

    /// Block until a unit is available; returns immediately once the
    /// semaphore has been revoked.
    pub fn down(&self) {
        self.obj.down()
    }

    /// Take a unit if one is available, without blocking.
    pub fn try_down(&self) -> bool {
        self.obj.try_down()
    }

    /// Whether the backing object has been revoked.
    pub fn is_revoked(&self) -> bool {
        self.obj.is_revoked()
    }
}

impl Drop for Sm {
    fn drop(&mut self) {
        match self.dispose {
            Dispose::Free => {
                self.env.space().remove(self.sel);
                self.env.caps().free(self.sel, 1);
            }
            Dispose::KeepSel => self.env.space().remove(self.sel),
            Dispose::Keep => {}
        }
    }
}
