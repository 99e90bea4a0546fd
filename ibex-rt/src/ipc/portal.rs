//! Portals: synchronous message-transfer endpoints.
//!
//! A portal is bound at creation to a [`LocalThread`] on a specific CPU.
//! Invoking it transfers the caller's frame to that thread, runs the bound
//! handler, and transfers the frame back; the caller blocks for the whole
//! round trip. Typed items attached to the frame are landed in the
//! receiver's window on the way in and in the caller's window on the way
//! out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ibex_abi::{CapRange, CapSel};

use crate::caps::Dispose;
use crate::env::Env;
use crate::error::{Error, Result};
use crate::space::KObject;
use crate::thread::{CallMsg, LocalThread, LtShared, ReplySlot};
use crate::utcb::{TypedItem, UtcbFrame};

/// Handler type bound to a portal. The first argument is the selector the
/// portal was created at, which dispatchers use to recover per-session
/// state in O(1).
pub(crate) type PortalFn = Arc<dyn Fn(CapSel, &mut UtcbFrame) + Send + Sync>;

/// Kernel-side portal object.
pub(crate) struct PortalObj {
    id: CapSel,
    thread: Arc<LtShared>,
    pub(crate) func: PortalFn,
    revoked: AtomicBool,
}

impl PortalObj {
    pub fn id(&self) -> CapSel {
        self.id
    }

    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }
}

/// A portal capability.
pub struct Portal {
    env: Env,
    sel: CapSel,
    dispose: Dispose,
}

impl Portal {
    /// Create a portal bound to `thread` at a freshly allocated selector.
    pub fn create(
        env: &Env,
        thread: &LocalThread,
        func: impl Fn(CapSel, &mut UtcbFrame) + Send + Sync + 'static,
    ) -> Result<Portal> {
        let sel = env.caps().allocate(1, 1)?;
        install(env, thread, sel, Arc::new(func));
        Ok(Portal {
            env: env.clone(),
            sel,
            dispose: Dispose::Free,
        })
    }

    /// Create a portal bound to `thread` at a caller-chosen selector. The
    /// selector stays allocated when the portal is dropped; it belongs to
    /// a larger block.
    pub fn create_at(
        env: &Env,
        thread: &LocalThread,
        sel: CapSel,
        func: impl Fn(CapSel, &mut UtcbFrame) + Send + Sync + 'static,
    ) -> Portal {
        install(env, thread, sel, Arc::new(func));
        Portal {
            env: env.clone(),
            sel,
            dispose: Dispose::KeepSel,
        }
    }

    /// Wrap a received portal selector without taking any ownership.
    pub fn attach(env: &Env, sel: CapSel) -> Portal {
        Portal {
            env: env.clone(),
            sel,
            dispose: Dispose::Keep,
        }
    }

    /// Wrap a selector the caller owns (object and selector are released
    /// on drop).
    pub(crate) fn attach_owned(env: &Env, sel: CapSel) -> Portal {
        Portal {
            env: env.clone(),
            sel,
            dispose: Dispose::Free,
        }
    }

    /// The selector naming this portal.
    pub fn sel(&self) -> CapSel {
        self.sel
    }

    /// Invoke the portal with `frame`. On return the frame holds the reply
    /// with its read cursor at the start.
    pub fn call(&self, frame: &mut UtcbFrame) -> Result<()> {
        invoke(&self.env, self.sel, frame)
    }
}

impl Drop for Portal {
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

/// Install a portal object bound to `thread` at `sel`.
pub(crate) fn install(env: &Env, thread: &LocalThread, sel: CapSel, func: PortalFn) {
    let obj = Arc::new(PortalObj {
        id: sel,
        thread: thread.shared().clone(),
        func,
        revoked: AtomicBool::new(false),
    });
    env.space().install(sel, KObject::Portal(obj));
}

/// Install a portal object for kernel-internal threads (the parent).
pub(crate) fn install_raw(env: &Env, thread: &Arc<LtShared>, sel: CapSel, func: PortalFn) {
    let obj = Arc::new(PortalObj {
        id: sel,
        thread: thread.clone(),
        func,
        revoked: AtomicBool::new(false),
    });
    env.space().install(sel, KObject::Portal(obj));
}

/// The portal-call primitive: transfer `frame` to the portal behind `sel`,
/// block until the bound handler has run, and transfer the reply back.
pub(crate) fn invoke(env: &Env, sel: CapSel, frame: &mut UtcbFrame) -> Result<()> {
    let portal = env.space().portal(sel)?;
    let data = frame.take_outgoing();
    let reply = Arc::new(ReplySlot::new());
    portal.thread.clone().submit(CallMsg {
        portal,
        data,
        reply: reply.clone(),
    })?;
    let reply_data = reply.wait()?;

    match deliver_typed(env, frame.window(), &reply_data.typed) {
        Ok((delegated, translated)) => {
            frame.load_reply(reply_data.words, delegated, translated);
            Ok(())
        }
        Err(err) => {
            // The reply carried typed items the caller cannot receive;
            // surface the failure but keep the frame consistent.
            frame.load_reply(reply_data.words, VecDeque::new(), VecDeque::new());
            Err(err)
        }
    }
}

/// Land a message's typed items: delegations are copied into the receive
/// window in order, translations are verified to name live objects. On
/// failure every copy made so far is removed again, so the receiver never
/// observes partial delegation.
pub(crate) fn deliver_typed(
    env: &Env,
    window: Option<CapRange>,
    typed: &[TypedItem],
) -> Result<(VecDeque<CapRange>, VecDeque<CapSel>)> {
    let mut delegated = VecDeque::new();
    let mut translated = VecDeque::new();
    let mut installed: Vec<CapSel> = Vec::new();
    let mut offset: u64 = 0;

    let result = (|| {
        for item in typed {
            match *item {
                TypedItem::Delegate(range) => {
                    let window = window.ok_or(Error::ArgsInvalid)?;
                    if offset + range.count > window.count {
                        return Err(Error::Capacity);
                    }
                    let base = window.base + offset;
                    for i in 0..range.count {
                        // Empty slots in the range transfer nothing.
                        if env.space().copy(range.base + i, base + i) {
                            installed.push(base + i);
                        }
                    }
                    delegated.push_back(CapRange::new(base, range.count));
                    offset += range.count;
                }
                TypedItem::Translate(sel) => {
                    env.space().lookup(sel)?;
                    translated.push_back(sel);
                }
            }
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok((delegated, translated)),
        Err(err) => {
            for sel in installed {
                env.space().remove(sel);
            }
            Err(err)
        }
    }
}
