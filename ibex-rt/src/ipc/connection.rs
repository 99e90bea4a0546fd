//! Client side of a service session.
//!
//! A [`Connection`] resolves a service name through the parent registry to
//! the registration portal covering the caller's CPU. A [`ClientSession`]
//! opened over it receives one portal selector per CPU and talks to the
//! service through them; dropping the session closes it.

use ibex_abi::cpu::{CpuId, CpuSet};
use ibex_abi::protocol::{ParentCmd, ServiceCmd, SessionCmd};
use ibex_abi::{next_pow2, CapRange, CapSel};

use crate::caps::OwnedSels;
use crate::env::Env;
use crate::error::Result;
use crate::ipc::portal::Portal;
use crate::mem::Dataspace;
use crate::sync::Sm;
use crate::utcb::UtcbFrame;

/// A resolved service name.
pub struct Connection {
    env: Env,
    name: String,
    cpus: CpuSet,
    reg_pt: Portal,
}

impl Connection {
    /// Resolve `name` for the calling CPU.
    ///
    /// Fails with [`Error::NotFound`](crate::Error::NotFound) when the
    /// service is unknown or does not cover this CPU.
    pub fn open(env: &Env, name: &str) -> Result<Connection> {
        let guard = OwnedSels::allocate(env, 1, 1)?;
        let mut frame = UtcbFrame::new();
        frame.put(ParentCmd::SvcLookup);
        frame.put_str(name);
        frame.set_window(guard.range());
        env.call(env.parent_pt(env.current_cpu())?, &mut frame)?;
        frame.check_reply()?;
        let cpus: CpuSet = frame.get()?;
        let _landed = frame.take_delegated()?;
        let range = guard.release();

        Ok(Connection {
            env: env.clone(),
            name: name.to_string(),
            cpus,
            reg_pt: Portal::attach_owned(env, range.base),
        })
    }

    /// The resolved service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The CPUs the service covers.
    pub fn cpus(&self) -> CpuSet {
        self.cpus
    }

    pub(crate) fn env(&self) -> &Env {
        &self.env
    }

    pub(crate) fn reg_pt(&self) -> &Portal {
        &self.reg_pt
    }
}

/// An open session with a service.
pub struct ClientSession {
    env: Env,
    id: u64,
    /// The allocated receive window (freed on drop).
    window: CapRange,
    /// The per-CPU portal selectors inside the window.
    caps: CapRange,
    /// Own copy of the registration portal, for closing.
    reg: Portal,
    closed: bool,
}

impl ClientSession {
    /// Open a session, passing `args` to the service's session factory.
    /// The reply delegates one portal per CPU into a freshly allocated
    /// window.
    pub fn open(conn: &Connection, args: &str) -> Result<ClientSession> {
        let env = conn.env();
        let cpus = env.cpu_count() as u64;
        let wsize = next_pow2(cpus);
        let guard = OwnedSels::allocate(env, wsize, wsize)?;

        let mut frame = UtcbFrame::new();
        frame.put(ServiceCmd::OpenSession);
        frame.put_str(args);
        frame.set_window(guard.range());
        conn.reg_pt().call(&mut frame)?;
        frame.check_reply()?;
        let id: u64 = frame.get()?;
        let _landed = frame.take_delegated()?;

        let reg_sel = env.caps().allocate(1, 1)?;
        env.space().copy(conn.reg_pt().sel(), reg_sel);
        let window = guard.release();

        Ok(ClientSession {
            env: env.clone(),
            id,
            window,
            caps: CapRange::new(window.base, cpus),
            reg: Portal::attach_owned(env, reg_sel),
            closed: false,
        })
    }

    /// The session id assigned by the service.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The portal selector for `cpu`.
    pub fn portal_sel(&self, cpu: CpuId) -> CapSel {
        self.caps.base + cpu as u64
    }

    /// Invoke the session portal for the calling CPU.
    pub fn call(&self, frame: &mut UtcbFrame) -> Result<()> {
        self.call_on(self.env.current_cpu(), frame)
    }

    /// Invoke the session portal for a specific CPU.
    pub fn call_on(&self, cpu: CpuId, frame: &mut UtcbFrame) -> Result<()> {
        self.env.call(self.portal_sel(cpu), frame)
    }

    /// Delegate a dataspace (and optionally a semaphore) to the service so
    /// it can build its side of a shared ring.
    pub fn share_dataspace(&self, ds: &Dataspace, sm: Option<&Sm>) -> Result<()> {
        let mut frame = UtcbFrame::new();
        frame.put(SessionCmd::SHARE_DATASPACE);
        frame.delegate(CapRange::new(ds.map_sel(), 1));
        if let Some(sm) = sm {
            frame.delegate(CapRange::new(sm.sel(), 1));
        }
        self.call(&mut frame)?;
        frame.check_reply()
    }

    /// Close the session explicitly, surfacing any error.
    pub fn close(mut self) -> Result<()> {
        self.do_close()
    }

    fn do_close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut frame = UtcbFrame::new();
        frame.put(ServiceCmd::CloseSession);
        frame.put(self.id);
        self.reg.call(&mut frame)?;
        frame.check_reply()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Err(err) = self.do_close() {
            log::debug!("session {} teardown: {err}", self.id);
        }
        for sel in self.window.base..self.window.end() {
            self.env.space().remove(sel);
        }
        self.env.caps().free(self.window.base, self.window.count);
    }
}
