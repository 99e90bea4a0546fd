//! Multi-CPU services and their client sessions.
//!
//! A service owns one portal-serving thread per provided CPU, a fixed-size
//! session table, and two selector blocks: `next_pow2(cpus)` registration
//! selectors (the delegation contract requires the power-of-two sizing) and
//! `max_sessions * cpus` session selectors. Session `slot` gets the portals
//! `caps_base + slot * cpus ..`, one per CPU, which is what lets the
//! dispatcher recover the session from the invoking selector in O(1).
//!
//! Sessions are reference counted. A dispatch holds a strong reference for
//! its whole duration, so closing a session mid-dispatch is safe: the slot
//! empties and the portals are revoked immediately, `invalidate` runs
//! exactly once, and the object itself dies only when the last reference
//! drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use spinning_top::Spinlock;

use ibex_abi::cpu::{CpuId, CpuSet};
use ibex_abi::error::ErrorCode;
use ibex_abi::protocol::ServiceCmd;
use ibex_abi::{next_pow2, CapRange, CapSel};

use crate::caps::OwnedSels;
use crate::env::Env;
use crate::error::{Error, Result};
use crate::ipc::portal::Portal;
use crate::thread::LocalThread;
use crate::utcb::UtcbFrame;

/// Per-session state attached by the concrete service.
///
/// `invalidate` runs exactly once when the service tears the session down;
/// it is the place to detach from broadcast lists and the like. The session
/// is logically dead once it returns.
pub trait SessionData: Send + Sync + 'static {
    fn invalidate(&self) {}
}

impl SessionData for () {}

/// What a session factory gets to work with.
pub struct SessionArgs {
    /// Session id; also the table slot.
    pub id: usize,
    /// Argument string the client passed to `OPEN_SESSION`.
    pub args: String,
    /// The session's per-CPU portal selectors.
    pub caps: CapRange,
}

/// Service sizing knobs.
#[derive(Debug, Clone, Copy)]
pub struct ServiceConfig {
    /// Capacity of the session table.
    pub max_sessions: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { max_sessions: 32 }
    }
}

/// The server-side half of one client session.
pub struct ServiceSession<S> {
    id: usize,
    caps: CapRange,
    invalidated: AtomicBool,
    data: S,
    /// The per-CPU portals; their selectors belong to the service's block.
    portals: Vec<Portal>,
}

impl<S: SessionData> ServiceSession<S> {
    /// Session id (also the table slot).
    pub fn id(&self) -> usize {
        self.id
    }

    /// The session's per-CPU portal selector range.
    pub fn portal_caps(&self) -> CapRange {
        self.caps
    }

    /// The attached per-session state.
    pub fn data(&self) -> &S {
        &self.data
    }

    /// Whether the service has torn this session down.
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        if self
            .invalidated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.data.invalidate();
        }
    }
}

type CreateFn<S> = Box<dyn Fn(&SessionArgs) -> Result<S> + Send + Sync>;
type DispatchFn<S> = Box<dyn Fn(&ServiceSession<S>, &mut UtcbFrame) -> Result<()> + Send + Sync>;

struct ServiceInner<S: SessionData> {
    env: Env,
    name: String,
    cpus: usize,
    max_sessions: usize,
    reg_caps: CapRange,
    caps_base: CapSel,
    /// Serializes open and close against each other.
    open_lock: Mutex<()>,
    sessions: RwLock<Vec<Option<Arc<ServiceSession<S>>>>>,
    threads: Spinlock<Vec<Option<LocalThread>>>,
    reg_portals: Spinlock<Vec<Option<Portal>>>,
    available: Spinlock<CpuSet>,
    create: CreateFn<S>,
    dispatch: DispatchFn<S>,
}

/// A named, multi-CPU service endpoint multiplexing client sessions.
pub struct Service<S: SessionData> {
    inner: Arc<ServiceInner<S>>,
}

impl<S: SessionData> Clone for Service<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: SessionData> Service<S> {
    /// Create a service skeleton: selector blocks are reserved, but no CPU
    /// serves portals until [`Service::provide_on`].
    ///
    /// `create` builds the per-session state on `OPEN_SESSION`; `dispatch`
    /// handles calls on session portals. A dispatch error clears the frame,
    /// revokes landed delegations and replies with the error code, so
    /// `dispatch` itself only writes the success reply.
    pub fn new(
        env: &Env,
        name: &str,
        config: ServiceConfig,
        create: impl Fn(&SessionArgs) -> Result<S> + Send + Sync + 'static,
        dispatch: impl Fn(&ServiceSession<S>, &mut UtcbFrame) -> Result<()> + Send + Sync + 'static,
    ) -> Result<Service<S>> {
        if config.max_sessions == 0 {
            return Err(Error::ArgsInvalid);
        }
        let cpus = env.cpu_count();
        let reg_count = next_pow2(cpus as u64);
        let reg_guard = OwnedSels::allocate(env, reg_count, reg_count)?;
        let block = (config.max_sessions * cpus) as u64;
        let block_guard = OwnedSels::allocate(env, block, next_pow2(cpus as u64))?;

        let inner = Arc::new(ServiceInner {
            env: env.clone(),
            name: name.to_string(),
            cpus,
            max_sessions: config.max_sessions,
            reg_caps: reg_guard.release(),
            caps_base: block_guard.release().base,
            open_lock: Mutex::new(()),
            sessions: RwLock::new(vec![None; config.max_sessions]),
            threads: Spinlock::new((0..cpus).map(|_| None).collect()),
            reg_portals: Spinlock::new((0..cpus).map(|_| None).collect()),
            available: Spinlock::new(CpuSet::empty()),
            create: Box::new(create),
            dispatch: Box::new(dispatch),
        });
        Ok(Service { inner })
    }

    /// The service's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The CPUs currently serving portals.
    pub fn available(&self) -> CpuSet {
        *self.inner.available.lock()
    }

    /// Spawn the CPU handler thread for `cpu`, bind its registration
    /// portal, and record the CPU as available.
    pub fn provide_on(&self, cpu: CpuId) -> Result<()> {
        let inner = &self.inner;
        if cpu >= inner.cpus {
            return Err(Error::ArgsInvalid);
        }
        if inner.threads.lock()[cpu].is_some() {
            return Err(Error::Exists);
        }

        let thread = LocalThread::spawn(&inner.env, cpu, &inner.name)?;
        // Sessions hand over a dataspace plus a semaphore.
        thread.accept_delegates(2)?;

        let weak = Arc::downgrade(inner);
        let portal = Portal::create_at(
            &inner.env,
            &thread,
            inner.reg_caps.base + cpu as u64,
            move |sel, frame| control_portal::<S>(&weak, sel, frame),
        );

        inner.threads.lock()[cpu] = Some(thread);
        inner.reg_portals.lock()[cpu] = Some(portal);
        inner.available.lock().set(cpu);
        log::debug!("service '{}' now provided on cpu {cpu}", inner.name);
        Ok(())
    }

    /// [`Service::provide_on`] for every CPU in `cpus`.
    pub fn provide(&self, cpus: &CpuSet) -> Result<()> {
        for cpu in cpus.iter() {
            self.provide_on(cpu)?;
        }
        Ok(())
    }

    /// Register with the parent's service registry under this service's
    /// name and currently provided CPU set. Idempotent on retry.
    pub fn reg(&self) -> Result<()> {
        let inner = &self.inner;
        let mut frame = UtcbFrame::new();
        frame.delegate(inner.reg_caps);
        frame.put_str(&inner.name);
        frame.put(*inner.available.lock());
        inner
            .env
            .call(inner.env.parent_pt(inner.env.current_cpu())?, &mut frame)?;
        frame.check_reply()
    }

    /// The session in `slot`, if one is live.
    pub fn get_session(&self, slot: usize) -> Option<Arc<ServiceSession<S>>> {
        self.inner.sessions.read().get(slot).and_then(|s| s.clone())
    }

    /// Snapshot of all live sessions.
    ///
    /// Each returned reference keeps its session alive even if it is
    /// removed mid-iteration; sessions opened after the snapshot are not
    /// observed.
    pub fn sessions(&self) -> Vec<Arc<ServiceSession<S>>> {
        self.inner.sessions.read().iter().flatten().cloned().collect()
    }

    /// Tear down `session`: empty its slot, revoke its portals, run
    /// `invalidate` once. Destruction is deferred until the last reference
    /// (for example an in-flight dispatch) drops.
    pub fn remove(&self, session: &Arc<ServiceSession<S>>) -> Result<()> {
        self.inner.remove_slot(session.id(), Some(session))
    }
}

impl<S: SessionData> ServiceInner<S> {
    fn new_session(this: &Arc<Self>, args: String) -> Result<Arc<ServiceSession<S>>> {
        let _guard = this.open_lock.lock();

        let slot = this
            .sessions
            .read()
            .iter()
            .position(|s| s.is_none())
            .ok_or(Error::Capacity)?;
        let caps = CapRange::new(
            this.caps_base + (slot * this.cpus) as u64,
            this.cpus as u64,
        );

        let mut portals = Vec::new();
        {
            let threads = this.threads.lock();
            for cpu in 0..this.cpus {
                if let Some(thread) = &threads[cpu] {
                    let weak = Arc::downgrade(this);
                    portals.push(Portal::create_at(
                        &this.env,
                        thread,
                        caps.base + cpu as u64,
                        move |sel, frame| session_portal::<S>(&weak, sel, frame),
                    ));
                }
            }
        }

        // If the factory fails, the portals just created unwind with it.
        let data = (this.create)(&SessionArgs {
            id: slot,
            args,
            caps,
        })?;

        let session = Arc::new(ServiceSession {
            id: slot,
            caps,
            invalidated: AtomicBool::new(false),
            data,
            portals,
        });
        this.sessions.write()[slot] = Some(session.clone());
        log::debug!("service '{}': session {slot} opened", this.name);
        Ok(session)
    }

    fn remove_slot(&self, slot: usize, expected: Option<&Arc<ServiceSession<S>>>) -> Result<()> {
        let _guard = self.open_lock.lock();
        let session = {
            let mut sessions = self.sessions.write();
            let entry = sessions.get_mut(slot).ok_or(Error::ArgsInvalid)?;
            if let (Some(current), Some(expected)) = (entry.as_ref(), expected) {
                if !Arc::ptr_eq(current, expected) {
                    return Err(Error::NotFound);
                }
            }
            entry.take().ok_or(Error::NotFound)?
        };
        // From here no lookup can return the session; kill the client's
        // portals, then run the application-level teardown exactly once.
        self.env.revoke(session.caps);
        session.invalidate();
        log::debug!("service '{}': session {slot} closed", self.name);
        Ok(())
    }
}

impl<S: SessionData> Drop for ServiceInner<S> {
    fn drop(&mut self) {
        for entry in self.sessions.get_mut().iter_mut() {
            if let Some(session) = entry.take() {
                self.env.revoke(session.caps);
                session.invalidate();
            }
        }
        // Portals before threads, both before the selector blocks return.
        for slot in self.reg_portals.lock().iter_mut() {
            *slot = None;
        }
        for slot in self.threads.lock().iter_mut() {
            *slot = None;
        }
        self.env.caps().free(self.reg_caps.base, self.reg_caps.count);
        self.env
            .caps()
            .free(self.caps_base, (self.max_sessions * self.cpus) as u64);
    }
}

/// Handler behind the registration portals: session open and close.
fn control_portal<S: SessionData>(
    weak: &Weak<ServiceInner<S>>,
    _sel: CapSel,
    frame: &mut UtcbFrame,
) {
    let Some(inner) = weak.upgrade() else {
        frame.clear();
        frame.put(ErrorCode::Abort);
        return;
    };

    let result = (|| -> Result<()> {
        match frame.get::<ServiceCmd>()? {
            ServiceCmd::OpenSession => {
                let args: String = frame.get()?;
                frame.finish_input()?;
                let session = ServiceInner::new_session(&inner, args)?;
                frame.clear();
                frame.put(ErrorCode::Success);
                frame.put(session.id() as u64);
                frame.delegate(session.portal_caps());
                Ok(())
            }
            ServiceCmd::CloseSession => {
                let slot = frame.get::<u64>()? as usize;
                frame.finish_input()?;
                inner.remove_slot(slot, None)?;
                frame.clear();
                frame.put(ErrorCode::Success);
                Ok(())
            }
        }
    })();

    if let Err(err) = result {
        frame.drop_delegations(&inner.env);
        frame.clear();
        frame.put(err.code());
    }
}

/// Handler behind every per-session portal: recover the session from the
/// invoking selector, take a read-side reference, and run the service's
/// dispatch function.
fn session_portal<S: SessionData>(
    weak: &Weak<ServiceInner<S>>,
    sel: CapSel,
    frame: &mut UtcbFrame,
) {
    let Some(inner) = weak.upgrade() else {
        frame.clear();
        frame.put(ErrorCode::Abort);
        return;
    };

    let slot = ((sel - inner.caps_base) / inner.cpus as u64) as usize;
    let session = inner.sessions.read().get(slot).and_then(|s| s.clone());
    let result = match session {
        // The reference is held across the whole dispatch; a concurrent
        // remove cannot free the session under us.
        Some(session) => (inner.dispatch)(&session, frame),
        None => Err(Error::ArgsInvalid),
    };

    if let Err(err) = result {
        frame.drop_delegations(&inner.env);
        frame.clear();
        frame.put(err.code());
    }
}
