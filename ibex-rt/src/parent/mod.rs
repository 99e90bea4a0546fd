//! The parent: service registry and dataspace manager.
//!
//! The parent serves one well-known registration portal per logical CPU.
//! Services register their name, CPU set and registration portals through
//! it; clients resolve names through it; and every dataspace lifecycle
//! operation (create, join, switch, destroy) is a round-trip through it.
//!
//! Backing regions are kept in a treap keyed by their base address, which
//! gives O(log n) containment queries when validating requested placements.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread::JoinHandle;

use spinning_top::Spinlock;
use treap::Treap;

use ibex_abi::cpu::CpuSet;
use ibex_abi::dataspace::{DataspaceDesc, Perm};
use ibex_abi::error::ErrorCode;
use ibex_abi::protocol::ParentCmd;
use ibex_abi::{next_pow2, CapRange};

use crate::env::Env;
use crate::error::{Error, Result};
use crate::ipc::portal::{self, PortalFn};
use crate::mem::{DsAttach, DsHandle, DsRole, Region, RegionRec};
use crate::space::KObject;
use crate::thread::{spawn_worker, LtShared};
use crate::utcb::UtcbFrame;

/// A registered service.
struct SvcEntry {
    /// Parent-owned copies of the service's registration portals, indexed
    /// by CPU.
    regs: CapRange,
    cpus: CpuSet,
}

/// One region of backing memory.
struct RegionEntry {
    rec: Arc<RegionRec>,
    /// Attachments alive on this region.
    refs: usize,
}

/// One attachment's bookkeeping.
struct AttachEntry {
    /// Parent-issued selectors to revoke on destroy.
    sels: CapRange,
    region_key: u64,
}

struct MemState {
    regions: Treap<u64, RegionEntry>,
    attachments: BTreeMap<u64, AttachEntry>,
    next_attach: u64,
}

/// Parent-side registries.
pub(crate) struct Parent {
    services: Spinlock<BTreeMap<String, SvcEntry>>,
    mem: Spinlock<MemState>,
}

impl Parent {
    pub fn new() -> Self {
        Self {
            services: Spinlock::new(BTreeMap::new()),
            mem: Spinlock::new(MemState {
                regions: Treap::new(),
                attachments: BTreeMap::new(),
                next_attach: 1,
            }),
        }
    }
}

/// The parent's running machinery: portal workers, one per CPU.
pub(crate) struct ParentRt {
    shareds: Vec<Arc<LtShared>>,
    handles: Vec<JoinHandle<()>>,
}

impl ParentRt {
    pub fn shutdown(self) {
        for shared in &self.shareds {
            shared.stop();
        }
        for handle in self.handles {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Bring up the parent workers and portals for `env`.
pub(crate) fn boot(env: &Env) -> Result<()> {
    let cpus = env.cpu_count();
    let window = next_pow2(cpus as u64);
    let mut pts = Vec::with_capacity(cpus);
    let mut shareds = Vec::with_capacity(cpus);
    let mut handles = Vec::with_capacity(cpus);

    for cpu in 0..cpus {
        let shared = LtShared::new(cpu);
        let wbase = env.caps().allocate(window, window)?;
        shared.set_window(Some(CapRange::new(wbase, window)));

        let pt_sel = env.caps().allocate(1, 1)?;
        let weak = env.downgrade();
        let func: PortalFn = Arc::new(move |_id, frame| {
            match weak.upgrade() {
                Some(inner) => handle_portal(&Env::from_inner(inner), frame),
                None => {
                    frame.clear();
                    frame.put(ErrorCode::Abort);
                }
            }
        });
        portal::install_raw(env, &shared, pt_sel, func);
        handles.push(spawn_worker(
            env.downgrade(),
            shared.clone(),
            format!("parent@cpu{cpu}"),
        )?);
        shareds.push(shared);
        pts.push(pt_sel);
    }

    env.set_parent_rt(pts, ParentRt { shareds, handles });
    Ok(())
}

/// Entry point of every parent portal: dispatch on the command tag and
/// guarantee the error-reply contract (window dropped, frame cleared).
fn handle_portal(env: &Env, frame: &mut UtcbFrame) {
    if let Err(err) = dispatch(env, frame) {
        frame.drop_delegations(env);
        frame.clear();
        frame.put(err.code());
    }
}

fn dispatch(env: &Env, frame: &mut UtcbFrame) -> Result<()> {
    let cmd: ParentCmd = frame.get()?;
    match cmd {
        ParentCmd::SvcRegister => svc_register(env, frame),
        ParentCmd::SvcLookup => svc_lookup(env, frame),
        ParentCmd::DsCreate => ds_create(env, frame),
        ParentCmd::DsJoin => ds_join(env, frame),
        ParentCmd::DsSwitch => ds_switch(env, frame),
        ParentCmd::DsDestroy => ds_destroy(env, frame),
    }
}

// ---------------------------------------------------------------------------
// Service registry
// ---------------------------------------------------------------------------

fn svc_register(env: &Env, frame: &mut UtcbFrame) -> Result<()> {
    let landed = frame.take_delegated()?;
    let name: String = frame.get()?;
    let cpus: CpuSet = frame.get()?;
    frame.finish_input()?;

    if cpus.is_empty() || landed.count < next_pow2(env.cpu_count() as u64) {
        return Err(Error::ArgsInvalid);
    }

    let parent = env.parent();
    let mut services = parent.services.lock();
    match services.get(&name) {
        Some(existing) => {
            // Idempotent per name: re-registering the same portals with
            // the same CPU set succeeds; anything else collides.
            if existing.cpus != cpus || !same_portals(env, existing.regs, landed, &cpus) {
                return Err(Error::Exists);
            }
            log::debug!("service '{name}' re-registered");
        }
        None => {
            // Adopt the landed portals; the window is reused by later
            // calls, the registry entry is not.
            let base = env.caps().allocate(landed.count, landed.count)?;
            for i in 0..landed.count {
                env.space().copy(landed.base + i, base + i);
            }
            log::debug!("service '{name}' registered for {cpus}");
            services.insert(
                name,
                SvcEntry {
                    regs: CapRange::new(base, landed.count),
                    cpus,
                },
            );
        }
    }

    frame.clear();
    frame.put(ErrorCode::Success);
    Ok(())
}

/// Whether the already registered portals and the landed ones are the same
/// kernel objects, compared by identity on the first covered CPU.
fn same_portals(env: &Env, regs: CapRange, landed: CapRange, cpus: &CpuSet) -> bool {
    let Some(cpu) = cpus.iter().next() else {
        return false;
    };
    let a = env.space().portal(regs.base + cpu as u64);
    let b = env.space().portal(landed.base + cpu as u64);
    match (a, b) {
        (Ok(a), Ok(b)) => Arc::ptr_eq(&a, &b),
        _ => false,
    }
}

fn svc_lookup(env: &Env, frame: &mut UtcbFrame) -> Result<()> {
    let name: String = frame.get()?;
    frame.finish_input()?;

    let cpu = env.current_cpu();
    let parent = env.parent();
    let services = parent.services.lock();
    let entry = services.get(&name).ok_or(Error::NotFound)?;
    if !entry.cpus.contains(cpu) {
        return Err(Error::NotFound);
    }
    let sel = entry.regs.base + cpu as u64;
    let cpus = entry.cpus;
    drop(services);

    frame.clear();
    frame.put(ErrorCode::Success);
    frame.put(cpus);
    frame.delegate(CapRange::new(sel, 1));
    Ok(())
}

// ---------------------------------------------------------------------------
// Dataspace manager
// ---------------------------------------------------------------------------

fn ds_create(env: &Env, frame: &mut UtcbFrame) -> Result<()> {
    let desc: DataspaceDesc = frame.get()?;
    frame.finish_input()?;

    if desc.size == 0 || (desc.align != 0 && !desc.align.is_power_of_two()) {
        return Err(Error::ArgsInvalid);
    }

    let parent = env.parent();
    let mut mem = parent.mem.lock();

    // A requested placement must not fall into an existing region.
    if desc.virt != 0 {
        if let Some((_, entry)) = mem.regions.get_floor(&desc.virt) {
            let base = entry.rec.region.base_addr();
            if desc.virt < base + entry.rec.region.len() as u64 {
                return Err(Error::Exists);
            }
        }
    }

    let size = desc.page_size();
    let region = Region::new(size);
    let rec = Arc::new(RegionRec {
        region: region.clone(),
        origin: AtomicU64::new(region.base_addr()),
        perms: Spinlock::new(desc.perms),
    });

    let sels = env.caps().allocate(2, 2)?;
    let attach_id = mem.next_attach;
    mem.next_attach += 1;
    let attach = Arc::new(DsAttach {
        attach_id,
        size,
        ty: desc.ty,
        align: desc.align,
        perms: desc.perms,
        rec: rec.clone(),
    });
    env.space()
        .install(sels, KObject::Dataspace(DsHandle::new(DsRole::Map, attach.clone())));
    env.space().install(
        sels + 1,
        KObject::Dataspace(DsHandle::new(DsRole::Unmap, attach.clone())),
    );

    mem.regions
        .insert(region.base_addr(), RegionEntry { rec, refs: 1 });
    mem.attachments.insert(
        attach_id,
        AttachEntry {
            sels: CapRange::new(sels, 2),
            region_key: region.base_addr(),
        },
    );
    log::debug!("created dataspace {} ({} bytes)", attach_id, size);

    frame.clear();
    frame.put(ErrorCode::Success);
    frame.put(attach.desc());
    frame.delegate(CapRange::new(sels, 2));
    Ok(())
}

fn ds_join(env: &Env, frame: &mut UtcbFrame) -> Result<()> {
    let sel = frame.take_translated()?;
    frame.finish_input()?;

    let handle = env.space().dataspace(sel)?;
    if handle.role != DsRole::Map {
        return Err(Error::ArgsInvalid);
    }

    let parent = env.parent();
    let mut mem = parent.mem.lock();
    let region_key = handle.attach.rec.region.base_addr();
    if mem.regions.get(&region_key).is_none() {
        return Err(Error::NotFound);
    }

    let unmap_sel = env.caps().allocate(1, 1)?;
    let attach_id = mem.next_attach;
    mem.next_attach += 1;
    let attach = Arc::new(DsAttach {
        attach_id,
        size: handle.attach.size,
        ty: handle.attach.ty,
        align: handle.attach.align,
        perms: handle.attach.perms,
        rec: handle.attach.rec.clone(),
    });
    env.space().install(
        unmap_sel,
        KObject::Dataspace(DsHandle::new(DsRole::Unmap, attach.clone())),
    );

    mem.regions
        .get_mut(&region_key)
        .expect("region checked above")
        .refs += 1;
    mem.attachments.insert(
        attach_id,
        AttachEntry {
            sels: CapRange::new(unmap_sel, 1),
            region_key,
        },
    );
    log::debug!("joined dataspace region {region_key:#x} as {attach_id}");

    frame.clear();
    frame.put(ErrorCode::Success);
    frame.put(attach.desc());
    frame.delegate(CapRange::new(unmap_sel, 1));
    Ok(())
}

fn ds_switch(env: &Env, frame: &mut UtcbFrame) -> Result<()> {
    let sel_a = frame.take_translated()?;
    let sel_b = frame.take_translated()?;
    frame.finish_input()?;

    let a = env.space().dataspace(sel_a)?;
    let b = env.space().dataspace(sel_b)?;
    if a.role != DsRole::Unmap || b.role != DsRole::Unmap {
        return Err(Error::ArgsInvalid);
    }
    let ra = &a.attach.rec;
    let rb = &b.attach.rec;
    if Arc::ptr_eq(ra, rb) || ra.region.len() != rb.region.len() {
        return Err(Error::ArgsInvalid);
    }

    let parent = env.parent();
    let mem = parent.mem.lock();
    ra.region.swap_contents(&rb.region);
    let oa = ra.origin.load(std::sync::atomic::Ordering::Acquire);
    let ob = rb.origin.load(std::sync::atomic::Ordering::Acquire);
    ra.origin.store(ob, std::sync::atomic::Ordering::Release);
    rb.origin.store(oa, std::sync::atomic::Ordering::Release);
    // All pages lose their permissions; both sides fault them back in.
    *ra.perms.lock() = Perm::empty();
    *rb.perms.lock() = Perm::empty();
    drop(mem);

    frame.clear();
    frame.put(ErrorCode::Success);
    frame.put(a.attach.desc());
    frame.put(b.attach.desc());
    Ok(())
}

fn ds_destroy(env: &Env, frame: &mut UtcbFrame) -> Result<()> {
    let sel = frame.take_translated()?;
    frame.finish_input()?;

    let handle = env.space().dataspace(sel)?;
    if handle.role != DsRole::Unmap {
        return Err(Error::ArgsInvalid);
    }

    let parent = env.parent();
    let mut mem = parent.mem.lock();
    let entry = mem
        .attachments
        .remove(&handle.attach.attach_id)
        .ok_or(Error::NotFound)?;

    env.space().revoke(entry.sels);
    env.caps().free(entry.sels.base, entry.sels.count);

    let last = {
        let region = mem
            .regions
            .get_mut(&entry.region_key)
            .expect("attachment without region");
        region.refs -= 1;
        region.refs == 0
    };
    if last {
        mem.regions.remove(&entry.region_key);
        log::debug!("freed dataspace region {:#x}", entry.region_key);
    }

    frame.clear();
    frame.put(ErrorCode::Success);
    Ok(())
}
