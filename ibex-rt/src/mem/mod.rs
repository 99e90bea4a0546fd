//! Dataspaces: shared memory with parent-managed lifecycle.
//!
//! A [`Dataspace`] represents a mapped shared-memory region identified by
//! two capabilities: the *map* selector, which is what gets delegated to
//! peers, and the *unmap* selector, which is retained as proof of ownership
//! for destroy and switch operations. Creation, joining, switching and
//! destruction are all round-trips through the current CPU's parent portal.
//!
//! Ownership moves with the Rust value: moving a `Dataspace` transfers the
//! destroy-on-drop responsibility, and [`Dataspace::destroy`] consumes the
//! value.

mod region;

pub(crate) use region::Region;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use spinning_top::Spinlock;

use ibex_abi::dataspace::{DataspaceDesc, DsType, Perm};
use ibex_abi::protocol::ParentCmd;
use ibex_abi::{CapRange, CapSel};

use crate::caps::{Dispose, OwnedSels};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::utcb::UtcbFrame;

/// Parent-side record of a backing region.
pub(crate) struct RegionRec {
    pub region: Arc<Region>,
    /// Mapping source; exchanged by switch operations.
    pub origin: AtomicU64,
    /// Currently faulted-in permissions of the mapping.
    pub perms: Spinlock<Perm>,
}

/// Which operation a selector authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DsRole {
    Map,
    Unmap,
}

/// One attachment of a region to the process.
pub(crate) struct DsAttach {
    pub attach_id: u64,
    pub size: usize,
    pub ty: DsType,
    pub align: u64,
    /// Granted permissions; stable for the attachment's life. The
    /// currently faulted-in state lives in the region record.
    pub perms: Perm,
    pub rec: Arc<RegionRec>,
}

impl DsAttach {
    /// The descriptor as the parent currently sees this attachment.
    pub fn desc(&self) -> DataspaceDesc {
        DataspaceDesc {
            size: self.size,
            ty: self.ty,
            perms: self.perms,
            phys: match self.ty {
                DsType::Locked => self.rec.region.base_addr(),
                _ => 0,
            },
            virt: self.rec.region.base_addr(),
            origin: self.rec.origin.load(Ordering::Acquire),
            align: self.align,
        }
    }
}

/// Kernel object behind a dataspace selector.
pub(crate) struct DsHandle {
    pub role: DsRole,
    pub attach: Arc<DsAttach>,
    revoked: AtomicBool,
}

impl DsHandle {
    pub fn new(role: DsRole, attach: Arc<DsAttach>) -> Arc<Self> {
        Arc::new(Self {
            role,
            attach,
            revoked: AtomicBool::new(false),
        })
    }

    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }
}

/// A mapped shared-memory region with parent-managed lifecycle.
pub struct Dataspace {
    env: Env,
    desc: DataspaceDesc,
    map_sel: CapSel,
    unmap_sel: CapSel,
    region: Arc<Region>,
    dispose: Dispose,
}

impl Dataspace {
    /// Create a fresh dataspace described by `desc`.
    ///
    /// The parent allocates backing memory, refines the descriptor (page
    /// rounding, addresses) and delegates the map and unmap capabilities
    /// back. On any failure the allocated selectors are freed before the
    /// error propagates.
    pub fn create(env: &Env, desc: DataspaceDesc) -> Result<Dataspace> {
        let sels = OwnedSels::allocate(env, 2, 2)?;

        let mut frame = UtcbFrame::new();
        frame.put(ParentCmd::DsCreate);
        frame.put(desc);
        frame.set_window(sels.range());
        env.call(env.parent_pt(env.current_cpu())?, &mut frame)?;
        frame.check_reply()?;

        let desc: DataspaceDesc = frame.get()?;
        let _landed = frame.take_delegated()?;
        let range = sels.release();

        let handle = env.space().dataspace(range.base)?;
        Ok(Dataspace {
            env: env.clone(),
            desc,
            map_sel: range.base,
            unmap_sel: range.base + 1,
            region: handle.attach.rec.region.clone(),
            dispose: Dispose::Free,
        })
    }

    /// Create an anonymous read/write dataspace of `size` bytes.
    pub fn create_anonymous(env: &Env, size: usize, perms: Perm) -> Result<Dataspace> {
        Self::create(env, DataspaceDesc::anonymous(size, perms))
    }

    /// Attach to an existing dataspace given only its map selector
    /// (typically one that just landed in a receive window).
    ///
    /// The selector is adopted (copied to an owned selector) before the
    /// round-trip, so window reuse by later calls cannot invalidate it.
    pub fn join(env: &Env, sel: CapSel) -> Result<Dataspace> {
        let sels = OwnedSels::allocate(env, 2, 2)?;
        if !env.space().copy(sel, sels.base()) {
            return Err(Error::Abort);
        }

        let result = (|| {
            let mut frame = UtcbFrame::new();
            frame.put(ParentCmd::DsJoin);
            frame.translate(sels.base());
            frame.set_window(CapRange::new(sels.base() + 1, 1));
            env.call(env.parent_pt(env.current_cpu())?, &mut frame)?;
            frame.check_reply()?;
            let desc: DataspaceDesc = frame.get()?;
            let _landed = frame.take_delegated()?;
            Ok(desc)
        })();

        match result {
            Ok(desc) => {
                let range = sels.release();
                let handle = env.space().dataspace(range.base)?;
                Ok(Dataspace {
                    env: env.clone(),
                    desc,
                    map_sel: range.base,
                    unmap_sel: range.base + 1,
                    region: handle.attach.rec.region.clone(),
                    dispose: Dispose::Free,
                })
            }
            Err(err) => {
                env.space().remove(sels.base());
                Err(err)
            }
        }
    }

    /// The refined descriptor.
    pub fn desc(&self) -> &DataspaceDesc {
        &self.desc
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.desc.size
    }

    /// Virtual address of the mapping; stable for this dataspace's life.
    pub fn virt(&self) -> u64 {
        self.region.base_addr()
    }

    /// The selector delegated to peers for joining.
    pub fn map_sel(&self) -> CapSel {
        self.map_sel
    }

    /// The selector retained for destroy and switch operations.
    pub fn unmap_sel(&self) -> CapSel {
        self.unmap_sel
    }

    /// The permissions currently faulted into the mapping.
    pub fn mapped_perms(&self) -> Result<Perm> {
        let handle = self.env.space().dataspace(self.map_sel)?;
        let perms = *handle.attach.rec.perms.lock();
        Ok(perms)
    }

    /// Fault the descriptor's permissions back into the mapping (after a
    /// switch reset them).
    pub fn touch(&self) -> Result<()> {
        let handle = self.env.space().dataspace(self.map_sel)?;
        *handle.attach.rec.perms.lock() = self.desc.perms;
        Ok(())
    }

    /// Atomically exchange the backing origin of this dataspace with
    /// `other`. Both must be owned by the caller and equally sized; all
    /// mapped permissions reset to empty, forcing re-faulting.
    pub fn switch_to(&mut self, other: &mut Dataspace) -> Result<()> {
        let mut frame = UtcbFrame::new();
        frame.put(ParentCmd::DsSwitch);
        frame.translate(self.unmap_sel);
        frame.translate(other.unmap_sel);
        self.env
            .call(self.env.parent_pt(self.env.current_cpu())?, &mut frame)?;
        frame.check_reply()?;
        self.desc = frame.get()?;
        other.desc = frame.get()?;
        Ok(())
    }

    /// Destroy the dataspace: the parent revokes both capabilities and
    /// frees the backing memory once the last attachment is gone.
    pub fn destroy(mut self) -> Result<()> {
        self.do_destroy()
    }

    fn do_destroy(&mut self) -> Result<()> {
        let mut frame = UtcbFrame::new();
        frame.put(ParentCmd::DsDestroy);
        frame.translate(self.unmap_sel);
        self.env
            .call(self.env.parent_pt(self.env.current_cpu())?, &mut frame)?;
        frame.check_reply()?;

        // The parent revoked the attachment's own selectors; an adopted map
        // copy (join case) is ours to drop, and both selectors return to
        // the allocator either way.
        self.env.space().remove(self.map_sel);
        self.env.caps().free(self.map_sel, 2);
        self.dispose = Dispose::Keep;
        Ok(())
    }

    /// Copy `data` into the mapping at byte offset `off`.
    pub fn write_bytes(&self, off: usize, data: &[u8]) {
        self.region.write_bytes(off, data);
    }

    /// Copy `len` bytes out of the mapping at byte offset `off`.
    pub fn read_bytes(&self, off: usize, len: usize) -> Vec<u8> {
        self.region.read_bytes(off, len)
    }

    pub(crate) fn region(&self) -> &Arc<Region> {
        &self.region
    }
}

impl Drop for Dataspace {
    fn drop(&mut self) {
        if self.dispose == Dispose::Free {
            if let Err(err) = self.do_destroy() {
                log::debug!("dataspace teardown failed: {err}");
            }
        }
    }
}
