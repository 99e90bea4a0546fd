//! Dataspace descriptors.
//!
//! A dataspace is a named, shareable memory region. The descriptor travels
//! over the wire during the create/join round-trips with the parent and is
//! refined by the parent (sizes rounded, addresses filled in).

use core::fmt;

use crate::wire::{Wire, WireError, WordReader, WordWriter};

/// Page size all dataspace sizes are rounded up to.
pub const PAGE_SIZE: usize = 4096;

/// Backing type of a dataspace.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsType {
    /// Plain anonymous memory.
    Anonymous = 0,
    /// Memory pinned to stable physical frames.
    Locked = 1,
    /// A virtual region without backing until faulted.
    Virtual = 2,
}

impl DsType {
    fn from_word(word: u64) -> Result<Self, WireError> {
        match word {
            0 => Ok(Self::Anonymous),
            1 => Ok(Self::Locked),
            2 => Ok(Self::Virtual),
            _ => Err(WireError::InvalidValue),
        }
    }
}

bitflags::bitflags! {
    /// Access permissions of a dataspace mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Perm: u64 {
        /// Readable.
        const R = 1;
        /// Writable.
        const W = 2;
        /// Executable.
        const X = 4;
    }
}

impl Perm {
    /// Read/write, the common case for shared rings.
    pub const RW: Perm = Perm::R.union(Perm::W);
}

/// Descriptor of a dataspace: what to create, or what was created.
///
/// `virt`, `phys` and `origin` are zero in a request and filled in by the
/// parent in the reply. `origin` records the mapping source, which is what
/// a later `switch_to` exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataspaceDesc {
    /// Size in bytes; always a page multiple once refined.
    pub size: usize,
    /// Backing type.
    pub ty: DsType,
    /// Access permissions.
    pub perms: Perm,
    /// Physical address (pinned types only).
    pub phys: u64,
    /// Virtual address of the mapping; stable for the mapping's life.
    pub virt: u64,
    /// Mapping source, exchanged by `switch_to`.
    pub origin: u64,
    /// Requested alignment of the backing, as a power of two (0 = default).
    pub align: u64,
}

impl DataspaceDesc {
    /// Descriptor for a fresh anonymous region of `size` bytes.
    pub fn anonymous(size: usize, perms: Perm) -> Self {
        Self {
            size,
            ty: DsType::Anonymous,
            perms,
            phys: 0,
            virt: 0,
            origin: 0,
            align: 0,
        }
    }

    /// Size rounded up to the next page multiple.
    pub fn page_size(&self) -> usize {
        self.size.div_ceil(PAGE_SIZE) * PAGE_SIZE
    }
}

impl fmt::Display for DataspaceDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ds[size={:#x} ty={:?} perms={:?} virt={:#x} origin={:#x}]",
            self.size, self.ty, self.perms, self.virt, self.origin
        )
    }
}

impl Wire for DataspaceDesc {
    fn put(&self, w: &mut WordWriter<'_>) {
        w.push(self.size as u64);
        w.push(self.ty as u64);
        w.push(self.perms.bits());
        w.push(self.phys);
        w.push(self.virt);
        w.push(self.origin);
        w.push(self.align);
    }

    fn get(r: &mut WordReader<'_>) -> Result<Self, WireError> {
        let size = r.pop()? as usize;
        let ty = DsType::from_word(r.pop()?)?;
        let perms = Perm::from_bits(r.pop()?).ok_or(WireError::InvalidValue)?;
        let phys = r.pop()?;
        let virt = r.pop()?;
        let origin = r.pop()?;
        let align = r.pop()?;
        Ok(Self {
            size,
            ty,
            perms,
            phys,
            virt,
            origin,
            align,
        })
    }
}
