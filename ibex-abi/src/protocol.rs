//! Command tags for the well-known portal protocols.
//!
//! The first untyped word of every request names a command; the remaining
//! untyped words and the typed (delegated/translated) items are
//! command-specific. Replies always begin with an
//! [`ErrorCode`](crate::error::ErrorCode).

use crate::wire::{Wire, WireError, WordReader, WordWriter};

/// Commands understood by a service's registration portals.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCmd {
    /// Open a session: request carries an argument string, reply delegates
    /// one portal selector per covered CPU.
    OpenSession = 0,
    /// Close a session: request carries the session id.
    CloseSession = 1,
}

impl Wire for ServiceCmd {
    fn put(&self, w: &mut WordWriter<'_>) {
        w.push(*self as u64);
    }

    fn get(r: &mut WordReader<'_>) -> Result<Self, WireError> {
        match r.pop()? {
            0 => Ok(Self::OpenSession),
            1 => Ok(Self::CloseSession),
            _ => Err(WireError::InvalidValue),
        }
    }
}

/// Standard first-word tags used on per-session portals.
///
/// Services are free to define further tags above
/// [`SessionCmd::FIRST_CUSTOM`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCmd;

impl SessionCmd {
    /// Client delegates a dataspace (and optionally a semaphore) so the
    /// service can build its side of a shared ring.
    pub const SHARE_DATASPACE: u64 = 0;
    /// First tag value available to concrete services.
    pub const FIRST_CUSTOM: u64 = 16;
}

/// Commands understood by the parent's per-CPU registration portals.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentCmd {
    /// Register a service: delegates the registration selector range and
    /// carries `(name, cpu set)`.
    SvcRegister = 0,
    /// Resolve a service name to the asking CPU's registration portal.
    SvcLookup = 1,
    /// Create a dataspace from a descriptor.
    DsCreate = 2,
    /// Join an existing dataspace by its map selector.
    DsJoin = 3,
    /// Atomically exchange the backing origins of two dataspaces.
    DsSwitch = 4,
    /// Destroy an attachment by its unmap selector.
    DsDestroy = 5,
}

impl Wire for ParentCmd {
    fn put(&self, w: &mut WordWriter<'_>) {
        w.push(*self as u64);
    }

    fn get(r: &mut WordReader<'_>) -> Result<Self, WireError> {
        match r.pop()? {
            0 => Ok(Self::SvcRegister),
            1 => Ok(Self::SvcLookup),
            2 => Ok(Self::DsCreate),
            3 => Ok(Self::DsJoin),
            4 => Ok(Self::DsSwitch),
            5 => Ok(Self::DsDestroy),
            _ => Err(WireError::InvalidValue),
        }
    }
}
