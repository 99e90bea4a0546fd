//! The in-process kernel object space.
//!
//! Maps capability selectors to kernel objects. Delegation copies an entry
//! to another selector; revocation marks the object dead for every holder
//! (the recursive revoke of the delegation tree collapses to marking the
//! shared object), while a plain remove only drops one selector's entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use spinning_top::Spinlock;

use ibex_abi::{CapRange, CapSel};

use crate::error::{Error, Result};
use crate::ipc::portal::PortalObj;
use crate::mem::DsHandle;
use crate::sync::SemObj;

/// A kernel object reachable through a selector.
#[derive(Clone)]
pub(crate) enum KObject {
    Portal(Arc<PortalObj>),
    Sem(Arc<SemObj>),
    Dataspace(Arc<DsHandle>),
}

impl KObject {
    fn mark_revoked(&self) {
        match self {
            KObject::Portal(p) => p.revoke(),
            KObject::Sem(s) => s.revoke(),
            KObject::Dataspace(d) => d.revoke(),
        }
    }

    fn is_revoked(&self) -> bool {
        match self {
            KObject::Portal(p) => p.is_revoked(),
            KObject::Sem(s) => s.is_revoked(),
            KObject::Dataspace(d) => d.is_revoked(),
        }
    }
}

/// Selector-indexed object table.
pub(crate) struct ObjSpace {
    map: Spinlock<BTreeMap<CapSel, KObject>>,
}

impl ObjSpace {
    pub fn new() -> Self {
        Self {
            map: Spinlock::new(BTreeMap::new()),
        }
    }

    /// Install `obj` at `sel`, replacing whatever was there (receive
    /// windows are reused across calls).
    pub fn install(&self, sel: CapSel, obj: KObject) {
        self.map.lock().insert(sel, obj);
    }

    /// Look up the object behind `sel`; revoked or absent selectors fail
    /// with [`Error::Abort`].
    pub fn lookup(&self, sel: CapSel) -> Result<KObject> {
        let obj = self.map.lock().get(&sel).cloned().ok_or(Error::Abort)?;
        if obj.is_revoked() {
            return Err(Error::Abort);
        }
        Ok(obj)
    }

    /// Copy the entry at `src` to `dst` (the delegation primitive).
    ///
    /// Copying an empty or dead selector transfers nothing and clears
    /// `dst`, so a reused receive window never shows a stale entry.
    pub fn copy(&self, src: CapSel, dst: CapSel) -> bool {
        match self.lookup(src) {
            Ok(obj) => {
                self.map.lock().insert(dst, obj);
                true
            }
            Err(_) => {
                self.map.lock().remove(&dst);
                false
            }
        }
    }

    /// Drop the entry at `sel` without touching the object. Idempotent.
    pub fn remove(&self, sel: CapSel) {
        self.map.lock().remove(&sel);
    }

    /// Revoke every selector in `range`: entries are removed and the
    /// objects behind them are marked dead for all remaining holders.
    pub fn revoke(&self, range: CapRange) {
        let mut map = self.map.lock();
        for sel in range.base..range.end() {
            if let Some(obj) = map.remove(&sel) {
                obj.mark_revoked();
            }
        }
    }

    /// Typed lookup of a portal.
    pub fn portal(&self, sel: CapSel) -> Result<Arc<PortalObj>> {
        match self.lookup(sel)? {
            KObject::Portal(p) => Ok(p),
            _ => Err(Error::ArgsInvalid),
        }
    }

    /// Typed lookup of a semaphore.
    pub fn sem(&self, sel: CapSel) -> Result<Arc<SemObj>> {
        match self.lookup(sel)? {
            KObject::Sem(s) => Ok(s),
            _ => Err(Error::ArgsInvalid),
        }
    }

    /// Typed lookup of a dataspace handle.
    pub fn dataspace(&self, sel: CapSel) -> Result<Arc<DsHandle>> {
        match self.lookup(sel)? {
            KObject::Dataspace(d) => Ok(d),
            _ => Err(Error::ArgsInvalid),
        }
    }
}
