//! Capability-selector allocation.
//!
//! Selectors name kernel objects in the process's capability space. The
//! allocator hands out contiguous ranges whose base satisfies a
//! power-of-two alignment (the delegation primitive requires aligned
//! ranges) and takes explicit frees; there is no other reclaim.

use std::collections::BTreeMap;

use spinning_top::Spinlock;

use ibex_abi::{CapRange, CapSel};

use crate::env::Env;
use crate::error::{Error, Result};

/// First selector available for dynamic allocation; lower values are
/// reserved for fixed assignments.
pub const CAP_BASE: CapSel = 0x100;

/// One past the last allocatable selector.
pub const CAP_END: CapSel = 1 << 20;

/// Disposal mode of an object's selector, recorded at construction.
///
/// Objects that allocated their selector free it again; objects wrapping a
/// received selector leave it alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispose {
    /// Drop the kernel object and free the selector.
    Free,
    /// Drop the kernel object but keep the selector allocated (it belongs
    /// to a larger block owned by someone else).
    KeepSel,
    /// Touch neither object nor selector.
    Keep,
}

/// Allocator for contiguous, aligned selector ranges.
///
/// All allocation is serialized by a single process-wide lock.
pub struct CapAllocator {
    inner: Spinlock<Inner>,
}

/// Free ranges keyed by base selector; never adjacent (frees coalesce).
struct Inner {
    free: BTreeMap<CapSel, u64>,
}

impl CapAllocator {
    /// Allocator covering `[base, end)`.
    pub fn new(base: CapSel, end: CapSel) -> Self {
        assert!(base < end);
        let mut free = BTreeMap::new();
        free.insert(base, end - base);
        Self {
            inner: Spinlock::new(Inner { free }),
        }
    }

    /// Allocate `count` contiguous selectors whose base is a multiple of
    /// `align` (a power of two).
    ///
    /// Fails with [`Error::Capacity`] when no aligned hole fits.
    pub fn allocate(&self, count: u64, align: u64) -> Result<CapSel> {
        if count == 0 || align == 0 || !align.is_power_of_two() {
            return Err(Error::ArgsInvalid);
        }
        let mut inner = self.inner.lock();
        let mut found = None;
        for (&base, &len) in inner.free.iter() {
            let aligned = (base + align - 1) & !(align - 1);
            if aligned + count <= base + len {
                found = Some((base, len, aligned));
                break;
            }
        }
        let (base, len, aligned) = found.ok_or(Error::Capacity)?;
        inner.free.remove(&base);
        if aligned > base {
            inner.free.insert(base, aligned - base);
        }
        let tail = base + len - (aligned + count);
        if tail > 0 {
            inner.free.insert(aligned + count, tail);
        }
        Ok(aligned)
    }

    /// Return `count` selectors starting at `base` to the allocator.
    ///
    /// The range must have been allocated before; freeing merges with
    /// adjacent free ranges.
    pub fn free(&self, base: CapSel, count: u64) {
        if count == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        let mut base = base;
        let mut count = count;
        // Merge with the predecessor if it ends exactly at `base`.
        if let Some((&prev_base, &prev_len)) = inner.free.range(..base).next_back() {
            assert!(prev_base + prev_len <= base, "double free of selector range");
            if prev_base + prev_len == base {
                inner.free.remove(&prev_base);
                base = prev_base;
                count += prev_len;
            }
        }
        // Merge with the successor if it starts exactly at the end.
        if let Some((&next_base, &next_len)) = inner.free.range(base + count..).next() {
            if next_base == base + count {
                inner.free.remove(&next_base);
                count += next_len;
            }
        }
        inner.free.insert(base, count);
    }

    /// Total number of free selectors (for diagnostics and tests).
    pub fn available(&self) -> u64 {
        self.inner.lock().free.values().sum()
    }
}

/// RAII guard over a freshly allocated selector range.
///
/// Frees the range on drop unless [`OwnedSels::release`] transferred
/// ownership; used to unwind partially constructed objects.
pub struct OwnedSels {
    env: Env,
    range: CapRange,
    released: bool,
}

impl OwnedSels {
    /// Allocate `count` selectors aligned to `align` under guard.
    pub fn allocate(env: &Env, count: u64, align: u64) -> Result<Self> {
        let base = env.caps().allocate(count, align)?;
        Ok(Self {
            env: env.clone(),
            range: CapRange::new(base, count),
            released: false,
        })
    }

    /// The guarded range.
    pub fn range(&self) -> CapRange {
        self.range
    }

    /// Base selector of the guarded range.
    pub fn base(&self) -> CapSel {
        self.range.base
    }

    /// Give up the guard; the caller now owns the range.
    pub fn release(mut self) -> CapRange {
        self.released = true;
        self.range
    }
}

impl Drop for OwnedSels {
    fn drop(&mut self) {
        if !self.released {
            self.env.caps().free(self.range.base, self.range.count);
        }
    }
}
