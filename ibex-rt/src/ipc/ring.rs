//! Lock-free single-producer/single-consumer ring over a shared dataspace.
//!
//! The ring's header, two machine words `{rpos, wpos}`, sits at offset 0
//! of the dataspace; the slot buffer follows. Exactly one producer and one
//! consumer touch the ring at any time, which is what makes the index
//! discipline sufficient: each side only ever advances its own index and
//! publishes it with a release fence, and the shared counting semaphore
//! both signals availability and carries the acquire edge for a blocked
//! consumer.
//!
//! The fullness test treats `wpos + 1 == rpos` as full, wasting one slot so
//! that full and empty stay distinguishable; with `N` slots at most `N - 1`
//! entries are outstanding.
//!
//! The party that created the dataspace initializes the header before any
//! traffic; the opposite party passes `init = false` and must not touch the
//! header until the portal round-trip that delegated the dataspace has
//! established that ordering.

use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use ibex_abi::ring::{ring_header_bytes, ring_slots};

use crate::error::{Error, Result};
use crate::mem::Dataspace;
use crate::sync::Sm;

/// Shared ring geometry and accessors common to both sides.
struct RingSide<T> {
    ds: Dataspace,
    sm: Sm,
    base: *mut u8,
    slots: usize,
    _marker: PhantomData<T>,
}

// The raw pointer targets the dataspace's region, which the `ds` field
// keeps alive; entries are plain data.
unsafe impl<T: Send> Send for RingSide<T> {}

impl<T: Copy> RingSide<T> {
    fn new(ds: Dataspace, sm: Sm, init: bool) -> Result<Self> {
        let slots = ring_slots(ds.size(), std::mem::size_of::<T>());
        if slots == 0 || std::mem::align_of::<T>() > ring_header_bytes() {
            return Err(Error::ArgsInvalid);
        }
        let side = Self {
            base: ds.region().base_ptr(),
            ds,
            sm,
            slots,
            _marker: PhantomData,
        };
        if init {
            side.rpos().store(0, Ordering::Relaxed);
            side.wpos().store(0, Ordering::Release);
        }
        Ok(side)
    }

    fn rpos(&self) -> &AtomicUsize {
        unsafe { &*(self.base as *const AtomicUsize) }
    }

    fn wpos(&self) -> &AtomicUsize {
        unsafe { &*(self.base.add(std::mem::size_of::<usize>()) as *const AtomicUsize) }
    }

    fn slot_ptr(&self, index: usize) -> *mut T {
        debug_assert!(index < self.slots);
        unsafe {
            self.base
                .add(ring_header_bytes() + index * std::mem::size_of::<T>()) as *mut T
        }
    }

    fn mask(&self) -> usize {
        self.slots - 1
    }
}

/// Producer half of a shared ring.
///
/// Owns its mapping of the dataspace and the signalling semaphore; the
/// consumer holds its own.
pub struct Producer<T: Copy> {
    side: RingSide<T>,
}

impl<T: Copy + Send + 'static> Producer<T> {
    /// Build the producer side over `ds`, signalling on `sm`.
    ///
    /// `init` zeroes the ring header and must be passed by exactly one
    /// party, conventionally the creator of the dataspace. Fails when the
    /// dataspace cannot hold a single entry.
    pub fn new(ds: Dataspace, sm: Sm, init: bool) -> Result<Self> {
        Ok(Self {
            side: RingSide::new(ds, sm, init)?,
        })
    }

    /// Number of slots in the ring.
    pub fn capacity(&self) -> usize {
        self.side.slots
    }

    /// The current write slot, or `None` while the ring is full.
    pub fn current(&mut self) -> Option<&mut T> {
        let wpos = self.side.wpos().load(Ordering::Relaxed);
        let rpos = self.side.rpos().load(Ordering::Acquire);
        if (wpos + 1) & self.side.mask() == rpos {
            return None;
        }
        Some(unsafe { &mut *self.side.slot_ptr(wpos) })
    }

    /// Publish the current slot: advance `wpos`, fence, signal.
    ///
    /// A failing signal means the peer revoked its semaphore; a
    /// disconnected consumer is not a producer-side error, so it is
    /// swallowed.
    pub fn next(&mut self) {
        let wpos = self.side.wpos().load(Ordering::Relaxed);
        self.side
            .wpos()
            .store((wpos + 1) & self.side.mask(), Ordering::Release);
        fence(Ordering::Release);
        if let Err(err) = self.side.sm.up() {
            log::trace!("ring signal after peer death: {err}");
        }
    }

    /// Write `value` into the next slot if one is free. Returns `false`
    /// when the ring is full.
    pub fn produce(&mut self, value: T) -> bool {
        match self.current() {
            Some(slot) => {
                *slot = value;
                self.next();
                true
            }
            None => false,
        }
    }

    /// The dataspace carrying the ring.
    pub fn dataspace(&self) -> &Dataspace {
        &self.side.ds
    }
}

/// Consumer half of a shared ring.
pub struct Consumer<T: Copy> {
    side: RingSide<T>,
    blocking: bool,
}

impl<T: Copy + Send + 'static> Consumer<T> {
    /// Build the consumer side over `ds`, waiting on `sm`.
    ///
    /// With `blocking`, [`Consumer::get`] parks on the semaphore while the
    /// ring is empty; otherwise it returns `None` immediately.
    pub fn new(ds: Dataspace, sm: Sm, init: bool, blocking: bool) -> Result<Self> {
        Ok(Self {
            side: RingSide::new(ds, sm, init)?,
            blocking,
        })
    }

    /// Number of slots in the ring.
    pub fn capacity(&self) -> usize {
        self.side.slots
    }

    /// Whether an entry is ready.
    pub fn has_data(&self) -> bool {
        let rpos = self.side.rpos().load(Ordering::Relaxed);
        rpos != self.side.wpos().load(Ordering::Acquire)
    }

    /// The current read slot.
    ///
    /// On an empty ring a blocking consumer waits on the semaphore and
    /// rechecks; it returns `None` only once the semaphore is revoked (the
    /// producer is gone) and the ring stays empty. A non-blocking consumer
    /// returns `None` immediately.
    pub fn get(&mut self) -> Option<&T> {
        loop {
            if self.has_data() {
                let rpos = self.side.rpos().load(Ordering::Relaxed);
                return Some(unsafe { &*self.side.slot_ptr(rpos) });
            }
            if !self.blocking || self.side.sm.is_revoked() {
                return None;
            }
            self.side.sm.down();
        }
    }

    /// Release the current slot: fence, then advance `rpos`.
    pub fn next(&mut self) {
        let rpos = self.side.rpos().load(Ordering::Relaxed);
        fence(Ordering::Release);
        self.side
            .rpos()
            .store((rpos + 1) & self.side.mask(), Ordering::Release);
    }

    /// The dataspace carrying the ring.
    pub fn dataspace(&self) -> &Dataspace {
        &self.side.ds
    }
}
