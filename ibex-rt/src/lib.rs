//! Capability-based service runtime.
//!
//! This crate implements the core userland machinery of a capability-based
//! microkernel system: capability-selector allocation, synchronous per-CPU
//! message-transfer endpoints ("portals"), shared-memory regions
//! ("dataspaces") with parent-mediated lifecycle, counting semaphores,
//! multi-CPU services with per-client sessions, and the lock-free
//! single-producer/single-consumer ring carried inside a shared dataspace.
//!
//! Kernel objects live in an in-process object space keyed by capability
//! selector; the parent (service registry plus dataspace manager) runs on
//! its own per-CPU handler threads. Everything observable, from synchronous
//! portal transfer and delegation to revocation surfacing as
//! [`Error::Abort`](error::Error::Abort) and real fences and blocking,
//! behaves as it would on the kernel, which is what makes the whole machine
//! testable on a host.
//!
//! The entry point is [`Env::new`](env::Env::new), which boots the parent
//! for a given number of logical CPUs and hands out the process context
//! every other constructor takes.

pub mod caps;
pub mod env;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod mem;
pub mod sync;
pub mod thread;
pub mod utcb;

pub(crate) mod parent;
pub(crate) mod space;

pub use env::Env;
pub use error::{Error, Result};
