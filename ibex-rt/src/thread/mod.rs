//! Runtime threads.
//!
//! Two kinds, mirroring the kernel model: a [`LocalThread`] only serves
//! portal calls on one logical CPU and has no run of its own, while a
//! [`GlobalThread`] owns a scheduling context and runs application code.

mod global;
mod local;

pub use global::GlobalThread;
pub use local::LocalThread;

pub(crate) use local::{spawn_worker, CallMsg, LtShared, ReplySlot};
