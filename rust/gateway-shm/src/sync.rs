//! Process-local synchronization primitives, switchable to loom for model checking.
//!
//! Atomics that live inside a shared region are always `core` atomics (see
//! [`crate::region::Region::atomic_i64`]); loom can only model state owned by
//! this process.

#[cfg(not(loom))]
pub use core::hint::spin_loop;
#[cfg(loom)]
pub use loom::hint::spin_loop;

#[cfg(not(loom))]
pub use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
#[cfg(loom)]
pub use loom::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[cfg(not(loom))]
pub use std::sync::Arc;
#[cfg(loom)]
pub use loom::sync::Arc;

#[cfg(loom)]
pub use loom::thread;
#[cfg(not(loom))]
pub use std::thread;
