//! Lock-free shared-memory substrate for gateway workers.
//!
//! Every structure in this crate is a view over a [`SharedRegion`]: a
//! fixed-size block of heap or memory-mapped storage addressed by byte
//! offset. The views are:
//!
//! - [`BufferPool`]: fixed-size payload slots keyed by stream id
//! - [`RingBuffer`] / [`RingBufferSpy`]: many-to-one message transport with
//!   non-destructive spies
//! - [`BudgetTable`]: shared flow-control budgets
//!
//! Nothing here blocks. Exhaustion is reported as `None`, `false` or a short
//! grant and the caller decides how to back off.

#[macro_use]
mod macros;

pub mod budget;
pub mod buffer_pool;
pub mod error;
pub mod mmap;
pub mod region;
pub mod ring;
pub mod sync;

pub use budget::{Budget, BudgetDebitor, BudgetTable};
pub use buffer_pool::BufferPool;
pub use error::LayoutError;
pub use mmap::MmapRegion;
pub use region::{HeapRegion, Region, SharedRegion};
pub use ring::{RingBuffer, RingBufferSpy, RingClaim, SpyPosition};

/// Returns true if `value` is zero or a power of two.
#[inline]
pub fn is_zero_or_power_of_two(value: usize) -> bool {
    value == 0 || value.is_power_of_two()
}

/// Rounds `value` up to the next multiple of `alignment` (a power of two).
#[inline]
pub const fn align(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}
