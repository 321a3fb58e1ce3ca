//! Slot-based buffer pool over a shared region.
//!
//! Region layout:
//!
//! ```text
//! [ slot 0 | slot 1 | ... | slot n-1 ][ stream id 0 | ... | stream id n-1 ]
//!   slot_capacity bytes each             8 bytes each
//! ```
//!
//! The trailer records which stream holds each slot. It exists for crash
//! diagnosis only; the used/free state lives in process-local bookkeeping
//! shared by every duplicate of the pool.

use crate::error::{LayoutError, check_length, check_power_of_two};
use crate::region::SharedRegion;
use crate::sync::{Arc, AtomicU64, AtomicUsize, Ordering};

/// Size of the per-slot stream id cell in the trailer.
pub const SLOT_TRAILER_CELL: usize = 8;

/// Total region length for a pool of the given shape.
pub const fn region_length(slot_capacity: usize, slot_count: usize) -> usize {
    slot_capacity * slot_count + SLOT_TRAILER_CELL * slot_count
}

/// Slots whose trailer holds a stream id, read without acquiring anything.
///
/// Works over read-only mappings, so an observer in another process can see
/// which streams a worker's slots belong to.
pub fn held_slots(
    slot_capacity: usize,
    slot_count: usize,
    region: &SharedRegion,
) -> Result<Vec<(usize, i64)>, LayoutError> {
    check_power_of_two("slot_capacity", slot_capacity)?;
    check_power_of_two("slot_count", slot_count)?;
    check_length(region_length(slot_capacity, slot_count), region.len())?;

    let trailer_offset = slot_capacity * slot_count;
    let raw = region.region();
    Ok((0..slot_count)
        .filter_map(|slot| {
            let stream_id = raw.load_i64(
                trailer_offset + slot * SLOT_TRAILER_CELL,
                std::sync::atomic::Ordering::Acquire,
            );
            (stream_id != 0).then_some((slot, stream_id))
        })
        .collect())
}

const GOLDEN_RATIO: u64 = 0x9E37_79B9_7F4A_7C15;

#[inline]
fn hash(stream_id: i64) -> usize {
    let h = (stream_id as u64).wrapping_mul(GOLDEN_RATIO);
    (h ^ (h >> 32)) as usize
}

/// Used bitmap and free counter, shared by every duplicate of a pool.
struct Bookkeeping {
    used: Box<[AtomicU64]>,
    available: AtomicUsize,
}

impl Bookkeeping {
    fn new(slot_count: usize) -> Self {
        let words = slot_count.div_ceil(64);
        Self {
            used: (0..words).map(|_| AtomicU64::new(0)).collect(),
            available: AtomicUsize::new(slot_count),
        }
    }

    /// Takes one unit of free capacity, or returns false if none is left.
    fn reserve(&self) -> bool {
        let mut available = self.available.load(Ordering::Acquire);
        loop {
            if available == 0 {
                return false;
            }
            match self.available.compare_exchange_weak(
                available,
                available - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => available = actual,
            }
        }
    }

    fn unreserve(&self) {
        self.available.fetch_add(1, Ordering::Release);
    }

    /// Atomically marks `slot` used. Returns false if it already was.
    fn try_mark(&self, slot: usize) -> bool {
        let bit = 1u64 << (slot % 64);
        let prev = self.used[slot / 64].fetch_or(bit, Ordering::AcqRel);
        prev & bit == 0
    }

    /// Atomically marks `slot` free. Returns false if it already was.
    fn clear(&self, slot: usize) -> bool {
        let bit = 1u64 << (slot % 64);
        let prev = self.used[slot / 64].fetch_and(!bit, Ordering::AcqRel);
        prev & bit != 0
    }

    fn is_used(&self, slot: usize) -> bool {
        let bit = 1u64 << (slot % 64);
        self.used[slot / 64].load(Ordering::Acquire) & bit != 0
    }
}

/// Hands out fixed-size slots of shared memory keyed by stream id.
///
/// Acquire and release take `&self` and are safe to call from several
/// threads. A slot is owned by whoever acquired it until they release it;
/// there is no timeout and no reclamation of slots held by a caller that
/// never releases them.
pub struct BufferPool {
    region: SharedRegion,
    bookkeeping: Arc<Bookkeeping>,
    slot_capacity: usize,
    slot_count: usize,
    trailer_offset: usize,
}

impl BufferPool {
    /// Build a pool over `region`.
    ///
    /// Both sizes must be zero or a power of two, and the region must be
    /// exactly [`region_length`] bytes and writable.
    pub fn build(
        slot_capacity: usize,
        slot_count: usize,
        region: SharedRegion,
    ) -> Result<Self, LayoutError> {
        check_power_of_two("slot_capacity", slot_capacity)?;
        check_power_of_two("slot_count", slot_count)?;

        let trailer_offset = slot_capacity.saturating_mul(slot_count);
        let expected =
            trailer_offset.saturating_add(slot_count.saturating_mul(SLOT_TRAILER_CELL));
        check_length(expected, region.len())?;
        region.require_writable()?;

        debug!(slot_capacity, slot_count, "built buffer pool");

        Ok(Self {
            region,
            bookkeeping: Arc::new(Bookkeeping::new(slot_count)),
            slot_capacity,
            slot_count,
            trailer_offset,
        })
    }

    /// Another handle over the same storage and the same used/free state.
    ///
    /// Acquiring through either handle affects both; each handle lends out
    /// its own buffer views.
    pub fn duplicate(&self) -> Self {
        Self {
            region: self.region.clone(),
            bookkeeping: Arc::clone(&self.bookkeeping),
            slot_capacity: self.slot_capacity,
            slot_count: self.slot_count,
            trailer_offset: self.trailer_offset,
        }
    }

    #[inline]
    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Acquire a free slot for `stream_id`, or `None` if the pool is exhausted.
    ///
    /// Probing starts at a slot derived from the stream id and walks forward,
    /// wrapping at the end.
    pub fn acquire(&self, stream_id: i64) -> Option<usize> {
        if !self.bookkeeping.reserve() {
            trace!(stream_id, "buffer pool exhausted");
            return None;
        }

        let mask = self.slot_count - 1;
        let mut slot = hash(stream_id) & mask;
        // A reservation guarantees a clear bit exists; concurrent acquirers
        // each hold their own reservation.
        while !self.bookkeeping.try_mark(slot) {
            slot = (slot + 1) & mask;
        }

        self.store_stream_id(slot, stream_id);
        trace!(stream_id, slot, "acquired slot");
        Some(slot)
    }

    /// Return `slot` to the pool.
    ///
    /// # Panics
    ///
    /// If `slot` is out of range or not currently acquired.
    pub fn release(&self, slot: usize) {
        self.assert_acquired(slot);

        self.store_stream_id(slot, 0);
        let was_used = self.bookkeeping.clear(slot);
        assert!(was_used, "slot {slot} released twice");
        self.bookkeeping.unreserve();
        trace!(slot, "released slot");
    }

    /// View of the whole slot.
    ///
    /// # Panics
    ///
    /// If `slot` is out of range or not currently acquired.
    pub fn buffer(&mut self, slot: usize) -> &mut [u8] {
        self.buffer_at(slot, 0)
    }

    /// View of the slot starting `offset` bytes in.
    ///
    /// # Panics
    ///
    /// If `slot` is not currently acquired or `offset > slot_capacity`.
    pub fn buffer_at(&mut self, slot: usize, offset: usize) -> &mut [u8] {
        self.assert_acquired(slot);
        assert!(
            offset <= self.slot_capacity,
            "offset {offset} past slot capacity {}",
            self.slot_capacity
        );

        let start = slot * self.slot_capacity + offset;
        // SAFETY: the slot is acquired, so only its owner addresses these
        // bytes, and `&mut self` allows one live view per handle.
        unsafe {
            self.region
                .region()
                .bytes_mut(start, self.slot_capacity - offset)
        }
    }

    /// Number of slots currently acquired across all duplicates.
    pub fn acquired_slots(&self) -> usize {
        self.slot_count - self.bookkeeping.available.load(Ordering::Acquire)
    }

    /// Whether `slot` is currently acquired.
    pub fn is_acquired(&self, slot: usize) -> bool {
        slot < self.slot_count && self.bookkeeping.is_used(slot)
    }

    /// Stream id recorded in the trailer for `slot`, zero when free.
    pub fn stream_id(&self, slot: usize) -> i64 {
        assert!(slot < self.slot_count, "slot {slot} out of range");
        self.region.region().load_i64(
            self.trailer_offset + slot * SLOT_TRAILER_CELL,
            std::sync::atomic::Ordering::Acquire,
        )
    }

    fn assert_acquired(&self, slot: usize) {
        assert!(
            slot < self.slot_count,
            "slot {slot} out of range (slot_count={})",
            self.slot_count
        );
        assert!(self.bookkeeping.is_used(slot), "slot {slot} is not acquired");
    }

    /// Trailer cells are 8-byte aligned only when the slot area is.
    #[inline]
    fn store_stream_id(&self, slot: usize, stream_id: i64) {
        self.region.region().store_i64(
            self.trailer_offset + slot * SLOT_TRAILER_CELL,
            stream_id,
            std::sync::atomic::Ordering::Release,
        );
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("slot_capacity", &self.slot_capacity)
            .field("slot_count", &self.slot_count)
            .field("acquired", &self.acquired_slots())
            .finish()
    }
}
