use std::ops::ControlFlow;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use super::descriptor::{
    ALIGNMENT, CONSUMER_HEARTBEAT_OFFSET, CORRELATION_COUNTER_OFFSET, HEAD_CACHE_POSITION_OFFSET,
    HEAD_POSITION_OFFSET, HEADER_LENGTH, PADDING_MSG_TYPE_ID, TAIL_POSITION_OFFSET,
    check_capacity, check_type_id, encoded_msg_offset, length_offset, type_offset,
};
use crate::error::LayoutError;
use crate::region::{Region, SharedRegion};
use crate::sync::spin_loop;

/// Many-producer, single-consumer message ring.
///
/// `write`, `try_claim` and `next_correlation_id` may be called concurrently
/// from any number of threads or processes. `read` and `unblock` belong to
/// the single primary consumer.
pub struct RingBuffer {
    region: SharedRegion,
    capacity: usize,
    max_msg_length: usize,
}

impl RingBuffer {
    /// Build a ring over `region`, whose length must be a power of two (or
    /// zero) plus [`TRAILER_LENGTH`](super::descriptor::TRAILER_LENGTH).
    pub fn build(region: SharedRegion) -> Result<Self, LayoutError> {
        let capacity = check_capacity(region.len())?;
        region.require_writable()?;

        debug!(capacity, "built ring buffer");

        Ok(Self {
            region,
            capacity,
            max_msg_length: capacity / 8,
        })
    }

    /// Size of the message area in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest payload accepted by `write` and `try_claim`.
    #[inline]
    pub fn max_msg_length(&self) -> usize {
        self.max_msg_length
    }

    /// The region this ring is built over.
    #[inline]
    pub fn shared_region(&self) -> &SharedRegion {
        &self.region
    }

    #[inline]
    fn raw(&self) -> &Region {
        self.region.region()
    }

    #[inline]
    fn trailer(&self, field: usize) -> &AtomicI64 {
        self.region.region().atomic_i64(self.capacity + field)
    }

    #[inline]
    fn length_cell(&self, record_index: usize) -> &AtomicI32 {
        self.region.region().atomic_i32(length_offset(record_index))
    }

    #[inline]
    fn type_cell(&self, record_index: usize) -> &AtomicI32 {
        self.region.region().atomic_i32(type_offset(record_index))
    }

    fn check_msg_length(&self, length: usize) {
        assert!(
            length <= self.max_msg_length,
            "encoded message exceeds max_msg_length of {}, length={length}",
            self.max_msg_length
        );
    }

    /// Append one message. Returns false, without changing the ring, if there
    /// is not enough free space.
    ///
    /// # Panics
    ///
    /// If `type_id < 1` or the payload is longer than `max_msg_length`.
    pub fn write(&self, type_id: i32, payload: &[u8]) -> bool {
        check_type_id(type_id);
        if self.capacity == 0 {
            return false;
        }
        self.check_msg_length(payload.len());

        let record_length = payload.len() + HEADER_LENGTH;
        let Some(record_index) = self.claim_capacity(record_length) else {
            return false;
        };

        self.type_cell(record_index)
            .store(type_id, Ordering::Relaxed);
        // SAFETY: the record was claimed by this producer and is invisible to
        // readers until its length turns positive.
        unsafe {
            self.raw()
                .bytes_mut(encoded_msg_offset(record_index), payload.len())
        }
        .copy_from_slice(payload);
        self.length_cell(record_index)
            .store(record_length as i32, Ordering::Release);

        true
    }

    /// Claim space for a `length`-byte message to be written in place.
    ///
    /// Returns `None` if there is not enough free space. The claim must be
    /// committed to become visible; dropping it uncommitted aborts it.
    ///
    /// # Panics
    ///
    /// If `type_id < 1` or `length` exceeds `max_msg_length`.
    pub fn try_claim(&self, type_id: i32, length: usize) -> Option<RingClaim<'_>> {
        check_type_id(type_id);
        if self.capacity == 0 {
            return None;
        }
        self.check_msg_length(length);

        let record_length = length + HEADER_LENGTH;
        let record_index = self.claim_capacity(record_length)?;
        self.type_cell(record_index)
            .store(type_id, Ordering::Release);

        trace!(type_id, record_index, length, "claimed ring record");

        Some(RingClaim {
            ring: self,
            record_index,
            length,
            done: false,
        })
    }

    /// Reserves `record_length` bytes at the tail and returns the record index.
    ///
    /// On success the record's length word holds `-record_length`, the header
    /// after it is zeroed for the next producer, and the tail has moved past
    /// the record (and past any padding inserted before the wrap).
    fn claim_capacity(&self, record_length: usize) -> Option<usize> {
        let aligned = crate::align(record_length, ALIGNMENT);
        let required = (aligned + HEADER_LENGTH) as i64;
        let capacity = self.capacity;
        let mask = capacity - 1;

        let head_cell = self.trailer(HEAD_POSITION_OFFSET);
        let head_cache = self.trailer(HEAD_CACHE_POSITION_OFFSET);
        let tail_cell = self.trailer(TAIL_POSITION_OFFSET);

        let mut head = head_cache.load(Ordering::Acquire);
        let (tail, mut tail_index, padding) = loop {
            let tail = tail_cell.load(Ordering::Acquire);
            if required > capacity as i64 - (tail - head) {
                head = head_cell.load(Ordering::Acquire);
                if required > capacity as i64 - (tail - head) {
                    return None;
                }
                head_cache.store(head, Ordering::Release);
            }

            let mut padding = 0;
            let tail_index = tail as usize & mask;
            let to_buffer_end = capacity - tail_index;

            if required > to_buffer_end as i64 {
                let mut head_index = head as usize & mask;
                if required > head_index as i64 {
                    head = head_cell.load(Ordering::Acquire);
                    head_index = head as usize & mask;
                    if required > head_index as i64 {
                        return None;
                    }
                    head_cache.store(head, Ordering::Release);
                }
                padding = to_buffer_end;
            }

            let claimed = -(record_length as i32);
            let cell = self.length_cell(tail_index);
            if cell
                .compare_exchange(0, claimed, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if tail_cell.load(Ordering::Acquire) == tail {
                    break (tail, tail_index, padding);
                }
                // The tail moved on before the claim landed, so the zero word
                // was not the header at the tail.
                self.undo_claim(tail_index, claimed);
            }
            spin_loop();
        };

        if padding != 0 {
            self.length_cell(0)
                .store(-(record_length as i32), Ordering::Release);
            self.type_cell(tail_index)
                .store(PADDING_MSG_TYPE_ID, Ordering::Relaxed);
            self.length_cell(tail_index)
                .store(padding as i32, Ordering::Release);
            tail_index = 0;
        }

        self.length_cell(tail_index + aligned)
            .store(0, Ordering::Relaxed);
        tail_cell.store(tail + (aligned + padding) as i64, Ordering::Release);

        Some(tail_index)
    }

    /// Restore the zero word a stale claim overwrote at `index`. Returns
    /// false if the word already changed again.
    ///
    /// A changed word belongs to whoever now owns that span (a newer header
    /// or payload bytes) and is left as is.
    fn undo_claim(&self, index: usize, claimed: i32) -> bool {
        match self.length_cell(index).compare_exchange(
            claimed,
            0,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => true,
            Err(current) => {
                trace!(index, claimed, current, "stale claim already overwritten");
                false
            }
        }
    }

    /// Deliver up to `limit` messages to `handler`, advancing the head past
    /// everything consumed (padding included). Returns the number delivered.
    ///
    /// Scans at most one contiguous block (up to the end of the buffer or half
    /// the capacity, whichever is shorter) per call.
    pub fn read<F>(&self, mut handler: F, limit: usize) -> usize
    where
        F: FnMut(i32, &[u8]) -> ControlFlow<()>,
    {
        if self.capacity == 0 {
            return 0;
        }

        let head_cell = self.trailer(HEAD_POSITION_OFFSET);
        let head = head_cell.load(Ordering::Relaxed);
        let head_index = head as usize & (self.capacity - 1);
        let max_block = (self.capacity - head_index).min(self.capacity >> 1);

        let scan = super::scan_block(
            self.raw(),
            self.capacity,
            head_index,
            max_block,
            limit,
            &mut handler,
        );

        if scan.bytes_read != 0 {
            head_cell.store(head + scan.bytes_read as i64, Ordering::Release);
        }

        scan.messages_read
    }

    /// Recover from a producer that claimed space and never committed it.
    ///
    /// Turns the stuck region at the head into padding so the consumer can
    /// move on. Returns true if anything was unblocked.
    pub fn unblock(&self) -> bool {
        if self.capacity == 0 {
            return false;
        }

        let mask = self.capacity - 1;
        let consumer_index = self.trailer(HEAD_POSITION_OFFSET).load(Ordering::Acquire) as usize & mask;
        let producer_index = self.trailer(TAIL_POSITION_OFFSET).load(Ordering::Acquire) as usize & mask;

        if producer_index == consumer_index {
            return false;
        }

        let length = self.length_cell(consumer_index).load(Ordering::Acquire);
        if length < 0 {
            self.type_cell(consumer_index)
                .store(PADDING_MSG_TYPE_ID, Ordering::Relaxed);
            self.length_cell(consumer_index)
                .store(-length, Ordering::Release);
            warn!(consumer_index, length = -length, "unblocked uncommitted ring record");
            return true;
        }

        if length == 0 {
            // Look for the next header a producer has written.
            let limit = if producer_index > consumer_index {
                producer_index
            } else {
                self.capacity
            };
            let mut index = consumer_index + ALIGNMENT;
            while index < limit {
                if self.length_cell(index).load(Ordering::Acquire) != 0 {
                    if self.still_zeroed(index, consumer_index) {
                        self.type_cell(consumer_index)
                            .store(PADDING_MSG_TYPE_ID, Ordering::Relaxed);
                        self.length_cell(consumer_index)
                            .store((index - consumer_index) as i32, Ordering::Release);
                        warn!(
                            consumer_index,
                            length = index - consumer_index,
                            "unblocked unclaimed ring gap"
                        );
                        return true;
                    }
                    break;
                }
                index += ALIGNMENT;
            }
        }

        false
    }

    fn still_zeroed(&self, from: usize, limit: usize) -> bool {
        let mut index = from;
        while index > limit {
            index -= ALIGNMENT;
            if self.length_cell(index).load(Ordering::Acquire) != 0 {
                return false;
            }
        }
        true
    }

    /// Returns the current counter value and increments it.
    pub fn next_correlation_id(&self) -> i64 {
        self.trailer(CORRELATION_COUNTER_OFFSET)
            .fetch_add(1, Ordering::AcqRel)
    }

    pub fn consumer_heartbeat_time(&self) -> i64 {
        self.trailer(CONSUMER_HEARTBEAT_OFFSET)
            .load(Ordering::Acquire)
    }

    pub fn set_consumer_heartbeat_time(&self, time: i64) {
        self.trailer(CONSUMER_HEARTBEAT_OFFSET)
            .store(time, Ordering::Release);
    }

    /// Tail position: total bytes ever claimed by producers.
    pub fn producer_position(&self) -> i64 {
        self.trailer(TAIL_POSITION_OFFSET).load(Ordering::Acquire)
    }

    /// Head position: total bytes consumed by the primary reader.
    pub fn consumer_position(&self) -> i64 {
        self.trailer(HEAD_POSITION_OFFSET).load(Ordering::Acquire)
    }

    /// Bytes claimed and not yet consumed.
    pub fn size(&self) -> usize {
        let head_cell = self.trailer(HEAD_POSITION_OFFSET);
        let tail_cell = self.trailer(TAIL_POSITION_OFFSET);

        let mut head_after = head_cell.load(Ordering::Acquire);
        loop {
            let head_before = head_after;
            let tail = tail_cell.load(Ordering::Acquire);
            head_after = head_cell.load(Ordering::Acquire);
            if head_after == head_before {
                return (tail - head_after) as usize;
            }
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("head", &self.consumer_position())
            .field("tail", &self.producer_position())
            .finish()
    }
}

/// Space claimed in a [`RingBuffer`] for a message written in place.
///
/// Dropping the claim without committing aborts it.
pub struct RingClaim<'a> {
    ring: &'a RingBuffer,
    record_index: usize,
    length: usize,
    done: bool,
}

impl RingClaim<'_> {
    /// The payload area, exactly as long as requested.
    pub fn buffer(&mut self) -> &mut [u8] {
        // SAFETY: the record is claimed by this producer until committed.
        unsafe {
            self.ring
                .raw()
                .bytes_mut(encoded_msg_offset(self.record_index), self.length)
        }
    }

    /// Publish the message to readers.
    pub fn commit(mut self) {
        self.finish(None);
    }

    /// Turn the claimed space into padding.
    pub fn abort(mut self) {
        self.finish(Some(PADDING_MSG_TYPE_ID));
    }

    fn finish(&mut self, type_id: Option<i32>) {
        let length_cell = self.ring.length_cell(self.record_index);
        let claimed = length_cell.load(Ordering::Relaxed);
        debug_assert!(claimed < 0, "ring claim already released");

        if let Some(type_id) = type_id {
            self.ring
                .type_cell(self.record_index)
                .store(type_id, Ordering::Relaxed);
        }
        length_cell.store(-claimed, Ordering::Release);
        self.done = true;
    }
}

impl Drop for RingClaim<'_> {
    fn drop(&mut self) {
        if !self.done {
            trace!(record_index = self.record_index, "aborting dropped ring claim");
            self.finish(Some(PADDING_MSG_TYPE_ID));
        }
    }
}
