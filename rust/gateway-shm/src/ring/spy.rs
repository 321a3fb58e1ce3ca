use std::ops::ControlFlow;
use std::sync::atomic::{AtomicI64, Ordering};

use super::descriptor::{HEAD_POSITION_OFFSET, TAIL_POSITION_OFFSET, check_capacity};
use crate::error::LayoutError;
use crate::region::SharedRegion;

/// Where a spy starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpyPosition {
    /// The start of the stream, as far as the buffer still holds it.
    Zero,
    /// The primary consumer's current position.
    Head,
    /// The producers' current position: only new messages.
    Tail,
}

/// Non-destructive reader of a ring buffer.
///
/// A spy keeps its own cursor and never stores to the region, so it can be
/// built over a read-only mapping in another process. It sees the same
/// records as the primary consumer, as long as it keeps up: a spy that falls
/// more than a full buffer behind the producers skips ahead to the head.
pub struct RingBufferSpy {
    region: SharedRegion,
    capacity: usize,
    position: i64,
}

impl RingBufferSpy {
    /// Attach a spy positioned at [`SpyPosition::Zero`].
    pub fn attach(region: SharedRegion) -> Result<Self, LayoutError> {
        let capacity = check_capacity(region.len())?;
        debug!(capacity, writable = region.is_writable(), "attached ring spy");
        Ok(Self {
            region,
            capacity,
            position: 0,
        })
    }

    #[inline]
    fn trailer(&self, field: usize) -> &AtomicI64 {
        self.region.region().atomic_i64(self.capacity + field)
    }

    /// Reset the private cursor from a snapshot of the trailer.
    pub fn spy_at(&mut self, position: SpyPosition) {
        self.position = match position {
            SpyPosition::Zero => 0,
            SpyPosition::Head => self.consumer_position(),
            SpyPosition::Tail => self.producer_position(),
        };
    }

    /// The spy's own position.
    #[inline]
    pub fn position(&self) -> i64 {
        self.position
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn producer_position(&self) -> i64 {
        self.trailer(TAIL_POSITION_OFFSET).load(Ordering::Acquire)
    }

    pub fn consumer_position(&self) -> i64 {
        self.trailer(HEAD_POSITION_OFFSET).load(Ordering::Acquire)
    }

    /// Deliver up to `limit` messages after the spy's position to `handler`.
    /// Returns the number delivered.
    pub fn spy<F>(&mut self, mut handler: F, limit: usize) -> usize
    where
        F: FnMut(i32, &[u8]) -> ControlFlow<()>,
    {
        if self.capacity == 0 {
            return 0;
        }

        let tail = self.producer_position();
        let mut position = self.position;
        if tail - position > self.capacity as i64 {
            let head = self.consumer_position();
            debug!(
                skipped = head - position,
                position, head, "ring spy lapped, resynchronising at head"
            );
            position = head;
        }

        let index = position as usize & (self.capacity - 1);
        let available = (tail - position).max(0) as usize;
        let max_block = (self.capacity - index)
            .min(self.capacity >> 1)
            .min(available);

        let scan = super::scan_block(
            self.region.region(),
            self.capacity,
            index,
            max_block,
            limit,
            &mut handler,
        );

        self.position = position + scan.bytes_read as i64;
        scan.messages_read
    }
}

impl std::fmt::Debug for RingBufferSpy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBufferSpy")
            .field("capacity", &self.capacity)
            .field("position", &self.position)
            .finish()
    }
}
