//! Record and trailer layout of the ring buffer.
//!
//! Record: `[ length:i32 | type_id:i32 | payload ]`, aligned to [`ALIGNMENT`].
//! A positive length marks a committed record; a negative length marks one
//! claimed by a producer and not yet committed; zero marks free space.
//!
//! Trailer fields each sit on their own pair of cache lines.

use crate::error::{LayoutError, check_power_of_two};

pub const HEADER_LENGTH: usize = 8;
pub const ALIGNMENT: usize = HEADER_LENGTH;

/// Type id of records that only fill space up to the end of the buffer.
pub const PADDING_MSG_TYPE_ID: i32 = -1;

const FIELD_STRIDE: usize = 128;

pub const HEAD_POSITION_OFFSET: usize = 0;
pub const TAIL_POSITION_OFFSET: usize = HEAD_POSITION_OFFSET + FIELD_STRIDE;
pub const HEAD_CACHE_POSITION_OFFSET: usize = TAIL_POSITION_OFFSET + FIELD_STRIDE;
pub const CORRELATION_COUNTER_OFFSET: usize = HEAD_CACHE_POSITION_OFFSET + FIELD_STRIDE;
pub const CONSUMER_HEARTBEAT_OFFSET: usize = CORRELATION_COUNTER_OFFSET + FIELD_STRIDE;
pub const TRAILER_LENGTH: usize = CONSUMER_HEARTBEAT_OFFSET + FIELD_STRIDE;

const _: () = assert!(TRAILER_LENGTH == 640);

#[inline]
pub const fn length_offset(record_index: usize) -> usize {
    record_index
}

#[inline]
pub const fn type_offset(record_index: usize) -> usize {
    record_index + 4
}

#[inline]
pub const fn encoded_msg_offset(record_index: usize) -> usize {
    record_index + HEADER_LENGTH
}

/// Largest message area whose record lengths and padding fit the `i32`
/// length word.
pub const MAX_CAPACITY: usize = 1 << 30;

const _: () = assert!(MAX_CAPACITY <= i32::MAX as usize);

/// Region length for a ring with a message area of `capacity` bytes.
pub const fn region_length(capacity: usize) -> usize {
    capacity + TRAILER_LENGTH
}

/// Returns the message-area capacity of a region of `region_len` bytes.
pub fn check_capacity(region_len: usize) -> Result<usize, LayoutError> {
    let Some(capacity) = region_len.checked_sub(TRAILER_LENGTH) else {
        return Err(LayoutError::Undersized {
            what: "ring buffer region",
            capacity: region_len,
            minimum: TRAILER_LENGTH,
        });
    };
    check_power_of_two("ring buffer capacity", capacity)?;
    if capacity > MAX_CAPACITY {
        return Err(LayoutError::Oversized {
            what: "ring buffer",
            capacity,
            maximum: MAX_CAPACITY,
        });
    }
    Ok(capacity)
}

/// # Panics
///
/// If `type_id < 1`. Non-positive ids are reserved for padding.
#[inline]
pub fn check_type_id(type_id: i32) {
    assert!(type_id >= 1, "message type id must be >= 1, got {type_id}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_excludes_trailer() {
        assert_eq!(check_capacity(region_length(1024)).unwrap(), 1024);
        assert_eq!(check_capacity(TRAILER_LENGTH).unwrap(), 0);
    }

    #[test]
    fn non_power_of_two_capacity_rejected() {
        assert!(matches!(
            check_capacity(region_length(1000)),
            Err(LayoutError::NotPowerOfTwo { value: 1000, .. })
        ));
    }

    #[test]
    fn region_smaller_than_trailer_rejected() {
        assert!(matches!(
            check_capacity(100),
            Err(LayoutError::Undersized { minimum: 640, .. })
        ));
    }

    #[test]
    fn capacity_beyond_length_word_rejected() {
        assert_eq!(check_capacity(region_length(MAX_CAPACITY)).unwrap(), MAX_CAPACITY);
        assert!(matches!(
            check_capacity(region_length(MAX_CAPACITY << 1)),
            Err(LayoutError::Oversized { maximum: MAX_CAPACITY, .. })
        ));
    }

    #[test]
    #[should_panic(expected = "type id")]
    fn padding_type_id_is_reserved() {
        check_type_id(PADDING_MSG_TYPE_ID);
    }
}
