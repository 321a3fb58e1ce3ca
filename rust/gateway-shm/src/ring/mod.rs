//! Many-to-one ring buffer transport over a shared region.
//!
//! ```text
//! [ message area: capacity bytes ][ trailer: TRAILER_LENGTH bytes ]
//! ```
//!
//! Producers claim space by compare-and-swap on the length word of the
//! record at the tail, so any number of threads or processes may write. One
//! primary consumer advances the head. Any number of [`RingBufferSpy`]
//! readers may follow the same records without touching the trailer.
//!
//! Readers take a handler `FnMut(type_id, payload) -> ControlFlow<()>`.
//! Returning `ControlFlow::Break(())` stops the scan and leaves the current
//! message unconsumed, so the next call delivers it again in full.

mod buffer;
pub mod descriptor;
mod spy;

use std::ops::ControlFlow;

pub use buffer::{RingBuffer, RingClaim};
pub use spy::{RingBufferSpy, SpyPosition};

/// Outcome of scanning one contiguous block of records.
struct Scan {
    bytes_read: usize,
    messages_read: usize,
}

/// Walks committed records from `index`, shared by the consumer and spies.
///
/// Stops at the first record whose length is not positive (still being
/// written), at `max_block` bytes, or after `limit` messages.
fn scan_block<F>(
    region: &crate::Region,
    capacity: usize,
    index: usize,
    max_block: usize,
    limit: usize,
    handler: &mut F,
) -> Scan
where
    F: FnMut(i32, &[u8]) -> ControlFlow<()>,
{
    use descriptor::{ALIGNMENT, HEADER_LENGTH, PADDING_MSG_TYPE_ID};
    use std::sync::atomic::Ordering;

    let mut bytes_read = 0;
    let mut messages_read = 0;

    while bytes_read < max_block && messages_read < limit {
        let record_index = index + bytes_read;
        let record_length = region
            .atomic_i32(descriptor::length_offset(record_index))
            .load(Ordering::Acquire);
        if record_length <= 0 {
            break;
        }

        let record_length = record_length as usize;
        let aligned = crate::align(record_length, ALIGNMENT);
        if record_length < HEADER_LENGTH || record_index + aligned > capacity {
            break;
        }
        bytes_read += aligned;

        let type_id = region
            .atomic_i32(descriptor::type_offset(record_index))
            .load(Ordering::Relaxed);
        if type_id == PADDING_MSG_TYPE_ID {
            continue;
        }

        // SAFETY: the positive length was published with release after the
        // payload was written, and producers do not reuse the record until
        // the head moves past it.
        let payload = unsafe {
            region.bytes(
                descriptor::encoded_msg_offset(record_index),
                record_length - HEADER_LENGTH,
            )
        };
        if handler(type_id, payload).is_break() {
            bytes_read -= aligned;
            break;
        }
        messages_read += 1;
    }

    Scan {
        bytes_read,
        messages_read,
    }
}
