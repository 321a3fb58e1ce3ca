//! Integration tests for the buffer pool shared between threads.

use std::collections::HashSet;
use std::sync::Mutex;

use gateway_shm::buffer_pool::{held_slots, region_length};
use gateway_shm::{BufferPool, MmapRegion, SharedRegion};

#[test]
fn duplicates_never_hand_out_a_held_slot() {
    let pool = BufferPool::build(64, 16, SharedRegion::heap(region_length(64, 16))).unwrap();
    let held = Mutex::new(HashSet::new());

    std::thread::scope(|scope| {
        for worker in 0..4i64 {
            let mut pool = pool.duplicate();
            let held = &held;
            scope.spawn(move || {
                for round in 0..500i64 {
                    let stream_id = worker << 32 | round;
                    let Some(slot) = pool.acquire(stream_id) else {
                        continue;
                    };
                    assert!(held.lock().unwrap().insert(slot), "slot {slot} handed out twice");
                    pool.buffer(slot)[..8].copy_from_slice(&stream_id.to_le_bytes());
                    assert_eq!(pool.stream_id(slot), stream_id);
                    assert_eq!(pool.buffer(slot)[..8], stream_id.to_le_bytes());
                    assert!(held.lock().unwrap().remove(&slot));
                    pool.release(slot);
                }
            });
        }
    });

    assert_eq!(pool.acquired_slots(), 0);
}

#[test]
fn trailer_is_visible_through_a_second_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("buffers0");

    let size = region_length(128, 8);
    let pool = BufferPool::build(128, 8, MmapRegion::create(&path, size).unwrap().into()).unwrap();
    let slot = pool.acquire(0xfeed).unwrap();

    // Diagnostic readers only need the trailer cells.
    let mapped = MmapRegion::attach_readonly(&path).unwrap();
    let view = mapped.region();
    let cell = view.atomic_i64(128 * 8 + slot * 8);
    assert_eq!(cell.load(std::sync::atomic::Ordering::Acquire), 0xfeed);

    let observed: SharedRegion = mapped.into();
    assert_eq!(held_slots(128, 8, &observed).unwrap(), vec![(slot, 0xfeed)]);

    pool.release(slot);
    assert!(held_slots(128, 8, &observed).unwrap().is_empty());
    assert!(held_slots(128, 4, &observed).is_err());
}
