//! Shared regions: fixed-size byte arenas addressed by offset.
//!
//! A [`Region`] is a raw, copyable view. [`HeapRegion`] and
//! [`MmapRegion`](crate::MmapRegion) own storage. [`SharedRegion`] is the
//! handle every layout in this crate is built over: it keeps the storage
//! alive for as long as any view of it exists.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU8, Ordering};

use crate::mmap::MmapRegion;

/// A contiguous region of memory addressed by offset.
///
/// # Safety
///
/// The caller must ensure:
/// - `base` is valid for `len` bytes and aligned to at least 8 bytes
/// - the memory remains valid for the lifetime of this Region
#[derive(Clone, Copy)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

impl Region {
    /// Create a region from a raw pointer and length.
    ///
    /// # Safety
    ///
    /// - `base` must be valid for `len` bytes
    /// - `base` must be aligned to at least 8 bytes
    /// - the memory must remain valid for the lifetime of this Region
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    /// Returns the base pointer of the region.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Returns the size of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the region has zero length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a pointer to offset `off` within the region.
    #[inline]
    pub fn offset(&self, off: usize) -> *mut u8 {
        assert!(
            off < self.len,
            "offset {off} out of bounds (len={})",
            self.len
        );
        unsafe { self.as_ptr().add(off) }
    }

    #[inline]
    fn check_span(&self, off: usize, len: usize) {
        assert!(
            off.checked_add(len).is_some_and(|end| end <= self.len),
            "span {off}+{len} out of bounds (len={})",
            self.len
        );
    }

    /// Returns the 64-bit atomic cell at `off`.
    ///
    /// # Panics
    ///
    /// If the cell is out of bounds or not 8-byte aligned.
    #[inline]
    pub fn atomic_i64(&self, off: usize) -> &AtomicI64 {
        self.check_span(off, 8);
        assert!(off.is_multiple_of(8), "offset {off} is not 8-byte aligned");
        // SAFETY: in bounds and aligned; AtomicI64 has the layout of i64 and
        // all concurrent access to the cell goes through atomics.
        unsafe { AtomicI64::from_ptr(self.as_ptr().add(off) as *mut i64) }
    }

    /// Returns the 32-bit atomic cell at `off`.
    ///
    /// # Panics
    ///
    /// If the cell is out of bounds or not 4-byte aligned.
    #[inline]
    pub fn atomic_i32(&self, off: usize) -> &AtomicI32 {
        self.check_span(off, 4);
        assert!(off.is_multiple_of(4), "offset {off} is not 4-byte aligned");
        // SAFETY: in bounds and aligned, see `atomic_i64`.
        unsafe { AtomicI32::from_ptr(self.as_ptr().add(off) as *mut i32) }
    }

    /// Loads the i64 at `off`, which need not be aligned.
    ///
    /// Aligned cells load atomically. Elsewhere each byte is loaded on its
    /// own, so a load racing a store may see a mix of old and new bytes.
    pub fn load_i64(&self, off: usize, order: Ordering) -> i64 {
        if off.is_multiple_of(8) {
            return self.atomic_i64(off).load(order);
        }
        self.check_span(off, 8);
        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.atomic_u8(off + i).load(order);
        }
        i64::from_ne_bytes(bytes)
    }

    /// Stores `value` at `off`, which need not be aligned. See [`Self::load_i64`].
    pub fn store_i64(&self, off: usize, value: i64, order: Ordering) {
        if off.is_multiple_of(8) {
            self.atomic_i64(off).store(value, order);
            return;
        }
        self.check_span(off, 8);
        for (i, byte) in value.to_ne_bytes().into_iter().enumerate() {
            self.atomic_u8(off + i).store(byte, order);
        }
    }

    #[inline]
    fn atomic_u8(&self, off: usize) -> &AtomicU8 {
        // SAFETY: callers checked the span; bytes are always aligned.
        unsafe { AtomicU8::from_ptr(self.as_ptr().add(off)) }
    }

    /// Returns the bytes in `off..off + len`.
    ///
    /// # Safety
    ///
    /// No other party may write those bytes for the lifetime of the slice.
    #[inline]
    pub unsafe fn bytes(&self, off: usize, len: usize) -> &[u8] {
        self.check_span(off, len);
        unsafe { std::slice::from_raw_parts(self.as_ptr().add(off), len) }
    }

    /// Returns the bytes in `off..off + len` for writing.
    ///
    /// # Safety
    ///
    /// No other party may read or write those bytes for the lifetime of the
    /// slice.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, off: usize, len: usize) -> &mut [u8] {
        self.check_span(off, len);
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr().add(off), len) }
    }
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// Heap-backed region for single-process use and tests.
pub struct HeapRegion {
    base: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl HeapRegion {
    /// Allocate a zeroed heap region aligned to 64 bytes.
    pub fn new_zeroed(size: usize) -> Self {
        let layout = match Layout::from_size_align(size.max(1), 64) {
            Ok(layout) => layout,
            Err(_) => panic!("heap region of {size} bytes exceeds the address space"),
        };
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(ptr) else {
            std::alloc::handle_alloc_error(layout)
        };
        Self {
            base,
            len: size,
            layout,
        }
    }

    /// Returns a Region view of this allocation.
    #[inline]
    pub fn region(&self) -> Region {
        unsafe { Region::from_raw(self.base, self.len) }
    }

    /// Returns the allocation size.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the allocation is zero-length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

/// Owns the backing; `Region` views point into it until the last handle drops.
enum Storage {
    Heap(#[allow(dead_code)] HeapRegion),
    Mmap(MmapRegion),
}

/// A cloneable handle over heap or mapped storage.
///
/// Clones share the storage, they never copy it. The storage is released
/// (freed, or unmapped) when the last handle drops.
#[derive(Clone)]
pub struct SharedRegion {
    storage: Arc<Storage>,
    region: Region,
    writable: bool,
}

impl SharedRegion {
    /// Allocates a zeroed, writable heap region of `size` bytes.
    pub fn heap(size: usize) -> Self {
        HeapRegion::new_zeroed(size).into()
    }

    /// Returns the raw view of the storage.
    #[inline]
    pub fn region(&self) -> &Region {
        &self.region
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.region.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Returns false for read-only mappings.
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Returns the backing file, if the storage is memory-mapped.
    pub fn path(&self) -> Option<&Path> {
        match &*self.storage {
            Storage::Heap(_) => None,
            Storage::Mmap(mmap) => Some(mmap.path()),
        }
    }

    /// Number of live handles sharing this storage.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.storage)
    }

    pub(crate) fn require_writable(&self) -> Result<(), crate::LayoutError> {
        if self.writable {
            Ok(())
        } else {
            Err(crate::LayoutError::ReadOnly)
        }
    }
}

impl From<HeapRegion> for SharedRegion {
    fn from(heap: HeapRegion) -> Self {
        let region = heap.region();
        Self {
            storage: Arc::new(Storage::Heap(heap)),
            region,
            writable: true,
        }
    }
}

impl From<MmapRegion> for SharedRegion {
    fn from(mmap: MmapRegion) -> Self {
        let region = mmap.region();
        let writable = mmap.is_writable();
        Self {
            storage: Arc::new(Storage::Mmap(mmap)),
            region,
            writable,
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("len", &self.len())
            .field("writable", &self.writable)
            .field("path", &self.path())
            .finish()
    }
}
