//! File-backed memory-mapped regions for cross-process shared memory.
//!
//! Engine workers create the files; out-of-process tools attach to them,
//! usually read-only.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use crate::Region;

/// File-backed memory-mapped region (`MAP_SHARED`).
pub struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
    /// Kept open for the lifetime of the mapping.
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
    /// Whether this region should delete the file on drop.
    owns_file: bool,
    writable: bool,
}

fn map(file: &File, size: usize, prot: libc::c_int) -> io::Result<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            prot,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))
}

fn mapped_len(file: &File) -> io::Result<usize> {
    let size = file.metadata()?.len();
    if size == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "shared memory file is empty",
        ));
    }
    usize::try_from(size).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "file too large"))
}

impl MmapRegion {
    /// Create a new zero-filled file of `size` bytes and map it read/write.
    ///
    /// The file is created (or truncated) with permissions 0600 and is
    /// deleted when this region drops.
    pub fn create(path: &Path, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "size must be > 0",
            ));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        file.set_len(size as u64)?;

        let ptr = map(&file, size, libc::PROT_READ | libc::PROT_WRITE)?;

        Ok(Self {
            ptr,
            len: size,
            file,
            path: path.to_path_buf(),
            owns_file: true,
            writable: true,
        })
    }

    /// Attach read/write to an existing file. The file size is the mapping size.
    pub fn attach(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = mapped_len(&file)?;
        let ptr = map(&file, len, libc::PROT_READ | libc::PROT_WRITE)?;

        Ok(Self {
            ptr,
            len,
            file,
            path: path.to_path_buf(),
            owns_file: false,
            writable: true,
        })
    }

    /// Attach read-only to an existing file.
    ///
    /// Any store through this mapping faults, so only observers (spies,
    /// metric readers) may be built over it.
    pub fn attach_readonly(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let len = mapped_len(&file)?;
        let ptr = map(&file, len, libc::PROT_READ)?;

        Ok(Self {
            ptr,
            len,
            file,
            path: path.to_path_buf(),
            owns_file: false,
            writable: false,
        })
    }

    /// Get a `Region` view of this mmap.
    #[inline]
    pub fn region(&self) -> Region {
        // SAFETY: the mapping is page aligned and valid until drop.
        unsafe { Region::from_raw(self.ptr, self.len) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file on disk after this region drops.
    pub fn release_ownership(&mut self) {
        self.owns_file = false;
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }

        if self.owns_file {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// SAFETY: the mapping is valid for the lifetime of MmapRegion and the memory
// is shared; all concurrent access goes through atomics.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn create_and_attach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data0");

        let owner = MmapRegion::create(&path, 4096).unwrap();
        assert_eq!(owner.len(), 4096);
        assert!(path.exists());

        owner.region().atomic_i64(64).store(0x4243, Ordering::Release);

        let attached = MmapRegion::attach(&path).unwrap();
        assert_eq!(attached.len(), 4096);
        assert_eq!(
            attached.region().atomic_i64(64).load(Ordering::Acquire),
            0x4243
        );
    }

    #[test]
    fn create_makes_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics").join("counters0");

        let _region = MmapRegion::create(&path, 1024).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn cleanup_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cleanup");

        {
            let _region = MmapRegion::create(&path, 1024).unwrap();
            assert!(path.exists());
        }

        assert!(!path.exists());
    }

    #[test]
    fn attached_does_not_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attached");

        let owner = MmapRegion::create(&path, 1024).unwrap();
        {
            let _attached = MmapRegion::attach(&path).unwrap();
            let _readonly = MmapRegion::attach_readonly(&path).unwrap();
        }
        assert!(path.exists());

        drop(owner);
        assert!(!path.exists());
    }

    #[test]
    fn released_ownership_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kept");

        let mut owner = MmapRegion::create(&path, 1024).unwrap();
        owner.release_ownership();
        drop(owner);
        assert!(path.exists());
    }

    #[test]
    fn readonly_sees_writer_stores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readonly");

        let owner = MmapRegion::create(&path, 4096).unwrap();
        let reader = MmapRegion::attach_readonly(&path).unwrap();
        assert!(!reader.is_writable());

        owner.region().atomic_i32(100).store(-3, Ordering::Release);
        assert_eq!(reader.region().atomic_i32(100).load(Ordering::Acquire), -3);
    }

    #[test]
    fn permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perms");

        let _region = MmapRegion::create(&path, 1024).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn zero_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zero");

        assert!(MmapRegion::create(&path, 0).is_err());
    }

    #[test]
    fn empty_file_rejected_on_attach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        assert!(MmapRegion::attach(&path).is_err());
        assert!(MmapRegion::attach_readonly(&path).is_err());
    }
}
