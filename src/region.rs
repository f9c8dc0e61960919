//! File-backed fixed regions and the msync committer.
//!
//! The allocator operates on raw bytes and stores absolute addresses inside
//! them, so a persistent region must be mapped at the *same* virtual address
//! every time it is opened. [`FileRegion`] wraps the `open`/`ftruncate`/
//! `mmap(MAP_FIXED)` plumbing that provides such a region on top of a file,
//! and hands out a [`MsyncCommitter`] that flushes dirtied ranges back to it.
//!
//! # Example
//!
//! ```rust,ignore
//! use fmem::{FileRegion, Fmem};
//!
//! let map_at = FileRegion::default_map_addr();
//! let region = unsafe { FileRegion::create("/tmp/state.region", 1 << 20, map_at)? };
//! let fm = unsafe {
//!     Fmem::create_new(region.base(), region.len(), 0, Some(Box::new(region.committer()?)))?
//! };
//!
//! // ... allocate, write, commit ...
//!
//! // Another process (or a later run) maps the same file at the same
//! // address and picks the allocator back up with `Fmem::from_existing`.
//! ```

use crate::commit::{CommitRange, Committer};
use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::mm::{MapFlags, MsyncFlags, ProtFlags};
use std::ffi::c_void;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// A fixed-size byte region backed by a memory-mapped file.
///
/// The mapping is `MAP_SHARED | MAP_FIXED` at a caller-chosen virtual
/// address, so raw pointers stored inside the region stay valid across
/// process restarts as long as every process maps at the same address.
///
/// Dropping the region syncs it best-effort and unmaps it. The backing file
/// is left in place; destroying it is the owner's business.
pub struct FileRegion {
    /// File descriptor of the backing file.
    fd: OwnedFd,
    /// Base of the fixed mapping.
    base: NonNull<u8>,
    /// Size of the region in bytes.
    len: usize,
    /// Path to the backing file.
    path: PathBuf,
}

impl FileRegion {
    /// A fixed map address comfortably away from the heap and the usual
    /// mmap area: the start of the millionth page.
    ///
    /// Any page-aligned address free in every participating process works;
    /// this is merely a usable default.
    pub fn default_map_addr() -> usize {
        rustix::param::page_size() * 1_000_000
    }

    /// Create (or truncate) the backing file and map `len` bytes of it at
    /// `map_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is 0, `map_at` is not page-aligned, or any
    /// of the `open`/`ftruncate`/`mmap` calls fail.
    ///
    /// # Safety
    ///
    /// `MAP_FIXED` replaces whatever is mapped at `map_at`: the caller must
    /// ensure the range `[map_at, map_at + len)` does not overlap any live
    /// mapping (stack, heap, code, or another region).
    pub unsafe fn create<P: AsRef<Path>>(path: P, len: usize, map_at: usize) -> Result<Self> {
        use rustix::fs::{Mode, OFlags};

        let path = path.as_ref();
        Self::check_geometry(len, map_at)?;

        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::CREATE | OFlags::TRUNC,
            Mode::from_raw_mode(0o644),
        )?;
        rustix::fs::ftruncate(&fd, len as u64)?;

        let base = unsafe { Self::map_fixed(&fd, len, map_at)? };

        tracing::debug!(path = %path.display(), len, map_at, "created file region");
        Ok(Self {
            fd,
            base,
            len,
            path: path.to_path_buf(),
        })
    }

    /// Map an existing backing file at `map_at`.
    ///
    /// The region length is taken from the file size.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or is empty, `map_at` is
    /// not page-aligned, or the mapping fails.
    ///
    /// # Safety
    ///
    /// Same requirements as [`FileRegion::create`]. Additionally, for the
    /// region to be usable by an allocator reopened over it, `map_at` must
    /// equal the address the region was originally created at.
    pub unsafe fn open<P: AsRef<Path>>(path: P, map_at: usize) -> Result<Self> {
        use rustix::fs::{Mode, OFlags};

        let path = path.as_ref();
        let fd = rustix::fs::open(path, OFlags::RDWR, Mode::empty())?;

        let len = rustix::fs::fstat(&fd)?.st_size as usize;
        Self::check_geometry(len, map_at)?;

        let base = unsafe { Self::map_fixed(&fd, len, map_at)? };

        tracing::debug!(path = %path.display(), len, map_at, "opened file region");
        Ok(Self {
            fd,
            base,
            len,
            path: path.to_path_buf(),
        })
    }

    fn check_geometry(len: usize, map_at: usize) -> Result<()> {
        if len == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "region length must be greater than 0",
            )));
        }
        if map_at == 0 || map_at % rustix::param::page_size() != 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "map address must be non-null and page-aligned",
            )));
        }
        Ok(())
    }

    unsafe fn map_fixed(fd: &OwnedFd, len: usize, map_at: usize) -> Result<NonNull<u8>> {
        let ptr = unsafe {
            rustix::mm::mmap(
                map_at as *mut c_void,
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED | MapFlags::FIXED,
                fd,
                0,
            )?
        };
        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::Io(io::Error::other("mmap returned null")))
    }

    /// Base address of the mapping.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Size of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the region has zero length (never, by construction).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path to the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Synchronously flush the whole region to the backing file.
    pub fn sync(&self) -> Result<()> {
        unsafe {
            rustix::mm::msync(self.base.as_ptr().cast(), self.len, MsyncFlags::SYNC)?;
        }
        Ok(())
    }

    /// A committer that flushes ranges of this region with `msync`.
    ///
    /// The committer duplicates the file descriptor, so it stays valid for
    /// as long as the mapping does even if the `FileRegion` handle is
    /// dropped first.
    pub fn committer(&self) -> Result<MsyncCommitter> {
        let fd = rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?;
        Ok(MsyncCommitter {
            base: self.base.as_ptr() as usize,
            len: self.len,
            fd,
        })
    }
}

impl Drop for FileRegion {
    fn drop(&mut self) {
        // Flush before unmapping so a clean shutdown persists everything,
        // committed or not.
        let _ = self.sync();
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.len);
        }
        // fd closes when OwnedFd drops.
    }
}

// SAFETY: the mapping is MAP_SHARED; the kernel keeps it coherent across
// threads, and FileRegion itself holds no thread-local state.
unsafe impl Send for FileRegion {}
unsafe impl Sync for FileRegion {}

/// Flushes commit ranges to a [`FileRegion`]'s backing file with `msync`.
///
/// `msync` requires page-aligned start addresses, so every range is rounded
/// down to the nearest page boundary (clamped at the region base) with its
/// length extended to compensate. A single range is flushed synchronously; a
/// scatter/gather batch is flushed asynchronously per range and then fenced
/// with one `fsync` of the backing file.
pub struct MsyncCommitter {
    base: usize,
    len: usize,
    fd: OwnedFd,
}

impl MsyncCommitter {
    /// Page-align a range downward, clamped to the region base.
    fn aligned(&self, range: &CommitRange) -> (*mut c_void, usize) {
        let page = rustix::param::page_size();
        let original = range.addr as usize;
        let mut start = original - (original % page);
        if start < self.base {
            start = self.base;
        }
        (start as *mut c_void, (original - start) + range.len)
    }
}

impl Committer for MsyncCommitter {
    fn commit(&self, ranges: &[CommitRange]) -> io::Result<usize> {
        if let [range] = ranges {
            let (addr, len) = self.aligned(range);
            unsafe { rustix::mm::msync(addr, len, MsyncFlags::SYNC) }
                .map_err(io::Error::from)?;
            return Ok(len);
        }

        let mut total = 0;
        for range in ranges {
            let (addr, len) = self.aligned(range);
            unsafe { rustix::mm::msync(addr, len, MsyncFlags::ASYNC) }
                .map_err(io::Error::from)?;
            total += len;
        }
        // Wait on all the async writes at once.
        rustix::fs::fsync(&self.fd).map_err(io::Error::from)?;
        Ok(total)
    }
}
