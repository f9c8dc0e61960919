//! Error types for fmem.

use thiserror::Error;

/// Result type alias using fmem's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for fmem operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The caller-supplied region is smaller than the allocator bookkeeping.
    #[error("region too small: {got} bytes, minimum is {min}")]
    RegionTooSmall {
        /// Length the caller supplied.
        got: usize,
        /// Smallest region the allocator can operate on.
        min: usize,
    },

    /// The region cannot hold even one minimum-sized allocation.
    #[error("region of {got} bytes cannot fit min_alloc {min_alloc} plus bookkeeping")]
    BadInitMem {
        /// Length the caller supplied.
        got: usize,
        /// Requested minimum allocation unit.
        min_alloc: u32,
    },

    /// The region is too large for the 32-bit page size field.
    #[error("region too large: a page size must fit in 32 bits")]
    RegionTooLarge,

    /// No free page is large enough to satisfy the request.
    #[error("out of memory: no free page can fit {requested} bytes")]
    OutOfMemory {
        /// Size of the failed request, after min_alloc rounding.
        requested: u32,
    },

    /// A page magic value did not match the poison sentinel.
    #[error("page corruption detected at {addr:#x}: magic {found:#06x}, expected {expected:#06x}")]
    Corruption {
        /// Address of the corrupted page header.
        addr: usize,
        /// Magic value found in the header.
        found: u16,
        /// The expected sentinel.
        expected: u16,
    },

    /// The committer reported failure, or a commit range was out of bounds.
    ///
    /// The allocator's in-region state has already been mutated when this is
    /// returned from `alloc` or `free`; the caller must treat the allocator
    /// as unusable.
    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
