//! The fixed-region allocator.
//!
//! [`Fmem`] is a malloc-style allocator that operates entirely inside a
//! caller-supplied, fixed-size byte region. The region is typically a
//! memory-mapped file or shared-memory object (see [`crate::region`]), which
//! lets the allocator's state and every allocation outlive the process.
//!
//! # Region layout
//!
//! ```text
//! ┌─────────────┬────────────────┬─────────────┬──────────────────────┐
//! │ head header │ accounting     │ tail header │ free payload bytes   │
//! └─────────────┴────────────────┴─────────────┴──────────────────────┘
//! ^                                                                   ^
//! region                                                 region + length
//! ```
//!
//! The region starts with one permanently-busy *head page* whose payload is
//! the accounting block, followed by one massive free page spanning the
//! rest of the region. Allocation walks the page ring first-fit and carves
//! smaller pages out of free ones; release marks the page free and coalesces
//! it with free neighbors.
//!
//! Carving always cuts from the *tail* of a free page, so free space stays
//! close to the ring head and the first-fit walk approaches O(1) while any
//! allocation holds.
//!
//! # Persistence
//!
//! Every metadata mutation that must survive a restart is forwarded to the
//! optional [`Committer`] as one or more `(address, length)` ranges. The
//! committer is process-local and re-supplied on every reopen; it is never
//! stored inside the region (a function reference is meaningless in another
//! process).
//!
//! All in-region links are raw absolute addresses: the region must be mapped
//! at the same virtual address it was created at. Memory moves are not
//! supported.

use crate::commit::{CommitRange, Committer};
use crate::error::{Error, Result};
use crate::list::ListNode;
use crate::page::{Fit, PageHeader, PAGE_MAGIC, PAGE_OVERHEAD};
use std::mem::size_of;
use std::ptr::{addr_of, addr_of_mut, NonNull};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Region-wide accounting, stored as the payload of the head page.
///
/// The struct layout is part of the on-region format. Integer fields are
/// stored in native (little-endian) byte order with no conversion.
#[repr(C)]
pub(crate) struct Accounting {
    /// Total bytes in the region.
    total_size: u64,
    /// Bytes currently belonging to free pages, headers included.
    total_available: u64,
    /// Busy pages other than the head.
    alloc_objects: u32,
    /// Minimum payload handed out per allocation.
    min_alloc: u32,
    /// Opaque client root-pointer slots; never inspected by the allocator.
    user: [AtomicUsize; 4],
    /// Spinlock word serializing all page and accounting mutations.
    lock: AtomicU32,
}

/// Snapshot of the allocator's accounting, read under the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FmemStats {
    /// Total bytes in the region.
    pub total_size: u64,
    /// Bytes currently belonging to free pages, headers included.
    pub total_available: u64,
    /// Busy pages other than the head.
    pub alloc_objects: u32,
    /// Minimum payload handed out per allocation.
    pub min_alloc: u32,
}

/// A fixed-region memory allocator.
///
/// The handle owns no region memory: it carries a pointer to the in-region
/// accounting block plus the process-local committer. Dropping the handle
/// leaves the region untouched; whoever owns the backing store destroys it.
///
/// All mutating operations are serialized by a spinlock word inside the
/// region, so the handle can be shared freely across threads (and, when the
/// region is shared memory, across processes).
///
/// # Example
///
/// ```rust
/// use fmem::Fmem;
/// use std::ptr::NonNull;
///
/// // Any 8-byte-aligned buffer works as a region; a mapped file makes it
/// // persistent.
/// let mut backing = vec![0u64; 64 * 1024 / 8];
/// let region = NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap();
///
/// let fm = unsafe { Fmem::create_new(region, 64 * 1024, 0, None) }.unwrap();
/// let mem = fm.alloc(128).unwrap();
/// assert_eq!(fm.alloc_objects(), 1);
///
/// let freed = unsafe { fm.free(mem) }.unwrap();
/// assert!(freed as usize >= 128);
/// ```
pub struct Fmem {
    /// The in-region accounting block (payload of the head page).
    acct: NonNull<Accounting>,
    /// Process-local persistence callback; never written to the region.
    committer: Option<Box<dyn Committer>>,
}

impl core::fmt::Debug for Fmem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fmem")
            .field("acct", &self.acct)
            .field("committer", &self.committer.is_some())
            .finish()
    }
}

// SAFETY: Fmem is Send + Sync because every page and accounting mutation
// happens under the in-region spinlock, the user slots are atomics, and the
// committer is required to be Send + Sync.
unsafe impl Send for Fmem {}
unsafe impl Sync for Fmem {}

impl Fmem {
    /// Bytes of overhead each page carries (its header).
    pub const PAGE_OVERHEAD: usize = size_of::<PageHeader>();

    /// Bytes the accounting block occupies inside the head page.
    pub const ACCOUNTING_OVERHEAD: usize = size_of::<Accounting>();

    /// Smallest region [`Fmem::create_new`] accepts.
    pub const MIN_REGION_LEN: usize = 3 * Self::PAGE_OVERHEAD + Self::ACCOUNTING_OVERHEAD;

    /// Default minimum allocation unit; avoids drowning in tiny pages.
    pub const DEFAULT_MIN_ALLOC: u32 = PAGE_OVERHEAD;

    /// Number of opaque user root-pointer slots.
    pub const USER_SLOTS: usize = 4;

    /// Create a new allocator over `length` bytes starting at `region`.
    ///
    /// Writes the head page (whose payload is the accounting block) and one
    /// massive free page covering the rest of the region. Requests smaller
    /// than `min_alloc` are rounded up; a `min_alloc` below
    /// [`Fmem::DEFAULT_MIN_ALLOC`] is clamped up to it.
    ///
    /// If a committer is supplied, the freshly written region prefix (both
    /// headers plus the accounting block) is committed before returning.
    ///
    /// # Errors
    ///
    /// - [`Error::RegionTooSmall`] if `length` cannot hold the bookkeeping.
    /// - [`Error::BadInitMem`] if `length` cannot hold one `min_alloc`
    ///   allocation on top of the bookkeeping.
    /// - [`Error::RegionTooLarge`] if a page size would overflow 32 bits.
    /// - [`Error::CommitFailed`] if the committer rejects the initial commit.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes of `length` bytes, at
    /// least 8-byte aligned, and must not be accessed through other pointers
    /// while the returned handle (or any handle derived from the region) is
    /// in use.
    pub unsafe fn create_new(
        region: NonNull<u8>,
        length: usize,
        min_alloc: u32,
        committer: Option<Box<dyn Committer>>,
    ) -> Result<Self> {
        let header = Self::PAGE_OVERHEAD;
        let bookkeeping = 2 * header + Self::ACCOUNTING_OVERHEAD;

        if length < Self::MIN_REGION_LEN {
            return Err(Error::RegionTooSmall {
                got: length,
                min: Self::MIN_REGION_LEN,
            });
        }
        if length < min_alloc as usize + bookkeeping {
            return Err(Error::BadInitMem {
                got: length,
                min_alloc,
            });
        }
        if length - (header + Self::ACCOUNTING_OVERHEAD) > u32::MAX as usize {
            return Err(Error::RegionTooLarge);
        }
        let min_alloc = min_alloc.max(Self::DEFAULT_MIN_ALLOC);

        // Head page: permanently busy, payload is the accounting block.
        let head = region.as_ptr() as *mut PageHeader;
        unsafe {
            std::ptr::write_bytes(head as *mut u8, 0, header);
            (*head).set_size((header + Self::ACCOUNTING_OVERHEAD) as u32);
            ListNode::init(addr_of_mut!((*head).list));
            (*head).set_busy();
            (*head).set_magic(PAGE_MAGIC);
        }

        // total_available counts free pages whole, header included, so it
        // starts at exactly the main page's size and stays equal to the sum
        // of free page sizes through every alloc and free.
        let acct = unsafe { PageHeader::payload(head) as *mut Accounting };
        unsafe {
            acct.write(Accounting {
                total_size: length as u64,
                total_available: (length - (header + Self::ACCOUNTING_OVERHEAD)) as u64,
                alloc_objects: 0,
                min_alloc,
                user: [
                    AtomicUsize::new(0),
                    AtomicUsize::new(0),
                    AtomicUsize::new(0),
                    AtomicUsize::new(0),
                ],
                lock: AtomicU32::new(UNLOCKED),
            });
        }

        // The one massive free page spanning the rest of the region.
        unsafe {
            let main = (head as *mut u8).add((*head).size() as usize) as *mut PageHeader;
            std::ptr::write_bytes(main as *mut u8, 0, header);
            (*main).set_size((length - (*head).size() as usize) as u32);
            ListNode::add_after(addr_of_mut!((*head).list), addr_of_mut!((*main).list));
            (*main).set_free();
            (*main).set_magic(PAGE_MAGIC);
        }

        let fm = Fmem {
            // SAFETY: acct points into the region, right after the head header.
            acct: unsafe { NonNull::new_unchecked(acct) },
            committer,
        };
        fm.maybe_commit(&[CommitRange::new(region.as_ptr(), bookkeeping)])?;

        tracing::debug!(length, min_alloc, "created allocator on region");
        Ok(fm)
    }

    /// Reattach to an allocator previously created over `region`.
    ///
    /// The stored state is authoritative: nothing is rewritten and no commit
    /// is issued. The transient committer is installed into the new handle
    /// and the lock is reset to recover from a crashed holder, which is
    /// only safe when the caller knows no other process is mid-operation.
    ///
    /// # Errors
    ///
    /// [`Error::Corruption`] if the head page fails the poison check.
    ///
    /// # Safety
    ///
    /// `region` must be mapped at the same virtual address the allocator was
    /// created at, and the same aliasing rules as [`Fmem::create_new`] apply.
    pub unsafe fn from_existing(
        region: NonNull<u8>,
        committer: Option<Box<dyn Committer>>,
    ) -> Result<Self> {
        let head = region.as_ptr() as *mut PageHeader;
        unsafe { PageHeader::verify_magic(head)? };

        let acct = unsafe { PageHeader::payload(head) as *mut Accounting };
        unsafe { (*acct).lock.store(UNLOCKED, Ordering::SeqCst) };

        tracing::debug!(region = region.as_ptr() as usize, "reopened allocator");
        Ok(Fmem {
            // SAFETY: acct points into the region, right after the head header.
            acct: unsafe { NonNull::new_unchecked(acct) },
            committer,
        })
    }

    /// Allocate `size` payload bytes.
    ///
    /// Walks the page ring first-fit. A request below the minimum allocation
    /// unit is rounded up to it. When the chosen page is comfortably larger
    /// than the request, a new page is carved off its tail and returned; the
    /// shrunk head fragment stays free.
    ///
    /// # Errors
    ///
    /// - [`Error::OutOfMemory`] when no free page fits the request.
    /// - [`Error::Corruption`] when a visited page fails the poison check.
    /// - [`Error::CommitFailed`] when the committer rejects the mutation; the
    ///   in-region state has already changed and the allocator must be
    ///   considered unusable.
    pub fn alloc(&self, size: u32) -> Result<NonNull<u8>> {
        let needed = size.max(self.min_alloc());
        let _guard = self.lock();

        // Cheap rejection before walking; carve overhead may still make an
        // individual fit impossible, which the walk discovers.
        if unsafe { (*self.acct.as_ptr()).total_available } < needed as u64 {
            return Err(Error::OutOfMemory { requested: needed });
        }

        let head = self.head_page();
        let mut selected: *mut PageHeader = std::ptr::null_mut();
        let mut carved = false;

        // SAFETY: the ring is intact and we hold the lock.
        unsafe {
            for link in ListNode::iter(addr_of_mut!((*head).list)) {
                let page = PageHeader::from_link(link.as_ptr());
                PageHeader::verify_magic(page)?;
                if !(*page).is_free() {
                    continue;
                }
                match (*page).fit(needed) {
                    Fit::CannotFit => continue,
                    Fit::AsIs => {
                        selected = page;
                        break;
                    }
                    Fit::WithCarve => {
                        selected = PageHeader::carve(page, needed);
                        carved = true;
                        break;
                    }
                }
            }
        }

        if selected.is_null() {
            return Err(Error::OutOfMemory { requested: needed });
        }

        unsafe {
            (*selected).set_busy();
            (*selected).set_magic(PAGE_MAGIC);

            let acct = self.acct.as_ptr();
            (*acct).total_available -= (*selected).size() as u64;
            (*acct).alloc_objects += 1;
        }

        if self.committer.is_some() {
            let header = CommitRange::new(selected as *const u8, Self::PAGE_OVERHEAD);
            if carved {
                // Scatter/gather: the new header, the shrunk previous
                // sibling, and the next sibling's relinked pair.
                let ranges = unsafe {
                    let prev = PageHeader::from_link((*selected).list.prev);
                    let next = PageHeader::from_link((*selected).list.next);
                    [
                        header,
                        CommitRange::new(prev as *const u8, Self::PAGE_OVERHEAD),
                        CommitRange::new(
                            addr_of!((*next).list) as *const u8,
                            size_of::<ListNode>(),
                        ),
                    ]
                };
                self.run_committer(&ranges)?;
            } else {
                // Only the flags word changed; one range covers it.
                self.run_committer(&[header])?;
            }
        }

        // SAFETY: payload of a live page is never null.
        Ok(unsafe { NonNull::new_unchecked(PageHeader::payload(selected)) })
    }

    /// Release an allocation, coalescing with free neighbors.
    ///
    /// Returns the total bytes returned to the pool, header included.
    ///
    /// # Errors
    ///
    /// - [`Error::Corruption`] when the page fails the poison check.
    /// - [`Error::CommitFailed`] when the committer rejects the mutation
    ///   (state already changed, allocator unusable).
    ///
    /// # Safety
    ///
    /// `mem` must be a payload address returned by [`Fmem::alloc`] on this
    /// allocator and not already freed, and the client must no longer touch
    /// the payload.
    pub unsafe fn free(&self, mem: NonNull<u8>) -> Result<u32> {
        let page = unsafe { PageHeader::from_payload(mem.as_ptr()) };
        let _guard = self.lock();

        unsafe { PageHeader::verify_magic(page)? };

        let freed = unsafe {
            let freed = (*page).size();
            (*page).set_free();
            freed
        };
        let survivor = unsafe { PageHeader::merge(page) };

        unsafe {
            let acct = self.acct.as_ptr();
            (*acct).alloc_objects -= 1;
            (*acct).total_available += freed as u64;
        }

        if self.committer.is_some() {
            // Scatter/gather: the survivor's whole header plus the link
            // pairs of both neighbors, all of which merge may have touched.
            let ranges = unsafe {
                let prev = PageHeader::from_link((*survivor).list.prev);
                let next = PageHeader::from_link((*survivor).list.next);
                [
                    CommitRange::new(survivor as *const u8, Self::PAGE_OVERHEAD),
                    CommitRange::new(addr_of!((*prev).list) as *const u8, size_of::<ListNode>()),
                    CommitRange::new(addr_of!((*next).list) as *const u8, size_of::<ListNode>()),
                ]
            };
            self.run_committer(&ranges)?;
        }

        Ok(freed)
    }

    /// Persist the four user root-pointer slots.
    ///
    /// Submits exactly one range covering the slots. No lock is taken: the
    /// slots are owned by the client, who serializes their own updates.
    ///
    /// # Errors
    ///
    /// [`Error::CommitFailed`] if no committer is installed or it rejects
    /// the range; [`Error::Corruption`] if the head page fails the poison
    /// check.
    pub fn commit_user_data(&self) -> Result<usize> {
        unsafe { PageHeader::verify_magic(self.head_page())? };

        let len = Self::USER_SLOTS * size_of::<usize>();
        let addr = unsafe { addr_of!((*self.acct.as_ptr()).user) as *const u8 };
        self.run_committer(&[CommitRange::new(addr, len)])?;
        Ok(len)
    }

    /// Persist `len` bytes of a client allocation starting at `mem`.
    ///
    /// A `len` of 0 means the allocation's whole payload.
    ///
    /// # Errors
    ///
    /// [`Error::CommitFailed`] if no committer is installed, the range
    /// exceeds the allocation's payload, or the committer rejects it;
    /// [`Error::Corruption`] if the owning page fails the poison check.
    ///
    /// # Safety
    ///
    /// `mem` must be a payload address returned by [`Fmem::alloc`] on this
    /// allocator and not freed.
    pub unsafe fn commit_mem(&self, mem: NonNull<u8>, len: u32) -> Result<usize> {
        let page = unsafe { PageHeader::from_payload(mem.as_ptr()) };
        let _guard = self.lock();

        unsafe { PageHeader::verify_magic(page)? };

        let payload = unsafe { (*page).payload_size() };
        let len = if len == 0 { payload } else { len };
        if len > payload {
            return Err(Error::CommitFailed(format!(
                "range of {len} bytes exceeds the allocation payload of {payload}"
            )));
        }

        self.run_committer(&[CommitRange::new(mem.as_ptr(), len as usize)])?;
        Ok(len as usize)
    }

    /// Store an opaque value in user slot `slot` (0-based, up to
    /// [`Fmem::USER_SLOTS`]).
    ///
    /// The slots are meant for client root pointers; the allocator never
    /// inspects them. They are not covered by the allocator lock.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range.
    pub fn set_user(&self, slot: usize, value: usize) {
        self.user_slot(slot).store(value, Ordering::Relaxed);
    }

    /// Read user slot `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range.
    pub fn user(&self, slot: usize) -> usize {
        self.user_slot(slot).load(Ordering::Relaxed)
    }

    /// Total bytes in the region.
    pub fn total_size(&self) -> u64 {
        // Immutable after creation; no lock needed.
        unsafe { (*self.acct.as_ptr()).total_size }
    }

    /// Minimum payload handed out per allocation.
    pub fn min_alloc(&self) -> u32 {
        // Immutable after creation; no lock needed.
        unsafe { (*self.acct.as_ptr()).min_alloc }
    }

    /// Bytes currently belonging to free pages, headers included.
    pub fn total_available(&self) -> u64 {
        let _guard = self.lock();
        unsafe { (*self.acct.as_ptr()).total_available }
    }

    /// Number of live allocations.
    pub fn alloc_objects(&self) -> u32 {
        let _guard = self.lock();
        unsafe { (*self.acct.as_ptr()).alloc_objects }
    }

    /// Consistent snapshot of the accounting block.
    pub fn stats(&self) -> FmemStats {
        let _guard = self.lock();
        let acct = self.acct.as_ptr();
        unsafe {
            FmemStats {
                total_size: (*acct).total_size,
                total_available: (*acct).total_available,
                alloc_objects: (*acct).alloc_objects,
                min_alloc: (*acct).min_alloc,
            }
        }
    }

    fn user_slot(&self, slot: usize) -> &AtomicUsize {
        debug_assert!(slot < Self::USER_SLOTS);
        unsafe { &(*self.acct.as_ptr()).user[slot] }
    }

    /// The head page enclosing the accounting block.
    pub(crate) fn head_page(&self) -> *mut PageHeader {
        unsafe { (self.acct.as_ptr() as *mut u8).sub(Self::PAGE_OVERHEAD) as *mut PageHeader }
    }

    fn lock(&self) -> SpinGuard<'_> {
        let lock = unsafe { &(*self.acct.as_ptr()).lock };
        while lock
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinGuard { lock }
    }

    fn run_committer(&self, ranges: &[CommitRange]) -> Result<usize> {
        let Some(committer) = &self.committer else {
            return Err(Error::CommitFailed("no committer installed".into()));
        };
        committer.commit(ranges).map_err(|e| {
            tracing::error!(error = %e, "committer reported failure");
            Error::CommitFailed(e.to_string())
        })
    }

    fn maybe_commit(&self, ranges: &[CommitRange]) -> Result<()> {
        if self.committer.is_some() {
            self.run_committer(ranges)?;
        }
        Ok(())
    }
}

struct SpinGuard<'a> {
    lock: &'a AtomicU32,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.store(UNLOCKED, Ordering::SeqCst);
    }
}
