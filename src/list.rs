//! Intrusive circular doubly-linked list.
//!
//! This is the linking primitive used to chain pages inside a fixed memory
//! region. Nodes are embedded in their enclosing structure and never
//! allocated on their own; the enclosing structure is recovered from a link
//! with pointer arithmetic (the page layer does this with `offset_of!`).
//!
//! The list is circular: an empty list is a node linked to itself, and the
//! iterators detect the end of a traversal by identity against the head node
//! they were started from. The head itself is never yielded.
//!
//! All operations work on raw pointers because the nodes live inside a
//! caller-supplied byte region, not in Rust-owned memory.

use std::ptr::NonNull;

/// A pair of absolute links embedded in a larger structure.
///
/// The links are raw in-region addresses; they are only valid while the
/// region is mapped at the address it was created at.
#[repr(C)]
#[derive(Debug)]
pub struct ListNode {
    /// Previous node in the ring.
    pub(crate) prev: *mut ListNode,
    /// Next node in the ring.
    pub(crate) next: *mut ListNode,
}

impl ListNode {
    /// Initialize `node` as a single-element ring (self-linked).
    ///
    /// # Safety
    ///
    /// `node` must point to writable memory large enough for a `ListNode`.
    pub unsafe fn init(node: *mut ListNode) {
        unsafe {
            (*node).prev = node;
            (*node).next = node;
        }
    }

    /// Link `new` into the ring immediately after `cur`.
    ///
    /// # Safety
    ///
    /// `cur` must be part of an initialized ring and `new` must point to
    /// writable memory not currently linked anywhere.
    pub unsafe fn add_after(cur: *mut ListNode, new: *mut ListNode) {
        unsafe {
            let next = (*cur).next;
            (*next).prev = new;
            (*new).next = next;
            (*new).prev = cur;
            (*cur).next = new;
        }
    }

    /// Link `new` into the ring immediately before `cur`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`ListNode::add_after`].
    pub unsafe fn add_before(cur: *mut ListNode, new: *mut ListNode) {
        unsafe {
            let prev = (*cur).prev;
            (*new).prev = prev;
            (*new).next = cur;
            (*cur).prev = new;
            (*prev).next = new;
        }
    }

    /// Unlink `node` from its ring.
    ///
    /// The node's own links are left dangling; it must be re-initialized
    /// before reuse.
    ///
    /// # Safety
    ///
    /// `node` must be part of an initialized ring.
    pub unsafe fn remove(node: *mut ListNode) {
        unsafe {
            let prev = (*node).prev;
            let next = (*node).next;
            (*prev).next = next;
            (*next).prev = prev;
        }
    }

    /// Iterate the ring forward, starting at `head.next`.
    ///
    /// The node passed as `head` is skipped: the iterator visits `head.next`
    /// through the node whose `next` is `head`.
    ///
    /// # Safety
    ///
    /// `head` must be part of an initialized ring, and the ring must not be
    /// relinked while the iterator is in use, except for nodes the caller
    /// has already moved past.
    pub unsafe fn iter(head: *mut ListNode) -> Iter {
        Iter {
            head,
            // SAFETY: head is part of an initialized ring per the contract.
            cur: unsafe { (*head).next },
        }
    }

    /// Iterate the ring backward, starting at `head.prev`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`ListNode::iter`].
    pub unsafe fn iter_rev(head: *mut ListNode) -> IterRev {
        IterRev {
            head,
            // SAFETY: head is part of an initialized ring per the contract.
            cur: unsafe { (*head).prev },
        }
    }
}

/// Forward ring iterator; see [`ListNode::iter`].
pub struct Iter {
    head: *mut ListNode,
    cur: *mut ListNode,
}

impl Iterator for Iter {
    type Item = NonNull<ListNode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == self.head {
            return None;
        }
        let node = self.cur;
        // SAFETY: cur is a live ring node per the construction contract.
        self.cur = unsafe { (*node).next };
        NonNull::new(node)
    }
}

/// Backward ring iterator; see [`ListNode::iter_rev`].
pub struct IterRev {
    head: *mut ListNode,
    cur: *mut ListNode,
}

impl Iterator for IterRev {
    type Item = NonNull<ListNode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == self.head {
            return None;
        }
        let node = self.cur;
        // SAFETY: cur is a live ring node per the construction contract.
        self.cur = unsafe { (*node).prev };
        NonNull::new(node)
    }
}
