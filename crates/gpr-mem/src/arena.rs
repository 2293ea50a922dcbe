//! Self-growing bump allocator.
//!
//! An [`Arena`] hands out memory by bumping a cursor through a chain of
//! nodes. Each node is one block taken from a backing allocator (the
//! [`HEAP`] unless configured otherwise), with a small header at its start.
//! When the newest node cannot fit a request, a new node of
//! `max(capacity, request)` bytes is linked in front of it, so an arena never
//! reports exhaustion on its own.
//!
//! Individual blocks are never freed. Memory comes back in bulk:
//!
//! - [`Arena::rewind`] moves the cursor back to an earlier
//!   [`position`](Arena::position), freeing every node newer than the one
//!   holding it.
//! - Dropping the arena (or [`Arena::delete`]) frees every node.
//!
//! # Layout
//!
//! ```text
//! head ─► | Node | data ............ |      (newest, active)
//!            │ tail
//!            ▼
//!         | Node | data ...... |            (older)
//! ```
//!
//! # Examples
//!
//! ```
//! use gpr_mem::alloc::Allocator;
//! use gpr_mem::arena::Arena;
//!
//! let arena = Arena::new(1024);
//!
//! let mark = arena.position();
//! let a = arena.alloc(100);
//! let b = arena.alloc(100);
//!
//! arena.rewind(mark).unwrap();
//! assert_eq!(arena.alloc(100), a);
//! assert_eq!(arena.alloc(100), b);
//! ```

use std::cell::Cell;
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};

use crate::alloc::{
    ALLOC_ALIGNMENT, Allocator, HEAP, Heap, checked_round_to_aligned, realloc_by_copy,
    round_to_aligned,
};
use crate::error::{Error, Result};

/// Arena allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Number of nodes in the chain.
    pub node_count: usize,
    /// Sum of the data capacity of all nodes in bytes.
    pub total_capacity: usize,
    /// Bytes handed out and not rewound, including alignment padding.
    pub bytes_used: usize,
}

/// Header stored at the start of every node block.
///
/// The node's data area starts [`NODE_HEADER`] bytes after the header and
/// ends at `end`.
struct Node {
    /// Next free byte of this node.
    position: Cell<*mut u8>,
    /// One past the last data byte.
    end: *mut u8,
    /// The previous, older node. Null for the first node.
    tail: *mut Node,
}

const NODE_HEADER: usize = round_to_aligned(mem::size_of::<Node>());

/// Rounds a request up to the alignment, aborting like the heap when the
/// result does not fit in `usize`.
#[inline(always)]
fn aligned_request(size: usize) -> usize {
    match checked_round_to_aligned(size) {
        Some(size) => size,
        None => Heap::out_of_memory(size, None),
    }
}

impl Node {
    /// Allocates a node with `capacity` bytes of data from `backing`.
    fn create(
        backing: &'static (dyn Allocator + Sync),
        capacity: usize,
        tail: *mut Node,
    ) -> NonNull<Node> {
        let Some(total) = NODE_HEADER.checked_add(capacity) else {
            Heap::out_of_memory(capacity, None)
        };
        let block = backing.alloc(total);

        // SAFETY: the block holds NODE_HEADER + capacity bytes and is aligned
        // for Node, so both the header write and the data pointers are in
        // bounds.
        unsafe {
            let data = block.as_ptr().add(NODE_HEADER);
            let node = block.cast::<Node>();
            node.as_ptr().write(Node {
                position: Cell::new(data),
                end: data.add(capacity),
                tail,
            });
            node
        }
    }

    #[inline(always)]
    fn data(&self) -> *mut u8 {
        // The data area follows the header inside the same block.
        (self as *const Node)
            .cast::<u8>()
            .cast_mut()
            .wrapping_add(NODE_HEADER)
    }

    #[inline(always)]
    fn remaining(&self) -> usize {
        self.end.addr() - self.position.get().addr()
    }

    #[inline(always)]
    fn contains(&self, pos: *mut u8) -> bool {
        self.data().addr() <= pos.addr() && pos.addr() <= self.end.addr()
    }
}

/// Growable region allocator.
///
/// `Arena` implements [`Allocator`]: `alloc` bumps, `dealloc` does nothing,
/// and `realloc` extends the newest block in place when it sits right before
/// the cursor.
///
/// An arena is used from one thread at a time. It may be moved to another
/// thread but not shared between threads.
pub struct Arena {
    /// Newest node; the only one that is allocated from.
    head: Cell<NonNull<Node>>,
    /// Data size of the next node to create when the head overflows.
    capacity: usize,
    /// Where node blocks come from.
    backing: &'static (dyn Allocator + Sync),
}

// SAFETY: the arena exclusively owns its node chain and holds no references
// into thread-local state. `Cell` already keeps it from being `Sync`.
unsafe impl Send for Arena {}

impl Arena {
    /// Creates an arena whose nodes hold `capacity` bytes (rounded up to
    /// [`ALLOC_ALIGNMENT`]) and come from the [`HEAP`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::new_in(capacity, &HEAP)
    }

    /// Creates an arena whose nodes come from `backing`.
    #[must_use]
    pub fn new_in(capacity: usize, backing: &'static (dyn Allocator + Sync)) -> Self {
        let capacity = aligned_request(capacity);
        let head = Node::create(backing, capacity, ptr::null_mut());

        Arena {
            head: Cell::new(head),
            capacity,
            backing,
        }
    }

    #[inline(always)]
    fn head(&self) -> &Node {
        // SAFETY: the head node stays allocated for as long as the arena
        // owns it, and nothing hands out `&mut Node`.
        unsafe { self.head.get().as_ref() }
    }

    /// Data size used for the next node when the current one overflows.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the cursor of the active node.
    ///
    /// Pass it to [`rewind`](Arena::rewind) to release everything allocated
    /// after this call.
    #[must_use]
    pub fn position(&self) -> *mut u8 {
        self.head().position.get()
    }

    /// Bump-allocates `size` bytes, growing the chain when needed.
    #[inline]
    fn bump(&self, size: usize) -> NonNull<u8> {
        let size = aligned_request(size);
        let head = self.head();

        if head.remaining() < size {
            return self.bump_new_node(size);
        }

        let block = head.position.get();
        head.position.set(block.wrapping_add(size));
        // SAFETY: the cursor points into a live node block, never null.
        unsafe { NonNull::new_unchecked(block) }
    }

    #[cold]
    fn bump_new_node(&self, size: usize) -> NonNull<u8> {
        let node_capacity = self.capacity.max(size);
        gpr_log::trace!("arena node of {} bytes for a {} byte request", node_capacity, size);

        let node = Node::create(self.backing, node_capacity, self.head.get().as_ptr());
        self.head.set(node);

        let head = self.head();
        let block = head.position.get();
        head.position.set(block.wrapping_add(size));
        // SAFETY: as in `bump`.
        unsafe { NonNull::new_unchecked(block) }
    }

    /// Moves `value` into the arena and returns a pointer to it.
    ///
    /// Types aligned beyond [`ALLOC_ALIGNMENT`] get padded placement. The
    /// value is never dropped by the arena.
    pub fn alloc_value<T>(&self, value: T) -> *mut T {
        let align = mem::align_of::<T>();
        let size = mem::size_of::<T>();

        let slot = if align <= ALLOC_ALIGNMENT {
            self.bump(size).as_ptr()
        } else {
            let padded = size.saturating_add(align - ALLOC_ALIGNMENT);
            let raw = self.bump(padded).as_ptr();
            raw.wrapping_add(raw.align_offset(align))
        };

        let slot = slot.cast::<T>();
        // SAFETY: slot is aligned for T and backed by at least size_of::<T>()
        // freshly allocated bytes.
        unsafe { slot.write(value) };
        slot
    }

    /// Rewinds the cursor to `position`, releasing everything allocated
    /// after it.
    ///
    /// Nodes newer than the one containing `position` are freed. An address
    /// that no node contains is rejected with
    /// [`Error::PositionOutOfArena`] and the arena is left untouched.
    pub fn rewind(&self, position: *mut u8) -> Result<()> {
        if !self.nodes().any(|node| node.contains(position)) {
            gpr_log::warn!("rewind to {:p} outside of arena ignored", position);
            return Err(Error::PositionOutOfArena {
                addr: position.addr(),
            });
        }

        while !self.head().contains(position) {
            self.delete_head();
        }
        self.head().position.set(position);
        Ok(())
    }

    /// Frees the head node and makes its tail active.
    ///
    /// Only called while an older node exists.
    fn delete_head(&self) {
        let old = self.head.get();
        let tail = self.head().tail;
        debug_assert!(!tail.is_null(), "deleting the oldest arena node");

        // SAFETY: tail is a live, older node of this chain (checked by the
        // callers), and `old` is not referenced after being freed.
        unsafe {
            self.head.set(NonNull::new_unchecked(tail));
            self.backing.dealloc(old.as_ptr().cast());
        }
        gpr_log::trace!("arena node {:p} released", old);
    }

    /// Frees every node. Equivalent to dropping the arena.
    pub fn delete(self) {
        drop(self);
    }

    /// Walks the chain from newest to oldest.
    fn nodes(&self) -> impl Iterator<Item = &Node> {
        let mut next = self.head.get().as_ptr();
        std::iter::from_fn(move || {
            // SAFETY: every non-null link points at a live node of this arena.
            let node = unsafe { next.as_ref()? };
            next = node.tail;
            Some(node)
        })
    }

    /// Returns allocation statistics for this arena.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        self.nodes().fold(
            ArenaStats {
                node_count: 0,
                total_capacity: 0,
                bytes_used: 0,
            },
            |mut stats, node| {
                stats.node_count += 1;
                stats.total_capacity += node.end.addr() - node.data().addr();
                stats.bytes_used += node.position.get().addr() - node.data().addr();
                stats
            },
        )
    }

    /// Grows `old_block` in place when it is the newest block of the active
    /// node, otherwise falls back to allocate-and-copy.
    ///
    /// # Safety
    ///
    /// Same contract as [`Allocator::realloc`].
    pub(crate) unsafe fn grow(&self, old_block: *mut u8, old_size: usize, new_size: usize) -> NonNull<u8> {
        let head = self.head();
        let at_frontier = !old_block.is_null()
            && checked_round_to_aligned(old_size)
                .is_some_and(|old_size| old_block.wrapping_add(old_size) == head.position.get());

        if !at_frontier {
            // SAFETY: forwarded caller contract.
            return unsafe { realloc_by_copy(self, old_block, old_size, new_size) };
        }

        head.position.set(old_block);
        let new_block = self.bump(new_size);
        if new_block.as_ptr() != old_block {
            // The head overflowed into a fresh node; the old block is still
            // intact in the previous one.
            // SAFETY: distinct nodes never overlap, and both ranges are valid
            // for the copied length.
            unsafe {
                ptr::copy_nonoverlapping(old_block, new_block.as_ptr(), old_size.min(new_size));
            }
        }
        new_block
    }
}

impl Allocator for Arena {
    #[inline]
    fn alloc(&self, size: usize) -> NonNull<u8> {
        self.bump(size)
    }

    unsafe fn dealloc(&self, _block: *mut u8) {}

    unsafe fn realloc(&self, old_block: *mut u8, old_size: usize, new_size: usize) -> NonNull<u8> {
        // SAFETY: forwarded caller contract.
        unsafe { self.grow(old_block, old_size, new_size) }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let mut node = self.head.get().as_ptr();
        while !node.is_null() {
            // SAFETY: each node is live until freed here, and its tail is read
            // before the block goes back to the backing allocator.
            unsafe {
                let tail = (*node).tail;
                self.backing.dealloc(node.cast());
                node = tail;
            }
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}
