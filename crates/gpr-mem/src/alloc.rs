//! The allocator capability and the process heap.
//!
//! Everything in this crate that needs memory asks for it through
//! [`Allocator`], usually as a `&dyn Allocator`. Which concrete allocator sits
//! behind the reference (the [`HEAP`], an [`Arena`](crate::arena::Arena) or a
//! thread-local [`Scope`](crate::scope::Scope)) is the caller's choice.
//!
//! # Contract
//!
//! - [`Allocator::alloc`] never returns null. Blocks are aligned to
//!   [`ALLOC_ALIGNMENT`] and hold at least the requested number of bytes.
//!   Running out of memory is fatal: the heap logs and aborts.
//! - [`Allocator::dealloc`] ignores null. Region allocators ignore everything
//!   else as well and reclaim memory in bulk.
//! - [`Allocator::realloc`] has a generic default (allocate, copy, free) that
//!   region allocators override to grow their newest block in place.
//!
//! # Examples
//!
//! ```
//! use gpr_mem::alloc::{Allocator, HEAP};
//!
//! let block = HEAP.alloc(64);
//! unsafe {
//!     block.as_ptr().write_bytes(0xAB, 64);
//!     let grown = HEAP.realloc(block.as_ptr(), 64, 128);
//!     assert_eq!(*grown.as_ptr().add(63), 0xAB);
//!     HEAP.dealloc(grown.as_ptr());
//! }
//! ```

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Alignment of every block handed out by this crate's allocators.
///
/// Matches the maximum scalar alignment (`max_align_t`) of the supported
/// 64-bit targets.
pub const ALLOC_ALIGNMENT: usize = 16;

/// Rounds `size` up to the next multiple of [`ALLOC_ALIGNMENT`].
///
/// ```
/// use gpr_mem::alloc::round_to_aligned;
///
/// assert_eq!(round_to_aligned(0), 0);
/// assert_eq!(round_to_aligned(1), 16);
/// assert_eq!(round_to_aligned(32), 32);
/// ```
#[inline(always)]
#[must_use]
pub const fn round_to_aligned(size: usize) -> usize {
    (size + ALLOC_ALIGNMENT - 1) & !(ALLOC_ALIGNMENT - 1)
}

/// Rounds `size` up to the next multiple of [`ALLOC_ALIGNMENT`], or `None`
/// if that does not fit in `usize`.
///
/// ```
/// use gpr_mem::alloc::checked_round_to_aligned;
///
/// assert_eq!(checked_round_to_aligned(17), Some(32));
/// assert_eq!(checked_round_to_aligned(usize::MAX - 3), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn checked_round_to_aligned(size: usize) -> Option<usize> {
    match size.checked_add(ALLOC_ALIGNMENT - 1) {
        Some(padded) => Some(padded & !(ALLOC_ALIGNMENT - 1)),
        None => None,
    }
}

/// A source of raw memory blocks.
///
/// The trait is object safe; consumers hold `&dyn Allocator` and never a
/// concrete allocator type.
pub trait Allocator {
    /// Allocates a block of at least `size` bytes aligned to
    /// [`ALLOC_ALIGNMENT`]. Never fails; heap exhaustion aborts the process.
    fn alloc(&self, size: usize) -> NonNull<u8>;

    /// Returns a block to the allocator. Null is ignored.
    ///
    /// # Safety
    ///
    /// `block` must be null or a live block returned by this allocator.
    unsafe fn dealloc(&self, block: *mut u8);

    /// Allocates a zero-filled block of at least `size` bytes.
    fn alloc_zeroed(&self, size: usize) -> NonNull<u8> {
        let block = self.alloc(size);
        // SAFETY: the block was just allocated with room for `size` bytes.
        unsafe { ptr::write_bytes(block.as_ptr(), 0, size) };
        block
    }

    /// Resizes `old_block` from `old_size` to `new_size` bytes, preserving
    /// the first `min(old_size, new_size)` bytes. A null `old_block` behaves
    /// like [`alloc`](Allocator::alloc).
    ///
    /// # Safety
    ///
    /// `old_block` must be null or a live block of this allocator that is
    /// valid for `old_size` bytes. It must not be used after the call.
    unsafe fn realloc(&self, old_block: *mut u8, old_size: usize, new_size: usize) -> NonNull<u8> {
        // SAFETY: forwarded caller contract.
        unsafe { realloc_by_copy(self, old_block, old_size, new_size) }
    }
}

/// Allocate, copy and free: the `realloc` every allocator falls back to.
///
/// # Safety
///
/// Same contract as [`Allocator::realloc`].
pub(crate) unsafe fn realloc_by_copy<A: Allocator + ?Sized>(
    allocator: &A,
    old_block: *mut u8,
    old_size: usize,
    new_size: usize,
) -> NonNull<u8> {
    let new_block = allocator.alloc(new_size);
    if !old_block.is_null() {
        // SAFETY: the old block is valid for `old_size` bytes and the new one
        // for `new_size`; a fresh block cannot overlap a live one.
        unsafe {
            ptr::copy_nonoverlapping(old_block, new_block.as_ptr(), old_size.min(new_size));
            allocator.dealloc(old_block);
        }
    }
    new_block
}

/// The process heap, backed by the global Rust allocator.
///
/// Each block carries a one-alignment-unit header recording the size of the
/// underlying allocation, so `dealloc` needs nothing but the pointer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Heap;

/// The shared, stateless heap allocator.
pub static HEAP: Heap = Heap;

const HEAP_HEADER: usize = ALLOC_ALIGNMENT;

impl Heap {
    /// Logs and aborts. Also the fate of region requests whose size cannot
    /// be represented.
    #[cold]
    pub(crate) fn out_of_memory(size: usize, layout: Option<Layout>) -> ! {
        gpr_log::error!("heap allocation of {} bytes failed", size);
        match layout {
            Some(layout) => alloc::handle_alloc_error(layout),
            None => std::process::abort(),
        }
    }
}

impl Allocator for Heap {
    fn alloc(&self, size: usize) -> NonNull<u8> {
        let total = size
            .checked_add(HEAP_HEADER + ALLOC_ALIGNMENT - 1)
            .map(|n| n & !(ALLOC_ALIGNMENT - 1));
        let Some(layout) = total.and_then(|t| Layout::from_size_align(t, ALLOC_ALIGNMENT).ok())
        else {
            Self::out_of_memory(size, None)
        };

        // SAFETY: the layout is never zero-sized because of the header.
        let base = unsafe { alloc::alloc(layout) };
        let Some(base) = NonNull::new(base) else {
            Self::out_of_memory(size, Some(layout))
        };

        // SAFETY: the allocation is at least HEAP_HEADER bytes and aligned
        // for usize, so the header write and the offset stay in bounds.
        unsafe {
            base.as_ptr().cast::<usize>().write(layout.size());
            NonNull::new_unchecked(base.as_ptr().add(HEAP_HEADER))
        }
    }

    unsafe fn dealloc(&self, block: *mut u8) {
        if block.is_null() {
            return;
        }

        // SAFETY: the caller guarantees `block` came from `Heap::alloc`, which
        // stored the size of the underlying allocation right before it.
        unsafe {
            let base = block.sub(HEAP_HEADER);
            let total = base.cast::<usize>().read();
            alloc::dealloc(base, Layout::from_size_align_unchecked(total, ALLOC_ALIGNMENT));
        }
    }
}

/// Counts the live blocks and allocation calls of an inner allocator.
///
/// Used to check that arenas, scopes and maps give back every block they
/// take.
///
/// ```
/// use gpr_mem::alloc::{Allocator, HEAP, TrackingAllocator};
///
/// static TRACKED: TrackingAllocator = TrackingAllocator::new(&HEAP);
///
/// let block = TRACKED.alloc(10);
/// assert_eq!(TRACKED.live_blocks(), 1);
/// unsafe { TRACKED.dealloc(block.as_ptr()) };
/// assert_eq!(TRACKED.live_blocks(), 0);
/// assert_eq!(TRACKED.total_allocations(), 1);
/// ```
pub struct TrackingAllocator {
    inner: &'static (dyn Allocator + Sync),
    live: AtomicUsize,
    allocations: AtomicUsize,
}

impl TrackingAllocator {
    /// Wraps `inner`.
    #[must_use]
    pub const fn new(inner: &'static (dyn Allocator + Sync)) -> Self {
        Self {
            inner,
            live: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
        }
    }

    /// Number of blocks allocated and not yet deallocated.
    pub fn live_blocks(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Number of `alloc` calls since creation.
    pub fn total_allocations(&self) -> usize {
        self.allocations.load(Ordering::Acquire)
    }
}

impl Allocator for TrackingAllocator {
    fn alloc(&self, size: usize) -> NonNull<u8> {
        let block = self.inner.alloc(size);
        self.live.fetch_add(1, Ordering::AcqRel);
        self.allocations.fetch_add(1, Ordering::AcqRel);
        block
    }

    unsafe fn dealloc(&self, block: *mut u8) {
        if block.is_null() {
            return;
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.dealloc(block) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_aligned() {
        assert_eq!(round_to_aligned(0), 0);
        assert_eq!(round_to_aligned(1), ALLOC_ALIGNMENT);
        assert_eq!(round_to_aligned(ALLOC_ALIGNMENT), ALLOC_ALIGNMENT);
        assert_eq!(round_to_aligned(ALLOC_ALIGNMENT + 1), 2 * ALLOC_ALIGNMENT);
    }

    #[test]
    fn test_checked_round_to_aligned() {
        assert_eq!(checked_round_to_aligned(0), Some(0));
        assert_eq!(checked_round_to_aligned(1), Some(ALLOC_ALIGNMENT));
        assert_eq!(
            checked_round_to_aligned(usize::MAX - ALLOC_ALIGNMENT + 1),
            Some(usize::MAX - ALLOC_ALIGNMENT + 1)
        );
        for size in [usize::MAX, usize::MAX - 3, usize::MAX - ALLOC_ALIGNMENT + 2] {
            assert_eq!(checked_round_to_aligned(size), None, "{size:#x}");
        }
    }

    #[test]
    fn test_heap_alignment_and_contents() {
        for size in [0, 1, 7, 16, 33, 4096] {
            let block = HEAP.alloc(size);
            assert_eq!(block.as_ptr() as usize % ALLOC_ALIGNMENT, 0);
            unsafe {
                block.as_ptr().write_bytes(0x5A, size);
                HEAP.dealloc(block.as_ptr());
            }
        }
    }

    #[test]
    fn test_heap_dealloc_null_is_noop() {
        unsafe { HEAP.dealloc(ptr::null_mut()) };
    }

    #[test]
    fn test_alloc_zeroed() {
        let block = HEAP.alloc_zeroed(100);
        let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), 100) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { HEAP.dealloc(block.as_ptr()) };
    }

    #[test]
    fn test_heap_realloc_preserves_prefix() {
        let block = HEAP.alloc(8);
        unsafe {
            for i in 0..8 {
                *block.as_ptr().add(i) = i as u8;
            }
            let grown = HEAP.realloc(block.as_ptr(), 8, 64);
            for i in 0..8 {
                assert_eq!(*grown.as_ptr().add(i), i as u8);
            }
            let shrunk = HEAP.realloc(grown.as_ptr(), 64, 4);
            for i in 0..4 {
                assert_eq!(*shrunk.as_ptr().add(i), i as u8);
            }
            HEAP.dealloc(shrunk.as_ptr());
        }
    }

    #[test]
    fn test_realloc_from_null() {
        let block = unsafe { HEAP.realloc(ptr::null_mut(), 0, 32) };
        unsafe { HEAP.dealloc(block.as_ptr()) };
    }

    #[test]
    fn test_tracking_counts_realloc() {
        let tracked = TrackingAllocator::new(&HEAP);
        let block = tracked.alloc(16);
        let block = unsafe { tracked.realloc(block.as_ptr(), 16, 32) };
        assert_eq!(tracked.live_blocks(), 1);
        assert_eq!(tracked.total_allocations(), 2);
        unsafe { tracked.dealloc(block.as_ptr()) };
        assert_eq!(tracked.live_blocks(), 0);
    }

    #[test]
    fn test_allocator_is_object_safe() {
        let allocators: [&dyn Allocator; 1] = [&HEAP];
        for a in allocators {
            let block = a.alloc(1);
            unsafe { a.dealloc(block.as_ptr()) };
        }
    }
}
