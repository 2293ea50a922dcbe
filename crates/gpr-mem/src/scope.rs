//! Thread-local nested scopes with deferred cleanup.
//!
//! A [`Scope`] is an [`Arena`] that lives on a per-thread stack. [`begin`]
//! pushes a new innermost scope, [`end`] pops it along with every scope opened
//! inside it that is still open. Closing a scope runs its deferred callbacks
//! (last registered, first run) and then releases all of its memory at once.
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use gpr_mem::alloc::Allocator;
//! use gpr_mem::scope::{begin, defer, end};
//!
//! let order = Rc::new(RefCell::new(Vec::new()));
//!
//! let outer = begin(0);
//! let inner = begin(4096);
//! let _scratch = inner.alloc(100);
//!
//! let log = Rc::clone(&order);
//! defer(outer, move || log.borrow_mut().push("outer"));
//! let log = Rc::clone(&order);
//! defer(inner, move || log.borrow_mut().push("inner"));
//!
//! // Closing the outer scope closes the inner one first.
//! unsafe { end(Some(outer)) };
//! assert_eq!(*order.borrow(), ["inner", "outer"]);
//! ```
//!
//! # Per-thread context
//!
//! Each thread owns a scope context, created by its first [`begin`]. Scope
//! records are bump-allocated from a dedicated factory arena, so closing a
//! scope rewinds the factory and reclaims the records of everything closed
//! with it.
//!
//! When a thread exits, its context closes the scopes left open (running
//! their callbacks) before the factory itself is freed. Those callbacks may
//! still use the whole scope API. Thread-local
//! destructors are not guaranteed to run for the main thread, which should
//! call [`end_all`] before exiting if deferred work must happen.
//!
//! # Sizing
//!
//! `begin(0)` sizes the new scope's nodes at twice the average number of bytes
//! previously allocated per scope, process-wide, and at least
//! [`MIN_SCOPE_SIZE`]. The counters behind the average are shared relaxed
//! atomics; they only feed this heuristic.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::alloc::{Allocator, round_to_aligned};
use crate::arena::{Arena, ArenaStats};

/// Node size of a scope begun without a hint and without history.
pub const MIN_SCOPE_SIZE: usize = 1024;

/// Number of scope records the factory holds before it grows.
pub const SCOPE_FACTORY_RECORDS: usize = 64;

/// Initial length of a scope's deferred-callback stack.
const DEFER_STACK_INITIAL: usize = 8;

static TOTAL_SCOPE_BYTES: AtomicUsize = AtomicUsize::new(0);
static TOTAL_SCOPE_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Snapshot of the process-wide scope sizing counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeStats {
    /// Scopes begun so far.
    pub scopes: usize,
    /// Bytes allocated through scopes so far.
    pub bytes: usize,
}

impl ScopeStats {
    /// Average bytes per scope, zero without history.
    #[must_use]
    pub fn average(&self) -> usize {
        self.bytes.checked_div(self.scopes).unwrap_or(0)
    }
}

/// Returns the process-wide scope sizing counters.
#[must_use]
pub fn scope_stats() -> ScopeStats {
    ScopeStats {
        scopes: TOTAL_SCOPE_COUNT.load(Ordering::Relaxed),
        bytes: TOTAL_SCOPE_BYTES.load(Ordering::Relaxed),
    }
}

/// Node size for a scope begun without a hint, given the history so far.
///
/// Twice the average bytes per previous scope, never below
/// [`MIN_SCOPE_SIZE`].
fn default_scope_size(history: ScopeStats) -> usize {
    history.average().saturating_mul(2).max(MIN_SCOPE_SIZE)
}

/// A deferred closure living in its scope's arena.
#[derive(Clone, Copy)]
struct DeferEntry {
    call: unsafe fn(*mut u8),
    closure: *mut u8,
}

/// Reads the closure of type `F` out of arena memory and runs it.
///
/// # Safety
///
/// `closure` must point to an initialized `F` that is never read again.
unsafe fn call_deferred<F: FnOnce()>(closure: *mut u8) {
    // SAFETY: forwarded caller contract.
    let f = unsafe { closure.cast::<F>().read() };
    f();
}

struct DeferStack {
    entries: *mut DeferEntry,
    len: usize,
    capacity: usize,
}

/// A nestable, thread-bound region.
///
/// Obtained from [`begin`] and valid until the [`end`] call that closes it
/// (directly or through an enclosing scope). The `'static` lifetime of the
/// returned reference is not checked by the compiler; keeping it past the
/// scope's end is the caller's responsibility, which is why [`end`] is
/// `unsafe`.
pub struct Scope {
    arena: Arena,
    parent: Option<NonNull<Scope>>,
    defers: Cell<Option<NonNull<DeferStack>>>,
    depth: usize,
    /// Bytes this scope added to the sizing counters.
    recorded: Cell<usize>,
    _thread_bound: PhantomData<*const ()>,
}

impl Scope {
    /// Nesting depth; the outermost scope of a thread has depth 0.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Statistics of the scope's arena.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    #[inline(always)]
    fn record_usage(&self, bytes: usize) {
        self.recorded.set(self.recorded.get().saturating_add(bytes));
        TOTAL_SCOPE_BYTES.fetch_add(bytes, Ordering::Relaxed);
    }

    fn push_deferred(&self, entry: DeferEntry) {
        let stack = match self.defers.get() {
            Some(stack) => stack,
            None => {
                let entries = self
                    .arena
                    .alloc(DEFER_STACK_INITIAL * mem::size_of::<DeferEntry>())
                    .cast::<DeferEntry>()
                    .as_ptr();
                let stack = self.arena.alloc_value(DeferStack {
                    entries,
                    len: 0,
                    capacity: DEFER_STACK_INITIAL,
                });
                // SAFETY: alloc_value never returns null.
                let stack = unsafe { NonNull::new_unchecked(stack) };
                self.defers.set(Some(stack));
                stack
            }
        };

        // SAFETY: the stack lives in this scope's arena, and no other
        // reference to it exists while this thread is in here.
        let stack = unsafe { &mut *stack.as_ptr() };
        if stack.len == stack.capacity {
            let capacity = stack.capacity * 2;
            let entries = self
                .arena
                .alloc(capacity * mem::size_of::<DeferEntry>())
                .cast::<DeferEntry>()
                .as_ptr();
            // SAFETY: both buffers hold at least `len` entries and come from
            // distinct arena allocations.
            unsafe { ptr::copy_nonoverlapping(stack.entries, entries, stack.len) };
            stack.entries = entries;
            stack.capacity = capacity;
        }

        // SAFETY: len < capacity after the growth above.
        unsafe { stack.entries.add(stack.len).write(entry) };
        stack.len += 1;
    }

    /// Runs every deferred callback, newest first, exactly once.
    fn run_deferred(&self) {
        // Callbacks may defer more work on this scope; that lands in a fresh
        // stack and runs in the next round.
        while let Some(stack) = self.defers.take() {
            // SAFETY: the stack was detached from the scope above, so nothing
            // else reads or writes it.
            let stack = unsafe { stack.as_ref() };
            for i in (0..stack.len).rev() {
                // SAFETY: entries below len are initialized and each closure
                // is consumed once.
                unsafe {
                    let entry = stack.entries.add(i).read();
                    (entry.call)(entry.closure);
                }
            }
        }
    }
}

impl Allocator for Scope {
    #[inline]
    fn alloc(&self, size: usize) -> NonNull<u8> {
        let block = self.arena.alloc(size);
        self.record_usage(round_to_aligned(size));
        block
    }

    unsafe fn dealloc(&self, _block: *mut u8) {}

    unsafe fn realloc(&self, old_block: *mut u8, old_size: usize, new_size: usize) -> NonNull<u8> {
        // SAFETY: forwarded caller contract.
        let block = unsafe { self.arena.grow(old_block, old_size, new_size) };
        self.record_usage(round_to_aligned(new_size).saturating_sub(round_to_aligned(old_size)));
        block
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("depth", &self.depth)
            .field("arena", &self.arena)
            .finish_non_exhaustive()
    }
}

/// The scope stack of one thread.
struct ScopeContext {
    /// Holds the `Scope` records.
    factory: Arena,
    /// Innermost open scope.
    top: Cell<Option<NonNull<Scope>>>,
}

thread_local! {
    /// The thread's context. Has no destructor, so it stays reachable while
    /// other thread-locals are torn down.
    static CONTEXT: Cell<Option<NonNull<ScopeContext>>> = const { Cell::new(None) };

    /// Closes and frees the context when the thread exits.
    static TEARDOWN: ContextTeardown = const { ContextTeardown };
}

/// Returns the calling thread's context, if it has one.
fn existing_context() -> Option<&'static ScopeContext> {
    // SAFETY: a registered context stays allocated until `ContextTeardown`
    // unregisters it, and is only used from its own thread.
    CONTEXT.with(Cell::get).map(|context| unsafe { context.as_ref() })
}

/// Returns the calling thread's context, creating it on first use.
fn context() -> &'static ScopeContext {
    if let Some(context) = existing_context() {
        return context;
    }

    let context = NonNull::from(Box::leak(Box::new(ScopeContext::new())));
    CONTEXT.with(|slot| slot.set(Some(context)));
    if TEARDOWN.try_with(|_| ()).is_err() {
        gpr_log::warn!("scope context created during thread teardown is never freed");
    }
    // SAFETY: just registered, see `existing_context`.
    unsafe { context.as_ref() }
}

struct ContextTeardown;

impl Drop for ContextTeardown {
    fn drop(&mut self) {
        let Some(context) = existing_context() else {
            return;
        };
        // Callbacks run here may still begin, end and look up scopes.
        context.close_all();

        if let Some(context) = CONTEXT.with(Cell::take) {
            // SAFETY: created by `Box::leak` in `context()` and unregistered
            // above, so no reference to it remains.
            drop(unsafe { Box::from_raw(context.as_ptr()) });
        }
    }
}

impl ScopeContext {
    fn new() -> Self {
        let record = round_to_aligned(mem::size_of::<Scope>());
        let factory = Arena::new(SCOPE_FACTORY_RECORDS * record);
        gpr_log::debug!("scope factory created with room for {} records", SCOPE_FACTORY_RECORDS);
        ScopeContext {
            factory,
            top: Cell::new(None),
        }
    }

    fn open_scopes(&self) -> impl Iterator<Item = NonNull<Scope>> {
        let mut next = self.top.get();
        std::iter::from_fn(move || {
            let current = next?;
            // SAFETY: every scope on the stack is a live factory record.
            next = unsafe { current.as_ref() }.parent;
            Some(current)
        })
    }

    fn push(&self, size_hint: usize) -> NonNull<Scope> {
        let size = if size_hint == 0 {
            default_scope_size(scope_stats())
        } else {
            size_hint
        };
        TOTAL_SCOPE_COUNT.fetch_add(1, Ordering::Relaxed);

        let parent = self.top.get();
        // SAFETY: the parent, if any, is a live record.
        let depth = parent.map_or(0, |p| unsafe { p.as_ref() }.depth + 1);

        let record = self.factory.alloc_value(Scope {
            arena: Arena::new(size),
            parent,
            defers: Cell::new(None),
            depth,
            recorded: Cell::new(0),
            _thread_bound: PhantomData,
        });
        // SAFETY: alloc_value never returns null.
        let record = unsafe { NonNull::new_unchecked(record) };
        self.top.set(Some(record));

        gpr_log::trace!("begin scope {:p} at depth {} with {} bytes", record, depth, size);
        record
    }

    /// Closes scopes from the innermost outwards until `target` is closed.
    fn close_through(&self, target: NonNull<Scope>) {
        if !self.open_scopes().any(|open| open == target) {
            gpr_log::warn!("end of scope {:p} that is not open ignored", target);
            return;
        }

        while let Some(current) = self.top.get() {
            // SAFETY: `current` is the live innermost record.
            let scope = unsafe { current.as_ref() };
            scope.run_deferred();
            if self.top.get() != Some(current) {
                // A callback opened scopes of its own; those close first.
                continue;
            }

            self.top.set(scope.parent);
            // SAFETY: popped above, so nothing refers to the record anymore.
            unsafe { ptr::drop_in_place(current.as_ptr()) };
            gpr_log::trace!("end scope {:p}", current);

            if current == target {
                break;
            }
        }

        let rewound = self.factory.rewind(target.as_ptr().cast());
        debug_assert!(rewound.is_ok(), "scope record outside of its factory");
    }

    fn close_all(&self) {
        while let Some(outermost) = self.open_scopes().last() {
            self.close_through(outermost);
        }
    }
}

impl Drop for ScopeContext {
    fn drop(&mut self) {
        debug_assert!(self.top.get().is_none(), "scope factory freed with open scopes");
        gpr_log::debug!("scope factory torn down");
    }
}

/// Opens a new innermost scope on the calling thread.
///
/// `size_hint` is the node size of the scope's arena in bytes. Zero picks a
/// size from the running average of previous scopes.
#[must_use]
pub fn begin(size_hint: usize) -> &'static Scope {
    let record = context().push(size_hint);
    // SAFETY: the record stays valid until `end` closes it; see `Scope`.
    unsafe { record.as_ref() }
}

/// Closes `scope` and every scope opened inside it that is still open,
/// innermost first, running each one's deferred callbacks before releasing
/// its memory.
///
/// `None`, and scopes that are not open on this thread, are ignored.
///
/// # Safety
///
/// After this call, `scope`, every scope closed along with it, and all memory
/// allocated from them must no longer be used. Deferred callbacks must not
/// end the scope that is running them or any scope enclosing it.
pub unsafe fn end(scope: Option<&Scope>) {
    let Some(scope) = scope else {
        return;
    };
    let target = NonNull::from(scope);

    match existing_context() {
        Some(context) => context.close_through(target),
        None => gpr_log::warn!("end of scope {:p} on a thread without scopes ignored", target),
    }
}

/// Closes every open scope of the calling thread, innermost first.
///
/// # Safety
///
/// Same contract as [`end`], for all scopes of the thread.
pub unsafe fn end_all() {
    if let Some(context) = existing_context() {
        context.close_all();
    }
}

/// Registers `f` to run when `scope` is closed.
///
/// Callbacks of one scope run in reverse registration order, exactly once.
/// The closure is stored in the scope's own arena.
pub fn defer<F>(scope: &Scope, f: F)
where
    F: FnOnce() + 'static,
{
    let closure = scope.arena.alloc_value(f);
    scope.push_deferred(DeferEntry {
        call: call_deferred::<F>,
        closure: closure.cast(),
    });
}

/// Returns the innermost open scope of the calling thread.
#[must_use]
pub fn current_scope() -> Option<&'static Scope> {
    let top = existing_context()?.top.get()?;
    // SAFETY: the record is open, see `begin`.
    Some(unsafe { top.as_ref() })
}

/// Returns the innermost open scope as an allocator, or `fallback` when the
/// calling thread has none.
///
/// Meant for code that cannot take an allocator argument.
#[must_use]
pub fn last_scope(fallback: &dyn Allocator) -> &dyn Allocator {
    match current_scope() {
        Some(scope) => scope,
        None => fallback,
    }
}
