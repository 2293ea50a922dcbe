//! Hash-trie map keyed by 128-bit integers.
//!
//! A [`Map`] is a table of slots whose length is a power of two. A key lands
//! in slot `low64(key) & (length - 1)`. When two keys meet in one slot, the
//! slot becomes a branch to a child table of `max(4, length / 2)` slots and
//! both keys move down, each shifted right by `log2(length)` bits so the next
//! level looks at fresh bits. Nothing is ever rehashed or chained.
//!
//! Every table comes from the allocator the map was created with, so a map
//! can live on the heap, in an [`Arena`](crate::arena::Arena) or in a
//! [`Scope`](crate::scope::Scope).
//!
//! Elements are stored either inline (`element_size > 0` bytes copied into
//! the table) or as raw pointers (`element_size == 0`). An optional
//! destructor runs once for every element that leaves the map.
//!
//! [`HashMap`] wraps a `Map` and derives keys from byte strings with
//! [`hash128`].
//!
//! # Examples
//!
//! ```
//! use gpr_mem::alloc::HEAP;
//! use gpr_mem::map::{HashMap, MapConfig};
//!
//! let config = MapConfig { element_size: 4, ..MapConfig::default() };
//! let mut map = HashMap::new(&HEAP, config).unwrap();
//!
//! map.set_bytes(b"answer", &42u32.to_ne_bytes()).unwrap();
//! assert_eq!(map.get_bytes(b"answer"), Some(&42u32.to_ne_bytes()[..]));
//!
//! assert!(map.remove(b"answer"));
//! assert_eq!(map.get_bytes(b"answer"), None);
//! ```

use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};

use crate::alloc::{ALLOC_ALIGNMENT, Allocator};
use crate::error::{Error, Result};
use crate::hash::{hash128, low64};

/// Root table length used when the configured capacity is zero.
pub const DEFAULT_MAP_CAPACITY: usize = 256;

/// Child tables never shrink below this many slots.
const MIN_TABLE_LENGTH: usize = 4;

/// Called with each element leaving the map: the stored pointer for
/// pointer-valued maps, a pointer to the inline bytes otherwise.
pub type Destructor = fn(*mut u8);

/// Construction options of a [`Map`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MapConfig {
    /// Bytes per inline element. Zero stores raw pointers instead.
    pub element_size: usize,
    /// Root table length; rounded down to a power of two, at least 4.
    /// Zero selects [`DEFAULT_MAP_CAPACITY`].
    pub capacity: usize,
    /// Runs for every element removed, replaced or left at deletion.
    pub destructor: Option<Destructor>,
}

enum Slot {
    Empty,
    /// `key` is the key as seen at this level, already shifted. `element` is
    /// only meaningful for pointer-valued maps.
    Occupied { key: u128, element: *mut u8 },
    Branch { child: NonNull<Slot> },
}

const _: () = assert!(mem::align_of::<Slot>() <= ALLOC_ALIGNMENT);

#[inline(always)]
const fn slot_index(key: u128, length: usize) -> usize {
    (low64(key) & (length as u64 - 1)) as usize
}

#[inline(always)]
const fn next_length(length: usize) -> usize {
    if length / 2 < MIN_TABLE_LENGTH {
        MIN_TABLE_LENGTH
    } else {
        length / 2
    }
}

#[inline(always)]
const fn shift_key(key: u128, length: usize) -> u128 {
    key >> length.trailing_zeros()
}

/// Root table length for a configured capacity.
fn root_length(capacity: usize) -> usize {
    let length = match capacity {
        0 => DEFAULT_MAP_CAPACITY,
        c if c.is_power_of_two() => c,
        c => 1 << (usize::BITS - 1 - c.leading_zeros()),
    };
    length.max(MIN_TABLE_LENGTH)
}

fn no_op_destructor(_: *mut u8) {}

/// Hash-trie map from `u128` keys to inline or pointer elements.
pub struct Map<'a> {
    allocator: &'a dyn Allocator,
    root: NonNull<Slot>,
    length: usize,
    element_size: usize,
    destructor: Destructor,
    len: usize,
}

impl<'a> Map<'a> {
    /// Creates an empty map whose tables come from `allocator`.
    pub fn new(allocator: &'a dyn Allocator, config: MapConfig) -> Result<Self> {
        let length = root_length(config.capacity);
        let slot_bytes = mem::size_of::<Slot>()
            .checked_add(config.element_size)
            .and_then(|per_slot| per_slot.checked_mul(length))
            .filter(|&bytes| bytes <= isize::MAX as usize);
        if slot_bytes.is_none() {
            return Err(Error::InvalidCapacity {
                capacity: config.capacity,
            });
        }

        Ok(Map {
            allocator,
            root: alloc_table(allocator, length, config.element_size),
            length,
            element_size: config.element_size,
            destructor: config.destructor.unwrap_or(no_op_destructor),
            len: 0,
        })
    }

    /// Number of elements in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the map holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Length of the root table.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.length
    }

    /// Bytes per inline element, zero for pointer-valued maps.
    #[must_use]
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Start of the inline element area of `table`.
    #[inline(always)]
    fn elements(&self, table: NonNull<Slot>, length: usize) -> *mut u8 {
        table.as_ptr().wrapping_add(length).cast()
    }

    /// Pointer to the element held by slot `index` of `table`.
    ///
    /// # Safety
    ///
    /// The slot must be occupied.
    #[inline(always)]
    unsafe fn element_at(&self, table: NonNull<Slot>, length: usize, index: usize) -> *mut u8 {
        if self.element_size == 0 {
            // SAFETY: caller guarantees the slot is occupied.
            match unsafe { &*table.as_ptr().add(index) } {
                Slot::Occupied { element, .. } => *element,
                _ => ptr::null_mut(),
            }
        } else {
            self.elements(table, length)
                .wrapping_add(index * self.element_size)
        }
    }

    /// Inserts `element` under `key`, replacing any element already stored
    /// under the same key.
    ///
    /// For inline maps `element_size` bytes are copied from `element`; for
    /// pointer-valued maps the pointer itself is stored.
    ///
    /// # Safety
    ///
    /// For inline maps, `element` must be valid for reading `element_size`
    /// bytes.
    pub unsafe fn set(&mut self, key: u128, element: *const u8) {
        let mut table = self.root;
        let mut length = self.length;
        let mut key = key;

        loop {
            let index = slot_index(key, length);
            // SAFETY: index < length, and every table holds `length` slots.
            let slot = unsafe { &mut *table.as_ptr().add(index) };

            match *slot {
                Slot::Empty => {
                    // SAFETY: forwarded caller contract for `element`.
                    unsafe { self.store(table, length, index, key, element) };
                    self.len += 1;
                    return;
                }
                Slot::Occupied { key: existing, .. } if existing == key => {
                    // SAFETY: the slot is occupied; the old element is
                    // destroyed before being overwritten.
                    unsafe {
                        (self.destructor)(self.element_at(table, length, index));
                        self.store(table, length, index, key, element);
                    }
                    return;
                }
                Slot::Occupied {
                    key: existing,
                    element: stored,
                } => {
                    let child_length = next_length(length);
                    let child = alloc_table(self.allocator, child_length, self.element_size);

                    // The occupant moves into the fresh child, where its slot
                    // is necessarily free.
                    let moved_key = shift_key(existing, length);
                    let moved_index = slot_index(moved_key, child_length);
                    // SAFETY: both indices are in bounds of their tables, and
                    // the element areas of distinct tables do not overlap.
                    unsafe {
                        if self.element_size != 0 {
                            ptr::copy_nonoverlapping(
                                self.elements(table, length)
                                    .add(index * self.element_size),
                                self.elements(child, child_length)
                                    .add(moved_index * self.element_size),
                                self.element_size,
                            );
                        }
                        child.as_ptr().add(moved_index).write(Slot::Occupied {
                            key: moved_key,
                            element: stored,
                        });
                    }
                    *slot = Slot::Branch { child };

                    key = shift_key(key, length);
                    table = child;
                    length = child_length;
                }
                Slot::Branch { child } => {
                    key = shift_key(key, length);
                    table = child;
                    length = next_length(length);
                }
            }
        }
    }

    /// Writes `key` and `element` into slot `index` of `table`.
    ///
    /// # Safety
    ///
    /// As for [`set`](Map::set).
    unsafe fn store(&self, table: NonNull<Slot>, length: usize, index: usize, key: u128, element: *const u8) {
        // SAFETY: index < length; the caller vouches for `element`.
        unsafe {
            if self.element_size != 0 {
                ptr::copy(
                    element,
                    self.elements(table, length)
                        .add(index * self.element_size),
                    self.element_size,
                );
            }
            let element = if self.element_size == 0 {
                element.cast_mut()
            } else {
                ptr::null_mut()
            };
            *table.as_ptr().add(index) = Slot::Occupied { key, element };
        }
    }

    /// Inserts an inline element. Fails if `element` is not exactly
    /// `element_size` bytes long.
    pub fn set_bytes(&mut self, key: u128, element: &[u8]) -> Result<()> {
        if self.element_size == 0 || element.len() != self.element_size {
            return Err(Error::ElementSizeMismatch {
                expected: self.element_size,
                actual: element.len(),
            });
        }
        // SAFETY: the slice is valid for element_size bytes.
        unsafe { self.set(key, element.as_ptr()) };
        Ok(())
    }

    /// Inserts a pointer element. Fails on inline maps.
    pub fn set_ptr(&mut self, key: u128, element: *mut u8) -> Result<()> {
        if self.element_size != 0 {
            return Err(Error::ElementSizeMismatch {
                expected: self.element_size,
                actual: 0,
            });
        }
        // SAFETY: pointer-valued maps never read through `element`.
        unsafe { self.set(key, element) };
        Ok(())
    }

    /// Finds the table and slot index holding `key`.
    fn find(&self, key: u128) -> Option<(NonNull<Slot>, usize, usize)> {
        let mut table = self.root;
        let mut length = self.length;
        let mut key = key;

        loop {
            let index = slot_index(key, length);
            // SAFETY: index < length.
            match unsafe { &*table.as_ptr().add(index) } {
                Slot::Empty => return None,
                Slot::Occupied { key: stored, .. } => {
                    return (*stored == key).then_some((table, length, index));
                }
                Slot::Branch { child } => {
                    key = shift_key(key, length);
                    table = *child;
                    length = next_length(length);
                }
            }
        }
    }

    /// Returns the element stored under `key`: the stored pointer for
    /// pointer-valued maps, a pointer to the inline bytes otherwise.
    ///
    /// Inline element pointers are only byte-aligned and stay valid until
    /// the key is removed or replaced, or the map is dropped.
    #[must_use]
    pub fn get(&self, key: u128) -> Option<*mut u8> {
        let (table, length, index) = self.find(key)?;
        // SAFETY: `find` only returns occupied slots.
        Some(unsafe { self.element_at(table, length, index) })
    }

    /// Returns the bytes of an inline element.
    #[must_use]
    pub fn get_bytes(&self, key: u128) -> Option<&[u8]> {
        if self.element_size == 0 {
            return None;
        }
        let element = self.get(key)?;
        // SAFETY: inline elements are element_size bytes owned by the map
        // and borrowed for as long as `self`.
        Some(unsafe { std::slice::from_raw_parts(element, self.element_size) })
    }

    /// Removes the element stored under `key`, running the destructor on it.
    /// Returns `false` if the key is absent.
    pub fn remove(&mut self, key: u128) -> bool {
        let Some((table, length, index)) = self.find(key) else {
            return false;
        };

        // SAFETY: `find` returned an occupied, in-bounds slot. The inline
        // bytes stay in place after the slot is cleared.
        unsafe {
            let element = self.element_at(table, length, index);
            *table.as_ptr().add(index) = Slot::Empty;
            (self.destructor)(element);
        }
        self.len -= 1;
        true
    }

    /// Destroys every element and frees every table. Equivalent to dropping
    /// the map.
    pub fn delete(self) {
        drop(self);
    }

    fn delete_table(&self, table: NonNull<Slot>, length: usize) {
        for index in 0..length {
            // SAFETY: index < length; each slot is visited once.
            match unsafe { &*table.as_ptr().add(index) } {
                Slot::Empty => {}
                Slot::Occupied { .. } => unsafe {
                    (self.destructor)(self.element_at(table, length, index));
                },
                Slot::Branch { child } => self.delete_table(*child, next_length(length)),
            }
        }
        // SAFETY: the table came from this allocator and is not used again.
        unsafe { self.allocator.dealloc(table.as_ptr().cast()) };
    }
}

/// Allocates a table of `length` empty slots followed by a zeroed element
/// area.
fn alloc_table(allocator: &dyn Allocator, length: usize, element_size: usize) -> NonNull<Slot> {
    let bytes = length * (mem::size_of::<Slot>() + element_size);
    let table = allocator.alloc_zeroed(bytes).cast::<Slot>();
    for index in 0..length {
        // SAFETY: the block holds `length` slots and is aligned for Slot.
        unsafe { table.as_ptr().add(index).write(Slot::Empty) };
    }
    table
}

impl Drop for Map<'_> {
    fn drop(&mut self) {
        self.delete_table(self.root, self.length);
    }
}

impl fmt::Debug for Map<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("len", &self.len)
            .field("capacity", &self.length)
            .field("element_size", &self.element_size)
            .finish_non_exhaustive()
    }
}

/// [`Map`] keyed by byte strings through [`hash128`].
#[derive(Debug)]
pub struct HashMap<'a> {
    map: Map<'a>,
}

impl<'a> HashMap<'a> {
    /// Creates an empty map whose tables come from `allocator`.
    pub fn new(allocator: &'a dyn Allocator, config: MapConfig) -> Result<Self> {
        Ok(HashMap {
            map: Map::new(allocator, config)?,
        })
    }

    /// Number of elements in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the map holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// See [`Map::set`].
    ///
    /// # Safety
    ///
    /// As for [`Map::set`].
    pub unsafe fn set(&mut self, key: &[u8], element: *const u8) {
        // SAFETY: forwarded caller contract.
        unsafe { self.map.set(hash128(key), element) }
    }

    /// See [`Map::set_bytes`].
    pub fn set_bytes(&mut self, key: &[u8], element: &[u8]) -> Result<()> {
        self.map.set_bytes(hash128(key), element)
    }

    /// See [`Map::set_ptr`].
    pub fn set_ptr(&mut self, key: &[u8], element: *mut u8) -> Result<()> {
        self.map.set_ptr(hash128(key), element)
    }

    /// See [`Map::get`].
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<*mut u8> {
        self.map.get(hash128(key))
    }

    /// See [`Map::get_bytes`].
    #[must_use]
    pub fn get_bytes(&self, key: &[u8]) -> Option<&[u8]> {
        self.map.get_bytes(hash128(key))
    }

    /// See [`Map::remove`].
    pub fn remove(&mut self, key: &[u8]) -> bool {
        self.map.remove(hash128(key))
    }

    /// Destroys every element and frees every table.
    pub fn delete(self) {
        self.map.delete();
    }
}
