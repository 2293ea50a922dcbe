//! `gpr` memory runtime
//!
//! Memory primitives built around one allocator capability:
//!
//! - **[`alloc`]**: the object-safe [`Allocator`] trait and the process [`HEAP`]
//! - **[`arena`]**: growable bump arenas with rewind and in-place growth
//! - **[`scope`]**: thread-local nested scopes with LIFO deferred callbacks
//!   (requires `scope` feature)
//! - **[`map`]**: hash-trie map keyed by 128-bit integers
//!   (requires `hashmap` feature)
//! - **[`hash`]**: FNV-1a hashing in 32, 64 and 128 bits
//!
//! Diagnostics go through `gpr-log`; set `GPR_LOG=trace` and call
//! [`gpr_log::init_from_env`] to watch nodes and scopes come and go.

pub mod alloc;
pub mod arena;
pub mod error;
pub mod hash;

#[cfg(feature = "hashmap")]
pub mod map;

#[cfg(feature = "scope")]
pub mod scope;

pub use alloc::{
    ALLOC_ALIGNMENT, Allocator, HEAP, Heap, TrackingAllocator, checked_round_to_aligned,
    round_to_aligned,
};
pub use arena::{Arena, ArenaStats};
pub use error::{Error, Result};
pub use hash::{hash32, hash64, hash128};

#[cfg(feature = "hashmap")]
pub use map::{DEFAULT_MAP_CAPACITY, HashMap, Map, MapConfig};

#[cfg(feature = "scope")]
pub use scope::{Scope, begin, current_scope, defer, end, end_all, last_scope};
