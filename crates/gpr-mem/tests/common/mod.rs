// Shared helpers for the gpr-mem integration tests.

#![allow(dead_code)]

use gpr_mem::map::{Map, MapConfig};

/// Deterministic xorshift64 generator so failures reproduce.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        XorShift(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}

/// Config for maps storing a `u32` inline.
pub fn u32_config(capacity: usize) -> MapConfig {
    MapConfig {
        element_size: 4,
        capacity,
        destructor: None,
    }
}

/// Reads the inline `u32` stored under `key`.
pub fn get_u32(map: &Map<'_>, key: u128) -> Option<u32> {
    map.get_bytes(key)
        .map(|bytes| u32::from_ne_bytes(bytes.try_into().expect("4-byte element")))
}
