//! FNV-1a hashing of byte strings.
//!
//! Deterministic, non-cryptographic hashes in 32, 64 and 128 bits. The
//! 128-bit variant produces the keys of [`HashMap`](crate::map::HashMap).
//!
//! ```
//! use gpr_mem::hash::{hash32, hash64, hash128};
//!
//! assert_eq!(hash32(b"a"), 0xe40c_292c);
//! assert_eq!(hash64(b"a"), 0xaf63_dc4c_8601_ec8c);
//! assert_eq!(hash128(b""), 0x6c62_272e_07bb_0142_62b8_2175_6295_c58d);
//! ```
//!
//! With the `portable-mul` feature the 128-bit multiply is assembled from
//! 64x64->128 partial products instead of using native `u128` arithmetic.

const FNV32_PRIME: u32 = 0x0100_0193;
const FNV32_OFFSET: u32 = 0x811c_9dc5;

const FNV64_PRIME: u64 = 0x0000_0100_0000_01b3;
const FNV64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;

const FNV128_PRIME: u128 = from_halves(0x0000_0000_0100_0000, 0x0000_0000_0000_013b);
const FNV128_OFFSET: u128 = from_halves(0x6c62_272e_07bb_0142, 0x62b8_2175_6295_c58d);

/// 32-bit FNV-1a.
#[must_use]
pub fn hash32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV32_OFFSET, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(FNV32_PRIME)
    })
}

/// 64-bit FNV-1a.
#[must_use]
pub fn hash64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV64_OFFSET, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(FNV64_PRIME)
    })
}

/// 128-bit FNV-1a.
#[must_use]
pub fn hash128(bytes: &[u8]) -> u128 {
    bytes.iter().fold(FNV128_OFFSET, |hash, &b| {
        mul128(hash ^ u128::from(b), FNV128_PRIME)
    })
}

#[cfg(not(feature = "portable-mul"))]
#[inline(always)]
fn mul128(a: u128, b: u128) -> u128 {
    a.wrapping_mul(b)
}

#[cfg(feature = "portable-mul")]
#[inline(always)]
fn mul128(a: u128, b: u128) -> u128 {
    mul128_portable(a, b)
}

/// Builds a 128-bit value from its high and low 64-bit halves.
#[inline(always)]
#[must_use]
pub const fn from_halves(hi: u64, lo: u64) -> u128 {
    ((hi as u128) << 64) | lo as u128
}

/// Low 64 bits of `value`.
#[inline(always)]
#[must_use]
pub const fn low64(value: u128) -> u64 {
    value as u64
}

/// High 64 bits of `value`.
#[inline(always)]
#[must_use]
pub const fn high64(value: u128) -> u64 {
    (value >> 64) as u64
}

/// Full 64x64->128 multiply from 32-bit partial products, returned as
/// `(high, low)`.
#[must_use]
pub const fn mul64_wide(a: u64, b: u64) -> (u64, u64) {
    const MASK: u64 = 0xffff_ffff;

    let (a_lo, a_hi) = (a & MASK, a >> 32);
    let (b_lo, b_hi) = (b & MASK, b >> 32);

    let lo_lo = a_lo * b_lo;
    let hi_lo = a_hi * b_lo;
    let lo_hi = a_lo * b_hi;
    let hi_hi = a_hi * b_hi;

    let cross = (lo_lo >> 32) + (hi_lo & MASK) + lo_hi;
    let high = (hi_lo >> 32) + (cross >> 32) + hi_hi;
    let low = (cross << 32) | (lo_lo & MASK);

    (high, low)
}

/// Wrapping 128-bit multiply built only from 64-bit operations.
#[must_use]
pub const fn mul128_portable(a: u128, b: u128) -> u128 {
    let (hi, lo) = mul64_wide(low64(a), low64(b));
    let hi = hi
        .wrapping_add(high64(a).wrapping_mul(low64(b)))
        .wrapping_add(low64(a).wrapping_mul(high64(b)));
    from_halves(hi, lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(hash32(b""), 0x811c_9dc5);
        assert_eq!(hash32(b"foobar"), 0xbf9c_f968);
        assert_eq!(hash64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(hash64(b"foobar"), 0x8594_4171_f739_67e8);
        assert_eq!(hash128(b"a"), 0xd228_cb69_6f1a_8caf_7891_2b70_4e4a_8964);
        assert_eq!(hash128(b"foobar"), 0x343e_1662_793c_64bf_6f0d_3597_ba44_6f18);
    }

    #[test]
    fn test_deterministic() {
        let input = b"the quick brown fox";
        assert_eq!(hash128(input), hash128(input));
        assert_eq!(hash64(input), hash64(input));
        assert_eq!(hash32(input), hash32(input));
    }

    #[test]
    fn test_short_strings_do_not_collide() {
        let keys: Vec<String> = (0..2000).map(|i| format!("key{i}")).collect();
        let mut hashes: Vec<u128> = keys.iter().map(|k| hash128(k.as_bytes())).collect();
        hashes.sort_unstable();
        hashes.dedup();
        assert_eq!(hashes.len(), keys.len());
    }

    #[test]
    fn test_halves() {
        let v = from_halves(0x0123_4567_89ab_cdef, 0xfedc_ba98_7654_3210);
        assert_eq!(high64(v), 0x0123_4567_89ab_cdef);
        assert_eq!(low64(v), 0xfedc_ba98_7654_3210);
    }

    #[test]
    fn test_mul64_wide_matches_native() {
        let samples = [0, 1, 2, 0xffff_ffff, 0x1_0000_0000, u64::MAX, 0x9e37_79b9_7f4a_7c15];
        for &a in &samples {
            for &b in &samples {
                let wide = u128::from(a) * u128::from(b);
                assert_eq!(mul64_wide(a, b), (high64(wide), low64(wide)), "{a:#x} * {b:#x}");
            }
        }
    }

    #[test]
    fn test_mul128_portable_matches_native() {
        let samples = [
            0,
            1,
            FNV128_PRIME,
            FNV128_OFFSET,
            u128::MAX,
            from_halves(u64::MAX, 0),
            from_halves(0xdead_beef, 0xcafe_babe_0000_0001),
        ];
        for &a in &samples {
            for &b in &samples {
                assert_eq!(mul128_portable(a, b), a.wrapping_mul(b));
            }
        }
    }
}
