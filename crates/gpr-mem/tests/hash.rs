// FNV-1a vectors and distribution checks

#[cfg(test)]
mod hash_tests {
    use gpr_mem::hash::{hash32, hash64, hash128, high64, low64};

    #[test]
    fn test_empty_input_is_offset_basis() {
        assert_eq!(hash32(b""), 0x811c_9dc5);
        assert_eq!(hash64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(hash128(b""), 0x6c62_272e_07bb_0142_62b8_2175_6295_c58d);
    }

    #[test]
    fn test_single_byte() {
        assert_eq!(hash32(b"a"), 0xe40c_292c);
        assert_eq!(hash64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(hash128(b"a"), 0xd228_cb69_6f1a_8caf_7891_2b70_4e4a_8964);
    }

    #[test]
    fn test_order_matters() {
        assert_ne!(hash128(b"ab"), hash128(b"ba"));
        assert_ne!(hash64(b"ab"), hash64(b"ba"));
    }

    #[test]
    fn test_low_bits_spread() {
        // Slot selection uses the low bits; sequential inputs must not pile
        // into a few slots of a 256-slot table.
        let mut buckets = [0u32; 256];
        for i in 0..25_600u32 {
            buckets[(low64(hash128(&i.to_le_bytes())) & 0xff) as usize] += 1;
        }
        let fullest = buckets.iter().copied().max().unwrap();
        let emptiest = buckets.iter().copied().min().unwrap();
        assert!(fullest < 200, "fullest bucket holds {fullest}");
        assert!(emptiest > 40, "emptiest bucket holds {emptiest}");
    }

    #[test]
    fn test_high_half_varies() {
        let highs: hashbrown::HashSet<u64> =
            (0..1_000u32).map(|i| high64(hash128(&i.to_le_bytes()))).collect();
        assert_eq!(highs.len(), 1_000);
    }
}
