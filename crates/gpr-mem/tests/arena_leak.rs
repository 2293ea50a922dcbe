// Arena leak tests
//
// Every node an arena takes from its backing allocator must come back, whether
// the arena is rewound, deleted or simply dropped.

#[cfg(test)]
mod leak_tests {
    use gpr_mem::alloc::{Allocator, HEAP, TrackingAllocator};
    use gpr_mem::arena::Arena;

    #[test]
    fn test_drop_returns_all_nodes() {
        static TRACKED: TrackingAllocator = TrackingAllocator::new(&HEAP);

        {
            let arena = Arena::new_in(256, &TRACKED);
            for _ in 0..100 {
                arena.alloc(200);
            }
            assert!(TRACKED.live_blocks() > 50);
        }

        assert_eq!(TRACKED.live_blocks(), 0);
    }

    #[test]
    fn test_delete_returns_all_nodes() {
        static TRACKED: TrackingAllocator = TrackingAllocator::new(&HEAP);

        let arena = Arena::new_in(64, &TRACKED);
        for i in 0..500u64 {
            arena.alloc_value(i);
        }
        arena.delete();

        assert_eq!(TRACKED.live_blocks(), 0);
    }

    #[test]
    fn test_repeated_rewind_does_not_accumulate() {
        static TRACKED: TrackingAllocator = TrackingAllocator::new(&HEAP);

        let arena = Arena::new_in(128, &TRACKED);
        let start = arena.position();
        let baseline = TRACKED.live_blocks();

        for round in 0..20 {
            for _ in 0..=round {
                arena.alloc(100);
            }
            arena.rewind(start).expect("start lies in the first node");
            assert_eq!(TRACKED.live_blocks(), baseline, "round {round}");
        }
    }

    #[test]
    fn test_rewind_to_middle_keeps_earlier_data() {
        let arena = Arena::new(64);
        let kept: Vec<*mut u64> = (0..20u64).map(|i| arena.alloc_value(i)).collect();
        let mark = arena.position();

        for i in 0..50u64 {
            arena.alloc_value(i * 1000);
        }
        arena.rewind(mark).expect("mark lies in the arena");

        for (i, &ptr) in kept.iter().enumerate() {
            assert_eq!(unsafe { *ptr }, i as u64);
        }
    }

    #[test]
    fn test_rejected_rewind_changes_nothing() {
        let arena = Arena::new(256);
        arena.alloc(100);
        let before = arena.stats();

        let mut outside = 0u8;
        assert!(arena.rewind(&mut outside).is_err());
        assert_eq!(arena.stats(), before);
    }
}
