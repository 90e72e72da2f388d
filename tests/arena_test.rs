mod common;

use common::{hot_pattern, warmed_config, HeapRegion};
use hpmalloc::{
    Arena, ArenaConfig, ArenaError, ArenaInfo, ArenaKind, EagerAccounting, LazyAccounting, ALIGN, FRAG_OVERHEAD,
    OPTIMIZE,
};
use std::ptr::NonNull;
use std::thread;

fn config() -> ArenaConfig {
    ArenaConfig { shards_per_bucket: 1, ..ArenaConfig::default() }
}

fn assert_invariants(info: &ArenaInfo) {
    assert!(info.used <= info.real_used, "{info:?}");
    assert!(info.real_used <= info.total_size, "{info:?}");
    assert_eq!(info.free, info.total_size - info.real_used);
    assert!(info.max_real_used >= info.real_used);
}

#[test]
fn test_freed_block_is_reused_by_same_class() {
    let backing = HeapRegion::new(1 << 20);
    let arena: Arena = Arena::create_private(backing.region, "reuse", config()).unwrap();

    let blocks: Vec<NonNull<u8>> = [16, 16, 32, 64].iter().map(|&n| arena.allocate(n).unwrap()).collect();
    unsafe { arena.free(blocks[1]) };
    let again = arena.allocate(16).unwrap();
    assert_eq!(again, blocks[1]);

    // An empty exact class falls through to the next non-empty bucket.
    unsafe { arena.free(again) };
    let smaller = arena.allocate(8).unwrap();
    assert_eq!(smaller, blocks[1]);
    assert_eq!(unsafe { arena.frag_size(smaller) }, Some(16));
    arena.verify().unwrap();
}

#[test]
fn test_fragmented_arena_reports_no_space() {
    let backing = HeapRegion::new(1 << 20);
    let arena: Arena = Arena::create_private(backing.region, "exhaust", config()).unwrap();

    let mut blocks = Vec::new();
    while let Ok(p) = arena.allocate(1024) {
        blocks.push(p);
    }
    while arena.allocate(ALIGN).is_ok() {}
    for p in blocks.iter().step_by(2) {
        unsafe { arena.free(*p) };
    }

    let info = arena.info();
    assert!(info.free > 64 * 1024, "aggregate free {} too small for the scenario", info.free);
    match arena.allocate(4096) {
        Err(ArenaError::NoSpace { requested, bucket }) => {
            assert_eq!(requested, 4096);
            assert_eq!(bucket, 4096 / ALIGN);
        }
        other => panic!("expected NoSpace, got {other:?}"),
    }
    // Nothing was compacted behind the caller's back.
    assert_eq!(arena.info(), info);
    arena.verify().unwrap();
}

#[test]
fn test_allocations_are_aligned_and_large_enough() {
    let backing = HeapRegion::new(4 << 20);
    let arena: Arena = Arena::create_private(backing.region, "sizes", config()).unwrap();
    for size in [1, 7, 8, 9, 100, 1000, OPTIMIZE - 1, OPTIMIZE, OPTIMIZE + 1, 100_000] {
        let p = arena.allocate(size).unwrap();
        assert_eq!(p.as_ptr() as usize % ALIGN, 0);
        let usable = unsafe { arena.frag_size(p) }.unwrap();
        assert!(usable >= size && usable % ALIGN == 0, "{size} -> {usable}");
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0xAB, size) };
    }
    arena.verify().unwrap();
}

#[test]
fn test_counters_track_every_operation() {
    let backing = HeapRegion::new(1 << 20);
    let arena: Arena = Arena::create_private(backing.region, "stats", config()).unwrap();
    let initial = arena.info();
    assert_invariants(&initial);

    let a = arena.allocate(200).unwrap();
    let b = arena.allocate(OPTIMIZE + 8).unwrap();
    let info = arena.info();
    assert_invariants(&info);
    assert_eq!(info.used, 200 + OPTIMIZE + 8);
    assert_eq!(info.real_used, initial.real_used + 200 + OPTIMIZE + 8 + 2 * FRAG_OVERHEAD);
    assert_eq!(info.fragments, 3);
    assert_eq!(arena.large_space(), OPTIMIZE + 8);

    unsafe {
        arena.free(b);
        arena.free(a);
    }
    let info = arena.info();
    assert_invariants(&info);
    assert_eq!(info.used, 0);
    assert_eq!(info.real_used, initial.real_used);
    assert_eq!(info.fragments, 1);
    assert_eq!(info.max_real_used, initial.real_used + 200 + OPTIMIZE + 8 + 2 * FRAG_OVERHEAD);
    assert_eq!(arena.large_space(), 0);
}

#[test]
fn test_lazy_accounting_converges_on_refresh() {
    let backing = HeapRegion::new(1 << 20);
    let config = config().with_stats_refresh_ms(60_000);
    let arena: Arena<LazyAccounting> = Arena::create_private(backing.region, "lazy", config).unwrap();
    let initial = arena.info();
    assert_invariants(&initial);

    let ptrs: Vec<_> = (1..=20).map(|i| arena.allocate(i * 24).unwrap()).collect();
    // Within the refresh window the cached snapshot is served.
    assert_eq!(arena.info().used, initial.used);

    let fresh = arena.refresh_info();
    assert_invariants(&fresh);
    let payload: usize = (1..=20).map(|i| i * 24).sum();
    assert_eq!(fresh.used, payload);
    assert_eq!(fresh.fragments, 21);

    for p in ptrs {
        unsafe { arena.free(p) };
    }
    let fresh = arena.refresh_info();
    assert_eq!(fresh.used, 0);
    assert_eq!(fresh.real_used, initial.real_used);
    arena.verify().unwrap();
}

#[test]
fn test_lazy_and_eager_agree() {
    let sizes = [24, 4000, 96, 70_000, 8, 512];
    let eager_backing = HeapRegion::new(1 << 20);
    let lazy_backing = HeapRegion::new(1 << 20);
    let eager: Arena<EagerAccounting> = Arena::create_private(eager_backing.region, "e", config()).unwrap();
    let lazy: Arena<LazyAccounting> = Arena::create_private(lazy_backing.region, "l", config()).unwrap();

    let e: Vec<_> = sizes.iter().map(|&s| eager.allocate(s).unwrap()).collect();
    let l: Vec<_> = sizes.iter().map(|&s| lazy.allocate(s).unwrap()).collect();
    unsafe {
        eager.free(e[1]);
        eager.free(e[3]);
        lazy.free(l[1]);
        lazy.free(l[3]);
    }
    let (ei, li) = (eager.info(), lazy.refresh_info());
    assert_eq!(ei.used, li.used);
    assert_eq!(ei.real_used, li.real_used);
    assert_eq!(ei.fragments, li.fragments);
}

#[test]
fn test_init_error_for_tiny_region() {
    let backing = HeapRegion::new(4096);
    match Arena::<EagerAccounting>::create_private(backing.region, "tiny", ArenaConfig::default()) {
        Err(ArenaError::Initialization { required, available }) => {
            assert_eq!(available, 4096);
            assert!(required > available);
        }
        other => panic!("expected Initialization, got {other:?}"),
    }
}

#[test]
fn test_second_handle_sees_first_handles_allocations() {
    let backing = HeapRegion::new(2 << 20);
    let owner: Arena = Arena::create_shared(backing.region, "shm", config()).unwrap();
    let peer: Arena = Arena::attach(backing.region, ArenaConfig::default()).unwrap();
    assert_eq!(peer.kind(), ArenaKind::Shared);
    assert_eq!(peer.name(), "shm");
    assert_eq!(peer.created_at(), owner.created_at());

    let p = owner.allocate(128).unwrap();
    unsafe { p.as_ptr().write(42) };
    assert_eq!(peer.info(), owner.info());

    // Freed through the other handle.
    unsafe { peer.free(p) };
    assert_eq!(owner.info().used, peer.info().used);
    owner.verify().unwrap();
}

#[test]
fn test_tags_follow_allocations() {
    let backing = HeapRegion::new(1 << 20);
    let arena: Arena = Arena::create_private(backing.region, "tags", config()).unwrap();
    let p = arena.allocate(40).unwrap();
    unsafe {
        assert_eq!(arena.tag(p), 0);
        arena.set_tag(p, 0xfeed);
        assert_eq!(arena.tag(p), 0xfeed);
        arena.free(p);
    }
    let q = arena.allocate(40).unwrap();
    assert_eq!(q, p);
    assert_eq!(unsafe { arena.tag(q) }, 0);
}

#[test]
fn test_large_space_triggers_defrag_hint() {
    let backing = HeapRegion::new(4 << 20);
    let arena: Arena = Arena::create_private(backing.region, "defrag", config()).unwrap();
    let limit = arena.large_limit();
    let mut held = Vec::new();
    while !arena.needs_defrag() {
        held.push(arena.allocate(OPTIMIZE * 2).unwrap());
    }
    assert!(arena.large_space() > limit);
    for p in held {
        unsafe { arena.free(p) };
    }
    assert!(!arena.needs_defrag());
}

#[test]
fn test_concurrent_threads_keep_arena_consistent() {
    let backing = HeapRegion::new(16 << 20);
    let arena: Arena = Arena::create_private(
        backing.region,
        "threads",
        ArenaConfig { shards_per_bucket: 4, ..ArenaConfig::default() },
    )
    .unwrap();
    let initial = arena.info();

    thread::scope(|s| {
        for t in 0..8u64 {
            let arena = &arena;
            s.spawn(move || {
                let mut state = 0x9E37_79B9_7F4A_7C15u64 ^ (t + 1);
                let mut held: Vec<(NonNull<u8>, u8)> = Vec::new();
                for _ in 0..5_000 {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    if held.len() < 64 && state % 3 != 0 {
                        let size = 8 + (state as usize >> 8) % 2048;
                        let p = arena.allocate(size).unwrap();
                        let byte = state as u8;
                        unsafe { std::ptr::write_bytes(p.as_ptr(), byte, size) };
                        held.push((p, byte));
                    } else if let Some((p, byte)) = held.pop() {
                        assert_eq!(unsafe { p.as_ptr().read() }, byte, "payload clobbered");
                        unsafe { arena.free(p) };
                    }
                }
                for (p, _) in held {
                    unsafe { arena.free(p) };
                }
            });
        }
    });

    let report = arena.verify().unwrap();
    let info = arena.info();
    assert_invariants(&info);
    assert_eq!(info.used, 0);
    assert_eq!(info.fragments, report.fragments);
    assert!(info.max_real_used > initial.real_used);
}

#[test]
fn test_concurrent_threads_on_warmed_sharded_arena() {
    let backing = HeapRegion::new(16 << 20);
    let mut arena: Arena = Arena::create_private(backing.region, "warm-threads", warmed_config(40)).unwrap();
    let summary = arena.warm_up_from(&hot_pattern());
    assert_eq!(summary.optimized_buckets, 20);
    let carved = arena.verify().unwrap();

    thread::scope(|s| {
        for t in 0..8u64 {
            let arena = &arena;
            s.spawn(move || {
                let mut state = 0xD1B5_4A32_D192_ED03u64 ^ (t + 1);
                let mut held: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
                for _ in 0..5_000 {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    if held.len() < 96 && state % 3 != 0 {
                        // Mostly sharded classes, some primary exact-fit and large ones.
                        let size = match state % 10 {
                            0 => 200 + (state as usize >> 8) % 40,
                            1 => 20_000 + (state as usize >> 8) % 20_000,
                            _ => 1 + (state as usize >> 8) % 160,
                        };
                        let p = arena.allocate(size).unwrap();
                        let byte = state as u8;
                        unsafe { std::ptr::write_bytes(p.as_ptr(), byte, size) };
                        held.push((p, size, byte));
                    } else if !held.is_empty() {
                        let (p, size, byte) = held.swap_remove(state as usize % held.len());
                        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), size) };
                        assert!(bytes.iter().all(|&b| b == byte), "payload clobbered");
                        unsafe { arena.free(p) };
                    }
                }
                for (p, _, _) in held {
                    unsafe { arena.free(p) };
                }
            });
        }
    });

    let report = arena.verify().unwrap();
    let info = arena.info();
    assert_invariants(&info);
    assert_eq!(info.used, 0);
    assert_eq!(info.fragments, report.fragments);
    // Exact-fit pieces are never merged away, so the carving survives.
    assert!(report.fragments >= carved.fragments);
    let dump = arena.dump();
    assert_eq!(dump.buckets.iter().filter(|b| b.optimized).count(), 20);
}

#[test]
fn test_debug_dump_names_call_sites() {
    let backing = HeapRegion::new(2 << 20);
    let arena: Arena = Arena::create_private(backing.region, "dbg", config().with_debug(true)).unwrap();
    let _held: Vec<_> = (0..4).map(|_| arena.allocate(256).unwrap()).collect();

    let report = arena.dump();
    assert_eq!(report.sites.len(), 1);
    assert_eq!(report.sites[0].allocations, 4);
    assert_eq!(report.sites[0].bytes, 1024);
    assert!(report.sites[0].site.contains("arena_test.rs"));
    assert!(report.to_string().contains("live allocations by site"));
    report.log();
}
