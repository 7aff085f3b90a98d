//! End-to-end allocator behavior over real shared-memory segments.
//!
//! Every test builds its own pool under a unique namespace, so the suite
//! can run in parallel. Segments are 256 MiB but sparsely backed: only the
//! pages actually holding chunk headers or payload bytes get committed.
//! None of these pools install the fault handler; the single-process paths
//! never fault (the cross-process path has its own test binary).

use dmapool::{DmaBufferPool, Error, PoolConfig};

fn pool_with(max_segments: u32, persistent: u32) -> DmaBufferPool {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    DmaBufferPool::new(PoolConfig {
        segment_size: 1 << 28,
        max_segments,
        persistent_segments: Some(persistent),
        install_fault_handler: false,
        ..PoolConfig::default()
    })
    .unwrap()
}

// ============================================================================
// Basic allocation laws
// ============================================================================

#[test]
fn test_small_alloc_lands_in_min_class() {
    let pool = pool_with(4, 1);
    let owner = pool.owner();

    let ptr = pool.alloc(&owner, 100).unwrap();
    assert!(pool.validate(ptr.as_ptr()));
    assert_eq!(pool.size(ptr).unwrap(), 100);
    assert_eq!(pool.chunk_size(ptr).unwrap(), 256);
    pool.audit().unwrap();

    pool.free(ptr).unwrap();
    pool.audit().unwrap();

    // The persistent segment stays, fully coalesced into one maximal chunk.
    let reports = pool.segment_reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].num_chunks, 0);
    assert_eq!(reports[0].classes.len(), 1);
    assert_eq!(reports[0].classes[0].mclass, 28);
    assert_eq!(reports[0].classes[0].free, 1);
}

#[test]
fn test_chunk_size_matches_request_normalization() {
    let pool = pool_with(4, 1);
    let owner = pool.owner();

    for (required, expected_chunk) in [
        (1usize, 256usize),
        (196, 256),
        (197, 512),
        (500, 1024),
        (4096, 8192),
        (1 << 20, 1 << 21),
    ] {
        let ptr = pool.alloc(&owner, required).unwrap();
        assert_eq!(pool.size(ptr).unwrap(), required);
        assert_eq!(pool.chunk_size(ptr).unwrap(), expected_chunk);
        pool.free(ptr).unwrap();
    }
    pool.audit().unwrap();
}

#[test]
fn test_alloc_free_alloc_is_deterministic() {
    let pool = pool_with(4, 1);
    let owner = pool.owner();

    let first = pool.alloc(&owner, 777).unwrap();
    pool.free(first).unwrap();
    let second = pool.alloc(&owner, 777).unwrap();
    assert_eq!(first, second);
    pool.free(second).unwrap();
    pool.audit().unwrap();
}

#[test]
fn test_merge_cascades_through_every_class() {
    let pool = pool_with(4, 1);
    let owner = pool.owner();

    let a = pool.alloc(&owner, 100).unwrap();
    let b = pool.alloc(&owner, 100).unwrap();
    pool.audit().unwrap();

    pool.free(a).unwrap();
    pool.audit().unwrap();
    pool.free(b).unwrap();
    pool.audit().unwrap();

    // Both 256-byte buddies merged and the cascade ran 8 -> 28.
    let reports = pool.segment_reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].classes.len(), 1);
    assert_eq!(reports[0].classes[0].mclass, 28);
    assert_eq!(reports[0].classes[0].free, 1);
}

#[test]
fn test_validate_rejects_foreign_pointers() {
    let pool = pool_with(4, 1);
    let owner = pool.owner();

    let on_stack = 0u64;
    assert!(!pool.validate(&on_stack as *const u64 as *const u8));

    let ptr = pool.alloc(&owner, 64).unwrap();
    // Mid-payload pointers are not valid handles either.
    assert!(!pool.validate(unsafe { ptr.as_ptr().add(8) }));
    assert!(pool.validate(ptr.as_ptr()));
    pool.free(ptr).unwrap();

    // Freed pointers stop validating.
    assert!(!pool.validate(ptr.as_ptr()));
    assert!(matches!(pool.free(ptr), Err(Error::Corrupted(_))));
}

#[test]
fn test_request_too_large_is_rejected() {
    let pool = pool_with(4, 1);
    let owner = pool.owner();

    let err = pool.alloc(&owner, 1 << 28).unwrap_err();
    assert!(matches!(err, Error::TooLarge { .. }));

    let max = pool.max_alloc_size();
    let ptr = pool.alloc(&owner, max).unwrap();
    assert_eq!(pool.chunk_size(ptr).unwrap(), 1 << 28);
    pool.free(ptr).unwrap();
}

// ============================================================================
// Segment lifecycle
// ============================================================================

#[test]
fn test_full_segment_spills_into_a_second() {
    let pool = pool_with(4, 2);
    let owner = pool.owner();

    // 200 MiB takes the maximal class, i.e. the whole 256 MiB segment.
    let big = pool.alloc(&owner, 200 << 20).unwrap();
    assert_eq!(pool.chunk_size(big).unwrap(), 1 << 28);
    assert_eq!(pool.segment_reports().len(), 1);

    let small = pool.alloc(&owner, 100).unwrap();
    let reports = pool.segment_reports();
    assert_eq!(reports.len(), 2);
    pool.audit().unwrap();

    pool.free(small).unwrap();
    pool.free(big).unwrap();
    pool.audit().unwrap();
}

#[test]
fn test_emptied_segment_is_destroyed_and_reincarnated() {
    let pool = pool_with(2, 0);
    let owner = pool.owner();

    let ptr = pool.alloc(&owner, 100).unwrap();
    let reports = pool.segment_reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].revision, 1);

    pool.free(ptr).unwrap();
    // Nothing persistent: the drained segment went back to inactive.
    assert!(pool.segment_reports().is_empty());
    pool.audit().unwrap();

    // The next allocation recreates the slot under a new incarnation.
    let again = pool.alloc(&owner, 100).unwrap();
    assert_eq!(again, ptr);
    let reports = pool.segment_reports();
    assert_eq!(reports[0].revision, 3);
    pool.free(again).unwrap();
}

#[test]
fn test_out_of_segments_reported_and_recoverable() {
    let pool = pool_with(2, 0);
    let owner = pool.owner();
    let max = pool.max_alloc_size();

    let a = pool.alloc(&owner, max).unwrap();
    let b = pool.alloc(&owner, max).unwrap();
    assert!(matches!(
        pool.alloc(&owner, 100),
        Err(Error::OutOfSegments(2))
    ));

    pool.free(a).unwrap();
    let c = pool.alloc(&owner, 100).unwrap();
    pool.free(b).unwrap();
    pool.free(c).unwrap();
    pool.audit().unwrap();
}

// ============================================================================
// Realloc
// ============================================================================

#[test]
fn test_realloc_same_class_updates_length_in_place() {
    let pool = pool_with(4, 1);
    let owner = pool.owner();

    let ptr = pool.alloc(&owner, 100).unwrap();
    unsafe { ptr.as_ptr().write_bytes(0x42, 100) };

    let resized = pool.realloc(ptr, 150).unwrap();
    assert_eq!(resized, ptr);
    assert_eq!(pool.size(resized).unwrap(), 150);
    assert_eq!(pool.chunk_size(resized).unwrap(), 256);
    assert_eq!(unsafe { resized.as_ptr().read() }, 0x42);
    pool.free(resized).unwrap();
}

#[test]
fn test_realloc_shrink_keeps_pointer_and_carves_tail() {
    let pool = pool_with(4, 1);
    let owner = pool.owner();

    // Class 10 chunk shrunk to class 8.
    let ptr = pool.alloc(&owner, 500).unwrap();
    assert_eq!(pool.chunk_size(ptr).unwrap(), 1024);
    unsafe { ptr.as_ptr().write_bytes(0x17, 4) };

    let resized = pool.realloc(ptr, 4).unwrap();
    assert_eq!(resized, ptr);
    assert_eq!(pool.chunk_size(resized).unwrap(), 256);
    assert_eq!(unsafe { resized.as_ptr().read() }, 0x17);
    pool.audit().unwrap();

    // The vacated tail shows up as free chunks of classes 8 and 9.
    let reports = pool.segment_reports();
    let class8 = reports[0].classes.iter().find(|c| c.mclass == 8).unwrap();
    let class9 = reports[0].classes.iter().find(|c| c.mclass == 9).unwrap();
    assert_eq!(class8.free, 1);
    assert_eq!(class9.free, 1);

    pool.free(resized).unwrap();
    pool.audit().unwrap();
}

#[test]
fn test_realloc_grow_moves_and_preserves_contents() {
    let pool = pool_with(4, 1);
    let owner = pool.owner();

    let ptr = pool.alloc(&owner, 200).unwrap();
    let pattern: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
    unsafe {
        std::ptr::copy_nonoverlapping(pattern.as_ptr(), ptr.as_ptr(), pattern.len());
    }

    let grown = pool.realloc(ptr, 100_000).unwrap();
    assert_ne!(grown, ptr);
    assert_eq!(pool.size(grown).unwrap(), 100_000);
    let readback = unsafe { std::slice::from_raw_parts(grown.as_ptr(), 200) };
    assert_eq!(readback, &pattern[..]);

    // The old chunk went back to the free lists.
    assert!(!pool.validate(ptr.as_ptr()));
    pool.free(grown).unwrap();
    pool.audit().unwrap();
}

// ============================================================================
// Owners
// ============================================================================

#[test]
fn test_free_all_releases_everything() {
    let pool = pool_with(4, 1);
    let owner = pool.owner();

    let sizes = [1usize, 57, 100, 512, 4096, 100_000];
    for i in 0..1000 {
        pool.alloc(&owner, sizes[i % sizes.len()]).unwrap();
    }
    assert_eq!(owner.chunk_count(), 1000);
    pool.audit().unwrap();

    pool.free_all(&owner).unwrap();
    assert_eq!(owner.chunk_count(), 0);
    pool.audit().unwrap();

    // Back to the startup picture: only persistent segments remain, each
    // fully coalesced.
    for report in pool.segment_reports() {
        assert!(report.persistent);
        assert_eq!(report.num_chunks, 0);
        for class in &report.classes {
            assert_eq!(class.active, 0);
        }
    }
}

#[test]
fn test_owner_chunk_counts_match_segment_reports() {
    let pool = pool_with(4, 1);
    let owner_a = pool.owner();
    let owner_b = pool.owner();

    for i in 0..40 {
        let owner = if i % 3 == 0 { &owner_a } else { &owner_b };
        pool.alloc(owner, 100 + i * 37).unwrap();
    }
    pool.audit().unwrap();

    let listed: u32 = pool.segment_reports().iter().map(|r| r.num_chunks).sum();
    assert_eq!(
        listed as u64,
        owner_a.chunk_count() + owner_b.chunk_count()
    );

    pool.free_all(&owner_a).unwrap();
    pool.free_all(&owner_b).unwrap();
    pool.audit().unwrap();
}

#[test]
fn test_dropping_owner_frees_its_chunks() {
    let pool = pool_with(4, 1);
    let owner = pool.owner();

    for _ in 0..10 {
        pool.alloc(&owner, 1024).unwrap();
    }
    assert_eq!(
        pool.segment_reports().iter().map(|r| r.num_chunks).sum::<u32>(),
        10
    );

    drop(owner);
    assert_eq!(
        pool.segment_reports().iter().map(|r| r.num_chunks).sum::<u32>(),
        0
    );
    pool.audit().unwrap();
}

// ============================================================================
// Poisoning
// ============================================================================

#[test]
fn test_poison_stamps_fresh_and_freed_payloads() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let pool = DmaBufferPool::new(PoolConfig {
        segment_size: 1 << 28,
        max_segments: 2,
        persistent_segments: Some(1),
        install_fault_handler: false,
        poison: true,
        ..PoolConfig::default()
    })
    .unwrap();
    let owner = pool.owner();

    let ptr = pool.alloc(&owner, 64).unwrap();
    let fresh = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
    assert!(fresh.iter().all(|&b| b == 0xAE));

    pool.free(ptr).unwrap();
    // The segment is persistent, so the memory stays mapped; the freed
    // payload carries the free stamp.
    let freed = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
    assert!(freed.iter().all(|&b| b == 0xF5));
}
