//! ABI behavior tests for sentrymalloc.
//!
//! These exercise the standard C allocator semantics by calling into the
//! heap facade through the crate's public Rust API.

use std::collections::HashSet;
use std::ptr;

use sentrymalloc::allocator::Heap;

/// Helper: initialize the allocator and return the heap.
///
/// # Safety
/// The returned reference is `'static` and backed by the process statics;
/// the facade itself is thread-safe.
unsafe fn heap() -> &'static Heap {
    sentrymalloc::init::ensure_initialized();
    // Pointer-identity assertions below rely on the unsampled fast path.
    sentrymalloc::config::set_sample_rate(0);
    sentrymalloc::init::heap()
}

// ---------------------------------------------------------------------------
// malloc(0) returns a unique, non-NULL, freeable pointer
// ---------------------------------------------------------------------------

#[test]
fn malloc_zero_returns_non_null() {
    unsafe {
        let h = heap();
        let p = h.malloc(0);
        assert!(!p.is_null(), "malloc(0) must return non-NULL");
        h.free(p);
    }
}

#[test]
fn malloc_zero_returns_unique_pointers() {
    unsafe {
        let h = heap();
        let mut ptrs = Vec::new();
        for _ in 0..64 {
            let p = h.malloc(0);
            assert!(!p.is_null());
            ptrs.push(p);
        }
        let unique: HashSet<usize> = ptrs.iter().map(|p| *p as usize).collect();
        assert_eq!(
            unique.len(),
            ptrs.len(),
            "malloc(0) must return unique pointers"
        );
        for p in ptrs {
            h.free(p);
        }
    }
}

// ---------------------------------------------------------------------------
// free(NULL) is a no-op
// ---------------------------------------------------------------------------

#[test]
fn free_null_is_noop() {
    unsafe {
        heap().free(ptr::null_mut());
    }
}

// ---------------------------------------------------------------------------
// Round-trip allocation: sizes x alignments, aligned, usable, writable
// ---------------------------------------------------------------------------

#[test]
fn round_trip_small_sizes() {
    unsafe {
        let h = heap();
        for size in [1usize, 8, 16, 17, 64, 75, 128, 500, 1024, 4000, 8000] {
            let p = h.malloc(size);
            assert!(!p.is_null(), "malloc({}) failed", size);
            assert_eq!(p as usize % 16, 0, "malloc({}) not 16-aligned", size);
            let usable = h.usable_size(p);
            assert!(usable >= size, "usable {} < requested {}", usable, size);
            // Whole usable extent is writable.
            ptr::write_bytes(p, 0x5A, usable);
            h.free(p);
        }
    }
}

#[test]
fn round_trip_alignments() {
    unsafe {
        let h = heap();
        let mut align = 1usize;
        while align <= 4096 {
            let p = h.memalign(align, 75);
            assert!(!p.is_null(), "memalign({}, 75) failed", align);
            assert_eq!(
                p as usize % align.max(1),
                0,
                "memalign({}, 75) misaligned",
                align
            );
            assert!(h.usable_size(p) >= 75);
            ptr::write_bytes(p, 0x33, 75);
            h.free(p);
            align *= 2;
        }
    }
}

#[test]
fn round_trip_large_sizes() {
    unsafe {
        let h = heap();
        for size in [16 * 1024usize, 64 * 1024, 1024 * 1024] {
            let p = h.malloc(size);
            assert!(!p.is_null());
            assert!(h.usable_size(p) >= size);
            ptr::write_bytes(p, 0x77, size);
            h.free(p);
        }
    }
}

#[test]
fn freed_chunk_is_reusable() {
    unsafe {
        let h = heap();
        let p = h.malloc(200);
        assert!(!p.is_null());
        h.free(p);
        // The thread cache is LIFO; the same chunk comes straight back.
        let q = h.malloc(200);
        assert_eq!(q, p, "freed chunk must be reusable");
        h.free(q);
    }
}

// ---------------------------------------------------------------------------
// realloc
// ---------------------------------------------------------------------------

#[test]
fn realloc_null_acts_as_malloc() {
    unsafe {
        let h = heap();
        let p = h.realloc(ptr::null_mut(), 128);
        assert!(!p.is_null());
        ptr::write_bytes(p, 0xAB, 128);
        h.free(p);
    }
}

#[test]
fn realloc_to_zero_returns_minimum_allocation() {
    unsafe {
        let h = heap();
        let p = h.malloc(64);
        let q = h.realloc(p, 0);
        assert!(!q.is_null(), "realloc(p, 0) must return a valid pointer");
        h.free(q);
    }
}

#[test]
fn realloc_preserves_contents() {
    unsafe {
        let h = heap();
        let p = h.malloc(100);
        for i in 0..100 {
            *p.add(i) = i as u8;
        }
        let q = h.realloc(p, 50_000);
        assert!(!q.is_null());
        for i in 0..100 {
            assert_eq!(*q.add(i), i as u8, "byte {} lost in realloc grow", i);
        }
        let r = h.realloc(q, 40);
        assert!(!r.is_null());
        for i in 0..40 {
            assert_eq!(*r.add(i), i as u8, "byte {} lost in realloc shrink", i);
        }
        h.free(r);
    }
}

#[test]
fn realloc_within_chunk_keeps_pointer() {
    unsafe {
        let h = heap();
        let p = h.malloc(100);
        let usable = h.usable_size(p);
        // Mild growth within the chunk and mild shrink both serve in place.
        assert_eq!(h.realloc(p, usable), p);
        assert_eq!(h.realloc(p, usable * 3 / 4), p);
        h.free(p);
    }
}

// ---------------------------------------------------------------------------
// calloc
// ---------------------------------------------------------------------------

#[test]
fn calloc_zeroes_recycled_memory() {
    unsafe {
        let h = heap();
        let p = h.malloc(256);
        ptr::write_bytes(p, 0xFF, 256);
        h.free(p);
        let q = h.calloc(4, 64);
        assert!(!q.is_null());
        for i in 0..256 {
            assert_eq!(*q.add(i), 0, "calloc byte {} not zeroed", i);
        }
        h.free(q);
    }
}

#[test]
fn calloc_overflow_fails() {
    unsafe {
        let h = heap();
        let p = h.calloc(usize::MAX, 2);
        assert!(p.is_null(), "calloc overflow must fail");
    }
}

// ---------------------------------------------------------------------------
// nallocx agrees with usable_size
// ---------------------------------------------------------------------------

#[test]
fn nallocx_matches_actual_usable_size() {
    unsafe {
        let h = heap();
        for size in [1usize, 75, 128, 1000, 8000, 100_000] {
            let predicted = h.nallocx(size);
            let p = h.malloc(size);
            assert_eq!(
                predicted,
                h.usable_size(p),
                "nallocx({}) disagrees with malloc",
                size
            );
            h.free(p);
        }
    }
}

// ---------------------------------------------------------------------------
// Size-class monotonicity: class_to_size(size_class(n)) >= n
// ---------------------------------------------------------------------------

#[test]
fn size_class_monotonicity() {
    use sentrymalloc::size_class::{class_to_size, size_class};
    for n in 1..=sentrymalloc::util::MAX_SMALL {
        let c = size_class(n).unwrap();
        assert!(class_to_size(c) >= n);
    }
}

// ---------------------------------------------------------------------------
// Hot/cold access hints
// ---------------------------------------------------------------------------

#[test]
fn cold_hint_round_trip() {
    unsafe {
        let h = heap();
        // Small requests share the tiers; page-path requests land in the
        // cold pool. Both must behave identically to the caller.
        for size in [64usize, 100_000] {
            let p = h.malloc_hot_cold(size, true);
            assert!(!p.is_null());
            assert!(h.usable_size(p) >= size);
            ptr::write_bytes(p, 0x44, size);
            h.free(p);
        }
        let q = h.malloc_hot_cold(128, false);
        assert!(!q.is_null());
        h.free(q);
    }
}

// ---------------------------------------------------------------------------
// malloc_trim / malloc_stats smoke
// ---------------------------------------------------------------------------

#[test]
fn trim_releases_pooled_memory() {
    unsafe {
        let h = heap();
        let p = h.malloc(256 * 1024);
        assert!(!p.is_null());
        h.free(p);
        // The span sits in the pool now; a release pass finds work.
        assert!(h.release_memory(0) > 0);
    }
}
