//! Spatial-safety tests: the bounds-check primitive, chunk-range queries,
//! invalid-free detection and the guarded string operations. Mirrors the
//! behavior contract of the sanitizer-facing ABI.

#![cfg(feature = "protection")]

use sentrymalloc::allocator::Heap;
use sentrymalloc::safety::{
    bc_check_boundary, gep_check_boundary, get_chunk_range, ACCESS_NON_HEAP, ACCESS_OK, ACCESS_OOB,
};
use sentrymalloc::util::NON_HEAP_SENTINEL;

unsafe fn heap() -> &'static Heap {
    sentrymalloc::init::ensure_initialized();
    sentrymalloc::init::heap()
}

static GLOBAL_CELL: u64 = 0xfeed;

// ---------------------------------------------------------------------------
// check_boundary(p, p, usable) == 0 immediately after alloc
// ---------------------------------------------------------------------------

#[test]
fn check_is_idempotent_after_alloc() {
    unsafe {
        let h = heap();
        for size in [1usize, 75, 128, 1000, 8000, 64 * 1024] {
            let p = h.malloc(size) as usize;
            assert!(p != 0);
            let usable = h.usable_size(p as *mut u8);
            assert_eq!(
                gep_check_boundary(p, p, usable),
                ACCESS_OK,
                "fresh alloc({}) fails its own bounds",
                size
            );
            h.free(p as *mut u8);
        }
    }
}

// ---------------------------------------------------------------------------
// Literal scenario: alloc(75) lands in an 80-byte chunk
// ---------------------------------------------------------------------------

#[test]
fn scenario_75_byte_object() {
    unsafe {
        let h = heap();
        let p = h.malloc(75) as usize;
        assert!(p != 0);

        assert_eq!(gep_check_boundary(p, p, 80), ACCESS_OK);
        assert_eq!(gep_check_boundary(p, p - 3, 5), ACCESS_OOB);
        assert_eq!(gep_check_boundary(p, p - 4, 1), ACCESS_OOB);
        assert_eq!(gep_check_boundary(p, p - 1, 1), ACCESS_OOB);
        assert_eq!(gep_check_boundary(p, p, 81), ACCESS_OOB);

        assert_eq!(bc_check_boundary(p, 80), ACCESS_OK);
        assert_eq!(bc_check_boundary(p, 81), ACCESS_OOB);

        h.free(p as *mut u8);
    }
}

// ---------------------------------------------------------------------------
// Literal scenario: alloc(0x2000) is page-backed and exactly bounded
// ---------------------------------------------------------------------------

#[test]
fn scenario_page_path_object() {
    unsafe {
        let h = heap();
        let p = h.malloc(0x2000) as usize;
        assert!(p != 0);
        assert_eq!(gep_check_boundary(p, p, 0x2000), ACCESS_OK);
        assert_eq!(gep_check_boundary(p, p, 0x2001), ACCESS_OOB);
        h.free(p as *mut u8);
    }
}

// ---------------------------------------------------------------------------
// Interior pointers resolve to their containing slot
// ---------------------------------------------------------------------------

#[test]
fn interior_base_resolves_to_slot() {
    unsafe {
        let h = heap();
        let p = h.malloc(75) as usize;
        let usable = h.usable_size(p as *mut u8);
        // base in the middle of the object still bounds to the same chunk
        assert_eq!(gep_check_boundary(p + 10, p + 10, usable - 10), ACCESS_OK);
        assert_eq!(gep_check_boundary(p + 10, p, usable), ACCESS_OK);
        assert_eq!(gep_check_boundary(p + 10, p + 10, usable), ACCESS_OOB);
        h.free(p as *mut u8);
    }
}

// ---------------------------------------------------------------------------
// Non-heap classification
// ---------------------------------------------------------------------------

#[test]
fn stack_and_globals_classify_as_non_heap() {
    unsafe {
        heap();
        let local = 0u64;
        let lp = &local as *const u64 as usize;
        assert_eq!(gep_check_boundary(lp, lp, 8), ACCESS_NON_HEAP);
        let gp = &GLOBAL_CELL as *const u64 as usize;
        assert_eq!(gep_check_boundary(gp, gp, 8), ACCESS_NON_HEAP);
        assert_eq!(bc_check_boundary(lp, 8), ACCESS_NON_HEAP);
    }
}

// ---------------------------------------------------------------------------
// get_chunk_range
// ---------------------------------------------------------------------------

#[test]
fn chunk_range_reports_start_and_end() {
    unsafe {
        let h = heap();
        let p = h.malloc(75) as usize;
        let mut start = 0usize;
        let end = get_chunk_range(p, &mut start);
        assert_eq!(start, p, "fresh object begins its chunk");
        assert_eq!(end - start, 80);

        let local = 0u64;
        let end = get_chunk_range(&local as *const u64 as usize, &mut start);
        assert_eq!(start, 0);
        assert_eq!(end, NON_HEAP_SENTINEL);

        h.free(p as *mut u8);
    }
}

// ---------------------------------------------------------------------------
// Invalid free: interior pointer is reported and ignored
// ---------------------------------------------------------------------------

#[test]
fn invalid_free_is_survivable() {
    unsafe {
        let h = heap();
        let p = h.malloc(80);
        assert!(!p.is_null());
        // Interior free: reported (stderr) but the process stays usable and
        // the chunk is untouched.
        h.free(p.add(16));
        // The object is still live and correctly bounded.
        let usable = h.usable_size(p);
        assert_eq!(gep_check_boundary(p as usize, p as usize, usable), ACCESS_OK);
        h.free(p);

        // Same on the page path.
        let big = h.malloc(0x20000);
        assert!(!big.is_null());
        h.free(big.add(0x2000));
        h.free(big);
    }
}

// ---------------------------------------------------------------------------
// Safety ABI round trip through the C symbols
// ---------------------------------------------------------------------------

#[test]
fn c_abi_entry_points() {
    unsafe {
        let h = heap();
        let p = h.malloc(75) as *mut core::ffi::c_void;
        assert_eq!(sentrymalloc::api::__gep_check_boundary(p, p, 80), 0);
        assert_eq!(sentrymalloc::api::__check_boundary(p, p, 81), -1);
        assert_eq!(sentrymalloc::api::__bc_check_boundary(p, 80), 0);
        let mut start = 0usize;
        let end = sentrymalloc::api::__get_chunk_range(p, &mut start);
        assert_eq!(start, p as usize);
        assert_eq!(end, p as usize + 80);
        sentrymalloc::api::__report_statistic();
        h.free(p as *mut u8);
    }
}

// ---------------------------------------------------------------------------
// String-operation guards
// ---------------------------------------------------------------------------

#[test]
fn strcpy_check_within_bounds() {
    unsafe {
        let h = heap();
        let dst = h.malloc(32);
        let src = h.malloc(32);
        core::ptr::copy_nonoverlapping(b"hello\0".as_ptr(), src, 6);
        let out = sentrymalloc::safety::string::strcpy_check(dst, src);
        assert_eq!(out, dst);
        assert_eq!(std::slice::from_raw_parts(dst, 6), b"hello\0");
        h.free(dst);
        h.free(src);
    }
}

#[test]
fn strcpy_check_truncates_on_overrun() {
    unsafe {
        let h = heap();
        // dst chunk is 16 bytes (padded 9 -> 16); src string is longer.
        let dst = h.malloc(8);
        let src = h.malloc(64);
        let long = b"0123456789abcdef0123456789abcdef\0";
        core::ptr::copy_nonoverlapping(long.as_ptr(), src, long.len());
        let dst_usable = h.usable_size(dst);

        sentrymalloc::safety::string::strcpy_check(dst, src);

        // Copy stopped inside the chunk and the result is NUL-terminated.
        let terminated = (0..=dst_usable).any(|i| *dst.add(i) == 0);
        assert!(terminated, "truncated copy must be NUL-terminated in-chunk");
        h.free(dst);
        h.free(src);
    }
}

#[test]
fn strcat_check_appends_within_bounds() {
    unsafe {
        let h = heap();
        let dst = h.malloc(32);
        let src = h.malloc(32);
        core::ptr::copy_nonoverlapping(b"foo\0".as_ptr(), dst, 4);
        core::ptr::copy_nonoverlapping(b"bar\0".as_ptr(), src, 4);
        sentrymalloc::safety::string::strcat_check(dst, src);
        assert_eq!(std::slice::from_raw_parts(dst, 7), b"foobar\0");

        // strncat with a cap shorter than src
        core::ptr::copy_nonoverlapping(b"xy\0".as_ptr(), dst, 3);
        sentrymalloc::safety::string::strncat_check(dst, src, 2);
        assert_eq!(std::slice::from_raw_parts(dst, 5), b"xyba\0");
        h.free(dst);
        h.free(src);
    }
}
