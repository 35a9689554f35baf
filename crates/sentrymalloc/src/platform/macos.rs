//! macOS rendition of the page primitives: same rounding contract as the
//! Linux layer, with the Darwin spellings (MAP_ANON, MADV_FREE). The
//! safety-layer extras that depend on Linux interfaces degrade here:
//! stack bounds are unknown and CPU identity collapses to 0.

use crate::util::{align_up, PAGE_SIZE};
use core::ptr;

/// # Safety
/// `bytes` must be non-zero.
pub unsafe fn map_pages(bytes: usize) -> *mut u8 {
    let len = align_up(bytes, PAGE_SIZE);
    let mem = libc::mmap(
        ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    if mem == libc::MAP_FAILED {
        return ptr::null_mut();
    }
    mem as *mut u8
}

/// # Safety
/// `ptr` came from `map_pages(bytes)` and nothing references the run.
pub unsafe fn unmap_pages(ptr: *mut u8, bytes: usize) {
    libc::munmap(ptr as *mut libc::c_void, align_up(bytes, PAGE_SIZE));
}

/// # Safety
/// Whole pages of a live mapping.
pub unsafe fn fence_pages(ptr: *mut u8, bytes: usize) {
    libc::mprotect(ptr as *mut libc::c_void, bytes, libc::PROT_NONE);
}

/// # Safety
/// Whole pages of a live mapping.
pub unsafe fn open_pages(ptr: *mut u8, bytes: usize) {
    libc::mprotect(
        ptr as *mut libc::c_void,
        bytes,
        libc::PROT_READ | libc::PROT_WRITE,
    );
}

/// MADV_FREE reclaims lazily, so discarded contents may linger until
/// memory pressure; callers already treat pooled spans as undefined.
///
/// # Safety
/// Whole pages of a live mapping; the contents are forfeit.
pub unsafe fn discard_pages(ptr: *mut u8, bytes: usize) -> bool {
    libc::madvise(ptr as *mut libc::c_void, bytes, libc::MADV_FREE) == 0
}

pub fn online_cpus() -> usize {
    let raw = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if raw < 1 {
        1
    } else {
        raw as usize
    }
}

/// sched_getcpu is unavailable on macOS; all threads share partition 0.
#[allow(dead_code)]
#[inline]
pub fn current_cpu() -> usize {
    0
}

pub fn monotonic_nanos() -> u64 {
    unsafe {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }
}

/// Stack bounds are not derivable portably here; the frame-pointer walker
/// degrades to an empty trace.
pub fn stack_bounds() -> (usize, usize) {
    (0, 0)
}
