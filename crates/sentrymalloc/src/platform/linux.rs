//! OS page primitives. Every mapping the allocator owns goes through this
//! layer, which keeps the page-granularity invariant in one place: requests
//! are rounded up to whole pages before they reach the kernel, so no caller
//! ever holds a partially mapped run and `unmap_pages` can re-derive the
//! mapped length from the same rounding.

use crate::util::{align_up, PAGE_SIZE};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Reserve at least `bytes` of zeroed read-write memory, rounded up to
/// whole pages. Null when the kernel refuses; allocation paths turn that
/// into their OOM handling rather than panicking inside malloc.
///
/// # Safety
/// `bytes` must be non-zero.
pub unsafe fn map_pages(bytes: usize) -> *mut u8 {
    let len = align_up(bytes, PAGE_SIZE);
    let mem = libc::mmap(
        ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if mem == libc::MAP_FAILED {
        return ptr::null_mut();
    }
    mem as *mut u8
}

/// Return a run to the kernel. `bytes` is the value passed to `map_pages`;
/// the rounding here must stay in lockstep with it.
///
/// # Safety
/// `ptr` came from `map_pages(bytes)` and nothing references the run.
pub unsafe fn unmap_pages(ptr: *mut u8, bytes: usize) {
    libc::munmap(ptr as *mut libc::c_void, align_up(bytes, PAGE_SIZE));
}

/// Make a run trap on any access. Guarded sampling slots and their fences
/// flip between this and `open_pages`.
///
/// # Safety
/// Whole pages of a live mapping.
pub unsafe fn fence_pages(ptr: *mut u8, bytes: usize) {
    libc::mprotect(ptr as *mut libc::c_void, bytes, libc::PROT_NONE);
}

/// Reopen a fenced run for reads and writes.
///
/// # Safety
/// Whole pages of a live mapping.
pub unsafe fn open_pages(ptr: *mut u8, bytes: usize) {
    libc::mprotect(
        ptr as *mut libc::c_void,
        bytes,
        libc::PROT_READ | libc::PROT_WRITE,
    );
}

/// Hand a run's physical pages back while keeping the mapping. MADV_DONTNEED
/// refaults zero-filled pages on the next touch, which is what lets pooled
/// spans be reused as if freshly mapped. Returns false when the kernel
/// declined; the span then simply stays resident and the release pass does
/// not count it.
///
/// # Safety
/// Whole pages of a live mapping; the contents are forfeit.
pub unsafe fn discard_pages(ptr: *mut u8, bytes: usize) -> bool {
    libc::madvise(ptr as *mut libc::c_void, bytes, libc::MADV_DONTNEED) == 0
}

/// Online CPU count, queried once and cached. Sizes the per-CPU cache
/// array and the NUMA partition map; a CPU coming online later keeps the
/// boot-time sizing.
pub fn online_cpus() -> usize {
    static CACHED: AtomicUsize = AtomicUsize::new(0);
    let cached = CACHED.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let raw = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    let cpus = if raw < 1 { 1 } else { raw as usize };
    CACHED.store(cpus, Ordering::Relaxed);
    cpus
}

/// CPU the calling thread is running on right now; 0 when the kernel
/// cannot say. Only an affinity hint, so staleness after migration is fine.
#[allow(dead_code)]
#[inline]
pub fn current_cpu() -> usize {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        cpu as usize
    }
}

/// Monotonic nanoseconds, for sample timestamps.
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

/// Bounds of the calling thread's stack, for the frame-pointer walker.
/// Returns (low, high), or (0, 0) when they cannot be determined.
pub fn stack_bounds() -> (usize, usize) {
    unsafe {
        let mut attr: libc::pthread_attr_t = core::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return (0, 0);
        }
        let mut base: *mut libc::c_void = ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut base, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 || base.is_null() {
            return (0, 0);
        }
        (base as usize, base as usize + size)
    }
}
