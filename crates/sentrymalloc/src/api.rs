//! C ABI: the standard allocation entry points plus the safety extension
//! the sanitizing pass emits calls to. Every entry dispatches on the init
//! state and falls back to the passthrough when the allocator is disabled
//! or still coming up.

use crate::init::{self, STATE_DISABLED, STATE_READY};
use crate::safety;
use crate::stats::stat_inc;
use crate::{passthrough, stats};
use core::ffi::{c_char, c_int, c_void};
use core::ptr;

/// Dispatch: check init state and route to the heap or the passthrough.
macro_rules! dispatch {
    ($ready:expr, $fallback:expr) => {{
        match init::state() {
            STATE_READY => $ready,
            STATE_DISABLED => $fallback,
            _ => {
                init::ensure_initialized();
                match init::state() {
                    STATE_READY => $ready,
                    _ => $fallback,
                }
            }
        }
    }};
}

// ============================================================================
// Standard C allocator API
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    dispatch!(
        init::heap().malloc(size) as *mut c_void,
        passthrough::malloc(size) as *mut c_void
    )
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    dispatch!(
        init::heap().free(ptr as *mut u8),
        passthrough::free(ptr as *mut u8)
    );
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    dispatch!(
        init::heap().realloc(ptr as *mut u8, size) as *mut c_void,
        passthrough::realloc(ptr as *mut u8, size) as *mut c_void
    )
}

#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    dispatch!(
        init::heap().calloc(nmemb, size) as *mut c_void,
        passthrough::calloc(nmemb, size) as *mut c_void
    )
}

// ============================================================================
// POSIX / C11 alignment APIs
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if memptr.is_null() {
        return libc::EINVAL;
    }
    if !alignment.is_power_of_two() || alignment < core::mem::size_of::<*mut c_void>() {
        return libc::EINVAL;
    }

    let ptr = dispatch!(
        init::heap().memalign(alignment, size) as *mut c_void,
        passthrough::memalign(alignment, size) as *mut c_void
    );
    if ptr.is_null() {
        return libc::ENOMEM;
    }
    *memptr = ptr;
    0
}

#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    // C11: size must be a multiple of alignment
    if !alignment.is_power_of_two() || (size % alignment != 0 && size != 0) {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    }
    dispatch!(
        init::heap().memalign(alignment, size) as *mut c_void,
        passthrough::memalign(alignment, size) as *mut c_void
    )
}

#[no_mangle]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    dispatch!(
        init::heap().memalign(alignment, size) as *mut c_void,
        passthrough::memalign(alignment, size) as *mut c_void
    )
}

#[no_mangle]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    let page = crate::util::PAGE_SIZE;
    dispatch!(
        init::heap().memalign(page, size) as *mut c_void,
        passthrough::memalign(page, size) as *mut c_void
    )
}

#[no_mangle]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    let page = crate::util::PAGE_SIZE;
    let rounded = crate::util::align_up(size.max(1), page);
    dispatch!(
        init::heap().memalign(page, rounded) as *mut c_void,
        passthrough::memalign(page, rounded) as *mut c_void
    )
}

// ============================================================================
// GNU / jemalloc-compatible extensions
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    dispatch!(
        init::heap().usable_size(ptr as *mut u8),
        passthrough::malloc_usable_size(ptr as *mut u8)
    )
}

/// Usable size a malloc(size) would produce, without allocating.
#[no_mangle]
pub unsafe extern "C" fn nallocx(size: usize, _flags: c_int) -> usize {
    dispatch!(init::heap().nallocx(size), size)
}

/// Sized deallocation.
#[no_mangle]
pub unsafe extern "C" fn sdallocx(ptr: *mut c_void, size: usize, _flags: c_int) {
    if ptr.is_null() {
        return;
    }
    dispatch!(
        init::heap().free_with_size(ptr as *mut u8, size),
        passthrough::free(ptr as *mut u8)
    );
}

/// mallopt: accept but ignore options for compatibility.
#[no_mangle]
pub unsafe extern "C" fn mallopt(_param: c_int, _value: c_int) -> c_int {
    1
}

/// mallinfo: zeroed struct for compatibility.
#[cfg(target_os = "linux")]
#[no_mangle]
pub unsafe extern "C" fn mallinfo() -> libc::mallinfo {
    core::mem::zeroed()
}

#[cfg(target_os = "linux")]
#[no_mangle]
pub unsafe extern "C" fn mallinfo2() -> libc::mallinfo2 {
    core::mem::zeroed()
}

/// Release pooled pages back to the kernel.
#[no_mangle]
pub unsafe extern "C" fn malloc_trim(_pad: usize) -> c_int {
    let released = dispatch!(init::heap().release_memory(0), 0);
    (released > 0) as c_int
}

/// Page-heap summary plus (under `statistic`) the operation counters.
#[no_mangle]
pub unsafe extern "C" fn malloc_stats() {
    if init::state() == STATE_READY {
        let s = init::heap().page_allocator.stats();
        crate::log::log_line!(
            "sentrymalloc: mapped {} bytes, pooled {} bytes",
            s.mapped_bytes,
            s.pooled_bytes
        );
    }
    stats::report_statistic();
}

// ============================================================================
// Safety ABI (sanitizer-emitted calls)
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn __gep_check_boundary(
    base: *mut c_void,
    ptr: *mut c_void,
    size: usize,
) -> c_int {
    #[cfg(feature = "protection")]
    {
        safety::gep_check_boundary(base as usize, ptr as usize, size)
    }
    #[cfg(not(feature = "protection"))]
    {
        let _ = (base, ptr, size);
        0
    }
}

/// Alias the instrumentation also emits for the two-argument form's
/// three-argument cousin.
#[no_mangle]
pub unsafe extern "C" fn __check_boundary(
    base: *mut c_void,
    ptr: *mut c_void,
    size: usize,
) -> c_int {
    __gep_check_boundary(base, ptr, size)
}

#[no_mangle]
pub unsafe extern "C" fn __bc_check_boundary(base: *mut c_void, size: usize) -> c_int {
    #[cfg(feature = "protection")]
    {
        safety::bc_check_boundary(base as usize, size)
    }
    #[cfg(not(feature = "protection"))]
    {
        let _ = (base, size);
        0
    }
}

#[no_mangle]
pub unsafe extern "C" fn __escape(loc: *mut *mut c_void, ptr: *mut c_void) -> c_int {
    stat_inc!(ESCAPE);
    #[cfg(feature = "protection")]
    {
        safety::escape(loc as *mut usize, ptr as usize)
    }
    #[cfg(not(feature = "protection"))]
    {
        let _ = (loc, ptr);
        0
    }
}

#[no_mangle]
pub unsafe extern "C" fn __get_chunk_range(base: *mut c_void, out_start: *mut usize) -> usize {
    safety::get_chunk_range(base as usize, out_start)
}

#[no_mangle]
pub unsafe extern "C" fn __report_error() {
    #[cfg(feature = "protection")]
    safety::report_error();
}

#[no_mangle]
pub unsafe extern "C" fn __report_statistic() {
    stats::report_statistic();
}

#[no_mangle]
pub unsafe extern "C" fn __strcpy_check(dst: *mut c_char, src: *const c_char) -> *mut c_char {
    safety::string::strcpy_check(dst as *mut u8, src as *const u8) as *mut c_char
}

#[no_mangle]
pub unsafe extern "C" fn __strncpy_check(
    dst: *mut c_char,
    src: *const c_char,
    maxlen: usize,
) -> *mut c_char {
    safety::string::strncpy_check(dst as *mut u8, src as *const u8, maxlen) as *mut c_char
}

#[no_mangle]
pub unsafe extern "C" fn __strcat_check(dst: *mut c_char, src: *const c_char) -> *mut c_char {
    safety::string::strcat_check(dst as *mut u8, src as *const u8) as *mut c_char
}

#[no_mangle]
pub unsafe extern "C" fn __strncat_check(
    dst: *mut c_char,
    src: *const c_char,
    maxlen: usize,
) -> *mut c_char {
    safety::string::strncat_check(dst as *mut u8, src as *const u8, maxlen) as *mut c_char
}

fn set_errno(err: c_int) {
    #[cfg(target_os = "linux")]
    unsafe {
        *libc::__errno_location() = err;
    }
    #[cfg(target_os = "macos")]
    unsafe {
        *libc::__error() = err;
    }
}
