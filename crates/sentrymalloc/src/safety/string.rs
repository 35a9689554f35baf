//! Bounded string operations. Each computes the chunk end of both operands
//! through the pagemap primitive and copies byte-by-byte, stopping with a
//! report on overrun instead of writing past either chunk. Operands outside
//! the heap (stack buffers) carry no bound.

use crate::log::report_violation;
use crate::safety::chunk_bounds;

#[inline]
fn chunk_end_of(addr: usize) -> usize {
    match chunk_bounds(addr) {
        Some((_, end)) => end,
        None => usize::MAX,
    }
}

/// Copy the NUL-terminated string at `src` to `dst`, bounded by both
/// chunks. Always NUL-terminates `dst` (at the truncation point on
/// overrun). Returns `dst`.
///
/// # Safety
/// `dst` and `src` must be valid C string pointers.
pub unsafe fn strcpy_check(dst: *mut u8, src: *const u8) -> *mut u8 {
    strncpy_check(dst, src, usize::MAX)
}

/// # Safety
/// `dst` and `src` must be valid C string pointers.
pub unsafe fn strncpy_check(dst: *mut u8, src: *const u8, maxlen: usize) -> *mut u8 {
    let dst_end = chunk_end_of(dst as usize);
    let src_end = chunk_end_of(src as usize);

    let mut d = dst;
    let mut s = src;
    let mut i = 0;

    while *s != 0 && i < maxlen {
        if (s as usize) < src_end && (d as usize) + 1 < dst_end {
            *d = *s;
            d = d.add(1);
            s = s.add(1);
            i += 1;
        } else {
            report_violation!("sentrymalloc: OOB detected in strncpy_check");
            break;
        }
    }

    if (d as usize) < dst_end {
        *d = 0;
    }
    dst
}

/// # Safety
/// `dst` and `src` must be valid C string pointers.
pub unsafe fn strcat_check(dst: *mut u8, src: *const u8) -> *mut u8 {
    strncat_check(dst, src, usize::MAX)
}

/// # Safety
/// `dst` and `src` must be valid C string pointers.
pub unsafe fn strncat_check(dst: *mut u8, src: *const u8, maxlen: usize) -> *mut u8 {
    let dst_end = chunk_end_of(dst as usize);
    let src_end = chunk_end_of(src as usize);

    // Seek the terminator of dst, bounded by its own chunk.
    let mut d = dst;
    while *d != 0 {
        if (d as usize) + 1 < dst_end {
            d = d.add(1);
        } else {
            report_violation!("sentrymalloc: OOB detected in strncat_check");
            return dst;
        }
    }

    let mut s = src;
    let mut i = 0;
    while *s != 0 && i < maxlen {
        if (s as usize) < src_end && (d as usize) + 1 < dst_end {
            *d = *s;
            d = d.add(1);
            s = s.add(1);
            i += 1;
        } else {
            report_violation!("sentrymalloc: OOB detected in strncat_check");
            break;
        }
    }

    if (d as usize) < dst_end {
        *d = 0;
    }
    dst
}
