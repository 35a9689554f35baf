//! Spatial and temporal safety primitives. Instrumented code calls these at
//! pointer-arithmetic and pointer-store sites; everything resolves through
//! the pagemap's packed info word, so the hot paths cost one or two loads
//! and never take a lock.

pub mod string;

use crate::log::report_violation;
use crate::pagemap;
use crate::pages::PageId;
use crate::size_class;
use crate::span::Span;
use crate::stats::stat_inc;
use crate::util::{ESCAPE_COMMIT_CAPACITY, NON_HEAP_SENTINEL, POISON_PATTERN};
use core::ffi::c_int;
use std::cell::RefCell;

pub const ACCESS_OK: c_int = 0;
pub const ACCESS_OOB: c_int = -1;
pub const ACCESS_NON_HEAP: c_int = 1;

/// Resolve the chunk `[start, end)` containing `addr`.
///
/// Fast case: the page's compact class is non-zero and the packed word
/// alone yields span start and object size — one pagemap load, no span
/// access. Class 0 consults the Span; an unmapped page or an unstamped
/// span (free pool, caches) classifies as non-heap.
#[inline]
pub fn chunk_bounds(addr: usize) -> Option<(usize, usize)> {
    let page = PageId::containing(addr);
    let info = pagemap::get_page_info(page);
    let class = (info & 0xff) as u32;
    let (span_start, obj_size) = if class != 0 {
        let first = PageId::from_index((info >> 8) as usize);
        (first.start_addr(), size_class::class_to_size(class))
    } else {
        let span = pagemap::get(page);
        if span.is_null() {
            return None;
        }
        let span = unsafe { &*span };
        let obj = span.obj_size_bytes();
        if obj == 0 {
            return None;
        }
        (span.start_address(), obj)
    };
    let chunk_start = span_start + ((addr - span_start) / obj_size) * obj_size;
    Some((chunk_start, chunk_start + obj_size))
}

/// Validate the access `[ptr, ptr + size)` against the chunk derived from
/// `base`. Returns 0 ok, -1 out-of-bounds, 1 non-heap.
pub fn gep_check_boundary(base: usize, ptr: usize, size: usize) -> c_int {
    stat_inc!(GEP_CHECK);
    let (chunk_start, chunk_end) = match chunk_bounds(base) {
        Some(bounds) => bounds,
        None => return ACCESS_NON_HEAP,
    };
    if ptr >= chunk_start && ptr + size <= chunk_end {
        return ACCESS_OK;
    }
    report_violation!(
        "sentrymalloc: OOB detected: base {:#x} chunk [{:#x}-{:#x}) access [{:#x}-{:#x})",
        base,
        chunk_start,
        chunk_end,
        ptr,
        ptr + size
    );
    ACCESS_OOB
}

/// `gep_check_boundary(base, base, size)`.
pub fn bc_check_boundary(base: usize, size: usize) -> c_int {
    stat_inc!(BC_CHECK);
    let (chunk_start, chunk_end) = match chunk_bounds(base) {
        Some(bounds) => bounds,
        None => return ACCESS_NON_HEAP,
    };
    if base >= chunk_start && base + size <= chunk_end {
        return ACCESS_OK;
    }
    report_violation!(
        "sentrymalloc: OOB detected: chunk [{:#x}-{:#x}) access [{:#x}-{:#x})",
        chunk_start,
        chunk_end,
        base,
        base + size
    );
    ACCESS_OOB
}

/// Chunk end of `base`; chunk start through `out_start`. Non-heap addresses
/// report the 2^48 sentinel with a zero start.
///
/// # Safety
/// `out_start` must be valid for a write.
pub unsafe fn get_chunk_range(base: usize, out_start: *mut usize) -> usize {
    stat_inc!(GET_END);
    match chunk_bounds(base) {
        Some((start, end)) => {
            *out_start = start;
            end
        }
        None => {
            *out_start = 0;
            NON_HEAP_SENTINEL
        }
    }
}

struct PendingEscape {
    loc: *mut usize,
    ptr: usize,
}

struct CommitBuffer {
    entries: [PendingEscape; ESCAPE_COMMIT_CAPACITY],
    pos: usize,
}

impl CommitBuffer {
    const fn new() -> Self {
        const EMPTY: PendingEscape = PendingEscape {
            loc: core::ptr::null_mut(),
            ptr: 0,
        };
        CommitBuffer {
            entries: [EMPTY; ESCAPE_COMMIT_CAPACITY],
            pos: 0,
        }
    }
}

thread_local! {
    static COMMIT: RefCell<CommitBuffer> = const { RefCell::new(CommitBuffer::new()) };
}

/// Record that the heap cell `loc` is being overwritten with `ptr`.
/// Returns 0 when tracked (or already tracked), -1 when dropped: non-heap
/// holder, non-heap target, unstamped span, or slot out of range.
///
/// The insertion is deferred through a per-thread ring; entries are
/// revalidated (`*loc == ptr`, span still stamped) when the ring drains, so
/// short-lived stores never pay the pointer-chase.
///
/// # Safety
/// `loc` must be valid for reads of one pointer.
pub unsafe fn escape(loc: *mut usize, ptr: usize) -> c_int {
    // Holders outside the heap (stack, globals) are not tracked; checking
    // the holder first is cheap and filters most drops.
    let loc_span = pagemap::get(PageId::containing(loc as usize));
    if loc_span.is_null() {
        return ACCESS_OOB;
    }
    stat_inc!(ESCAPE_HEAP);

    let span = pagemap::get(PageId::containing(ptr));
    if span.is_null() {
        return ACCESS_OOB;
    }
    stat_inc!(ESCAPE_VALID);

    let obj_size = (*span).obj_size_bytes();
    if obj_size == 0 {
        return ACCESS_OOB;
    }
    let span_start = (*span).start_address();
    let idx = (ptr - span_start) / obj_size;
    let obj_start = span_start + idx * obj_size;

    let old = *loc;
    if obj_start <= old && old < obj_start + obj_size {
        // The cell already aims into this slot; nothing to update.
        stat_inc!(ESCAPE_LOC_OPTIMIZED);
        return ACCESS_OK;
    }
    stat_inc!(ESCAPE_FINAL);

    if idx >= (*span).objects_per_span as usize {
        return ACCESS_OOB;
    }

    // The store supersedes whatever relationship the old value carried.
    clear_superseded(old, loc);

    buffer_escape(loc, ptr);
    ACCESS_OK
}

/// Unlink the record `loc` held from its prior target's chain, if the old
/// value resolves to a live slot.
unsafe fn clear_superseded(old: usize, loc: *mut usize) {
    if old == 0 || old & POISON_PATTERN == POISON_PATTERN {
        return;
    }
    let span = pagemap::get(PageId::containing(old));
    if span.is_null() {
        return;
    }
    let span = &mut *span;
    if let Some(idx) = span.slot_index(old) {
        if (idx as u32) < span.objects_per_span {
            span.clear_old_escape(idx, loc);
        }
    }
}

unsafe fn buffer_escape(loc: *mut usize, ptr: usize) {
    let buffered = COMMIT
        .try_with(|cell| {
            let mut buffer = match cell.try_borrow_mut() {
                Ok(b) => b,
                Err(_) => return false,
            };
            if buffer.pos == ESCAPE_COMMIT_CAPACITY {
                drain(&mut buffer);
            }
            let pos = buffer.pos;
            buffer.entries[pos] = PendingEscape { loc, ptr };
            buffer.pos = pos + 1;
            true
        })
        .unwrap_or(false);
    if !buffered {
        commit_one(loc, ptr);
    }
}

/// Flush the ring. Each entry is revalidated: the cell must still hold the
/// recorded pointer and the target span must still be stamped; stale
/// entries (cell overwritten, target freed) are simply dropped.
unsafe fn drain(buffer: &mut CommitBuffer) {
    for i in 0..buffer.pos {
        let loc = buffer.entries[i].loc;
        let ptr = buffer.entries[i].ptr;
        if *loc == ptr {
            commit_one(loc, ptr);
        } else {
            stat_inc!(ESCAPE_CACHE_OPTIMIZED);
        }
    }
    buffer.pos = 0;
}

unsafe fn commit_one(loc: *mut usize, ptr: usize) {
    let span = pagemap::get(PageId::containing(ptr));
    if span.is_null() {
        return;
    }
    let span = &mut *span;
    let idx = match span.slot_index(ptr) {
        Some(i) => i,
        None => return,
    };
    span.insert_escape(idx, loc);
}

/// Flush the calling thread's pending escapes immediately. Tests and
/// shutdown paths use this; production code relies on the ring filling.
pub fn flush_pending_escapes() {
    let _ = COMMIT.try_with(|cell| {
        if let Ok(mut buffer) = cell.try_borrow_mut() {
            unsafe { drain(&mut buffer) };
        }
    });
}

/// Free-time validation and temporal cleanup. `ptr` must sit exactly on an
/// object boundary of its stamped span; every tracked cell still aiming
/// into the object is poisoned and the slot's chain is torn down. Returns
/// false when the free must not touch any freelist.
///
/// # Safety
/// `span` is the pagemap-resolved owner of `ptr`.
pub unsafe fn on_free(span: *mut Span, ptr: usize) -> bool {
    let span = &mut *span;
    let obj_size = span.obj_size_bytes();
    if obj_size == 0 {
        report_violation!("sentrymalloc: double/invalid free detected: {:#x}", ptr);
        return false;
    }
    let start = span.start_address();
    let offset = ptr - start;
    if offset % obj_size != 0 {
        report_violation!("sentrymalloc: double/invalid free detected: {:#x}", ptr);
        return false;
    }
    span.poison_escapes(offset / obj_size, ptr, ptr + obj_size);
    true
}

/// A freed pointer carrying the poison pattern is a recycled dangling
/// pointer: its target was freed and the cell was marked.
#[inline]
pub fn carries_poison(ptr: usize) -> bool {
    ptr & POISON_PATTERN == POISON_PATTERN
}

/// Log (and, per policy, abort) a violation reported by instrumented code.
pub fn report_error() {
    report_violation!("sentrymalloc: OOB detected");
}
