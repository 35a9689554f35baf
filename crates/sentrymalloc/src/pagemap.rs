//! Two-level radix tree mapping pages to spans.
//!
//! Each mapped page carries two cells in its leaf block:
//!   - an `AtomicPtr<Span>` for the owning descriptor, and
//!   - an `AtomicU64` info word packing `(first_page_index << 8) | class`.
//!
//! The info word is the whole fast path: `check_boundary` derives the chunk
//! start and object size from it in a single load when the compact class is
//! non-zero, without touching the (cold) Span. Class 0 in the word means
//! "consult the Span".
//!
//! Writers run under the page-heap lock; readers are wait-free. A reader
//! observes pre- or post-update values, never torn bits. Leaf blocks come
//! straight from mmap, never the user heap.

use crate::pages::PageId;
use crate::platform;
use crate::span::Span;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// Leaf fan-out. 2^15 pages per leaf block.
const L2_BITS: usize = 15;
const L2_SIZE: usize = 1 << L2_BITS;

/// Root covers the canonical 48-bit address space.
const L1_BITS: usize = 48 - crate::util::PAGE_SHIFT - L2_BITS;
const L1_SIZE: usize = 1 << L1_BITS;

#[repr(C)]
struct L2Block {
    spans: [AtomicPtr<Span>; L2_SIZE],
    info: [AtomicU64; L2_SIZE],
}

/// Root table pointer, installed once with CAS so a racing double-init is
/// harmless (the loser unmaps its copy).
static L1_ROOT: AtomicPtr<AtomicPtr<L2Block>> = AtomicPtr::new(ptr::null_mut());

#[inline(always)]
fn split(p: PageId) -> Option<(usize, usize)> {
    let index = p.index();
    if index >> (L1_BITS + L2_BITS) != 0 {
        return None;
    }
    Some((index >> L2_BITS, index & (L2_SIZE - 1)))
}

/// Map the root table. Idempotent; must complete before any allocation.
///
/// # Safety
/// Requires a working mmap only.
pub unsafe fn init() -> bool {
    if !L1_ROOT.load(Ordering::Acquire).is_null() {
        return true;
    }
    let bytes = L1_SIZE * core::mem::size_of::<AtomicPtr<L2Block>>();
    let mem = platform::map_pages(bytes);
    if mem.is_null() {
        return false;
    }
    // mmap is zeroed and null is all-zero, so the root is ready as-is.
    let root = mem as *mut AtomicPtr<L2Block>;
    if L1_ROOT
        .compare_exchange(ptr::null_mut(), root, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        platform::unmap_pages(mem, bytes);
    }
    true
}

#[cold]
unsafe fn alloc_l2(slot: &AtomicPtr<L2Block>) -> *mut L2Block {
    let bytes = core::mem::size_of::<L2Block>();
    let mem = platform::map_pages(bytes);
    if mem.is_null() {
        return ptr::null_mut();
    }
    // Zeroed memory: null span pointers, absent info words.
    let block = mem as *mut L2Block;
    match slot.compare_exchange(ptr::null_mut(), block, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => block,
        Err(existing) => {
            platform::unmap_pages(mem, bytes);
            existing
        }
    }
}

unsafe fn leaf_for(p: PageId, create: bool) -> Option<(&'static L2Block, usize)> {
    let l1 = L1_ROOT.load(Ordering::Acquire);
    if l1.is_null() {
        return None;
    }
    let (l1_idx, l2_idx) = split(p)?;
    let slot = &*l1.add(l1_idx);
    let mut block = slot.load(Ordering::Acquire);
    if block.is_null() {
        if !create {
            return None;
        }
        block = alloc_l2(slot);
        if block.is_null() {
            return None;
        }
    }
    Some((&*block, l2_idx))
}

/// Span owning `p`, or null. Wait-free.
#[inline(always)]
pub fn get(p: PageId) -> *mut Span {
    unsafe {
        match leaf_for(p, false) {
            Some((block, idx)) => block.spans[idx].load(Ordering::Acquire),
            None => ptr::null_mut(),
        }
    }
}

/// Packed `(first_page << 8) | class` word for `p`, or 0 when the page is
/// not registered. The bounds-check fast path.
#[inline(always)]
pub fn get_page_info(p: PageId) -> u64 {
    unsafe {
        match leaf_for(p, false) {
            Some((block, idx)) => block.info[idx].load(Ordering::Acquire),
            None => 0,
        }
    }
}

/// Register every page of `span` with the given compact class. The span's
/// geometry fields must be written before this call; the stores here are
/// the publication point.
///
/// # Safety
/// Caller holds the page-heap lock; `span` is valid.
pub unsafe fn set_span(span: *mut Span, compact_class: u8) {
    let first = (*span).first_page();
    let packed = ((first.index() as u64) << 8) | compact_class as u64;
    for i in 0..(*span).num_pages() {
        if let Some((block, idx)) = leaf_for(first.add(i), true) {
            block.spans[idx].store(span, Ordering::Release);
            block.info[idx].store(packed, Ordering::Release);
        }
    }
}

/// Drop the registration of every page of `span` (guarded spans, whose
/// pages outlive the descriptor). Pool-owned spans keep their entries.
///
/// # Safety
/// Caller holds the page-heap lock.
pub unsafe fn clear_span(span: *mut Span) {
    let first = (*span).first_page();
    for i in 0..(*span).num_pages() {
        if let Some((block, idx)) = leaf_for(first.add(i), false) {
            block.spans[idx].store(ptr::null_mut(), Ordering::Release);
            block.info[idx].store(0, Ordering::Release);
        }
    }
}

/// Rewrite only the compact class of `span`'s pages, keeping the span
/// pointer (a span moving between live and cached states).
///
/// # Safety
/// Caller holds the page-heap lock.
pub unsafe fn set_compact_class(span: *mut Span, compact_class: u8) {
    let first = (*span).first_page();
    let packed = ((first.index() as u64) << 8) | compact_class as u64;
    for i in 0..(*span).num_pages() {
        if let Some((block, idx)) = leaf_for(first.add(i), false) {
            block.info[idx].store(packed, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::PageId;

    fn ensure_init() {
        use std::sync::Once;
        static ONCE: Once = Once::new();
        ONCE.call_once(|| unsafe {
            assert!(init());
        });
    }

    #[test]
    fn absent_pages_read_as_empty() {
        ensure_init();
        // High canonical pages no test (and no mmap) ever touches.
        let p = PageId::from_index((1 << 35) + 0x12345);
        assert!(get(p).is_null());
        assert_eq!(get_page_info(p), 0);
        assert_eq!(get_page_info(PageId::from_index((1 << 35) + 0x7654321)), 0);
    }

    #[test]
    fn set_and_get_round_trip() {
        ensure_init();
        // Above the 47-bit mmap ceiling: cannot collide with live spans.
        let span = Span::new(PageId::from_index((1 << 35) + 0x40_0000), 3);
        unsafe {
            (*span).stamp(64, 64);
            set_span(span, 7);
            let first = (*span).first_page();
            for i in 0..3 {
                assert_eq!(get(first.add(i)), span);
                let info = get_page_info(first.add(i));
                assert_eq!(info & 0xff, 7);
                assert_eq!((info >> 8) as usize, first.index());
            }
            set_compact_class(span, 0);
            assert_eq!(get_page_info(first) & 0xff, 0);
            assert_eq!(get(first), span);
            clear_span(span);
            assert!(get(first).is_null());
            assert_eq!(get_page_info(first), 0);
            Span::delete(span);
        }
    }

    #[test]
    fn out_of_range_pages_are_rejected() {
        ensure_init();
        let huge = PageId::from_index(1 << 40);
        assert!(get(huge).is_null());
        assert_eq!(get_page_info(huge), 0);
    }
}
