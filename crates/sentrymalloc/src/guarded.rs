//! Guarded-page allocator for sampled allocations. A fixed region of data
//! pages, each fenced by PROT_NONE pages on both sides, so any out-of-bounds
//! access hardware-traps. Only single-page, page-alignable sampled
//! allocations are eligible; everything else takes the dedicated-span
//! sampling path.

use crate::platform;
use crate::util::{align_down, PAGE_SIZE};
use core::ptr;
use spin::Mutex;

/// Data slots in the region. One u64 occupancy mask.
const SLOTS: usize = 64;

struct Inner {
    /// Region base; slot `i`'s data page sits at `base + (2*i + 1) * PAGE_SIZE`.
    base: usize,
    occupied: u64,
    requested: [usize; SLOTS],
    user: [usize; SLOTS],
}

pub struct GuardedPageAllocator {
    inner: Mutex<Inner>,
}

const REGION_PAGES: usize = 2 * SLOTS + 1;

impl GuardedPageAllocator {
    pub const fn new() -> Self {
        GuardedPageAllocator {
            inner: Mutex::new(Inner {
                base: 0,
                occupied: 0,
                requested: [0; SLOTS],
                user: [0; SLOTS],
            }),
        }
    }

    unsafe fn ensure_region(inner: &mut Inner) -> bool {
        if inner.base != 0 {
            return true;
        }
        let mem = platform::map_pages(REGION_PAGES * PAGE_SIZE);
        if mem.is_null() {
            return false;
        }
        // Everything starts inaccessible; slots open up per allocation.
        platform::fence_pages(mem, REGION_PAGES * PAGE_SIZE);
        inner.base = mem as usize;
        true
    }

    /// Place a sampled allocation in a fenced slot. Returns null when the
    /// request is ineligible, the region is exhausted, or the region could
    /// not be mapped — callers degrade to unguarded sampling.
    ///
    /// # Safety
    /// Allocator must be initialized.
    pub unsafe fn allocate(&self, size: usize, align: usize) -> *mut u8 {
        if size == 0 || size > PAGE_SIZE || align > PAGE_SIZE {
            return ptr::null_mut();
        }
        let mut inner = self.inner.lock();
        if !Self::ensure_region(&mut inner) {
            return ptr::null_mut();
        }
        if inner.occupied == u64::MAX {
            return ptr::null_mut();
        }
        let slot = inner.occupied.trailing_ones() as usize;
        inner.occupied |= 1 << slot;

        let page = inner.base + (2 * slot + 1) * PAGE_SIZE;
        platform::open_pages(page as *mut u8, PAGE_SIZE);
        // Right-aligned against the trailing fence so forward overflows trap
        // on the very next access.
        let user = align_down(page + PAGE_SIZE - size, align.max(1));
        inner.requested[slot] = size;
        inner.user[slot] = user;
        user as *mut u8
    }

    /// Close the slot owning `ptr`. Physical page contents are dropped so a
    /// stale read cannot leak prior data even before the fence traps it.
    ///
    /// # Safety
    /// `ptr` must have come from `allocate` and not yet been freed.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        let mut inner = self.inner.lock();
        let slot = match Self::slot_of(&inner, ptr as usize) {
            Some(s) => s,
            None => return,
        };
        let page = inner.base + (2 * slot + 1) * PAGE_SIZE;
        platform::discard_pages(page as *mut u8, PAGE_SIZE);
        platform::fence_pages(page as *mut u8, PAGE_SIZE);
        inner.occupied &= !(1 << slot);
        inner.requested[slot] = 0;
        inner.user[slot] = 0;
    }

    pub fn pointer_is_mine(&self, ptr: *mut u8) -> bool {
        let inner = self.inner.lock();
        if inner.base == 0 {
            return false;
        }
        let p = ptr as usize;
        p >= inner.base && p < inner.base + REGION_PAGES * PAGE_SIZE
    }

    /// Requested size of the live allocation whose user pointer is exactly
    /// `ptr`; None for fence pages, interior pointers, or stale slots. The
    /// free path uses this as its boundary-exactness check.
    pub fn live_user(&self, ptr: *mut u8) -> Option<usize> {
        let inner = self.inner.lock();
        let slot = Self::slot_of(&inner, ptr as usize)?;
        if inner.user[slot] == ptr as usize {
            Some(inner.requested[slot])
        } else {
            None
        }
    }

    /// Requested size recorded for a live guarded allocation.
    pub fn requested_size(&self, ptr: *mut u8) -> usize {
        let inner = self.inner.lock();
        match Self::slot_of(&inner, ptr as usize) {
            Some(slot) => inner.requested[slot],
            None => 0,
        }
    }

    /// Data-page start for a live guarded allocation (the span anchor).
    pub fn page_of(&self, ptr: *mut u8) -> usize {
        let inner = self.inner.lock();
        match Self::slot_of(&inner, ptr as usize) {
            Some(slot) => inner.base + (2 * slot + 1) * PAGE_SIZE,
            None => 0,
        }
    }

    fn slot_of(inner: &Inner, addr: usize) -> Option<usize> {
        if inner.base == 0 || addr < inner.base {
            return None;
        }
        let offset = addr - inner.base;
        if offset >= REGION_PAGES * PAGE_SIZE {
            return None;
        }
        let page_index = offset / PAGE_SIZE;
        if page_index % 2 == 0 {
            return None; // fence page
        }
        let slot = (page_index - 1) / 2;
        if inner.occupied & (1 << slot) == 0 {
            None
        } else {
            Some(slot)
        }
    }
}
