//! Size classes for the small-object path.
//!
//! Classes are generated 4-per-doubling: for each power-of-two range
//! [2^k, 2^(k+1)) there are sizes at 1/4, 2/4, 3/4 and 4/4 of the range,
//! starting from 16 and ending at MAX_SMALL. Class 0 is reserved and means
//! "not a small object; consult the Span". Every class size is a multiple
//! of 8, which is what lets Span::obj_size store sizes in 8-byte units.
//!
//! Geometry per class: the span holds `pages` whole pages carved into
//! `num_objects` slots; `batch` is the transfer-cache handoff quantum.

use crate::util::{MAX_SMALL, MIN_ALIGN, PAGE_SIZE};

/// Number of entries including the reserved class 0.
pub const NUM_SIZE_CLASSES: usize = {
    let mut count = 1 + 4; // reserved + 16,32,48,64
    let mut base = 64;
    while base < MAX_SMALL {
        count += 4;
        base *= 2;
    }
    count
};

#[derive(Clone, Copy)]
pub struct SizeClassInfo {
    /// Object size in bytes.
    pub size: usize,
    /// Pages per span for this class.
    pub pages: usize,
    /// Objects carved out of one span.
    pub num_objects: usize,
    /// Objects moved per transfer-cache batch.
    pub batch: usize,
}

const fn info_for(size: usize) -> SizeClassInfo {
    // Smallest span holding at least two objects.
    let mut pages = (2 * size + PAGE_SIZE - 1) / PAGE_SIZE;
    if pages == 0 {
        pages = 1;
    }
    let num_objects = (pages * PAGE_SIZE) / size;
    let mut batch = 65536 / size;
    if batch < 2 {
        batch = 2;
    }
    if batch > 32 {
        batch = 32;
    }
    SizeClassInfo {
        size,
        pages,
        num_objects,
        batch,
    }
}

pub static SIZE_CLASSES: [SizeClassInfo; NUM_SIZE_CLASSES] = {
    let mut table = [SizeClassInfo {
        size: 0,
        pages: 0,
        num_objects: 0,
        batch: 0,
    }; NUM_SIZE_CLASSES];

    // First group: 16, 32, 48, 64
    let mut idx = 1;
    let mut base = 0;
    while idx <= 4 {
        base += 16;
        table[idx] = info_for(base);
        idx += 1;
    }

    // Subsequent groups: 4 per doubling
    base = 64;
    while idx < NUM_SIZE_CLASSES {
        let step = base / 4;
        let mut j = 0;
        while j < 4 && idx < NUM_SIZE_CLASSES {
            base += step;
            table[idx] = info_for(base);
            idx += 1;
            j += 1;
        }
    }

    table
};

/// Look up the size class for an allocation size. Returns `None` when the
/// size must take the page path.
#[inline]
pub fn size_class(size: usize) -> Option<u32> {
    let size = if size < MIN_ALIGN { MIN_ALIGN } else { size };
    if size > MAX_SMALL {
        return None;
    }

    // Binary search for the smallest class >= size (class 0 excluded).
    let mut lo = 1usize;
    let mut hi = NUM_SIZE_CLASSES;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if SIZE_CLASSES[mid].size < size {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    if lo < NUM_SIZE_CLASSES {
        Some(lo as u32)
    } else {
        None
    }
}

#[inline(always)]
pub fn class_to_size(class: u32) -> usize {
    SIZE_CLASSES[class as usize].size
}

#[inline(always)]
pub fn class_to_pages(class: u32) -> usize {
    SIZE_CLASSES[class as usize].pages
}

#[inline(always)]
pub fn class_objects(class: u32) -> usize {
    SIZE_CLASSES[class as usize].num_objects
}

#[inline(always)]
pub fn class_batch(class: u32) -> usize {
    SIZE_CLASSES[class as usize].batch
}
