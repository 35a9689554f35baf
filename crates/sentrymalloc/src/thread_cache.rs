//! Per-thread front-end cache: one object stack per size class, linked
//! through the objects themselves. The fast path for both allocate and
//! deallocate — no locks, no atomics, single-threaded by construction.
//! Refills and drains move whole class-specific batches through the
//! transfer cache.

use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::transfer::MAX_BATCH;
use crate::util::DEFAULT_THREAD_CACHE_BYTES;

#[derive(Clone, Copy)]
struct ClassList {
    head: *mut u8,
    len: u32,
}

impl ClassList {
    const EMPTY: ClassList = ClassList {
        head: core::ptr::null_mut(),
        len: 0,
    };
}

pub struct Cache {
    lists: [ClassList; NUM_SIZE_CLASSES],
    total_bytes: usize,
    budget: usize,
}

impl Cache {
    pub const fn new() -> Self {
        Cache {
            lists: [ClassList::EMPTY; NUM_SIZE_CLASSES],
            total_bytes: 0,
            budget: DEFAULT_THREAD_CACHE_BYTES,
        }
    }

    pub fn set_budget(&mut self, budget: usize) {
        self.budget = budget;
    }

    /// Pop one object. None = miss, caller refills.
    #[inline]
    pub fn pop(&mut self, class: u32) -> Option<*mut u8> {
        let list = &mut self.lists[class as usize];
        if list.head.is_null() {
            return None;
        }
        let obj = list.head;
        unsafe {
            list.head = *(obj as *mut *mut u8);
        }
        list.len -= 1;
        self.total_bytes -= size_class::class_to_size(class);
        Some(obj)
    }

    /// Push one freed object.
    ///
    /// # Safety
    /// `obj` must be a live object of `class`, owned by the caller.
    #[inline]
    pub unsafe fn push(&mut self, class: u32, obj: *mut u8) {
        let list = &mut self.lists[class as usize];
        *(obj as *mut *mut u8) = list.head;
        list.head = obj;
        list.len += 1;
        self.total_bytes += size_class::class_to_size(class);
    }

    /// Whether a drain should follow a push: the class holds more than two
    /// batches, or the whole cache is over budget.
    #[inline]
    pub fn needs_drain(&self, class: u32) -> bool {
        let list = &self.lists[class as usize];
        list.len as usize > 2 * size_class::class_batch(class) || self.total_bytes > self.budget
    }

    /// Absorb a refill batch.
    ///
    /// # Safety
    /// All pointers are live objects of `class` owned by the caller.
    pub unsafe fn fill(&mut self, class: u32, batch: &[*mut u8]) {
        for &obj in batch {
            self.push(class, obj);
        }
    }

    /// Pop up to one batch into `buf`; returns the count.
    pub fn drain(&mut self, class: u32, buf: &mut [*mut u8; MAX_BATCH]) -> usize {
        let want = size_class::class_batch(class);
        let mut n = 0;
        while n < want {
            match self.pop(class) {
                Some(obj) => {
                    buf[n] = obj;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Pop everything of one class (thread exit / full drain).
    pub fn drain_all(&mut self, class: u32, buf: &mut [*mut u8; MAX_BATCH]) -> usize {
        let mut n = 0;
        while n < MAX_BATCH {
            match self.pop(class) {
                Some(obj) => {
                    buf[n] = obj;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }
}

/// Run `f` against the calling thread's cache. Returns None during TLS
/// teardown or when re-entered from inside the cache itself.
#[inline]
pub fn with_cache<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut Cache) -> R,
{
    use std::cell::RefCell;

    thread_local! {
        static CACHE: RefCell<Cache> = const { RefCell::new(Cache::new()) };
    }

    CACHE
        .try_with(|cell| cell.try_borrow_mut().ok().map(|mut cache| f(&mut cache)))
        .ok()
        .flatten()
}
