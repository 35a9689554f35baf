//! Central freelists, one per size class, each behind its own mutex so
//! contention is per-class rather than global. A central list owns the
//! spans of its class that still have free objects; objects are linked
//! through their own first word (objects are at least MIN_ALIGN bytes, and
//! free objects carry no metadata of their own).

use crate::page_allocator::PageAllocator;
use crate::pagemap;
use crate::pages::{Length, PageId};
use crate::size_class;
use crate::span::{MemoryTag, Span, SpanList};
use crate::sync::Mutex;
use core::ptr;

struct Inner {
    /// Spans of this class with at least one free object. Fully-allocated
    /// spans float, reachable only through the pagemap, until an object
    /// comes back.
    nonempty: SpanList,
}

pub struct CentralFreeList {
    inner: Mutex<Inner>,
}

impl CentralFreeList {
    pub const fn new() -> Self {
        CentralFreeList {
            inner: Mutex::new(Inner {
                nonempty: SpanList::new(),
            }),
        }
    }

    /// Fill `buf` with up to `buf.len()` objects of `class`. Returns the
    /// number delivered; 0 means the page allocator is out of memory.
    ///
    /// # Safety
    /// Allocator must be initialized; `class` is a valid non-zero class.
    pub unsafe fn remove_range(
        &self,
        class: u32,
        pa: &PageAllocator,
        buf: &mut [*mut u8],
    ) -> usize {
        let mut inner = self.inner.lock();
        let mut filled = 0;
        while filled < buf.len() {
            let span = inner.nonempty.first();
            let span = if span.is_null() {
                match Self::populate(class, pa) {
                    Some(s) => {
                        inner.nonempty.push_front(s);
                        s
                    }
                    None => break,
                }
            } else {
                span
            };
            while filled < buf.len() && !(*span).free_objects.is_null() {
                let obj = (*span).free_objects;
                (*span).free_objects = *(obj as *mut *mut u8);
                (*span).allocated += 1;
                buf[filled] = obj;
                filled += 1;
            }
            if (*span).free_objects.is_null() {
                inner.nonempty.remove(span);
            }
        }
        filled
    }

    /// Take a batch of objects back. Spans whose every object has returned
    /// are handed to the page allocator.
    ///
    /// # Safety
    /// Every pointer in `batch` must be an object of `class` previously
    /// handed out by `remove_range`.
    pub unsafe fn insert_range(&self, pa: &PageAllocator, batch: &[*mut u8]) {
        let mut inner = self.inner.lock();
        for &obj in batch {
            let span = pagemap::get(PageId::containing(obj as usize));
            crate::log::check_condition!(
                !span.is_null(),
                "sentrymalloc: central freelist insert of unmapped object {:p}",
                obj
            );
            if (*span).free_objects.is_null() {
                // Was fully allocated; it becomes findable again.
                inner.nonempty.push_front(span);
            }
            *(obj as *mut *mut u8) = (*span).free_objects;
            (*span).free_objects = obj;
            (*span).allocated -= 1;
            if (*span).allocated == 0 {
                inner.nonempty.remove(span);
                (*span).free_objects = ptr::null_mut();
                pa.delete_span(span);
            }
        }
    }

    /// Fetch a fresh span from the page allocator, stamp it for `class`,
    /// publish it in the pagemap and carve its object freelist.
    unsafe fn populate(class: u32, pa: &PageAllocator) -> Option<*mut Span> {
        let pages = size_class::class_to_pages(class);
        let span = pa.new_span(Length::new(pages), MemoryTag::Normal);
        if span.is_null() {
            return None;
        }
        let size = size_class::class_to_size(class);
        let objects = size_class::class_objects(class);
        (*span).stamp(size, objects);
        (*span).allocated = 0;
        // Geometry is stamped before the pagemap stores publish the span.
        pagemap::set_span(span, class as u8);

        let base = (*span).start_address();
        let mut head: *mut u8 = ptr::null_mut();
        let mut i = objects;
        while i > 0 {
            i -= 1;
            let obj = (base + i * size) as *mut u8;
            *(obj as *mut *mut u8) = head;
            head = obj;
        }
        (*span).free_objects = head;
        Some(span)
    }
}
