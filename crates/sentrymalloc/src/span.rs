//! Span descriptors: one per contiguous run of pages handed out by the page
//! allocator. A span carries the object geometry the safety layer reads
//! through the pagemap, the per-slot escape chains, and the sampling mark.
//!
//! Descriptors, escape nodes and escape head tables live in dedicated
//! metadata arenas; user memory never holds allocator metadata.

use crate::arena::MetaArena;
use crate::pages::PageId;
use crate::recorder::SampledAllocation;
use crate::util::{ESCAPE_TABLE_SLOTS, POISON_PATTERN};
use core::cell::Cell;
use core::mem::size_of;
use core::ptr;
use spin::Mutex;

static SPAN_ARENA: MetaArena = MetaArena::new(size_of::<Span>());
static ESCAPE_ARENA: MetaArena = MetaArena::new(size_of::<Escape>());
static ESCAPE_TABLE_ARENA: MetaArena =
    MetaArena::new(ESCAPE_TABLE_SLOTS * size_of::<*mut Escape>());

/// "The cell at `loc` currently stores a pointer into my slot."
/// Sixteen bytes; a node doubles as a 2-head inline table for spans with at
/// most two objects.
#[repr(C)]
pub struct Escape {
    pub loc: *mut usize,
    pub next: *mut Escape,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum MemoryTag {
    Normal = 0,
    Cold = 1,
    Sampled = 2,
}

#[repr(C)]
pub struct Span {
    first_page: PageId,
    num_pages: usize,
    /// Object size in 8-byte units. 0 = unstamped: the span is sitting in a
    /// cache or the page allocator's pool and owns no live objects.
    pub obj_size: u32,
    pub objects_per_span: u32,
    /// null, or an inline 2-slot block, or an ESCAPE_TABLE_SLOTS table of
    /// chain heads. Guarded by `escape_lock` (a Cell so the lock guard and
    /// the list mutation can coexist on one `&self`).
    escape_list: Cell<*mut *mut Escape>,
    escape_lock: Mutex<()>,
    sampled_allocation: *mut SampledAllocation,
    pub tag: MemoryTag,
    /// Set when the span's pages belong to the guarded-page region rather
    /// than the page allocator.
    pub guarded: bool,
    /// NUMA partition of the backing pages.
    pub partition: u8,
    /// Pool bookkeeping: physical pages were returned via madvise while the
    /// span sat in the free pool.
    pub released: bool,
    /// Intrusive linkage for page-allocator pools and central lists.
    pub next: *mut Span,
    pub prev: *mut Span,
    /// Central-freelist state: free objects of this span, linked through
    /// their first word, and the count handed out.
    pub free_objects: *mut u8,
    pub allocated: u32,
}

unsafe impl Send for Span {}
unsafe impl Sync for Span {}

impl Span {
    /// Allocate a descriptor for `[first_page, first_page + num_pages)`.
    /// Returns null on metadata OOM.
    pub fn new(first_page: PageId, num_pages: usize) -> *mut Span {
        let raw = SPAN_ARENA.alloc() as *mut Span;
        if raw.is_null() {
            return raw;
        }
        unsafe {
            raw.write(Span {
                first_page,
                num_pages,
                obj_size: 0,
                objects_per_span: 0,
                escape_list: Cell::new(ptr::null_mut()),
                escape_lock: Mutex::new(()),
                sampled_allocation: ptr::null_mut(),
                tag: MemoryTag::Normal,
                guarded: false,
                partition: 0,
                released: false,
                next: ptr::null_mut(),
                prev: ptr::null_mut(),
                free_objects: ptr::null_mut(),
                allocated: 0,
            });
        }
        raw
    }

    /// Destroy a descriptor, releasing any escape structures it still owns.
    ///
    /// # Safety
    /// `span` must have come from `Span::new` and must be owned by the
    /// caller (no concurrent access).
    pub unsafe fn delete(span: *mut Span) {
        (*span).release_escapes();
        SPAN_ARENA.dealloc(span as *mut u8);
    }

    #[inline(always)]
    pub fn first_page(&self) -> PageId {
        self.first_page
    }

    #[inline(always)]
    pub fn last_page(&self) -> PageId {
        self.first_page.add(self.num_pages - 1)
    }

    #[inline(always)]
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    #[inline(always)]
    pub fn start_address(&self) -> usize {
        self.first_page.start_addr()
    }

    #[inline(always)]
    pub fn bytes_in_span(&self) -> usize {
        self.num_pages << crate::util::PAGE_SHIFT
    }

    /// Reshape the descriptor to a new run. Only valid while the span is
    /// owned by the page allocator (splitting pooled runs).
    pub fn set_range(&mut self, first_page: PageId, num_pages: usize) {
        self.first_page = first_page;
        self.num_pages = num_pages;
    }

    /// Stamp object geometry. Written before the span is published in the
    /// pagemap; the safety layer reads these fields without a lock.
    pub fn stamp(&mut self, obj_size_bytes: usize, objects_per_span: usize) {
        debug_assert!(obj_size_bytes % 8 == 0);
        self.obj_size = (obj_size_bytes / 8) as u32;
        self.objects_per_span = objects_per_span as u32;
    }

    /// Clear the stamp when the span returns to the pool. Pagemap entries
    /// survive; an unstamped span classifies as non-heap.
    pub fn unstamp(&mut self) {
        self.obj_size = 0;
        self.objects_per_span = 0;
    }

    #[inline(always)]
    pub fn obj_size_bytes(&self) -> usize {
        self.obj_size as usize * 8
    }

    /// Slot index of `addr`, or None when the span is unstamped or the
    /// address precedes the span.
    #[inline]
    pub fn slot_index(&self, addr: usize) -> Option<usize> {
        let obj = self.obj_size_bytes();
        if obj == 0 || addr < self.start_address() {
            return None;
        }
        Some((addr - self.start_address()) / obj)
    }

    pub fn sample(&mut self, sa: *mut SampledAllocation) {
        self.sampled_allocation = sa;
        self.tag = MemoryTag::Sampled;
    }

    /// Detach and return the sample record, if any.
    pub fn unsample(&mut self) -> *mut SampledAllocation {
        let sa = self.sampled_allocation;
        self.sampled_allocation = ptr::null_mut();
        sa
    }

    #[inline(always)]
    pub fn sampled_allocation(&self) -> *mut SampledAllocation {
        self.sampled_allocation
    }

    // ------------------------------------------------------------------
    // Escape chains
    // ------------------------------------------------------------------

    /// Heads available for this span: the table is capped, and tiny spans
    /// use an inline 2-head block.
    #[inline]
    fn escape_slots(&self) -> usize {
        (self.objects_per_span as usize).min(ESCAPE_TABLE_SLOTS)
    }

    unsafe fn ensure_escape_list(&self) -> *mut *mut Escape {
        let existing = self.escape_list.get();
        if !existing.is_null() {
            return existing;
        }
        let list = if self.objects_per_span <= 2 {
            // A single escape node is exactly two head pointers.
            let block = ESCAPE_ARENA.alloc() as *mut *mut Escape;
            if !block.is_null() {
                ptr::write_bytes(block, 0, 2);
            }
            block
        } else {
            let table = ESCAPE_TABLE_ARENA.alloc() as *mut *mut Escape;
            if !table.is_null() {
                ptr::write_bytes(table, 0, ESCAPE_TABLE_SLOTS);
            }
            table
        };
        self.escape_list.set(list);
        list
    }

    /// Record that `loc` holds a pointer into slot `idx`. Drops silently on
    /// metadata OOM or when `idx` exceeds the head table.
    ///
    /// # Safety
    /// `loc` must be a mapped heap address.
    pub unsafe fn insert_escape(&self, idx: usize, loc: *mut usize) {
        if idx >= self.escape_slots() {
            return;
        }
        let _guard = self.escape_lock.lock();
        let list = self.ensure_escape_list();
        if list.is_null() {
            return;
        }
        let node = ESCAPE_ARENA.alloc() as *mut Escape;
        if node.is_null() {
            return;
        }
        let head = list.add(idx);
        (*node).loc = loc;
        (*node).next = *head;
        *head = node;
    }

    /// Free slot `idx`'s chain. Every node whose cell still aims into
    /// `[obj_begin, obj_end)` gets the poison pattern ORed into its high
    /// bits, so a later dereference (or free) of that cell traps or is
    /// reported. Under `report-only` the write is suppressed.
    ///
    /// # Safety
    /// Tracked cells must still be mapped (guaranteed: the page allocator
    /// never unmaps pooled runs).
    pub unsafe fn poison_escapes(&self, idx: usize, obj_begin: usize, obj_end: usize) {
        if self.escape_list.get().is_null() || idx >= self.escape_slots() {
            return;
        }
        let _guard = self.escape_lock.lock();
        let head = self.escape_list.get().add(idx);
        let mut cur = *head;
        while !cur.is_null() {
            let next = (*cur).next;
            let cell = (*cur).loc;
            let value = *cell;
            if obj_begin <= value && value < obj_end {
                #[cfg(not(feature = "report-only"))]
                {
                    *cell = value | POISON_PATTERN;
                }
                #[cfg(feature = "report-only")]
                {
                    crate::log::log_line!(
                        "sentrymalloc: dangling pointer cell {:p} -> {:#x} left intact",
                        cell,
                        value
                    );
                }
            }
            ESCAPE_ARENA.dealloc(cur as *mut u8);
            cur = next;
        }
        *head = ptr::null_mut();
    }

    /// Remove the record `loc` from slot `idx`'s chain, if present. Called
    /// when a tracked cell is overwritten with a pointer to a different
    /// object.
    ///
    /// # Safety
    /// Caller must own a consistent view of the span (pagemap-resolved).
    pub unsafe fn clear_old_escape(&self, idx: usize, loc: *mut usize) {
        if self.escape_list.get().is_null() || idx >= self.escape_slots() {
            return;
        }
        let _guard = self.escape_lock.lock();
        let head = self.escape_list.get().add(idx);
        let mut prev: *mut Escape = ptr::null_mut();
        let mut cur = *head;
        while !cur.is_null() {
            if (*cur).loc == loc {
                if prev.is_null() {
                    *head = (*cur).next;
                } else {
                    (*prev).next = (*cur).next;
                }
                ESCAPE_ARENA.dealloc(cur as *mut u8);
                return;
            }
            prev = cur;
            cur = (*cur).next;
        }
    }

    /// Drop every remaining escape structure. Called when the span is
    /// recycled; stale records must not outlive the slots they describe.
    pub unsafe fn release_escapes(&self) {
        let list = self.escape_list.get();
        if list.is_null() {
            return;
        }
        let _guard = self.escape_lock.lock();
        let slots = if self.objects_per_span <= 2 {
            2
        } else {
            ESCAPE_TABLE_SLOTS
        };
        for idx in 0..slots {
            let mut cur = *list.add(idx);
            while !cur.is_null() {
                let next = (*cur).next;
                ESCAPE_ARENA.dealloc(cur as *mut u8);
                cur = next;
            }
        }
        if self.objects_per_span <= 2 {
            ESCAPE_ARENA.dealloc(list as *mut u8);
        } else {
            ESCAPE_TABLE_ARENA.dealloc(list as *mut u8);
        }
        self.escape_list.set(ptr::null_mut());
    }
}

/// Intrusive doubly-linked list of spans, null-terminated.
pub struct SpanList {
    head: *mut Span,
}

unsafe impl Send for SpanList {}

impl SpanList {
    pub const fn new() -> Self {
        SpanList {
            head: ptr::null_mut(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline]
    pub fn first(&self) -> *mut Span {
        self.head
    }

    /// # Safety
    /// `span` must not be on any list.
    pub unsafe fn push_front(&mut self, span: *mut Span) {
        (*span).prev = ptr::null_mut();
        (*span).next = self.head;
        if !self.head.is_null() {
            (*self.head).prev = span;
        }
        self.head = span;
    }

    /// # Safety
    /// `span` must be on this list.
    pub unsafe fn remove(&mut self, span: *mut Span) {
        let prev = (*span).prev;
        let next = (*span).next;
        if prev.is_null() {
            self.head = next;
        } else {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
        (*span).next = ptr::null_mut();
        (*span).prev = ptr::null_mut();
    }

    /// # Safety
    /// List links must be consistent.
    pub unsafe fn pop_front(&mut self) -> *mut Span {
        let span = self.head;
        if !span.is_null() {
            self.remove(span);
        }
        span
    }
}
