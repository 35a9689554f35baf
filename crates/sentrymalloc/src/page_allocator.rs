//! The page allocator: source and sink of spans, backed by anonymous
//! mappings. Pools of free spans are kept per memory tag (and NUMA
//! partition), indexed by run length; fresh memory is requested from the OS
//! in 2 MiB slugs and split. Pooled runs are never unmapped, which is what
//! lets stale pagemap entries stay valid; `release_memory` hands the
//! physical pages back with madvise under a dedicated release lock.

use crate::pagemap;
use crate::pages::{Length, PageId};
use crate::span::{MemoryTag, Span, SpanList};
use crate::sync::{FutexLock, Mutex};
use crate::util::PAGE_SHIFT;
use crate::{config, platform};
use core::ptr;

/// Runs up to this many pages have an exact-size pool list.
const MAX_POOL_PAGES: usize = 128;

/// Pages per OS request.
const SLUG_PAGES: usize = {
    let pages = (2 * 1024 * 1024) >> PAGE_SHIFT;
    if pages > MAX_POOL_PAGES {
        pages
    } else {
        MAX_POOL_PAGES * 2
    }
};

#[cfg(feature = "numa-aware")]
const NORMAL_PARTITIONS: usize = 2;
#[cfg(not(feature = "numa-aware"))]
const NORMAL_PARTITIONS: usize = 1;

/// Normal partitions, then Cold, then Sampled.
const NUM_POOLS: usize = NORMAL_PARTITIONS + 2;

struct Pool {
    lists: [SpanList; MAX_POOL_PAGES + 1],
    large: SpanList,
}

impl Pool {
    const fn new() -> Self {
        const EMPTY: SpanList = SpanList::new();
        Pool {
            lists: [EMPTY; MAX_POOL_PAGES + 1],
            large: SpanList::new(),
        }
    }
}

struct PageHeap {
    pools: [Pool; NUM_POOLS],
    mapped_bytes: usize,
    pooled_pages: usize,
}

pub struct PageHeapStats {
    pub mapped_bytes: usize,
    pub pooled_bytes: usize,
}

/// Span source/sink. The inner mutex is the page-heap lock of the whole
/// allocator: pagemap writes happen inside its critical sections.
pub struct PageAllocator {
    heap: Mutex<PageHeap>,
    release_lock: FutexLock,
}

fn pool_index(tag: MemoryTag, partition: u8) -> usize {
    match tag {
        MemoryTag::Normal => (partition as usize) % NORMAL_PARTITIONS,
        MemoryTag::Cold => NORMAL_PARTITIONS,
        MemoryTag::Sampled => NORMAL_PARTITIONS + 1,
    }
}

/// NUMA partition for the calling thread. Identity 0 unless partitioning is
/// compiled in and enabled at runtime.
pub fn current_partition() -> u8 {
    #[cfg(feature = "numa-aware")]
    {
        if config::numa_enabled() {
            return (platform::current_cpu() % NORMAL_PARTITIONS) as u8;
        }
    }
    0
}

impl PageAllocator {
    pub const fn new() -> Self {
        const POOL: Pool = Pool::new();
        PageAllocator {
            heap: Mutex::new(PageHeap {
                pools: [POOL; NUM_POOLS],
                mapped_bytes: 0,
                pooled_pages: 0,
            }),
            release_lock: FutexLock::new(),
        }
    }

    /// Produce an unstamped span of exactly `pages`, tagged. Returns null on
    /// OOM or when the configured memory limit would be exceeded.
    ///
    /// # Safety
    /// Allocator must be initialized.
    pub unsafe fn new_span(&self, pages: Length, tag: MemoryTag) -> *mut Span {
        let partition = current_partition();
        let mut heap = self.heap.lock();
        let pool = pool_index(tag, partition);

        if let Some(span) = Self::carve_from_pool(&mut heap, pool, pages.raw()) {
            (*span).tag = tag;
            (*span).partition = partition;
            return span;
        }

        // Pool miss: bring in a fresh slug and split it.
        let slug = pages.raw().max(SLUG_PAGES);
        let bytes = slug << PAGE_SHIFT;
        let limit = config::memory_limit();
        if limit != 0 && heap.mapped_bytes + bytes > limit {
            return ptr::null_mut();
        }
        let mem = platform::map_pages(bytes);
        if mem.is_null() {
            return ptr::null_mut();
        }
        heap.mapped_bytes += bytes;

        let first = PageId::containing(mem as usize);
        let span = Span::new(first, pages.raw());
        if span.is_null() {
            return ptr::null_mut();
        }
        (*span).tag = tag;
        (*span).partition = partition;
        if slug > pages.raw() {
            Self::pool_remainder(
                &mut heap,
                pool,
                first.add(pages.raw()),
                slug - pages.raw(),
                tag,
                partition,
            );
        }
        span
    }

    /// Produce a span whose start address is aligned to `align_pages` pages.
    /// Used by memalign for alignments above the page size. Always maps
    /// fresh memory; head and tail trims go to the pool.
    ///
    /// # Safety
    /// Allocator must be initialized; `align_pages` is a power of two.
    pub unsafe fn new_span_aligned(
        &self,
        pages: Length,
        align_pages: usize,
        tag: MemoryTag,
    ) -> *mut Span {
        if align_pages <= 1 {
            return self.new_span(pages, tag);
        }
        let partition = current_partition();
        let mut heap = self.heap.lock();
        let total = pages.raw() + align_pages;
        let bytes = total << PAGE_SHIFT;
        let limit = config::memory_limit();
        if limit != 0 && heap.mapped_bytes + bytes > limit {
            return ptr::null_mut();
        }
        let mem = platform::map_pages(bytes);
        if mem.is_null() {
            return ptr::null_mut();
        }
        heap.mapped_bytes += bytes;

        let align_bytes = align_pages << PAGE_SHIFT;
        let aligned = crate::util::align_up(mem as usize, align_bytes);
        let first = PageId::containing(aligned);
        let head = first.index() - PageId::containing(mem as usize).index();
        let tail = total - head - pages.raw();

        let span = Span::new(first, pages.raw());
        if span.is_null() {
            return ptr::null_mut();
        }
        (*span).tag = tag;
        (*span).partition = partition;
        let pool = pool_index(tag, partition);
        if head > 0 {
            Self::pool_remainder(
                &mut heap,
                pool,
                PageId::containing(mem as usize),
                head,
                tag,
                partition,
            );
        }
        if tail > 0 {
            Self::pool_remainder(&mut heap, pool, first.add(pages.raw()), tail, tag, partition);
        }
        span
    }

    /// Return a span to the free pool. The span must already be unstamped
    /// of live objects by the caller's layer; escape structures are torn
    /// down here, and the pagemap keeps the (now classless) entries so that
    /// stale pointers classify as non-heap rather than faulting the tree.
    ///
    /// # Safety
    /// `span` is owned by the caller and not on any list.
    pub unsafe fn delete_span(&self, span: *mut Span) {
        let mut heap = self.heap.lock();
        (*span).release_escapes();
        (*span).unstamp();
        (*span).released = false;
        pagemap::set_compact_class(span, 0);
        let pool = pool_index((*span).tag, (*span).partition);
        Self::push_pool(&mut heap, pool, span);
    }

    /// Hand physical pages of pooled spans back to the kernel, up to
    /// `max_bytes` (0 = everything). Serialised by the release lock; the
    /// page-heap lock is dropped across each madvise call.
    ///
    /// # Safety
    /// Allocator must be initialized.
    pub unsafe fn release_memory(&self, max_bytes: usize) -> usize {
        self.release_lock.lock();
        let mut released = 0usize;
        'outer: loop {
            // Pick a victim under the heap lock, madvise outside it.
            let victim = {
                let heap = self.heap.lock();
                let mut found: *mut Span = ptr::null_mut();
                'scan: for pool in heap.pools.iter() {
                    for list in pool.lists.iter().chain(core::iter::once(&pool.large)) {
                        let mut span = list.first();
                        while !span.is_null() {
                            if !(*span).released {
                                found = span;
                                break 'scan;
                            }
                            span = (*span).next;
                        }
                    }
                }
                if found.is_null() {
                    break 'outer;
                }
                (*found).released = true;
                found
            };
            let bytes = (*victim).bytes_in_span();
            if platform::discard_pages((*victim).start_address() as *mut u8, bytes) {
                released += bytes;
                if max_bytes != 0 && released >= max_bytes {
                    break;
                }
            }
        }
        self.release_lock.unlock();
        released
    }

    pub fn stats(&self) -> PageHeapStats {
        let heap = self.heap.lock();
        PageHeapStats {
            mapped_bytes: heap.mapped_bytes,
            pooled_bytes: heap.pooled_pages << PAGE_SHIFT,
        }
    }

    /// Reset locks in a single-threaded post-fork child.
    ///
    /// # Safety
    /// No other thread may exist.
    pub unsafe fn reset_locks_after_fork(&self) {
        self.heap.force_unlock();
        self.release_lock.force_unlock();
    }

    // ------------------------------------------------------------------

    unsafe fn carve_from_pool(
        heap: &mut PageHeap,
        pool: usize,
        pages: usize,
    ) -> Option<*mut Span> {
        // Exact lists first, then first fit among larger runs.
        let span = if pages <= MAX_POOL_PAGES {
            let mut found = ptr::null_mut();
            for len in pages..=MAX_POOL_PAGES {
                let candidate = heap.pools[pool].lists[len].first();
                if !candidate.is_null() {
                    heap.pools[pool].lists[len].remove(candidate);
                    found = candidate;
                    break;
                }
            }
            if found.is_null() {
                Self::pop_large_fit(heap, pool, pages)
            } else {
                found
            }
        } else {
            Self::pop_large_fit(heap, pool, pages)
        };
        if span.is_null() {
            return None;
        }
        heap.pooled_pages -= (*span).num_pages();
        (*span).released = false;

        if (*span).num_pages() > pages {
            let tag = (*span).tag;
            let partition = (*span).partition;
            let rest_first = (*span).first_page().add(pages);
            let rest_pages = (*span).num_pages() - pages;
            (*span).set_range((*span).first_page(), pages);
            Self::pool_remainder(heap, pool, rest_first, rest_pages, tag, partition);
        }
        Some(span)
    }

    unsafe fn pop_large_fit(heap: &mut PageHeap, pool: usize, pages: usize) -> *mut Span {
        let mut span = heap.pools[pool].large.first();
        while !span.is_null() {
            if (*span).num_pages() >= pages {
                heap.pools[pool].large.remove(span);
                return span;
            }
            span = (*span).next;
        }
        ptr::null_mut()
    }

    /// Wrap leftover pages in a descriptor and pool them, registering the
    /// pages so stale lookups resolve to the (unstamped) remainder span.
    unsafe fn pool_remainder(
        heap: &mut PageHeap,
        pool: usize,
        first: PageId,
        pages: usize,
        tag: MemoryTag,
        partition: u8,
    ) {
        let rest = Span::new(first, pages);
        if rest.is_null() {
            // Metadata OOM: the pages leak into the void rather than the
            // allocator crashing. They stay mapped and unreferenced.
            return;
        }
        (*rest).tag = tag;
        (*rest).partition = partition;
        pagemap::set_span(rest, 0);
        Self::push_pool(heap, pool, rest);
    }

    unsafe fn push_pool(heap: &mut PageHeap, pool: usize, span: *mut Span) {
        heap.pooled_pages += (*span).num_pages();
        let pages = (*span).num_pages();
        if pages <= MAX_POOL_PAGES {
            heap.pools[pool].lists[pages].push_front(span);
        } else {
            heap.pools[pool].large.push_front(span);
        }
    }
}
