//! The allocator facade: path selection (fast / slow / page), the sampling
//! decision, and the malloc-family policies. One `Heap` instance lives in
//! the process statics.

use crate::central::CentralFreeList;
use crate::guarded::GuardedPageAllocator;
use crate::page_allocator::PageAllocator;
use crate::pagemap;
use crate::pages::{Length, PageId};
use crate::recorder::{SampleRecorder, SampleTemplate};
use crate::safety;
use crate::sampler;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::span::{MemoryTag, Span};
use crate::stats::stat_inc;
use crate::transfer::{TransferCache, MAX_BATCH};
use crate::util::{MAX_SMALL, MAX_STACK_DEPTH, MIN_ALIGN, PAGE_SHIFT, PAGE_SIZE};
use crate::{platform, stack};
use core::ptr;

#[cfg(not(feature = "cpu-cache"))]
use crate::thread_cache::with_cache;

#[cfg(feature = "cpu-cache")]
use crate::cpu_cache::with_cache;

/// Extra byte folded into small-path class selection under protection, so a
/// one-past-the-end pointer still lies inside its own slot.
#[cfg(feature = "protection")]
pub const PROTECTION_PAD: usize = 1;
#[cfg(not(feature = "protection"))]
pub const PROTECTION_PAD: usize = 0;

#[inline(always)]
fn padded(size: usize) -> usize {
    size + PROTECTION_PAD
}

pub struct Heap {
    pub page_allocator: PageAllocator,
    central: [CentralFreeList; NUM_SIZE_CLASSES],
    transfer: [TransferCache; NUM_SIZE_CLASSES],
    pub guarded: GuardedPageAllocator,
    pub recorder: SampleRecorder,
}

unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    pub const fn new() -> Self {
        const CENTRAL: CentralFreeList = CentralFreeList::new();
        const TRANSFER: TransferCache = TransferCache::new();
        Heap {
            page_allocator: PageAllocator::new(),
            central: [CENTRAL; NUM_SIZE_CLASSES],
            transfer: [TRANSFER; NUM_SIZE_CLASSES],
            guarded: GuardedPageAllocator::new(),
            recorder: SampleRecorder::new(),
        }
    }

    // ------------------------------------------------------------------
    // Small-object plumbing: local cache -> transfer cache -> central list
    // ------------------------------------------------------------------

    unsafe fn fetch_batch(&self, class: u32, buf: &mut [*mut u8; MAX_BATCH]) -> usize {
        let n = self.transfer[class as usize].try_remove(buf);
        if n != 0 {
            return n;
        }
        let want = size_class::class_batch(class);
        self.central[class as usize].remove_range(class, &self.page_allocator, &mut buf[..want])
    }

    unsafe fn deposit_batch(&self, class: u32, batch: &[*mut u8]) {
        if !self.transfer[class as usize].try_insert(batch) {
            self.central[class as usize].insert_range(&self.page_allocator, batch);
        }
    }

    /// Fast-path allocate: pop the local cache, refilling a batch on miss.
    unsafe fn allocate_small(&self, class: u32) -> *mut u8 {
        let cached = with_cache(|cache| {
            if let Some(obj) = cache.pop(class) {
                return obj;
            }
            let mut buf = [ptr::null_mut(); MAX_BATCH];
            let n = self.fetch_batch(class, &mut buf);
            if n == 0 {
                return ptr::null_mut();
            }
            cache.fill(class, &buf[1..n]);
            buf[0]
        });
        match cached {
            Some(obj) => obj,
            None => {
                // No local cache (TLS teardown, contended CPU slab): one
                // object straight from the shared tiers.
                let mut buf = [ptr::null_mut(); MAX_BATCH];
                let n = self.central[class as usize].remove_range(
                    class,
                    &self.page_allocator,
                    &mut buf[..1],
                );
                if n == 0 {
                    ptr::null_mut()
                } else {
                    buf[0]
                }
            }
        }
    }

    /// Fast-path deallocate: push the local cache, draining a batch when
    /// over the class or byte budget.
    unsafe fn deallocate_small(&self, class: u32, obj: *mut u8) {
        let deposited = with_cache(|cache| {
            cache.push(class, obj);
            if cache.needs_drain(class) {
                let mut buf = [ptr::null_mut(); MAX_BATCH];
                let n = cache.drain(class, &mut buf);
                if n != 0 {
                    self.deposit_batch(class, &buf[..n]);
                }
            }
        });
        if deposited.is_none() {
            self.central[class as usize].insert_range(&self.page_allocator, &[obj]);
        }
    }

    // ------------------------------------------------------------------
    // Page path
    // ------------------------------------------------------------------

    /// `size > MAX_SMALL`, or an alignment the class table cannot honor.
    /// One object, the whole span; the pagemap carries class 0 and bounds
    /// come from the span stamp.
    unsafe fn malloc_pages(&self, size: usize, align: usize, tag: MemoryTag) -> *mut u8 {
        let pages = Length::from_bytes_ceil(size);
        let span = if align <= PAGE_SIZE {
            self.page_allocator.new_span(pages, tag)
        } else {
            self.page_allocator
                .new_span_aligned(pages, align >> PAGE_SHIFT, tag)
        };
        if span.is_null() {
            return ptr::null_mut();
        }
        (*span).stamp((*span).bytes_in_span(), 1);
        pagemap::set_span(span, 0);

        let result = (*span).start_address() as *mut u8;
        let weight = sampler::with_sampler(|s| s.record_allocation(size)).unwrap_or(0);
        if weight != 0 {
            self.attach_sample(span, size, (*span).bytes_in_span(), align, weight, ptr::null_mut());
        }
        result
    }

    // ------------------------------------------------------------------
    // Sampling
    // ------------------------------------------------------------------

    unsafe fn attach_sample(
        &self,
        span: *mut Span,
        requested: usize,
        allocated: usize,
        align: usize,
        weight: usize,
        proxy: *mut u8,
    ) {
        let mut trace = [0usize; MAX_STACK_DEPTH];
        let depth = stack::capture(&mut trace);
        let template = SampleTemplate {
            stack: trace,
            depth,
            requested_size: requested,
            allocated_size: allocated,
            alignment: align,
            weight,
            span_start: (*span).start_address(),
            allocation_time_ns: platform::monotonic_nanos(),
            proxy,
        };
        let sa = self.recorder.register(&template);
        if sa.is_null() {
            // Sampling is never fatal; the allocation stays unsampled.
            return;
        }
        (*span).sample(sa);
        self.recorder.maybe_save_peak();
    }

    /// Turn a small allocation that tripped the sampler into a sampled one:
    /// either a guarded slot or a dedicated Sampled-tag span. The original
    /// cache object becomes the proxy and goes straight back to the small
    /// path. Degrades to the plain object on any auxiliary failure.
    unsafe fn sampleify_small(
        &self,
        class: u32,
        obj: *mut u8,
        requested: usize,
        align: usize,
        weight: usize,
    ) -> *mut u8 {
        let allocated = size_class::class_to_size(class);
        let usable = allocated - PROTECTION_PAD;

        // Guarded placement: single-page, page-alignable requests only.
        let eligible = allocated <= PAGE_SIZE
            && align <= PAGE_SIZE
            && sampler::with_sampler(|s| s.should_sample_guarded()).unwrap_or(false);
        if eligible {
            let guarded_ptr = self.guarded.allocate(requested, align);
            if !guarded_ptr.is_null() {
                let page = self.guarded.page_of(guarded_ptr);
                let span = Span::new(PageId::containing(page), 1);
                if !span.is_null() {
                    (*span).guarded = true;
                    (*span).tag = MemoryTag::Sampled;
                    // Bounds for guarded memory are page-granular; the
                    // fences catch what the grid cannot express.
                    (*span).stamp(PAGE_SIZE, 1);
                    pagemap::set_span(span, 0);
                    self.attach_sample(span, requested, requested, align, weight, ptr::null_mut());
                    self.deallocate_small(class, obj);
                    return guarded_ptr;
                }
                self.guarded.deallocate(guarded_ptr);
            }
        }

        // Dedicated span in the Sampled tag.
        let span = self
            .page_allocator
            .new_span(Length::from_bytes_ceil(allocated), MemoryTag::Sampled);
        if span.is_null() {
            return obj;
        }
        (*span).stamp(allocated, (*span).bytes_in_span() / allocated);
        pagemap::set_span(span, 0);
        self.attach_sample(span, requested, usable, align, weight, obj);
        self.deallocate_small(class, obj);
        (*span).start_address() as *mut u8
    }

    // ------------------------------------------------------------------
    // Facade operations
    // ------------------------------------------------------------------

    /// # Safety
    /// Allocator must be initialized.
    pub unsafe fn malloc(&self, size: usize) -> *mut u8 {
        stat_inc!(MALLOC);
        // malloc(0) returns a unique non-NULL pointer.
        let requested = if size == 0 { 1 } else { size };
        match size_class::size_class(padded(requested)) {
            Some(class) => {
                let weight =
                    sampler::with_sampler(|s| s.record_allocation(requested)).unwrap_or(0);
                let obj = self.allocate_small(class);
                if obj.is_null() {
                    return ptr::null_mut();
                }
                if weight != 0 {
                    return self.sampleify_small(class, obj, requested, MIN_ALIGN, weight);
                }
                obj
            }
            None => self.malloc_pages(requested, MIN_ALIGN, MemoryTag::Normal),
        }
    }

    /// Hot/cold-tagged allocation (operator-new hot/cold forms; cold steers
    /// the page path into the cold pool).
    ///
    /// # Safety
    /// Allocator must be initialized.
    pub unsafe fn malloc_hot_cold(&self, size: usize, cold: bool) -> *mut u8 {
        let requested = if size == 0 { 1 } else { size };
        if cold && size_class::size_class(padded(requested)).is_none() {
            stat_inc!(MALLOC);
            return self.malloc_pages(requested, MIN_ALIGN, MemoryTag::Cold);
        }
        // The size-class tiers are shared; the hint only steers page spans.
        self.malloc(size)
    }

    /// # Safety
    /// Allocator must be initialized; `align` is a power of two.
    pub unsafe fn memalign(&self, align: usize, size: usize) -> *mut u8 {
        if align <= MIN_ALIGN {
            return self.malloc(size);
        }
        stat_inc!(MALLOC);
        let requested = if size == 0 { 1 } else { size };

        if align <= PAGE_SIZE && padded(requested.max(align)) <= MAX_SMALL {
            // Smallest class that is both large enough and a multiple of
            // the alignment; the power-of-two classes guarantee one exists.
            let mut class = match size_class::size_class(padded(requested.max(align))) {
                Some(c) => c,
                None => return self.malloc_pages(requested, align, MemoryTag::Normal),
            };
            while (class as usize) < NUM_SIZE_CLASSES {
                if size_class::class_to_size(class) % align == 0 {
                    let weight =
                        sampler::with_sampler(|s| s.record_allocation(requested)).unwrap_or(0);
                    let obj = self.allocate_small(class);
                    if obj.is_null() {
                        return ptr::null_mut();
                    }
                    if weight != 0 {
                        return self.sampleify_small(class, obj, requested, align, weight);
                    }
                    return obj;
                }
                class += 1;
            }
        }
        self.malloc_pages(requested, align, MemoryTag::Normal)
    }

    /// # Safety
    /// Allocator must be initialized; `ptr` is null or owned by it.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        stat_inc!(FREE);
        self.free_impl(ptr);
    }

    unsafe fn free_impl(&self, ptr: *mut u8) {
        let addr = ptr as usize;
        let page = PageId::containing(addr);
        let span = pagemap::get(page);
        if span.is_null() {
            if safety::carries_poison(addr) {
                crate::log::report_violation!(
                    "sentrymalloc: double/invalid free detected: {:#x}",
                    addr
                );
            } else {
                crate::log::report_violation!(
                    "sentrymalloc: freeing a pointer with no span: {:#x}",
                    addr
                );
            }
            return;
        }

        // Guarded slots validate against the recorded user pointer; their
        // span grid is page-granular and cannot express the object.
        if (*span).guarded {
            match self.guarded.live_user(ptr) {
                Some(requested) => {
                    (*span).poison_escapes(0, addr, addr + requested);
                    self.free_span(span, ptr);
                }
                None => {
                    crate::log::report_violation!(
                        "sentrymalloc: double/invalid free detected: {:#x}",
                        addr
                    );
                }
            }
            return;
        }

        // Spatial/temporal gate: boundary-exact, then poison every tracked
        // cell still aiming into the object. An unstamped span (pool or
        // cache resident) is an invalid free and touches no freelist.
        if !safety::on_free(span, addr) {
            return;
        }

        let class = (pagemap::get_page_info(page) & 0xff) as u32;
        if class != 0 {
            self.deallocate_small(class, ptr);
        } else {
            self.free_span(span, ptr);
        }
    }

    unsafe fn free_span(&self, span: *mut Span, ptr: *mut u8) {
        let sa = (*span).unsample();
        if !sa.is_null() {
            self.recorder.unregister(sa);
        }
        if (*span).guarded {
            self.guarded.deallocate(ptr);
            pagemap::clear_span(span);
            Span::delete(span);
        } else {
            self.page_allocator.delete_span(span);
        }
    }

    /// Sized delete: when the caller-supplied size pins the class, skip the
    /// info-word read and validate against it; mismatches (sampled spans,
    /// wrong size) take the full path.
    ///
    /// # Safety
    /// Allocator must be initialized; `ptr` is null or owned by it.
    pub unsafe fn free_with_size(&self, ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }
        stat_inc!(FREE);
        let requested = if size == 0 { 1 } else { size };
        if let Some(class) = size_class::size_class(padded(requested)) {
            let page = PageId::containing(ptr as usize);
            let info = pagemap::get_page_info(page);
            if (info & 0xff) as u32 == class {
                let span = pagemap::get(page);
                if !span.is_null() && safety::on_free(span, ptr as usize) {
                    self.deallocate_small(class, ptr);
                }
                return;
            }
        }
        self.free_impl(ptr);
    }

    /// # Safety
    /// Allocator must be initialized.
    pub unsafe fn calloc(&self, nmemb: usize, size: usize) -> *mut u8 {
        let total = match nmemb.checked_mul(size) {
            Some(t) => t,
            None => {
                set_errno_nomem();
                return ptr::null_mut();
            }
        };
        let p = self.malloc(total);
        if !p.is_null() {
            // Slab objects are recycled; zero unconditionally.
            ptr::write_bytes(p, 0, total);
        }
        p
    }

    /// Grow ×1.25 / shrink ÷2 policy: serve in place while the chunk fits
    /// (growth) or is no more than twice the need (shrink); otherwise move.
    ///
    /// # Safety
    /// Allocator must be initialized; `ptr` is null or owned by it.
    pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.malloc(new_size);
        }
        if new_size == 0 {
            // Minimum allocation rather than NULL: callers routinely treat
            // NULL as failure and keep using the old pointer.
            self.free(ptr);
            return self.malloc(0);
        }

        let old_usable = self.usable_size(ptr);
        if new_size <= old_usable {
            // Shrink in place unless the chunk is now over twice the need.
            if new_size >= old_usable / 2 {
                return ptr;
            }
        }

        let new_ptr = self.malloc(new_size);
        if new_ptr.is_null() {
            return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size));
        self.free(ptr);
        new_ptr
    }

    /// User-usable bytes of a live allocation; protection's pad byte is
    /// invisible to the caller.
    ///
    /// # Safety
    /// Allocator must be initialized; `ptr` is null or owned by it.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        let page = PageId::containing(ptr as usize);
        let info = pagemap::get_page_info(page);
        let class = (info & 0xff) as u32;
        if class != 0 {
            return size_class::class_to_size(class) - PROTECTION_PAD;
        }
        let span = pagemap::get(page);
        if span.is_null() {
            return 0;
        }
        let sa = (*span).sampled_allocation();
        if !sa.is_null() {
            return (*sa).allocated_size;
        }
        if (*span).obj_size_bytes() == 0 {
            return 0;
        }
        (*span).bytes_in_span()
    }

    /// Usable size a hypothetical `malloc(size)` would report (nallocx).
    pub fn nallocx(&self, size: usize) -> usize {
        let requested = if size == 0 { 1 } else { size };
        match size_class::size_class(padded(requested)) {
            Some(class) => size_class::class_to_size(class) - PROTECTION_PAD,
            None => Length::from_bytes_ceil(requested).in_bytes(),
        }
    }

    /// malloc_trim / ReleaseMemoryToSystem.
    ///
    /// # Safety
    /// Allocator must be initialized.
    pub unsafe fn release_memory(&self, max_bytes: usize) -> usize {
        self.page_allocator.release_memory(max_bytes)
    }

    /// Reset every lock in a single-threaded post-fork child.
    ///
    /// # Safety
    /// No other thread may exist.
    pub unsafe fn reset_locks_after_fork(&self) {
        self.page_allocator.reset_locks_after_fork();
    }
}

fn set_errno_nomem() {
    #[cfg(target_os = "linux")]
    unsafe {
        *libc::__errno_location() = libc::ENOMEM;
    }
    #[cfg(target_os = "macos")]
    unsafe {
        *libc::__error() = libc::ENOMEM;
    }
}
