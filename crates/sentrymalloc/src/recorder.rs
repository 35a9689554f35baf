//! Sampled-allocation registry and profile construction.
//!
//! Records are arena-allocated and linked into a lock-free intrusive list:
//! insertion is a CAS push, removal is a tombstone. Iteration takes the
//! recorder's lock, reports live records and physically reclaims dead
//! non-head nodes (the head may be the target of a concurrent push and is
//! never unlinked in place).

use crate::arena::MetaArena;
use crate::util::MAX_STACK_DEPTH;
use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use spin::Mutex;

static SAMPLE_ARENA: MetaArena = MetaArena::new(size_of::<SampledAllocation>());

#[repr(C)]
pub struct SampledAllocation {
    pub stack: [usize; MAX_STACK_DEPTH],
    pub depth: usize,
    pub requested_size: usize,
    pub allocated_size: usize,
    pub alignment: usize,
    pub weight: usize,
    pub span_start: usize,
    pub allocation_time_ns: u64,
    /// Small sampled allocations hand the original cache object back and
    /// dedicate a fresh span to the sample; `proxy` remembers that object.
    pub proxy: *mut u8,
    next: AtomicPtr<SampledAllocation>,
    dead: AtomicBool,
}

/// Plain-data view of one sample, as handed to profile consumers.
#[derive(Clone, Copy)]
pub struct ProfileSample {
    pub stack: [usize; MAX_STACK_DEPTH],
    pub depth: usize,
    pub requested_size: usize,
    pub allocated_size: usize,
    pub alignment: usize,
    pub weight: usize,
    pub span_start: usize,
    pub allocation_time_ns: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProfileType {
    Heap,
    Fragmentation,
    PeakHeap,
    Allocations,
}

/// An iterable snapshot; detached from the registry at construction.
pub struct Profile {
    pub kind: ProfileType,
    samples: Vec<ProfileSample>,
}

impl Profile {
    pub fn iterate<F: FnMut(&ProfileSample)>(&self, mut f: F) {
        for s in &self.samples {
            f(s);
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

pub struct SampleRecorder {
    head: AtomicPtr<SampledAllocation>,
    iter_lock: Mutex<()>,
    live_sampled_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    peak_snapshot: Mutex<Vec<ProfileSample>>,
}

impl SampleRecorder {
    pub const fn new() -> Self {
        SampleRecorder {
            head: AtomicPtr::new(ptr::null_mut()),
            iter_lock: Mutex::new(()),
            live_sampled_bytes: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
            peak_snapshot: Mutex::new(Vec::new()),
        }
    }

    /// Register a sample; returns null on metadata OOM (the caller then
    /// degrades to an unsampled allocation — sampling is never fatal).
    pub fn register(&self, template: &SampleTemplate) -> *mut SampledAllocation {
        let node = SAMPLE_ARENA.alloc() as *mut SampledAllocation;
        if node.is_null() {
            return node;
        }
        unsafe {
            node.write(SampledAllocation {
                stack: template.stack,
                depth: template.depth,
                requested_size: template.requested_size,
                allocated_size: template.allocated_size,
                alignment: template.alignment,
                weight: template.weight,
                span_start: template.span_start,
                allocation_time_ns: template.allocation_time_ns,
                proxy: template.proxy,
                next: AtomicPtr::new(ptr::null_mut()),
                dead: AtomicBool::new(false),
            });
            loop {
                let head = self.head.load(Ordering::Acquire);
                (*node).next.store(head, Ordering::Relaxed);
                if self
                    .head
                    .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        }
        self.live_sampled_bytes
            .fetch_add(template.allocated_size, Ordering::Relaxed);
        node
    }

    /// Tombstone a record when its allocation is freed. Reclamation happens
    /// on the next iteration.
    ///
    /// # Safety
    /// `sa` must have come from `register` and not been unregistered yet.
    pub unsafe fn unregister(&self, sa: *mut SampledAllocation) {
        self.live_sampled_bytes
            .fetch_sub((*sa).allocated_size, Ordering::Relaxed);
        (*sa).dead.store(true, Ordering::Release);
    }

    /// Visit every live record. Dead non-head nodes are unlinked and their
    /// storage recycled while the lock is held.
    pub fn iterate<F: FnMut(&SampledAllocation)>(&self, mut f: F) {
        let _guard = self.iter_lock.lock();
        unsafe {
            let head = self.head.load(Ordering::Acquire);
            let mut prev: *mut SampledAllocation = ptr::null_mut();
            let mut cur = head;
            while !cur.is_null() {
                let next = (*cur).next.load(Ordering::Acquire);
                if (*cur).dead.load(Ordering::Acquire) {
                    if cur != head {
                        // Pushers only touch the head; interior dead nodes
                        // are unreachable once unlinked.
                        (*prev).next.store(next, Ordering::Release);
                        SAMPLE_ARENA.dealloc(cur as *mut u8);
                        cur = next;
                        continue;
                    }
                } else {
                    f(&*cur);
                }
                prev = cur;
                cur = next;
            }
        }
    }

    /// Save a peak snapshot when live sampled bytes exceed the previous
    /// peak by 10%.
    pub fn maybe_save_peak(&self) {
        let live = self.live_sampled_bytes.load(Ordering::Relaxed);
        let peak = self.peak_bytes.load(Ordering::Relaxed);
        if live <= peak + peak / 10 {
            return;
        }
        self.peak_bytes.store(live, Ordering::Relaxed);
        let mut snapshot = Vec::new();
        self.iterate(|sa| snapshot.push(sample_of(sa)));
        *self.peak_snapshot.lock() = snapshot;
    }

    /// Build a profile of the requested kind.
    pub fn snapshot_current(&self, kind: ProfileType) -> Profile {
        let mut samples = Vec::new();
        match kind {
            ProfileType::Heap | ProfileType::Allocations => {
                self.iterate(|sa| samples.push(sample_of(sa)));
            }
            ProfileType::Fragmentation => {
                self.iterate(|sa| {
                    if sa.allocated_size > sa.requested_size {
                        samples.push(sample_of(sa));
                    }
                });
            }
            ProfileType::PeakHeap => {
                samples = self.peak_snapshot.lock().clone();
            }
        }
        Profile { kind, samples }
    }
}

fn sample_of(sa: &SampledAllocation) -> ProfileSample {
    ProfileSample {
        stack: sa.stack,
        depth: sa.depth,
        requested_size: sa.requested_size,
        allocated_size: sa.allocated_size,
        alignment: sa.alignment,
        weight: sa.weight,
        span_start: sa.span_start,
        allocation_time_ns: sa.allocation_time_ns,
    }
}

/// Construction-time fields of a sample, gathered outside any lock.
pub struct SampleTemplate {
    pub stack: [usize; MAX_STACK_DEPTH],
    pub depth: usize,
    pub requested_size: usize,
    pub allocated_size: usize,
    pub alignment: usize,
    pub weight: usize,
    pub span_start: usize,
    pub allocation_time_ns: u64,
    pub proxy: *mut u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(req: usize, alloc: usize) -> SampleTemplate {
        SampleTemplate {
            stack: [0; MAX_STACK_DEPTH],
            depth: 0,
            requested_size: req,
            allocated_size: alloc,
            alignment: 16,
            weight: 2 * 1024 * 1024,
            span_start: 0x1000_0000,
            allocation_time_ns: 1,
            proxy: ptr::null_mut(),
        }
    }

    #[test]
    fn register_iterate_unregister() {
        let rec = SampleRecorder::new();
        let a = rec.register(&template(75, 80));
        let b = rec.register(&template(100, 112));
        assert!(!a.is_null() && !b.is_null());

        let mut live = 0;
        rec.iterate(|_| live += 1);
        assert_eq!(live, 2);

        unsafe { rec.unregister(a) };
        live = 0;
        rec.iterate(|_| live += 1);
        assert_eq!(live, 1);

        // Dead interior node was reclaimed; another pass still sees one.
        live = 0;
        rec.iterate(|_| live += 1);
        assert_eq!(live, 1);
    }

    #[test]
    fn fragmentation_profile_filters_tight_fits() {
        let rec = SampleRecorder::new();
        rec.register(&template(80, 80));
        rec.register(&template(75, 80));
        let frag = rec.snapshot_current(ProfileType::Fragmentation);
        assert_eq!(frag.len(), 1);
        frag.iterate(|s| {
            assert_eq!(s.requested_size, 75);
            assert_eq!(s.allocated_size, 80);
        });
        let heap = rec.snapshot_current(ProfileType::Heap);
        assert_eq!(heap.len(), 2);
    }

    #[test]
    fn peak_snapshot_tracks_high_water() {
        let rec = SampleRecorder::new();
        let a = rec.register(&template(1000, 1024));
        rec.maybe_save_peak();
        unsafe { rec.unregister(a) };
        rec.register(&template(10, 16));
        rec.maybe_save_peak();
        let peak = rec.snapshot_current(ProfileType::PeakHeap);
        assert_eq!(peak.len(), 1);
        peak.iterate(|s| assert_eq!(s.allocated_size, 1024));
    }
}
