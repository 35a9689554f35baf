//! Per-CPU front-end cache (feature `cpu-cache`). One slab of class stacks
//! per CPU, indexed by sched_getcpu. Restartable sequences are not
//! expressible in stable Rust; the single-writer-per-CPU presumption is
//! enforced with a try-lock instead — the common case is uncontended, and a
//! preempted-and-migrated thread fails the try-lock and falls through to
//! the transfer cache rather than blocking.

use crate::platform;
use crate::sync::FutexLock;
use crate::thread_cache::Cache;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

#[repr(C, align(128))]
struct CpuSlab {
    lock: FutexLock,
    cache: UnsafeCell<Cache>,
}

static SLABS: AtomicPtr<CpuSlab> = AtomicPtr::new(ptr::null_mut());
static NUM_CPUS: AtomicUsize = AtomicUsize::new(0);

/// Map and initialize one slab per online CPU.
///
/// # Safety
/// Single-threaded init, before any cached operation.
pub unsafe fn init() -> bool {
    let cpus = platform::online_cpus();
    let mem = platform::map_pages(cpus * core::mem::size_of::<CpuSlab>()) as *mut CpuSlab;
    if mem.is_null() {
        return false;
    }
    for i in 0..cpus {
        mem.add(i).write(CpuSlab {
            lock: FutexLock::new(),
            cache: UnsafeCell::new(Cache::new()),
        });
        (*(*mem.add(i)).cache.get()).set_budget(crate::config::thread_cache_bytes());
    }
    NUM_CPUS.store(cpus, Ordering::Release);
    SLABS.store(mem, Ordering::Release);
    true
}

/// Run `f` against the current CPU's cache. None when the slab is busy
/// (another thread on the same CPU mid-operation) or before init; callers
/// fall back to the transfer cache.
#[inline]
pub fn with_cache<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut Cache) -> R,
{
    let slabs = SLABS.load(Ordering::Acquire);
    if slabs.is_null() {
        return None;
    }
    let cpus = NUM_CPUS.load(Ordering::Relaxed);
    let slab = unsafe { &*slabs.add(platform::current_cpu() % cpus) };
    if !slab.lock.try_lock() {
        return None;
    }
    let result = f(unsafe { &mut *slab.cache.get() });
    slab.lock.unlock();
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class;

    #[test]
    fn per_cpu_cache_round_trip() {
        unsafe {
            assert!(init());
        }
        let class = size_class::size_class(64).unwrap();
        let mut obj = [0u8; 64];
        let p = obj.as_mut_ptr();
        let pushed = with_cache(|c| unsafe {
            c.push(class, p);
            c.pop(class)
        });
        assert_eq!(pushed, Some(Some(p)));
    }
}
