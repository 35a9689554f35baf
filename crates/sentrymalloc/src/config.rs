use crate::util::{DEFAULT_GUARDED_SAMPLE_RATE, DEFAULT_SAMPLE_RATE, DEFAULT_THREAD_CACHE_BYTES};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Cached config values (read once at init, never allocate).
static SAMPLE_RATE: AtomicUsize = AtomicUsize::new(DEFAULT_SAMPLE_RATE);
static GUARDED_SAMPLE_RATE: AtomicUsize = AtomicUsize::new(DEFAULT_GUARDED_SAMPLE_RATE);
static MEMORY_LIMIT: AtomicUsize = AtomicUsize::new(0);
static THREAD_CACHE_BYTES: AtomicUsize = AtomicUsize::new(DEFAULT_THREAD_CACHE_BYTES);
static NUMA_ENABLED: AtomicBool = AtomicBool::new(false);

/// Read configuration from environment variables. Unknown variables are
/// ignored by construction (only known keys are queried).
///
/// # Safety
/// Must be called from single-threaded context (init); libc::getenv is not
/// thread-safe against a concurrently mutating environment.
pub unsafe fn read_config() {
    if let Some(val) = getenv_usize(b"SENTRYMALLOC_SAMPLE_RATE\0") {
        SAMPLE_RATE.store(val, Ordering::Relaxed);
    }
    if let Some(val) = getenv_usize(b"SENTRYMALLOC_GUARDED_SAMPLE_RATE\0") {
        GUARDED_SAMPLE_RATE.store(val, Ordering::Relaxed);
    }
    if let Some(val) = getenv_usize(b"SENTRYMALLOC_MEMORY_LIMIT\0") {
        MEMORY_LIMIT.store(val, Ordering::Relaxed);
    }
    if let Some(val) = getenv_usize(b"SENTRYMALLOC_THREAD_CACHE_BYTES\0") {
        if val > 0 {
            THREAD_CACHE_BYTES.store(val, Ordering::Relaxed);
        }
    }
    let numa = b"SENTRYMALLOC_NUMA\0".as_ptr() as *const libc::c_char;
    if !libc::getenv(numa).is_null() {
        NUMA_ENABLED.store(true, Ordering::Relaxed);
    }
}

/// Check if the allocator is disabled via env var (kill-switch).
///
/// # Safety
/// Must be called during init.
pub unsafe fn is_disabled() -> bool {
    let key = b"SENTRYMALLOC_DISABLE\0".as_ptr() as *const libc::c_char;
    !libc::getenv(key).is_null()
}

/// Mean bytes between samples; 0 disables sampling.
pub fn sample_rate() -> usize {
    SAMPLE_RATE.load(Ordering::Relaxed)
}

/// Adjust the sampling period at runtime (profiling front-ends and tests).
/// Threads pick the new rate up at their next sampler reset.
pub fn set_sample_rate(bytes: usize) {
    SAMPLE_RATE.store(bytes, Ordering::Relaxed);
}

/// Every Nth sample goes behind guard pages; 0 disables guarding.
pub fn guarded_sample_rate() -> usize {
    GUARDED_SAMPLE_RATE.load(Ordering::Relaxed)
}

/// Soft cap on mapped bytes; 0 = unlimited.
pub fn memory_limit() -> usize {
    MEMORY_LIMIT.load(Ordering::Relaxed)
}

pub fn thread_cache_bytes() -> usize {
    THREAD_CACHE_BYTES.load(Ordering::Relaxed)
}

#[allow(dead_code)]
pub fn numa_enabled() -> bool {
    NUMA_ENABLED.load(Ordering::Relaxed)
}

/// Parse an environment variable as a usize.
///
/// # Safety
/// Calls libc::getenv.
unsafe fn getenv_usize(key: &[u8]) -> Option<usize> {
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return None;
    }

    // Parse manually (no std allocation)
    let mut result: usize = 0;
    let mut ptr = val as *const u8;
    loop {
        let byte = *ptr;
        if byte == 0 {
            break;
        }
        if !byte.is_ascii_digit() {
            return None;
        }
        result = result.checked_mul(10)?.checked_add((byte - b'0') as usize)?;
        ptr = ptr.add(1);
    }
    Some(result)
}
