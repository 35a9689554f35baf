//! Passthrough to the real system allocator, used when the kill-switch env
//! var disables sentrymalloc or init fails. Because this library exports
//! the `malloc` symbols itself, the real functions must be found with
//! dlsym(RTLD_NEXT); and because dlsym may itself call malloc, a small
//! static bump buffer serves the window before resolution completes.

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

const RTLD_NEXT: *mut c_void = -1isize as *mut c_void;

static REAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_FREE: AtomicUsize = AtomicUsize::new(0);
static REAL_REALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_CALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_MEMALIGN: AtomicUsize = AtomicUsize::new(0);
static REAL_USABLE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Resolve the real libc entry points.
///
/// # Safety
/// Call once from the single-threaded init path.
pub unsafe fn resolve_real_functions() {
    resolve(&REAL_MALLOC, c"malloc");
    resolve(&REAL_FREE, c"free");
    resolve(&REAL_REALLOC, c"realloc");
    resolve(&REAL_CALLOC, c"calloc");
    resolve(&REAL_MEMALIGN, c"posix_memalign");
    resolve(&REAL_USABLE_SIZE, c"malloc_usable_size");
}

unsafe fn resolve(slot: &AtomicUsize, name: &core::ffi::CStr) -> usize {
    let cached = slot.load(Ordering::Acquire);
    if cached != 0 {
        return cached;
    }
    let sym = libc::dlsym(RTLD_NEXT, name.as_ptr());
    if sym.is_null() {
        return 0;
    }
    // Concurrent resolvers converge on one value.
    let _ = slot.compare_exchange(0, sym as usize, Ordering::Release, Ordering::Acquire);
    slot.load(Ordering::Acquire)
}

// Bootstrap arena for allocations made while dlsym is still resolving.
const BOOTSTRAP_BYTES: usize = 65536;
static BOOTSTRAP_USED: AtomicUsize = AtomicUsize::new(0);
static mut BOOTSTRAP: [u8; BOOTSTRAP_BYTES] = [0; BOOTSTRAP_BYTES];

unsafe fn bootstrap_alloc(size: usize, align: usize) -> *mut u8 {
    let need = (size + align - 1 + 15) & !15;
    loop {
        let used = BOOTSTRAP_USED.load(Ordering::Relaxed);
        if used + need > BOOTSTRAP_BYTES {
            return ptr::null_mut();
        }
        if BOOTSTRAP_USED
            .compare_exchange_weak(used, used + need, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            let base = ptr::addr_of_mut!(BOOTSTRAP).cast::<u8>().add(used);
            return ((base as usize + align - 1) & !(align - 1)) as *mut u8;
        }
    }
}

unsafe fn is_bootstrap(ptr: *mut u8) -> bool {
    let base = ptr::addr_of!(BOOTSTRAP) as usize;
    (base..base + BOOTSTRAP_BYTES).contains(&(ptr as usize))
}

/// # Safety
/// Standard malloc contract.
pub unsafe fn malloc(size: usize) -> *mut u8 {
    let f = resolve(&REAL_MALLOC, c"malloc");
    if f != 0 {
        let func: unsafe extern "C" fn(usize) -> *mut c_void = core::mem::transmute(f);
        func(size) as *mut u8
    } else {
        bootstrap_alloc(size, 16)
    }
}

/// # Safety
/// `ptr` is null or came from this passthrough.
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() || is_bootstrap(ptr) {
        return;
    }
    let f = resolve(&REAL_FREE, c"free");
    if f != 0 {
        let func: unsafe extern "C" fn(*mut c_void) = core::mem::transmute(f);
        func(ptr as *mut c_void);
    }
}

/// # Safety
/// `ptr` is null or came from this passthrough.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
        return malloc(size);
    }
    if is_bootstrap(ptr) {
        let new = malloc(size);
        if !new.is_null() {
            let base = ptr::addr_of!(BOOTSTRAP) as usize;
            let available = BOOTSTRAP_BYTES - (ptr as usize - base);
            ptr::copy_nonoverlapping(ptr, new, size.min(available));
        }
        return new;
    }
    let f = resolve(&REAL_REALLOC, c"realloc");
    if f != 0 {
        let func: unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void =
            core::mem::transmute(f);
        func(ptr as *mut c_void, size) as *mut u8
    } else {
        ptr::null_mut()
    }
}

/// # Safety
/// Standard calloc contract.
pub unsafe fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    let f = resolve(&REAL_CALLOC, c"calloc");
    if f != 0 {
        let func: unsafe extern "C" fn(usize, usize) -> *mut c_void = core::mem::transmute(f);
        return func(nmemb, size) as *mut u8;
    }
    let total = match nmemb.checked_mul(size) {
        Some(t) => t,
        None => return ptr::null_mut(),
    };
    let p = bootstrap_alloc(total, 16);
    if !p.is_null() {
        ptr::write_bytes(p, 0, total);
    }
    p
}

/// # Safety
/// `alignment` is a power of two.
pub unsafe fn memalign(alignment: usize, size: usize) -> *mut u8 {
    let f = resolve(&REAL_MEMALIGN, c"posix_memalign");
    if f != 0 {
        let func: unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> libc::c_int =
            core::mem::transmute(f);
        let mut out: *mut c_void = ptr::null_mut();
        if func(&mut out, alignment, size) == 0 {
            return out as *mut u8;
        }
        return ptr::null_mut();
    }
    bootstrap_alloc(size, alignment.max(16))
}

/// # Safety
/// `ptr` is null or came from this passthrough.
pub unsafe fn malloc_usable_size(ptr: *mut u8) -> usize {
    if ptr.is_null() || is_bootstrap(ptr) {
        return 0;
    }
    let f = resolve(&REAL_USABLE_SIZE, c"malloc_usable_size");
    if f != 0 {
        let func: unsafe extern "C" fn(*mut c_void) -> usize = core::mem::transmute(f);
        func(ptr as *mut c_void)
    } else {
        0
    }
}
