//! Process-wide statics and lazy initialization. A single `Heap` composite
//! lives here; init is idempotent under races via the state machine
//! (double-checked through the atomic), runs from an `.init_array`
//! constructor before main, and is re-entered on demand from the API layer
//! for early callers.

use crate::allocator::Heap;
use crate::{config, passthrough};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;
const DISABLED: u8 = 3;

pub static INIT_STATE: AtomicU8 = AtomicU8::new(UNINIT);

pub const STATE_READY: u8 = READY;
pub const STATE_DISABLED: u8 = DISABLED;

struct HeapHolder(UnsafeCell<Heap>);
unsafe impl Sync for HeapHolder {}

static HEAP: HeapHolder = HeapHolder(UnsafeCell::new(Heap::new()));

/// Fork generation, bumped in the child so thread-local state can detect
/// staleness.
static FORK_GENERATION: AtomicU64 = AtomicU64::new(0);

/// Library constructor -- called before main().
#[used]
#[cfg_attr(target_os = "linux", link_section = ".init_array")]
#[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_init_func")]
static CTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn init() {
        sentrymalloc_init();
    }
    init
};

/// Thread driving initialization, so a re-entrant allocation from inside
/// init (dlsym, getenv) falls through to the passthrough instead of
/// self-deadlocking on the spin-wait.
static INIT_TID: AtomicU64 = AtomicU64::new(0);

#[inline]
fn self_tid() -> u64 {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::syscall(libc::SYS_gettid) as u64
    }
    #[cfg(not(target_os = "linux"))]
    unsafe {
        libc::pthread_self() as u64
    }
}

/// # Safety
/// Safe to call from any thread; only one performs the work.
pub unsafe fn sentrymalloc_init() {
    match INIT_STATE.compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            INIT_TID.store(self_tid(), Ordering::Release);
        }
        Err(INITIALIZING) => {
            if INIT_TID.load(Ordering::Acquire) == self_tid() {
                return;
            }
            while INIT_STATE.load(Ordering::Acquire) == INITIALIZING {
                core::hint::spin_loop();
            }
            return;
        }
        Err(_) => return,
    }

    // Real libc entry points first: the passthrough needs them, and so does
    // any allocation dlsym itself performs.
    passthrough::resolve_real_functions();

    config::read_config();

    if config::is_disabled() {
        INIT_STATE.store(DISABLED, Ordering::Release);
        return;
    }

    if !crate::pagemap::init() {
        INIT_STATE.store(DISABLED, Ordering::Release);
        return;
    }

    #[cfg(feature = "cpu-cache")]
    if !crate::cpu_cache::init() {
        INIT_STATE.store(DISABLED, Ordering::Release);
        return;
    }

    libc::pthread_atfork(None, None, Some(atfork_child));

    INIT_STATE.store(READY, Ordering::Release);
}

/// After fork() the child is single-threaded but inherits locks that may be
/// held by threads that no longer exist; reset them and bump the
/// generation.
unsafe extern "C" fn atfork_child() {
    if INIT_STATE.load(Ordering::Acquire) == READY {
        heap().reset_locks_after_fork();
    }
    FORK_GENERATION.fetch_add(1, Ordering::Release);
}

#[allow(dead_code)]
#[inline(always)]
pub fn fork_generation() -> u64 {
    FORK_GENERATION.load(Ordering::Relaxed)
}

#[cold]
#[inline(never)]
pub unsafe fn ensure_initialized() {
    sentrymalloc_init();
}

/// # Safety
/// Must not be called before initialization has at least started.
#[inline(always)]
pub unsafe fn heap() -> &'static Heap {
    &*HEAP.0.get()
}

#[inline(always)]
pub fn state() -> u8 {
    INIT_STATE.load(Ordering::Acquire)
}
