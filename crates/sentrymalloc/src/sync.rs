//! Locks for the long-held sections: the page-heap lock, the per-class
//! central freelist locks and the release lock. std::sync::Mutex may
//! allocate on contention and so cannot sit inside malloc; a pure spinlock
//! would burn a core whenever the holder is in the kernel servicing an
//! mmap. The compromise is a futex lock with a short adaptive spin: a
//! carve or batch refill is a few dozen instructions, so a contender
//! usually gets the lock before its spin budget runs out and only parks in
//! the kernel when the holder is genuinely slow.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

const FREE: u32 = 0;
/// Bit 0: some thread owns the lock.
const HELD: u32 = 1;
/// HELD plus bit 1: at least one contender parked (or about to park);
/// unlock must issue a wake.
const CONTESTED: u32 = 3;

/// Acquisition attempts before parking.
const SPIN_LIMIT: u32 = 64;

pub struct FutexLock {
    state: AtomicU32,
}

unsafe impl Send for FutexLock {}
unsafe impl Sync for FutexLock {}

impl FutexLock {
    pub const fn new() -> Self {
        FutexLock {
            state: AtomicU32::new(FREE),
        }
    }

    #[inline]
    pub fn lock(&self) {
        if self.try_lock() {
            return;
        }
        self.lock_contended();
    }

    /// One uncontended acquisition attempt.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[cold]
    fn lock_contended(&self) {
        // Adaptive phase: the holder is likely mid-carve and gone shortly.
        let mut spins = 0;
        while spins < SPIN_LIMIT {
            if self.state.load(Ordering::Relaxed) == FREE && self.try_lock() {
                return;
            }
            core::hint::spin_loop();
            spins += 1;
        }
        // Parking phase: advertise a waiter and sleep. The swap leaves
        // CONTESTED behind in every case, so once any thread has parked the
        // eventual unlock wakes somebody; swap returning FREE means the
        // lock was ours in the same step.
        while self.state.swap(CONTESTED, Ordering::Acquire) != FREE {
            futex_wait(&self.state, CONTESTED);
        }
    }

    #[inline]
    pub fn unlock(&self) {
        // A plain HELD means nobody ever parked; skip the syscall.
        if self.state.swap(FREE, Ordering::Release) == CONTESTED {
            futex_wake_one(&self.state);
        }
    }

    /// Unconditionally reset to unlocked, without a wake.
    ///
    /// # Safety
    /// Single-threaded post-fork child only: the previous holder no longer
    /// exists and neither does any parked waiter.
    pub unsafe fn force_unlock(&self) {
        self.state.store(FREE, Ordering::Release);
    }
}

#[cfg(target_os = "linux")]
fn futex_wait(state: &AtomicU32, expected: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            state as *const AtomicU32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            core::ptr::null::<libc::timespec>(),
        );
    }
}

#[cfg(target_os = "linux")]
fn futex_wake_one(state: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            state as *const AtomicU32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            1u32,
        );
    }
}

// Without futexes the parking phase degenerates to yielding spins; the
// adaptive phase already absorbs the common case.
#[cfg(not(target_os = "linux"))]
fn futex_wait(_state: &AtomicU32, _expected: u32) {
    std::thread::yield_now();
}

#[cfg(not(target_os = "linux"))]
fn futex_wake_one(_state: &AtomicU32) {}

/// Data guarded by a [`FutexLock`], scoped through a guard like
/// std::sync::Mutex but allocation-free and poison-free (a panic inside
/// malloc aborts anyway).
pub struct Mutex<T> {
    lock: FutexLock,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: FutexLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.lock.lock();
        MutexGuard { owner: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.lock.try_lock() {
            Some(MutexGuard { owner: self })
        } else {
            None
        }
    }

    /// # Safety
    /// Single-threaded post-fork child only.
    pub unsafe fn force_unlock(&self) {
        self.lock.force_unlock();
    }
}

pub struct MutexGuard<'a, T> {
    owner: &'a Mutex<T>,
}

impl<T> core::ops::Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.owner.value.get() }
    }
}

impl<T> core::ops::DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.owner.value.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.lock.unlock();
    }
}
