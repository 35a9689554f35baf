//! Transfer cache: a bounded stack of whole object batches sitting in front
//! of each central freelist. Threads that just filled or emptied a local
//! cache exchange complete batches here under a try-lock; only on a miss do
//! they contend the central list's mutex. Nothing ever blocks on this path.

use spin::Mutex;

/// Largest per-class batch (see size_class::class_batch).
pub const MAX_BATCH: usize = 32;

/// Batches retained per class.
const DEPTH: usize = 16;

struct Inner {
    count: usize,
    sizes: [u8; DEPTH],
    slots: [[*mut u8; MAX_BATCH]; DEPTH],
}

pub struct TransferCache {
    inner: Mutex<Inner>,
}

unsafe impl Send for TransferCache {}
unsafe impl Sync for TransferCache {}

impl TransferCache {
    pub const fn new() -> Self {
        TransferCache {
            inner: Mutex::new(Inner {
                count: 0,
                sizes: [0; DEPTH],
                slots: [[core::ptr::null_mut(); MAX_BATCH]; DEPTH],
            }),
        }
    }

    /// Park a full batch. Returns false when the stack is full or contended;
    /// the caller then goes to the central list.
    pub fn try_insert(&self, batch: &[*mut u8]) -> bool {
        debug_assert!(batch.len() <= MAX_BATCH);
        let mut inner = match self.inner.try_lock() {
            Some(g) => g,
            None => return false,
        };
        if inner.count == DEPTH {
            return false;
        }
        let i = inner.count;
        inner.sizes[i] = batch.len() as u8;
        inner.slots[i][..batch.len()].copy_from_slice(batch);
        inner.count += 1;
        true
    }

    /// Take one parked batch into `buf`. Returns the object count, 0 on an
    /// empty or contended stack.
    pub fn try_remove(&self, buf: &mut [*mut u8; MAX_BATCH]) -> usize {
        let mut inner = match self.inner.try_lock() {
            Some(g) => g,
            None => return 0,
        };
        if inner.count == 0 {
            return 0;
        }
        inner.count -= 1;
        let i = inner.count;
        let n = inner.sizes[i] as usize;
        buf[..n].copy_from_slice(&inner.slots[i][..n]);
        n
    }
}
