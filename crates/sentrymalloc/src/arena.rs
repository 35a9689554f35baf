//! Metadata arenas. Span descriptors, escape nodes, escape-list tables and
//! sample records all come from here, never from the user heap: a freed
//! object must leave no metadata in user-visible memory, and the safety
//! layer must be able to allocate while the page heap is mid-operation.

use crate::platform;
use crate::util::align_up;
use core::ptr;
use spin::Mutex;

/// Bytes requested from the OS per refill.
const CHUNK_BYTES: usize = 64 * 1024;

struct FreeNode {
    next: *mut FreeNode,
}

struct ArenaInner {
    free: *mut FreeNode,
    /// Bump region for when the freelist is empty.
    chunk: *mut u8,
    remaining: usize,
}

/// Fixed-object-size arena backed by anonymous mappings.
pub struct MetaArena {
    obj_size: usize,
    inner: Mutex<ArenaInner>,
}

unsafe impl Send for MetaArena {}
unsafe impl Sync for MetaArena {}

impl MetaArena {
    /// `obj_size` must be at least pointer-sized (the freelist is intrusive)
    /// and at most CHUNK_BYTES.
    pub const fn new(obj_size: usize) -> Self {
        MetaArena {
            obj_size,
            inner: Mutex::new(ArenaInner {
                free: ptr::null_mut(),
                chunk: ptr::null_mut(),
                remaining: 0,
            }),
        }
    }

    /// Allocate one object. Returns null on OOM. Memory is not zeroed when
    /// recycled from the freelist.
    pub fn alloc(&self) -> *mut u8 {
        let mut inner = self.inner.lock();
        unsafe {
            if !inner.free.is_null() {
                let node = inner.free;
                inner.free = (*node).next;
                return node as *mut u8;
            }
            let size = align_up(self.obj_size, core::mem::size_of::<usize>());
            if inner.remaining < size {
                let chunk = platform::map_pages(CHUNK_BYTES);
                if chunk.is_null() {
                    return ptr::null_mut();
                }
                inner.chunk = chunk;
                inner.remaining = CHUNK_BYTES;
            }
            let p = inner.chunk;
            inner.chunk = inner.chunk.add(size);
            inner.remaining -= size;
            p
        }
    }

    /// Return one object to the freelist.
    ///
    /// # Safety
    /// `p` must have come from `alloc` on this arena and must not be reused
    /// by the caller afterwards.
    pub unsafe fn dealloc(&self, p: *mut u8) {
        let mut inner = self.inner.lock();
        let node = p as *mut FreeNode;
        (*node).next = inner.free;
        inner.free = node;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_recycles_freed_objects() {
        let arena = MetaArena::new(32);
        let a = arena.alloc();
        let b = arena.alloc();
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
        unsafe {
            arena.dealloc(a);
            let c = arena.alloc();
            assert_eq!(c, a);
        }
    }

    #[test]
    fn survives_chunk_refill() {
        let arena = MetaArena::new(1024);
        let mut ptrs = Vec::new();
        for _ in 0..200 {
            let p = arena.alloc();
            assert!(!p.is_null());
            ptrs.push(p);
        }
        ptrs.sort_unstable();
        ptrs.dedup();
        assert_eq!(ptrs.len(), 200);
    }
}
