//! Temporal-safety tests: escape tracking, free-time poisoning, and the
//! commit-buffer discipline. Holder cells live in heap memory (stack and
//! global holders are dropped by design); `flush_pending_escapes` stands in
//! for the ring filling up naturally.

#![cfg(feature = "protection")]

use sentrymalloc::allocator::Heap;
use sentrymalloc::safety::{escape, flush_pending_escapes, ACCESS_OK, ACCESS_OOB};
use sentrymalloc::util::POISON_PATTERN;

unsafe fn heap() -> &'static Heap {
    sentrymalloc::init::ensure_initialized();
    // Pointer-identity assertions below rely on the unsampled fast path.
    sentrymalloc::config::set_sample_rate(0);
    sentrymalloc::init::heap()
}

/// A heap-resident pointer cell, as the sanitizer sees application pointer
/// stores.
unsafe fn holder(h: &Heap) -> *mut usize {
    let cell = h.malloc(core::mem::size_of::<usize>() * 4) as *mut usize;
    assert!(!cell.is_null());
    *cell = 0;
    cell
}

// ---------------------------------------------------------------------------
// Freeing the target poisons a tracked cell that still aims into it
// ---------------------------------------------------------------------------

#[test]
fn free_poisons_dangling_cell() {
    unsafe {
        let h = heap();
        let cell = holder(h);
        let t = h.malloc(80) as usize;

        assert_eq!(escape(cell, t), ACCESS_OK);
        *cell = t;
        flush_pending_escapes();

        h.free(t as *mut u8);
        assert_eq!(
            *cell,
            t | POISON_PATTERN,
            "dangling cell must carry the poison pattern"
        );

        // Freeing through the poisoned cell is reported, not honored.
        h.free(*cell as *mut u8);

        h.free(cell as *mut u8);
    }
}

// ---------------------------------------------------------------------------
// Escape removal on overwrite: the superseded relationship must not poison
// ---------------------------------------------------------------------------

#[test]
fn overwrite_supersedes_previous_escape() {
    unsafe {
        let h = heap();
        let cell = holder(h);

        let t1 = h.malloc(80) as usize;
        assert_eq!(escape(cell, t1), ACCESS_OK);
        *cell = t1;
        flush_pending_escapes();

        // Zero-size targets are legal escape targets.
        let t2 = h.malloc(0) as usize;
        assert_eq!(escape(cell, t2), ACCESS_OK);
        *cell = t2;
        flush_pending_escapes();

        h.free(t1 as *mut u8);
        assert_eq!(*cell, t2, "freeing the old target must not touch the cell");
        h.free(*cell as *mut u8);
        h.free(cell as *mut u8);
    }
}

// ---------------------------------------------------------------------------
// Escape preservation under reallocation of unrelated memory
// ---------------------------------------------------------------------------

#[test]
fn unrelated_churn_preserves_relationship() {
    unsafe {
        let h = heap();
        let cell = holder(h);
        let a = h.malloc(80) as usize;
        assert_eq!(escape(cell, a), ACCESS_OK);
        *cell = a;
        flush_pending_escapes();

        for _ in 0..64 {
            let b = h.malloc(80);
            h.free(b);
        }

        assert_eq!(*cell, a, "unrelated churn must not poison a live cell");
        h.free(a as *mut u8);
        assert_eq!(*cell, a | POISON_PATTERN);
        h.free(cell as *mut u8);
    }
}

// ---------------------------------------------------------------------------
// Escape forgotten after the holder is reclaimed
// ---------------------------------------------------------------------------

#[test]
fn reclaimed_holder_is_not_poisoned() {
    unsafe {
        let h = heap();
        let mem = h.malloc(80) as *mut usize;
        let t = h.malloc(80) as usize;
        assert_eq!(escape(mem, t), ACCESS_OK);
        *mem = t;
        flush_pending_escapes();

        // The holder dies and its chunk is recycled as an opaque buffer.
        h.free(mem as *mut u8);
        let data = h.malloc(80);
        assert_eq!(data as usize, mem as usize, "LIFO reuse of the chunk");
        core::ptr::write_bytes(data, b'A', 80);

        // Freeing the old target must not corrupt the reused buffer: the
        // tracked cell no longer holds a pointer into it.
        h.free(t as *mut u8);
        assert_eq!(*(data as *mut u64), 0x4141_4141_4141_4141);
        h.free(data);
    }
}

// ---------------------------------------------------------------------------
// Stack holders are dropped; freeing never disturbs the stack cell
// ---------------------------------------------------------------------------

#[test]
fn stack_holder_is_dropped() {
    unsafe {
        let h = heap();
        let mut cell: usize = 0;
        let t = h.malloc(80) as usize;
        assert_eq!(escape(&mut cell, t), ACCESS_OOB, "stack holder must drop");
        cell = t;
        // The cell is reused for a non-pointer value.
        cell = 0x112233;
        h.free(t as *mut u8);
        assert_eq!(cell, 0x112233, "free must not disturb a stack cell");
    }
}

// ---------------------------------------------------------------------------
// Redundant same-slot escape is a cheap no-op
// ---------------------------------------------------------------------------

#[test]
fn same_slot_escape_short_circuits() {
    unsafe {
        let h = heap();
        let cell = holder(h);
        let t = h.malloc(80) as usize;
        assert_eq!(escape(cell, t), ACCESS_OK);
        *cell = t;
        // Interior pointer into the same slot: tracked relationship already
        // covers it.
        assert_eq!(escape(cell, t + 8), ACCESS_OK);
        flush_pending_escapes();
        h.free(t as *mut u8);
        assert_eq!(*cell, t | POISON_PATTERN);
        h.free(cell as *mut u8);
    }
}

// ---------------------------------------------------------------------------
// Commit buffer: stale entries are filtered at flush
// ---------------------------------------------------------------------------

#[test]
fn stale_buffered_escape_is_dropped() {
    unsafe {
        let h = heap();
        let cell = holder(h);
        let t = h.malloc(80) as usize;
        assert_eq!(escape(cell, t), ACCESS_OK);
        // The store never happens; the cell keeps an unrelated value.
        *cell = 0xabcd;
        flush_pending_escapes();
        h.free(t as *mut u8);
        assert_eq!(*cell, 0xabcd, "stale entry must not be committed");
        h.free(cell as *mut u8);
    }
}

// ---------------------------------------------------------------------------
// The ring drains itself when full
// ---------------------------------------------------------------------------

#[test]
fn full_ring_self_drains() {
    unsafe {
        let h = heap();
        let n = sentrymalloc::util::ESCAPE_COMMIT_CAPACITY + 8;
        let cells = h.malloc(n * 8) as *mut usize;
        let mut targets = Vec::new();
        for i in 0..n {
            let t = h.malloc(48) as usize;
            assert_eq!(escape(cells.add(i), t), ACCESS_OK);
            *cells.add(i) = t;
            targets.push(t);
        }
        // More escapes than the ring holds: the early ones must have been
        // committed by the overflow drain, without any explicit flush.
        h.free(targets[0] as *mut u8);
        assert_eq!(*cells, targets[0] | POISON_PATTERN);
        for &t in &targets[1..] {
            h.free(t as *mut u8);
        }
        h.free(cells as *mut u8);
    }
}

// ---------------------------------------------------------------------------
// Scaled-down escape fuzz (full scale lives in fuzz/)
// ---------------------------------------------------------------------------

#[test]
fn escape_fuzz_small() {
    const OBJECTS: usize = 256;
    const OPS: usize = 100_000;
    unsafe {
        let h = heap();
        let table = h.malloc(OBJECTS * 8) as *mut usize;
        assert!(!table.is_null());
        for i in 0..OBJECTS {
            let t = h.malloc(128) as usize;
            assert!(t != 0);
            escape(table.add(i), t);
            *table.add(i) = t;
        }

        let mut rng: u64 = 0x9e3779b97f4a7c15;
        let mut next = || {
            rng ^= rng << 13;
            rng ^= rng >> 7;
            rng ^= rng << 17;
            rng as usize
        };

        for _ in 0..OPS {
            let x = next() % OBJECTS;
            let y = next() % OBJECTS;
            let tx = *table.add(x);
            let ty = *table.add(y);
            if tx != 0 && tx & POISON_PATTERN != POISON_PATTERN && ty != 0 {
                // Store table[y] into the first word of object table[x].
                escape(tx as *mut usize, ty);
                *(tx as *mut usize) = ty;
            }
            if next() % 100 == 0 {
                let z = next() % OBJECTS;
                let t = *table.add(z);
                if t != 0 && t & POISON_PATTERN != POISON_PATTERN {
                    *table.add(z) = 0;
                    h.free(t as *mut u8);
                    let fresh = h.malloc(128) as usize;
                    assert!(fresh != 0);
                    escape(table.add(z), fresh);
                    *table.add(z) = fresh;
                }
            }
        }
        flush_pending_escapes();

        for i in 0..OBJECTS {
            let t = *table.add(i);
            if t != 0 && t & POISON_PATTERN != POISON_PATTERN {
                h.free(t as *mut u8);
            }
        }
        h.free(table as *mut u8);
    }
}
