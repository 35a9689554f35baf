#![no_main]

use libfuzzer_sys::fuzz_target;
use sentrymalloc::allocator::Heap;
use sentrymalloc::safety::{escape, flush_pending_escapes};
use sentrymalloc::util::POISON_PATTERN;

/// Escape-graph fuzz: a heap-resident pointer table whose cells are
/// rewired at random, with occasional frees and reallocations. The
/// full-scale version of the scaled-down integration test; each input byte
/// drives one rewire and a 1-in-256 chance of churn.
const OBJECTS: usize = 512;

unsafe fn heap() -> &'static Heap {
    sentrymalloc::init::ensure_initialized();
    sentrymalloc::init::heap()
}

fuzz_target!(|data: &[u8]| {
    let h = unsafe { heap() };
    unsafe {
        let table = h.malloc(OBJECTS * 8) as *mut usize;
        if table.is_null() {
            return;
        }
        for i in 0..OBJECTS {
            let t = h.malloc(128) as usize;
            assert!(t != 0);
            escape(table.add(i), t);
            *table.add(i) = t;
        }

        let mut iter = data.iter();
        while let (Some(&a), Some(&b)) = (iter.next(), iter.next()) {
            let x = (a as usize * 7 + b as usize) % OBJECTS;
            let y = (b as usize * 13 + a as usize) % OBJECTS;
            let tx = *table.add(x);
            let ty = *table.add(y);
            if tx != 0 && tx & POISON_PATTERN != POISON_PATTERN && ty != 0 {
                escape(tx as *mut usize, ty);
                *(tx as *mut usize) = ty;
            }
            if a == b {
                let z = (a as usize) % OBJECTS;
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
});
