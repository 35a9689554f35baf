//! Larson-style server workload: threads share slots of live allocations,
//! each round frees a random slot and reallocates it at a random size,
//! exercising cross-thread frees and the transfer cache. Run with
//! `cargo run --release --bin larson [threads]`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Instant;

use sentrymalloc::allocator::Heap;

const SLOTS_PER_THREAD: usize = 1024;
const ROUNDS: usize = 200_000;
const MIN_SIZE: usize = 16;
const MAX_SIZE: usize = 2048;

unsafe fn heap() -> &'static Heap {
    sentrymalloc::init::ensure_initialized();
    sentrymalloc::init::heap()
}

struct SendSlots(*mut *mut u8);
unsafe impl Send for SendSlots {}

fn main() {
    let threads: usize = std::env::args()
        .nth(1)
        .and_then(|a| a.parse().ok())
        .unwrap_or(4);

    unsafe {
        let h = heap();
        let total_ops = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(threads));

        // Pre-populate every thread's slot table with live objects.
        let tables: Vec<SendSlots> = (0..threads)
            .map(|_| {
                let table = h.malloc(SLOTS_PER_THREAD * 8) as *mut *mut u8;
                for i in 0..SLOTS_PER_THREAD {
                    *table.add(i) = h.malloc(MIN_SIZE + i % (MAX_SIZE - MIN_SIZE));
                }
                SendSlots(table)
            })
            .collect();

        let start = Instant::now();
        let handles: Vec<_> = tables
            .into_iter()
            .enumerate()
            .map(|(tid, slots)| {
                let barrier = Arc::clone(&barrier);
                let total_ops = Arc::clone(&total_ops);
                std::thread::spawn(move || {
                    let slots = slots;
                    let h = heap();
                    let table = slots.0;
                    let mut rng = 0x853c_49e6_748f_ea9bu64 ^ tid as u64;
                    let mut next = move || {
                        rng ^= rng << 13;
                        rng ^= rng >> 7;
                        rng ^= rng << 17;
                        rng as usize
                    };
                    barrier.wait();
                    for _ in 0..ROUNDS {
                        let slot = next() % SLOTS_PER_THREAD;
                        let size = MIN_SIZE + next() % (MAX_SIZE - MIN_SIZE);
                        h.free(*table.add(slot));
                        let p = h.malloc(size);
                        assert!(!p.is_null());
                        std::ptr::write_bytes(p, 0x5A, size.min(64));
                        *table.add(slot) = p;
                    }
                    total_ops.fetch_add(ROUNDS * 2, Ordering::Relaxed);
                    for i in 0..SLOTS_PER_THREAD {
                        h.free(*table.add(i));
                    }
                    h.free(table as *mut u8);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let elapsed = start.elapsed();
        let ops = total_ops.load(Ordering::Relaxed);
        println!(
            "{} threads: {} ops in {:.2}s ({:.1} Mops/s)",
            threads,
            ops,
            elapsed.as_secs_f64(),
            ops as f64 / elapsed.as_secs_f64() / 1e6
        );
    }
}
