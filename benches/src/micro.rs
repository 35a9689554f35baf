//! Microbenchmarks: malloc/free latency per size class, the bounds-check
//! primitive, and the escape hot path. Run with `cargo run --release
//! --bin micro`.

use std::hint::black_box;
use std::time::Instant;

use sentrymalloc::allocator::Heap;
use sentrymalloc::safety::{escape, gep_check_boundary};

unsafe fn heap() -> &'static Heap {
    sentrymalloc::init::ensure_initialized();
    sentrymalloc::init::heap()
}

fn bench_malloc_free(size: usize, iterations: usize) -> f64 {
    unsafe {
        let h = heap();
        for _ in 0..1000 {
            let p = h.malloc(black_box(size));
            std::ptr::write_bytes(p, 0xAB, size.min(64));
            h.free(black_box(p));
        }
        let start = Instant::now();
        for _ in 0..iterations {
            let p = h.malloc(black_box(size));
            std::ptr::write_bytes(p, 0xAB, size.min(64));
            h.free(black_box(p));
        }
        start.elapsed().as_nanos() as f64 / iterations as f64
    }
}

fn bench_check_boundary(iterations: usize) -> f64 {
    unsafe {
        let h = heap();
        let p = h.malloc(128) as usize;
        let usable = h.usable_size(p as *mut u8);
        let start = Instant::now();
        for i in 0..iterations {
            let offset = i % usable;
            black_box(gep_check_boundary(p, p + offset, 1));
        }
        let elapsed = start.elapsed().as_nanos() as f64 / iterations as f64;
        h.free(p as *mut u8);
        elapsed
    }
}

fn bench_escape(iterations: usize) -> f64 {
    unsafe {
        let h = heap();
        let cells = h.malloc(64 * 8) as *mut usize;
        let mut targets = [0usize; 64];
        for t in targets.iter_mut() {
            *t = h.malloc(64) as usize;
        }
        let start = Instant::now();
        for i in 0..iterations {
            let cell = cells.add(i % 64);
            let target = targets[(i * 7 + 3) % 64];
            black_box(escape(cell, target));
            *cell = target;
        }
        let elapsed = start.elapsed().as_nanos() as f64 / iterations as f64;
        sentrymalloc::safety::flush_pending_escapes();
        for &t in &targets {
            h.free(t as *mut u8);
        }
        h.free(cells as *mut u8);
        elapsed
    }
}

fn main() {
    const ITERS: usize = 1_000_000;

    println!("size\tns/malloc+free");
    for size in [16usize, 64, 256, 1024, 4096, 16384, 65536] {
        let ns = bench_malloc_free(size, if size > 8192 { ITERS / 10 } else { ITERS });
        println!("{}\t{:.1}", size, ns);
    }
    println!("check_boundary\t{:.1} ns/op", bench_check_boundary(ITERS * 4));
    println!("escape\t{:.1} ns/op", bench_escape(ITERS));
}
