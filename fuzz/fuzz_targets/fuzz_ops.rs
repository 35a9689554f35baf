#![no_main]

use libfuzzer_sys::fuzz_target;
use sentrymalloc::allocator::Heap;

/// Interprets the input as a sequence of allocator operations.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=malloc, 1=free, 2=realloc, 3=calloc, 4=memalign,
///           5=check, 6=escape, 7=free_with_size)
///   byte 1-2: size (little-endian u16)
///   byte 3: slot index (which tracked pointer to operate on)
///
/// Up to 64 live pointers are tracked; every op must leave the heap usable.
const MAX_SLOTS: usize = 64;

unsafe fn heap() -> &'static Heap {
    sentrymalloc::init::ensure_initialized();
    sentrymalloc::init::heap()
}

fuzz_target!(|data: &[u8]| {
    let h = unsafe { heap() };
    let mut slots: [*mut u8; MAX_SLOTS] = [std::ptr::null_mut(); MAX_SLOTS];
    let mut sizes: [usize; MAX_SLOTS] = [0; MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] & 0x07;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        unsafe {
            match opcode {
                0 => {
                    if !slots[slot].is_null() {
                        h.free(slots[slot]);
                    }
                    let ptr = h.malloc(size);
                    slots[slot] = ptr;
                    sizes[slot] = size;
                    if !ptr.is_null() {
                        let usable = h.usable_size(ptr);
                        assert!(usable >= size.max(1));
                        std::ptr::write_bytes(ptr, 0xAA, usable.min(256));
                    }
                }
                1 => {
                    if !slots[slot].is_null() {
                        h.free(slots[slot]);
                        slots[slot] = std::ptr::null_mut();
                        sizes[slot] = 0;
                    }
                }
                2 => {
                    let ptr = h.realloc(slots[slot], size);
                    if !ptr.is_null() {
                        slots[slot] = ptr;
                        sizes[slot] = size.max(1);
                    } else if !slots[slot].is_null() && size != 0 {
                        // Failed grow: the original stays valid.
                    } else {
                        slots[slot] = std::ptr::null_mut();
                        sizes[slot] = 0;
                    }
                }
                3 => {
                    if !slots[slot].is_null() {
                        h.free(slots[slot]);
                    }
                    let nmemb = (size >> 8).max(1);
                    let elem = (size & 0xff).max(1);
                    let ptr = h.calloc(nmemb, elem);
                    slots[slot] = ptr;
                    sizes[slot] = nmemb * elem;
                    if !ptr.is_null() {
                        for j in 0..(nmemb * elem).min(256) {
                            assert_eq!(*ptr.add(j), 0, "calloc not zeroed at {}", j);
                        }
                    }
                }
                4 => {
                    if !slots[slot].is_null() {
                        h.free(slots[slot]);
                    }
                    let align = 1usize << (size % 13); // 1..=4096
                    let ptr = h.memalign(align, size);
                    slots[slot] = ptr;
                    sizes[slot] = size;
                    if !ptr.is_null() {
                        assert_eq!(ptr as usize % align.max(1), 0);
                    }
                }
                5 => {
                    if !slots[slot].is_null() {
                        let p = slots[slot] as usize;
                        let usable = h.usable_size(slots[slot]);
                        assert_eq!(sentrymalloc::safety::gep_check_boundary(p, p, usable), 0);
                        // Guarded samples are page-granular, so probe a
                        // whole page past the end.
                        assert_eq!(
                            sentrymalloc::safety::gep_check_boundary(p, p, usable + 4096),
                            -1
                        );
                    }
                }
                6 => {
                    {
                        let target = (data[i.min(data.len() - 1)] as usize) % MAX_SLOTS;
                        if !slots[slot].is_null()
                            && !slots[target].is_null()
                            && sizes[slot] >= 8
                        {
                            let cell = slots[slot] as *mut usize;
                            sentrymalloc::safety::escape(cell, slots[target] as usize);
                            *cell = slots[target] as usize;
                        }
                    }
                }
                7 => {
                    if !slots[slot].is_null() && sizes[slot] != 0 {
                        h.free_with_size(slots[slot], sizes[slot]);
                        slots[slot] = std::ptr::null_mut();
                        sizes[slot] = 0;
                    }
                }
                _ => unreachable!(),
            }
        }
    }

    sentrymalloc::safety::flush_pending_escapes();

    for slot in &mut slots {
        if !slot.is_null() {
            unsafe { heap().free(*slot) };
            *slot = std::ptr::null_mut();
        }
    }
});
