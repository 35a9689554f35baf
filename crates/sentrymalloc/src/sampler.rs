//! Per-thread allocation sampler: a countdown of bytes until the next
//! sample, drawn from an exponential distribution around the configured
//! mean so that sampling is unbiased by allocation size. The returned
//! weight is the drawn period; profile readers divide by it to unskew.

use crate::config;
use std::cell::RefCell;

pub struct Sampler {
    bytes_until_sample: isize,
    rng: u64,
    samples_until_guarded: usize,
    /// Rate the current countdown was drawn from; a runtime rate change
    /// forces a redraw.
    drawn_rate: usize,
}

impl Sampler {
    pub const fn new() -> Self {
        Sampler {
            bytes_until_sample: 0,
            rng: 0,
            samples_until_guarded: 0,
            drawn_rate: 0,
        }
    }

    fn prime(&mut self, rate: usize) {
        // Seed from the sampler's own address and the clock; determinism
        // across runs is a non-goal.
        if self.rng == 0 {
            let seed = self as *const _ as u64 ^ crate::platform::monotonic_nanos();
            self.rng = seed | 1;
            self.samples_until_guarded = config::guarded_sample_rate();
        }
        self.drawn_rate = rate;
        self.bytes_until_sample = self.next_interval() as isize;
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.rng;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    fn next_interval(&mut self) -> usize {
        let mean = self.drawn_rate;
        if mean == 0 {
            return isize::MAX as usize;
        }
        // Exponential draw: -mean * ln(U), U uniform in (0, 1].
        let u = ((self.next_u64() >> 11) as f64 + 1.0) / (1u64 << 53) as f64;
        let draw = -(mean as f64) * u.ln();
        let capped = draw.min(isize::MAX as f64 / 2.0);
        (capped as usize).max(1)
    }

    /// Account `size` bytes; returns the sample weight when this allocation
    /// is the one that trips the countdown, 0 otherwise.
    #[inline]
    pub fn record_allocation(&mut self, size: usize) -> usize {
        let rate = config::sample_rate();
        if rate == 0 {
            return 0;
        }
        if self.drawn_rate != rate {
            self.prime(rate);
        }
        self.bytes_until_sample -= size as isize;
        if self.bytes_until_sample > 0 {
            return 0;
        }
        let weight = rate.max(size);
        self.bytes_until_sample = self.next_interval() as isize;
        weight
    }

    /// Every Nth sample is placed behind guard pages when eligible.
    pub fn should_sample_guarded(&mut self) -> bool {
        let rate = config::guarded_sample_rate();
        if rate == 0 {
            return false;
        }
        if self.samples_until_guarded <= 1 {
            self.samples_until_guarded = rate;
            true
        } else {
            self.samples_until_guarded -= 1;
            false
        }
    }
}

/// Run `f` against the calling thread's sampler. None during TLS teardown.
#[inline]
pub fn with_sampler<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut Sampler) -> R,
{
    thread_local! {
        static SAMPLER: RefCell<Sampler> = const { RefCell::new(Sampler::new()) };
    }
    SAMPLER
        .try_with(|cell| cell.try_borrow_mut().ok().map(|mut s| f(&mut s)))
        .ok()
        .flatten()
}
