//! Operation counters behind the `statistic` feature, and the dump routine
//! backing `__report_statistic` / `malloc_stats`.

#[cfg(feature = "statistic")]
pub mod counters {
    use core::sync::atomic::AtomicU64;

    pub static MALLOC: AtomicU64 = AtomicU64::new(0);
    pub static FREE: AtomicU64 = AtomicU64::new(0);
    pub static ESCAPE: AtomicU64 = AtomicU64::new(0);
    pub static ESCAPE_VALID: AtomicU64 = AtomicU64::new(0);
    pub static ESCAPE_HEAP: AtomicU64 = AtomicU64::new(0);
    pub static ESCAPE_LOC_OPTIMIZED: AtomicU64 = AtomicU64::new(0);
    pub static ESCAPE_FINAL: AtomicU64 = AtomicU64::new(0);
    pub static ESCAPE_CACHE_OPTIMIZED: AtomicU64 = AtomicU64::new(0);
    pub static GET_END: AtomicU64 = AtomicU64::new(0);
    pub static GEP_CHECK: AtomicU64 = AtomicU64::new(0);
    pub static BC_CHECK: AtomicU64 = AtomicU64::new(0);
}

/// Bump one counter; compiles to nothing without `statistic`.
macro_rules! stat_inc {
    ($name:ident) => {
        #[cfg(feature = "statistic")]
        $crate::stats::counters::$name.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    };
}

pub(crate) use stat_inc;

/// Dump every counter to stderr.
pub fn report_statistic() {
    #[cfg(feature = "statistic")]
    {
        use core::sync::atomic::Ordering::Relaxed;
        use self::counters::*;
        crate::log::log_line!("malloc count\t\t: {}", MALLOC.load(Relaxed));
        crate::log::log_line!("free count\t\t: {}", FREE.load(Relaxed));
        crate::log::log_line!("escape count\t\t: {}", ESCAPE.load(Relaxed));
        crate::log::log_line!("escape valid count\t: {}", ESCAPE_VALID.load(Relaxed));
        crate::log::log_line!("escape heap count\t: {}", ESCAPE_HEAP.load(Relaxed));
        crate::log::log_line!(
            "escape optimized count\t: {}",
            ESCAPE_LOC_OPTIMIZED.load(Relaxed)
        );
        crate::log::log_line!("escape final count\t: {}", ESCAPE_FINAL.load(Relaxed));
        crate::log::log_line!(
            "escape cache optimized\t: {}",
            ESCAPE_CACHE_OPTIMIZED.load(Relaxed)
        );
        crate::log::log_line!("get end count\t: {}", GET_END.load(Relaxed));
        crate::log::log_line!("gep check count\t: {}", GEP_CHECK.load(Relaxed));
        crate::log::log_line!("bc check count\t: {}", BC_CHECK.load(Relaxed));
    }
}
