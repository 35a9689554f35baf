//! Violation and diagnostics reporting. Each report is formatted into a
//! fixed-size line on the caller's stack and emitted with a single
//! write(2) to fd 2, so reporting needs no lock, no allocation, and two
//! threads tripping checks at once cannot interleave partial lines.
//! Over-long reports are truncated with a marker instead of spilling into
//! a second write.

use core::fmt::{self, Write};

/// Bytes per report line, including the truncation marker and newline.
const LINE_BYTES: usize = 192;

/// Reserved tail: b"..." plus the newline.
const TAIL_BYTES: usize = 4;

struct Line {
    buf: [u8; LINE_BYTES],
    len: usize,
    truncated: bool,
}

impl Line {
    const fn new() -> Self {
        Line {
            buf: [0; LINE_BYTES],
            len: 0,
            truncated: false,
        }
    }

    /// Terminate the line and hand it to the kernel in one write.
    fn emit(mut self) {
        if self.truncated {
            self.buf[self.len..self.len + 3].copy_from_slice(b"...");
            self.len += 3;
        }
        self.buf[self.len] = b'\n';
        self.len += 1;
        unsafe {
            libc::write(2, self.buf.as_ptr() as *const libc::c_void, self.len);
        }
    }
}

impl Write for Line {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let cap = LINE_BYTES - TAIL_BYTES;
        let bytes = s.as_bytes();
        let room = cap - self.len;
        if bytes.len() > room {
            self.buf[self.len..cap].copy_from_slice(&bytes[..room]);
            self.len = cap;
            self.truncated = true;
        } else {
            self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
            self.len += bytes.len();
        }
        Ok(())
    }
}

#[doc(hidden)]
#[cold]
#[inline(never)]
pub fn _log(args: fmt::Arguments<'_>) {
    let mut line = Line::new();
    let _ = line.write_fmt(args);
    line.emit();
}

/// Unconditional diagnostic line to stderr.
macro_rules! log_line {
    ($($arg:tt)*) => {
        $crate::log::_log(format_args!($($arg)*))
    };
}

/// Violation report: logs under `error-report`, aborts under
/// `crash-on-corruption`.
macro_rules! report_violation {
    ($($arg:tt)*) => {{
        #[cfg(feature = "error-report")]
        $crate::log::_log(format_args!($($arg)*));
        #[cfg(feature = "crash-on-corruption")]
        $crate::log::abort_now();
    }};
}

/// Internal invariant guard: always logs and aborts on failure.
macro_rules! check_condition {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::log::_log(format_args!($($arg)*));
            $crate::log::abort_now();
        }
    };
}

pub(crate) use check_condition;
pub(crate) use log_line;
pub(crate) use report_violation;

/// Abort after a corruption report. Kept out of line so callers stay small.
#[cold]
#[inline(never)]
pub fn abort_now() -> ! {
    unsafe { libc::abort() }
}
