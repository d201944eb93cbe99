use std::fmt;

/// Nanoseconds since the realtime epoch.
///
/// `clock_gettime` is async-signal-safe, so this is usable from the sample
/// handler.
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: the pointer is valid for the duration of the call.
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Kernel thread id of the calling thread.
pub fn gettid() -> u64 {
    // SAFETY: gettid takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// Formats one diagnostic line into a fixed stack buffer and emits it with a
/// single `write(2)` to stderr. This is the only logging facility permitted
/// inside the sample handler; everything else uses `tracing`.
pub struct DiagLine {
    buf: [u8; 256],
    len: usize,
}

impl DiagLine {
    pub const fn new() -> Self {
        DiagLine {
            buf: [0; 256],
            len: 0,
        }
    }

    pub fn emit(mut self) {
        if self.len < self.buf.len() {
            self.buf[self.len] = b'\n';
            self.len += 1;
        }
        // SAFETY: the buffer is valid for `len` bytes; write(2) is
        // async-signal-safe.
        unsafe { libc::write(2, self.buf.as_ptr() as *const libc::c_void, self.len) };
    }
}

impl Default for DiagLine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for DiagLine {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let available = self.buf.len() - self.len;
        let take = s.len().min(available);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}
