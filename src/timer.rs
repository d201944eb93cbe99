//! Wall-clock event source: a per-thread POSIX interval timer delivering the
//! sampling signal to the thread that owns it.

use std::mem::MaybeUninit;
use std::ptr;

use tracing::debug;

use crate::collector::{install_sample_handler, StartError, SAMPLE_SIGNAL};
use crate::util::gettid;

/// Per-thread interval timer. The timer fires on the thread's consumed CPU
/// time, so idle threads are not sampled.
pub struct IntervalTimer {
    timer_id: libc::timer_t,
}

impl IntervalTimer {
    pub fn install(interval_ns: u64) -> Result<Self, StartError> {
        install_sample_handler()?;

        // SAFETY: zeroed sigevent is a valid starting point; every field the
        // kernel reads for SIGEV_THREAD_ID is filled in below.
        let mut event: libc::sigevent = unsafe { MaybeUninit::zeroed().assume_init() };
        event.sigev_notify = libc::SIGEV_THREAD_ID;
        event.sigev_signo = SAMPLE_SIGNAL;
        event.sigev_notify_thread_id = gettid() as libc::c_int;

        let mut timer_id: libc::timer_t = ptr::null_mut();
        // SAFETY: both pointers are valid for the duration of the call.
        let rc = unsafe {
            libc::timer_create(libc::CLOCK_THREAD_CPUTIME_ID, &mut event, &mut timer_id)
        };
        if rc != 0 {
            return Err(StartError::Timer(errno::errno()));
        }

        let spec = libc::itimerspec {
            it_interval: timespec_from_ns(interval_ns),
            it_value: timespec_from_ns(interval_ns),
        };
        // SAFETY: timer_id was just created; spec is valid.
        let rc = unsafe { libc::timer_settime(timer_id, 0, &spec, ptr::null_mut()) };
        if rc != 0 {
            let error = errno::errno();
            // SAFETY: timer_id is live and owned by us.
            unsafe { libc::timer_delete(timer_id) };
            return Err(StartError::Timer(error));
        }

        debug!(interval_ns, "interval timer armed");
        Ok(IntervalTimer { timer_id })
    }

    /// Disarms and deletes the timer. Signals already queued may still be
    /// delivered; the handler tolerates a missing sample block.
    pub fn detach(self) {
        // SAFETY: timer_id is live and owned by us; detach consumes self so
        // it cannot be deleted twice.
        unsafe { libc::timer_delete(self.timer_id) };
    }
}

fn timespec_from_ns(ns: u64) -> libc::timespec {
    libc::timespec {
        tv_sec: (ns / 1_000_000_000) as libc::time_t,
        tv_nsec: (ns % 1_000_000_000) as libc::c_long,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timespec_conversion() {
        let spec = timespec_from_ns(1_000_000_000 / 35);
        assert_eq!(spec.tv_sec, 0);
        assert_eq!(spec.tv_nsec, 28_571_428);

        let spec = timespec_from_ns(2_500_000_000);
        assert_eq!(spec.tv_sec, 2);
        assert_eq!(spec.tv_nsec, 500_000_000);
    }

    #[test]
    fn test_install_and_detach() {
        let timer = IntervalTimer::install(1_000_000_000).expect("timer_create should work");
        timer.detach();
    }
}
