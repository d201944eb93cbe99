//! Hardware-counter event source: a per-thread perf event whose overflow is
//! routed to the sampling signal.

use std::collections::HashMap;
use std::os::raw::c_int;

use lazy_static::lazy_static;
use perf_event_open_sys as sys;
use perf_event_open_sys::bindings::perf_event_attr;
use tracing::debug;

use crate::collector::{install_sample_handler, StartError, SAMPLE_SIGNAL};
use crate::util::gettid;

// Not exposed by the `libc` crate for this target; values are fixed by the
// Linux kernel/glibc fcntl.h ABI.
const F_SETSIG: c_int = 10;
const F_SETOWN_EX: c_int = 15;
const F_OWNER_TID: c_int = 0;

#[repr(C)]
struct f_owner_ex {
    type_: c_int,
    pid: libc::pid_t,
}

lazy_static! {
    /// PAPI preset event names accepted from the environment, mapped onto
    /// the generic hardware events the kernel exposes.
    static ref EVENT_CODES: HashMap<&'static str, u64> = HashMap::from([
        ("PAPI_TOT_CYC", sys::bindings::PERF_COUNT_HW_CPU_CYCLES as u64),
        ("PAPI_TOT_INS", sys::bindings::PERF_COUNT_HW_INSTRUCTIONS as u64),
        ("PAPI_REF_CYC", sys::bindings::PERF_COUNT_HW_REF_CPU_CYCLES as u64),
        ("PAPI_BR_INS", sys::bindings::PERF_COUNT_HW_BRANCH_INSTRUCTIONS as u64),
        ("PAPI_BR_MSP", sys::bindings::PERF_COUNT_HW_BRANCH_MISSES as u64),
        ("PAPI_L2_TCA", sys::bindings::PERF_COUNT_HW_CACHE_REFERENCES as u64),
        ("PAPI_L2_TCM", sys::bindings::PERF_COUNT_HW_CACHE_MISSES as u64),
    ]);
}

pub(crate) fn event_code(name: &str) -> Option<u64> {
    EVENT_CODES.get(name).copied()
}

/// One hardware counter bound to the calling thread, armed to deliver the
/// sampling signal every `threshold` counted events.
#[derive(Debug)]
pub struct OverflowCounter {
    fd: c_int,
}

impl OverflowCounter {
    pub fn install(event: &str, threshold: u64) -> Result<Self, StartError> {
        let config = event_code(event).ok_or_else(|| StartError::UnknownEvent(event.into()))?;

        install_sample_handler()?;

        let mut attrs = perf_event_attr {
            size: std::mem::size_of::<perf_event_attr>() as u32,
            type_: sys::bindings::PERF_TYPE_HARDWARE,
            config,
            ..Default::default()
        };
        attrs.__bindgen_anon_1.sample_period = threshold;
        attrs.__bindgen_anon_2.wakeup_events = 1;
        attrs.set_disabled(1);

        // SAFETY: attrs is a fully initialized perf_event_attr; pid 0 binds
        // the counter to the calling thread on any CPU.
        let fd = unsafe {
            sys::perf_event_open(&mut attrs, 0 /* this thread */, -1, -1, 0) as c_int
        };
        if fd < 0 {
            return Err(StartError::Counter(errno::errno()));
        }

        let counter = OverflowCounter { fd };
        counter.route_signal()?;
        // Arm for one overflow; the handler re-arms after each sample.
        counter.rearm();

        debug!(event, threshold, "hardware counter armed");
        Ok(counter)
    }

    /// Directs the counter's overflow notification at the owning thread as
    /// the sampling signal.
    fn route_signal(&self) -> Result<(), StartError> {
        let owner = f_owner_ex {
            type_: F_OWNER_TID,
            pid: gettid() as libc::pid_t,
        };
        // SAFETY: fd is a live perf event fd owned by us.
        let rc = unsafe {
            let flags = libc::fcntl(self.fd, libc::F_GETFL);
            if flags < 0
                || libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_ASYNC) < 0
                || libc::fcntl(self.fd, F_SETSIG, SAMPLE_SIGNAL) < 0
                || libc::fcntl(self.fd, F_SETOWN_EX, &owner) < 0
            {
                -1
            } else {
                0
            }
        };
        if rc != 0 {
            let error = errno::errno();
            // SAFETY: fd is owned by us and not yet published.
            unsafe { libc::close(self.fd) };
            return Err(StartError::Counter(error));
        }
        Ok(())
    }

    /// Re-enables the counter for one more overflow period. Called from the
    /// sample handler after each recorded sample; ioctl is
    /// async-signal-safe.
    pub fn rearm(&self) {
        // SAFETY: fd is a live perf event fd.
        unsafe { sys::ioctls::REFRESH(self.fd, 1) };
    }

    pub fn detach(self) {
        // SAFETY: fd is live and owned by us; detach consumes self.
        unsafe {
            sys::ioctls::DISABLE(self.fd, 0);
            libc::close(self.fd);
        }
    }
}
