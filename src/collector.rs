//! Collector lifecycle: per-thread start/pause/resume/stop, environment
//! configuration, the shared sample signal handler and the blame-shift hooks.

use std::cell::{Cell, UnsafeCell};
use std::env;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use thiserror::Error;
use tracing::{debug, info};

use stackpulse_wire::{DataHeader, RANK_UNRESOLVED};

use crate::overflow::OverflowCounter;
use crate::sample::ThreadSamples;
use crate::timer::IntervalTimer;
use crate::transport::Transport;
use crate::unwind::{self, MAX_FRAMES};
use crate::util::gettid;

pub const ENV_USERTIME_RATE: &str = "CBTF_USERTIME_RATE";
pub const ENV_HWCTIME_EVENT: &str = "CBTF_HWCTIME_EVENT";
pub const ENV_HWCTIME_THRESHOLD: &str = "CBTF_HWCTIME_THRESHOLD";
pub const ENV_DEBUG_COLLECTOR: &str = "CBTF_DEBUG_COLLECTOR";
pub const ENV_DEBUG_COLLECTOR_OMPT: &str = "CBTF_DEBUG_COLLECTOR_OMPT";

pub const DEFAULT_RATE_HZ: u32 = 35;
pub const DEFAULT_EVENT: &str = "PAPI_TOT_CYC";
const BASE_THRESHOLD: u64 = 10_000_000;
pub const DEFAULT_THRESHOLD: u64 = 2 * BASE_THRESHOLD;

/// Signal shared by both event sources.
pub(crate) const SAMPLE_SIGNAL: libc::c_int = libc::SIGPROF;

/// Frames of signal-trampoline and overflow-dispatch overhead above the
/// interrupted code when fast-tracing from the counter overflow path.
const OVERFLOW_SKIP_FRAMES: usize = 6;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("collector already running on this thread")]
    AlreadyRunning,
    #[error("invalid sampling rate {0:?}")]
    InvalidRate(String),
    #[error("invalid overflow threshold {0:?}")]
    InvalidThreshold(String),
    #[error("unknown hardware counter event {0:?}")]
    UnknownEvent(String),
    #[error("failed to install the sample signal handler: {0}")]
    SignalHandler(nix::Error),
    #[error("failed to create the sampling timer: {0}")]
    Timer(errno::Errno),
    #[error("hardware counters unavailable: {0}")]
    Counter(errno::Errno),
}

/// Which event source drives sampling on a thread.
#[derive(Clone, Debug)]
pub enum EventSourceConfig {
    /// Interval timer over the thread's consumed CPU time.
    Timer { rate_hz: u32 },
    /// Hardware counter overflow.
    Counter { event: String, threshold: u64 },
}

impl EventSourceConfig {
    /// String uniquely identifying the collector variant, copied into every
    /// batch header.
    pub fn collector_id(&self) -> &'static str {
        match self {
            EventSourceConfig::Timer { .. } => "usertime",
            EventSourceConfig::Counter { .. } => "hwctime",
        }
    }

    /// Sampling interval recorded in the payload: nanoseconds between timer
    /// ticks, or the counter threshold.
    pub fn interval(&self) -> u64 {
        match self {
            EventSourceConfig::Timer { rate_hz } => 1_000_000_000 / *rate_hz as u64,
            EventSourceConfig::Counter { threshold, .. } => *threshold,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    pub source: EventSourceConfig,
    /// Emit a diagnostic line on every flush.
    pub debug: bool,
    /// Emit a diagnostic line on every blame-shift flag change.
    pub debug_ompt: bool,
}

impl CollectorConfig {
    /// Wall-clock sampling configuration from the environment.
    pub fn usertime_from_env() -> Result<Self, StartError> {
        let rate_hz = match env::var(ENV_USERTIME_RATE) {
            Ok(text) => match text.parse::<u32>() {
                Ok(rate) if rate > 0 => rate,
                _ => return Err(StartError::InvalidRate(text)),
            },
            Err(_) => DEFAULT_RATE_HZ,
        };
        Ok(CollectorConfig {
            source: EventSourceConfig::Timer { rate_hz },
            debug: env::var_os(ENV_DEBUG_COLLECTOR).is_some(),
            debug_ompt: env::var_os(ENV_DEBUG_COLLECTOR_OMPT).is_some(),
        })
    }

    /// Hardware-counter sampling configuration from the environment.
    pub fn hwctime_from_env() -> Result<Self, StartError> {
        let event = env::var(ENV_HWCTIME_EVENT).unwrap_or_else(|_| DEFAULT_EVENT.to_string());
        let threshold = match env::var(ENV_HWCTIME_THRESHOLD) {
            Ok(text) => match text.parse::<u64>() {
                Ok(threshold) if threshold > 0 => threshold,
                _ => return Err(StartError::InvalidThreshold(text)),
            },
            Err(_) => DEFAULT_THRESHOLD,
        };
        Ok(CollectorConfig {
            source: EventSourceConfig::Counter { event, threshold },
            debug: env::var_os(ENV_DEBUG_COLLECTOR).is_some(),
            debug_ompt: env::var_os(ENV_DEBUG_COLLECTOR_OMPT).is_some(),
        })
    }
}

pub(crate) enum EventSource {
    Timer(IntervalTimer),
    Counter(OverflowCounter),
}

impl EventSource {
    fn detach(self) {
        match self {
            EventSource::Timer(timer) => timer.detach(),
            EventSource::Counter(counter) => counter.detach(),
        }
    }
}

/// Blame-shift flags for the owning thread. When set, samples are attributed
/// to the corresponding synthetic address instead of the interrupted PC.
#[derive(Clone, Copy, Default)]
pub(crate) struct BlameShift {
    idle: bool,
    wait_barrier: bool,
    barrier: bool,
}

#[derive(Clone, Copy, Debug)]
enum BlameKind {
    Idle,
    WaitBarrier,
    Barrier,
}

struct Tls {
    samples: ThreadSamples,
    source: Option<EventSource>,
    blame: BlameShift,
    debug_ompt: bool,
}

// The sample block is owned by exactly one thread. Mainline code and the
// signal handler never run concurrently on that thread: the kernel masks
// SAMPLE_SIGNAL for the duration of the handler, and the handler bails out
// through `defer_sampling` whenever mainline code is about to mutate the
// block. Cross-thread access does not exist, so a plain UnsafeCell suffices.
thread_local! {
    static TLS: UnsafeCell<Option<Box<Tls>>> = const { UnsafeCell::new(None) };
}

fn tls_slot() -> *mut Option<Box<Tls>> {
    TLS.with(UnsafeCell::get)
}

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Installs the process-wide sample signal handler. Idempotent; the flag
/// flips exactly once per process, before any event source is armed.
pub(crate) fn install_sample_handler() -> Result<(), StartError> {
    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    let action = SigAction::new(
        SigHandler::SigAction(sample_signal_handler),
        SaFlags::SA_RESTART | SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    // SAFETY: the handler only touches the interrupted thread's own sample
    // block and async-signal-safe services.
    if let Err(error) = unsafe { signal::sigaction(Signal::SIGPROF, &action) } {
        HANDLER_INSTALLED.store(false, Ordering::SeqCst);
        return Err(StartError::SignalHandler(error));
    }
    Ok(())
}

extern "C" fn sample_signal_handler(
    _signo: libc::c_int,
    _info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let slot = tls_slot();
    // SAFETY: same-thread access; see the TLS comment above. A thread that
    // never started a collector, or already stopped it, has an empty slot.
    let Some(tls) = (unsafe { &mut *slot }).as_deref_mut() else {
        return;
    };
    if tls.samples.defer_sampling {
        return;
    }

    let mut frames = [0u64; MAX_FRAMES];
    let captured = match &tls.source {
        Some(EventSource::Counter(_)) => {
            // The overflow path carries known dispatch overhead on top of
            // the interrupted frames; fall back to the saved context when
            // fast tracing finds nothing.
            match unwind::capture_fast(OVERFLOW_SKIP_FRAMES, &mut frames) {
                0 => capture_context(context, &mut frames),
                n => n,
            }
        }
        _ => capture_context(context, &mut frames),
    };

    if captured > 0 {
        apply_blame(&tls.blame, &mut frames[..captured]);
        tls.samples.record(&frames[..captured]);
    }

    if let Some(EventSource::Counter(counter)) = &tls.source {
        counter.rearm();
    }
}

fn capture_context(context: *mut libc::c_void, frames: &mut [u64]) -> usize {
    if context.is_null() {
        return 0;
    }
    // SAFETY: the kernel hands the handler a valid ucontext_t.
    unwind::capture_from_context(unsafe { &*(context as *const libc::ucontext_t) }, frames)
}

/// Overwrites the top frame with the blame sentinel when a blame-shift flag
/// is set. Priority: idle, then wait-barrier, then barrier.
fn apply_blame(blame: &BlameShift, frames: &mut [u64]) {
    if frames.is_empty() {
        return;
    }
    if blame.idle {
        frames[0] = blame_sentinel(BlameKind::Idle);
    } else if blame.wait_barrier {
        frames[0] = blame_sentinel(BlameKind::WaitBarrier);
    } else if blame.barrier {
        frames[0] = blame_sentinel(BlameKind::Barrier);
    }
}

/// Synthetic frame address for a blame category: the address of the public
/// hook function itself, so the analysis side can resolve it like any other
/// PC.
fn blame_sentinel(kind: BlameKind) -> u64 {
    let hook: fn(bool) = match kind {
        BlameKind::Idle => thread_idle,
        BlameKind::WaitBarrier => thread_wait_barrier,
        BlameKind::Barrier => thread_barrier,
    };
    hook as usize as u64
}

/// Marks the calling thread as idle; samples taken while set are attributed
/// to the idle sentinel. Callable only between `start` and `stop`; otherwise
/// a silent no-op.
pub fn thread_idle(flag: bool) {
    set_blame(BlameKind::Idle, flag);
}

pub fn thread_wait_barrier(flag: bool) {
    set_blame(BlameKind::WaitBarrier, flag);
}

pub fn thread_barrier(flag: bool) {
    set_blame(BlameKind::Barrier, flag);
}

fn set_blame(kind: BlameKind, flag: bool) {
    let slot = tls_slot();
    // SAFETY: same-thread access; see the TLS comment above.
    let Some(tls) = (unsafe { &mut *slot }).as_deref_mut() else {
        return;
    };
    match kind {
        BlameKind::Idle => tls.blame.idle = flag,
        BlameKind::WaitBarrier => tls.blame.wait_barrier = flag,
        BlameKind::Barrier => tls.blame.barrier = flag,
    }
    if tls.debug_ompt {
        debug!(?kind, flag, "blame-shift flag updated");
    }
}

static JOB_RANK: AtomicU64 = AtomicU64::new(RANK_UNRESOLVED);

/// Publishes the job rank (e.g. after MPI_Init). Every flush from then on
/// carries it; batches flushed earlier carry [`RANK_UNRESOLVED`].
pub fn set_job_rank(rank: u64) {
    JOB_RANK.store(rank, Ordering::Relaxed);
}

pub(crate) fn current_rank() -> u64 {
    JOB_RANK.load(Ordering::Relaxed)
}

const RANK_ENV_VARS: &[&str] = &["OMPI_COMM_WORLD_RANK", "PMI_RANK", "SLURM_PROCID"];

fn probe_rank_from_env() {
    if JOB_RANK.load(Ordering::Relaxed) != RANK_UNRESOLVED {
        return;
    }
    for var in RANK_ENV_VARS {
        if let Some(rank) = env::var(var).ok().and_then(|text| text.parse::<u64>().ok()) {
            set_job_rank(rank);
            return;
        }
    }
}

static THREAD_COUNTER: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static THREAD_NUMBER: Cell<Option<u32>> = const { Cell::new(None) };
}

/// Process-wide thread number, assigned on the thread's first `start` and
/// stable for its lifetime. Thread 0 is whichever thread starts first.
fn thread_number() -> u32 {
    THREAD_NUMBER.with(|cell| match cell.get() {
        Some(number) => number,
        None => {
            let number = THREAD_COUNTER.fetch_add(1, Ordering::Relaxed);
            cell.set(Some(number));
            number
        }
    })
}

/// Builds a header template for the current process: host name, pid and the
/// calling thread's id filled in, rank unresolved.
pub fn process_header(experiment: u32) -> DataHeader {
    DataHeader {
        experiment,
        host: nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default(),
        pid: std::process::id() as u64,
        posix_tid: gettid(),
        rank: RANK_UNRESOLVED,
        ..Default::default()
    }
}

/// Starts data collection on the calling thread.
///
/// Copies the header template, binds the thread's sample block into TLS and
/// arms the configured event source. Configuration and platform-capability
/// problems surface here and leave the thread unchanged.
pub fn start(
    header: &DataHeader,
    config: CollectorConfig,
    transport: Box<dyn Transport>,
) -> Result<(), StartError> {
    let slot = tls_slot();
    // SAFETY: same-thread access; no event source is armed yet.
    if unsafe { (*slot).is_some() } {
        return Err(StartError::AlreadyRunning);
    }

    probe_rank_from_env();

    let mut header = header.clone();
    header.collector = config.source.collector_id().to_string();
    header.posix_tid = gettid();
    header.omp_tid = thread_number();

    let samples = ThreadSamples::new(header, config.source.interval(), transport, config.debug);
    // SAFETY: publish the block before arming; nothing delivers the sample
    // signal to this thread yet.
    unsafe {
        *slot = Some(Box::new(Tls {
            samples,
            source: None,
            blame: BlameShift::default(),
            debug_ompt: config.debug_ompt,
        }));
    }

    let source = match &config.source {
        EventSourceConfig::Timer { .. } => {
            IntervalTimer::install(config.source.interval()).map(EventSource::Timer)
        }
        EventSourceConfig::Counter { event, threshold } => {
            OverflowCounter::install(event, *threshold).map(EventSource::Counter)
        }
    };

    match source {
        Ok(source) => {
            // SAFETY: same-thread store; the handler tolerates a block with
            // no source for the instant before this.
            unsafe {
                (*slot).as_deref_mut().unwrap().source = Some(source);
            }
            info!(
                collector = config.source.collector_id(),
                interval = config.source.interval(),
                "collector started"
            );
            Ok(())
        }
        Err(error) => {
            // SAFETY: nothing was armed; reclaim the block.
            unsafe {
                *slot = None;
            }
            Err(error)
        }
    }
}

/// Pauses sampling on the calling thread: the handler becomes a no-op until
/// `resume`. Idempotent; silently tolerated before `start`.
pub fn pause() {
    let slot = tls_slot();
    // SAFETY: same-thread access; the handler only reads this flag.
    if let Some(tls) = (unsafe { &mut *slot }).as_deref_mut() {
        tls.samples.defer_sampling = true;
    }
}

/// Resumes sampling on the calling thread. Idempotent.
pub fn resume() {
    let slot = tls_slot();
    // SAFETY: same-thread access; the handler only reads this flag.
    if let Some(tls) = (unsafe { &mut *slot }).as_deref_mut() {
        tls.samples.defer_sampling = false;
    }
}

/// Stops data collection on the calling thread: detaches the event source,
/// flushes any buffered samples and releases the sample block. A silent
/// no-op if no collector is running.
pub fn stop() {
    let slot = tls_slot();
    // SAFETY: same-thread access; the gate is set before the block is
    // mutated, and the source is detached before the block is dropped, so a
    // late signal finds either a gated block or an empty slot.
    unsafe {
        let Some(tls) = (*slot).as_deref_mut() else {
            return;
        };
        tls.samples.defer_sampling = true;
        if let Some(source) = tls.source.take() {
            source.detach();
        }
        tls.samples.finish();
        *slot = None;
    }
    debug!("collector stopped");
}
