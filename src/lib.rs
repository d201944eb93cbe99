//! In-process sampling runtime.
//!
//! Periodically samples the running program, either on a wall-clock interval
//! timer or on a hardware-counter overflow, captures the native call stack at
//! each sample, deduplicates identical stacks in a bounded per-thread buffer
//! and ships completed batches through a pluggable transport. The companion
//! `stackpulse-symtab` crate resolves the sampled addresses offline.

pub mod collector;
pub mod sample;
pub mod transport;
pub mod unwind;

mod overflow;
mod timer;
mod util;

pub use collector::{
    pause, process_header, resume, set_job_rank, start, stop, thread_barrier, thread_idle,
    thread_wait_barrier, CollectorConfig, EventSourceConfig, StartError,
};
pub use sample::{ThreadSamples, BUFFER_SIZE};
pub use transport::{ChannelTransport, FileTransport, SamplePayload, Transport, DATA_SUFFIX};
pub use unwind::MAX_FRAMES;
