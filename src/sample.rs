//! Per-thread sample buffer: stack dedup, buffer-full flushes and header
//! range maintenance.
//!
//! Everything in this module runs either on the owning thread's mainline or
//! on its own signal deliveries, never concurrently, so no synchronization is
//! needed beyond the `defer_sampling` gate.

use std::fmt::Write as _;

use stackpulse_wire::DataHeader;

use crate::collector::current_rank;
use crate::transport::{SamplePayload, Transport};
use crate::unwind::MAX_FRAMES;
use crate::util::{now_ns, DiagLine};

/// Number of stack slots (and counts) in the sample buffer.
pub const BUFFER_SIZE: usize = 1024;

/// Highest repetition count a stack entry accumulates before a fresh entry
/// is started for the same stack.
const COUNT_LIMIT: u8 = 254;

/// Marker for an entry at its count limit. Never written by this runtime but
/// honored when scanning, so buffers from older producers stay mergeable.
const COUNT_FULL: u8 = 255;

struct SampleBuffer {
    /// Stack trace (PC) addresses, stacks stored back to back.
    stacktraces: [u64; BUFFER_SIZE],
    /// Directory for `stacktraces`: a value greater than zero marks a top of
    /// stack and carries its repetition count, zero marks a continuation
    /// slot.
    count: [u8; BUFFER_SIZE],
    len: usize,
}

/// Per-thread sampling state: the data header, the payload buffers and the
/// gate flag. One instance lives in thread-local storage between `start` and
/// `stop`.
pub struct ThreadSamples {
    header: DataHeader,
    interval: u64,
    buffer: SampleBuffer,
    transport: Box<dyn Transport>,
    pub(crate) defer_sampling: bool,
    debug: bool,
}

impl ThreadSamples {
    pub fn new(
        header: DataHeader,
        interval: u64,
        transport: Box<dyn Transport>,
        debug: bool,
    ) -> Self {
        let mut samples = ThreadSamples {
            header,
            interval,
            buffer: SampleBuffer {
                stacktraces: [0; BUFFER_SIZE],
                count: [0; BUFFER_SIZE],
                len: 0,
            },
            transport,
            defer_sampling: false,
            debug,
        };
        samples.initialize_data();
        samples
    }

    pub fn len(&self) -> usize {
        self.buffer.len
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.len == 0
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn header(&self) -> &DataHeader {
        &self.header
    }

    /// Merges one captured stack into the buffer.
    ///
    /// Runs on the signal context. If an identical stack already heads an
    /// entry its count is bumped; a stack that would not fit triggers a flush
    /// first. An empty capture is a transient anomaly and is dropped.
    pub fn record(&mut self, frames: &[u64]) {
        if self.defer_sampling || frames.is_empty() {
            return;
        }
        debug_assert!(frames.len() <= MAX_FRAMES);

        // Walk the count directory comparing stored stacks against the new
        // one. The last matching head wins so that a spill entry, which sits
        // later in the buffer, shadows the saturated entry it replaced.
        let mut matched: Option<usize> = None;
        for i in 0..self.buffer.len {
            let count = self.buffer.count[i];
            if count == 0 || count == COUNT_FULL {
                continue;
            }
            if i + frames.len() > BUFFER_SIZE {
                continue;
            }
            if self.buffer.stacktraces[i..i + frames.len()] == *frames {
                matched = Some(i);
            }
        }

        if let Some(i) = matched {
            if self.buffer.count[i] < COUNT_LIMIT {
                self.buffer.count[i] += 1;
                return;
            }
            // Saturated entry: fall through and start a fresh one.
        }

        if self.buffer.len + frames.len() > BUFFER_SIZE {
            self.send_samples();
        }

        let base = self.buffer.len;
        for (offset, pc) in frames.iter().enumerate() {
            self.buffer.stacktraces[base + offset] = *pc;
            self.buffer.count[base + offset] = if offset == 0 { 1 } else { 0 };
            self.update_header_with_address(*pc);
        }
        self.buffer.len += frames.len();
    }

    /// Sends the current batch through the transport and re-initializes the
    /// header and buffers. Signal-safe: no allocation, no locks.
    pub fn send_samples(&mut self) {
        self.header.time_end = now_ns();
        // The job rank only becomes known once the process' communication
        // runtime is up; adopt whatever has been published by now.
        self.header.rank = current_rank();

        if self.debug {
            let mut line = DiagLine::new();
            let _ = write!(
                line,
                "{} send_samples: time_range({:#x},{:#x}) addr_range[{:#x},{:#x}) \
                 stacktraces_len({})",
                self.header.collector,
                self.header.time_begin,
                self.header.time_end,
                self.header.addr_begin,
                self.header.addr_end,
                self.buffer.len,
            );
            line.emit();
        }

        let payload = SamplePayload {
            interval: self.interval,
            stacktraces: &self.buffer.stacktraces[..self.buffer.len],
            count: &self.buffer.count[..self.buffer.len],
        };
        // A failed send drops this batch; the next one starts clean.
        let _ = self.transport.send(&self.header, &payload);

        self.initialize_data();
    }

    /// Final flush at collector teardown.
    pub fn finish(&mut self) {
        self.header.time_end = now_ns();
        if self.buffer.len > 0 {
            self.send_samples();
        }
    }

    fn initialize_data(&mut self) {
        self.header.time_begin = now_ns();
        self.header.time_end = 0;
        self.header.addr_begin = u64::MAX;
        self.header.addr_end = 0;
        self.buffer.stacktraces = [0; BUFFER_SIZE];
        self.buffer.count = [0; BUFFER_SIZE];
        self.buffer.len = 0;
    }

    /// Grows the header's address interval to contain `addr`, end-exclusive.
    fn update_header_with_address(&mut self, addr: u64) {
        if addr < self.header.addr_begin {
            self.header.addr_begin = addr;
        }
        if addr >= self.header.addr_end {
            self.header.addr_end = addr + 1;
        }
    }

    #[cfg(test)]
    fn counts(&self) -> Vec<(usize, u8)> {
        (0..self.buffer.len)
            .filter(|i| self.buffer.count[*i] > 0)
            .map(|i| (i, self.buffer.count[i]))
            .collect()
    }
}
