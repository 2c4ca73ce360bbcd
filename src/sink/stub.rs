//! Recording sink for tests and dry runs.
//!
//! Records every submission in order. It also checks the async memory
//! contract the way a real transmitter would exercise it: when the next send
//! arrives, the previous async frame is re-read and compared with what was
//! submitted. Any difference is counted as a lifetime violation.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{OutgoingFrame, Sink};
use crate::capture::stub::{frame_sequence, SEQUENCE_HEADER_LEN};
use crate::format::{FourCc, Resolution};

/// Bytes of each submission kept for inspection.
const PREFIX_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendMode {
    Sync,
    Async,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub mode: SendMode,
    pub resolution: Resolution,
    pub fourcc: FourCc,
    pub len: usize,
    /// Address of the submitted memory.
    pub data_addr: usize,
    /// Sequence written by the synthetic capture device, if present.
    pub sequence: Option<u64>,
    pub prefix: Vec<u8>,
}

struct InFlight {
    addr: usize,
    len: usize,
    prefix: Vec<u8>,
}

pub struct StubSink {
    name: String,
    receivers: AtomicBool,
    send_delay: Option<Duration>,
    fail_sends: AtomicBool,
    submissions: Mutex<Vec<Submission>>,
    in_flight: Mutex<Option<InFlight>>,
    probes: AtomicU64,
    violations: AtomicU64,
}

impl StubSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            receivers: AtomicBool::new(true),
            send_delay: None,
            fail_sends: AtomicBool::new(false),
            submissions: Mutex::new(Vec::new()),
            in_flight: Mutex::new(None),
            probes: AtomicU64::new(0),
            violations: AtomicU64::new(0),
        }
    }

    /// Simulate a slow transmitter.
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }

    pub fn with_receivers(self, present: bool) -> Self {
        self.set_receivers(present);
        self
    }

    pub fn set_receivers(&self, present: bool) {
        self.receivers.store(present, Ordering::SeqCst);
    }

    /// Make every following send fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.lock_submissions().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.lock_submissions().len()
    }

    /// Sequence numbers of every submission, in order.
    pub fn sequences(&self) -> Vec<Option<u64>> {
        self.lock_submissions().iter().map(|s| s.sequence).collect()
    }

    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }

    /// Async frames whose memory changed before the next send.
    pub fn lifetime_violations(&self) -> u64 {
        self.violations.load(Ordering::SeqCst)
    }

    fn lock_submissions(&self) -> MutexGuard<'_, Vec<Submission>> {
        self.submissions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-read the previous async frame and drop our reference to it.
    ///
    /// # Safety
    ///
    /// Only called at the start of a send or flush, while the caller of the
    /// previous `send_async` still guarantees the memory.
    unsafe fn settle_in_flight(&self) {
        if let Some(prev) = self.lock_in_flight().take() {
            let bytes = std::slice::from_raw_parts(prev.addr as *const u8, prev.len);
            if bytes[..prev.prefix.len()] != prev.prefix[..] {
                let total = self.violations.fetch_add(1, Ordering::SeqCst) + 1;
                log::warn!(
                    "StubSink: async frame at {:#x} changed before the next send ({} violations)",
                    prev.addr,
                    total
                );
            }
        }
    }

    fn record(&self, mode: SendMode, frame: &OutgoingFrame<'_>) -> Result<Vec<u8>> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("{}: synthetic send failure", self.name));
        }
        if let Some(delay) = self.send_delay {
            std::thread::sleep(delay);
        }
        let prefix = frame.data[..frame.data.len().min(PREFIX_LEN)].to_vec();
        let sequence = if frame.data.len() >= SEQUENCE_HEADER_LEN {
            frame_sequence(frame.data)
        } else {
            None
        };
        log::trace!(
            "StubSink: {:?} frame {:?} ({} bytes)",
            mode,
            sequence,
            frame.data.len()
        );
        self.lock_submissions().push(Submission {
            mode,
            resolution: frame.resolution,
            fourcc: frame.fourcc,
            len: frame.data.len(),
            data_addr: frame.data.as_ptr() as usize,
            sequence,
            prefix: prefix.clone(),
        });
        Ok(prefix)
    }
}

impl Sink for StubSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_receivers(&self, _timeout: Duration) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.receivers.load(Ordering::SeqCst)
    }

    fn send_sync(&self, frame: &OutgoingFrame<'_>) -> Result<()> {
        // SAFETY: the previous async caller's guarantee holds until this
        // call returns.
        unsafe { self.settle_in_flight() };
        self.record(SendMode::Sync, frame)?;
        Ok(())
    }

    unsafe fn send_async(&self, frame: &OutgoingFrame<'_>) -> Result<()> {
        self.settle_in_flight();
        let prefix = self.record(SendMode::Async, frame)?;
        *self.lock_in_flight() = Some(InFlight {
            addr: frame.data.as_ptr() as usize,
            len: frame.data.len(),
            prefix,
        });
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        // SAFETY: as in `send_sync`.
        unsafe { self.settle_in_flight() };
        Ok(())
    }
}
