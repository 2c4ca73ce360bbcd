//! Synthetic capture device for `stub://` paths.
//!
//! Behaves like a V4L2 mmap device: buffers are allocated once, the "driver"
//! fills queued buffers in FIFO order and hands them back on dequeue. Each
//! fill rewrites the whole frame with a grey test pattern that starts with the
//! little-endian sequence number, so consumers can check ordering.

use anyhow::Result;
use std::collections::VecDeque;
use std::io;
use std::ptr::NonNull;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{CaptureDevice, Dequeued, FormatRequest, MappedBuffer, MappedPlane, NegotiatedFormat};
use crate::error::CaptureError;
use crate::format::{FourCc, Resolution};

/// Bytes reserved at the start of every synthetic frame for the sequence.
pub const SEQUENCE_HEADER_LEN: usize = 8;

#[derive(Clone, Debug)]
pub struct StubConfig {
    pub resolution: Resolution,
    pub fourcc: FourCc,
    /// Upper bound on buffers the "driver" grants.
    pub max_buffers: u32,
    /// Minimum time between filled frames. `None` fills as fast as buffers
    /// are queued.
    pub frame_interval: Option<Duration>,
    /// Fail every dequeue after this many frames (fatal I/O simulation).
    pub fail_after: Option<u32>,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::new(64, 36),
            fourcc: FourCc::UYVY,
            max_buffers: 8,
            frame_interval: None,
            fail_after: None,
        }
    }
}

/// Read the sequence number a synthetic device wrote into a frame.
pub fn frame_sequence(bytes: &[u8]) -> Option<u64> {
    let header: [u8; SEQUENCE_HEADER_LEN] = bytes.get(..SEQUENCE_HEADER_LEN)?.try_into().ok()?;
    Some(u64::from_le_bytes(header))
}

struct Allocation {
    ptr: NonNull<u8>,
    len: usize,
}

// Allocations are only written by the stub "driver" while the buffer is
// queued to it.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

#[derive(Default)]
struct StubState {
    streaming: bool,
    queued: VecDeque<u32>,
    sequence: u32,
    next_fill_at: Option<Instant>,
}

pub struct StubDevice {
    name: String,
    config: StubConfig,
    allocations: Vec<Option<Allocation>>,
    state: Mutex<StubState>,
    ready: Condvar,
}

impl StubDevice {
    pub fn new(name: &str, config: StubConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            allocations: Vec::new(),
            state: Mutex::new(StubState::default()),
            ready: Condvar::new(),
        }
    }

    /// Number of buffers currently queued to the synthetic driver.
    pub fn queued_len(&self) -> usize {
        self.lock().queued.len()
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        // A poisoned lock only means a test thread panicked; the state is
        // still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn frame_due(&self, state: &StubState, now: Instant) -> bool {
        match state.next_fill_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    fn has_ready_frame(&self, state: &StubState, now: Instant) -> bool {
        state.streaming && !state.queued.is_empty() && self.frame_due(state, now)
    }

    fn fill(&self, index: u32, sequence: u32) -> u32 {
        let Some(Some(allocation)) = self.allocations.get(index as usize) else {
            return 0;
        };
        // SAFETY: the buffer was queued to this device, so no consumer holds
        // it, and the allocation lives until `unmap`.
        let bytes = unsafe { std::slice::from_raw_parts_mut(allocation.ptr.as_ptr(), allocation.len) };
        fill_pattern(bytes, self.config.fourcc);
        let header = (sequence as u64).to_le_bytes();
        let n = header.len().min(bytes.len());
        bytes[..n].copy_from_slice(&header[..n]);
        allocation.len as u32
    }
}

fn einval(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, what.to_string())
}

/// Neutral grey in packed 4:2:2.
fn fill_pattern(bytes: &mut [u8], fourcc: FourCc) {
    let (even, odd) = if fourcc == FourCc::YUYV {
        (0x10, 0x80)
    } else {
        (0x80, 0x10)
    };
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = if i % 2 == 0 { even } else { odd };
    }
}

impl CaptureDevice for StubDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn negotiate(&mut self, request: &FormatRequest) -> Result<NegotiatedFormat> {
        if let Some(width) = request.width {
            self.config.resolution.width = width;
        }
        if let Some(height) = request.height {
            self.config.resolution.height = height;
        }
        match request.fourcc {
            Some(fourcc) if fourcc == FourCc::UYVY || fourcc == FourCc::YUYV => {
                self.config.fourcc = fourcc;
            }
            Some(fourcc) => {
                log::warn!(
                    "StubDevice: {} does not support {}, keeping {}",
                    self.name,
                    fourcc,
                    self.config.fourcc
                );
            }
            None => {}
        }
        Ok(NegotiatedFormat {
            resolution: self.config.resolution,
            fourcc: self.config.fourcc,
        })
    }

    fn request_buffers(&mut self, count: u32) -> Result<Vec<MappedBuffer>, CaptureError> {
        if !self.allocations.is_empty() {
            return Err(CaptureError::io("VIDIOC_REQBUFS", einval("buffers already requested")));
        }
        let granted = count.min(self.config.max_buffers);
        let len = self
            .config
            .resolution
            .packed_422_len()
            .max(SEQUENCE_HEADER_LEN);

        let mut buffers = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            let mut bytes = vec![0u8; len].into_boxed_slice();
            fill_pattern(&mut bytes, self.config.fourcc);
            let raw = Box::into_raw(bytes) as *mut u8;
            let ptr = NonNull::new(raw).ok_or_else(|| CaptureError::io("mmap", einval("null allocation")))?;
            self.allocations.push(Some(Allocation { ptr, len }));
            // SAFETY: the allocation is freed only in `unmap` or on drop.
            let plane = unsafe { MappedPlane::new(ptr, len, index * len as u32) };
            buffers.push(MappedBuffer {
                index,
                planes: vec![plane],
            });
        }
        log::debug!("StubDevice: {} granted {} of {} buffers", self.name, granted, count);
        Ok(buffers)
    }

    fn queue(&self, index: u32) -> Result<(), CaptureError> {
        if !matches!(self.allocations.get(index as usize), Some(Some(_))) {
            return Err(CaptureError::io("VIDIOC_QBUF", einval("unknown buffer index")));
        }
        let mut state = self.lock();
        if state.queued.contains(&index) {
            return Err(CaptureError::io("VIDIOC_QBUF", einval("buffer already queued")));
        }
        state.queued.push_back(index);
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    fn dequeue(&self) -> Result<Dequeued, CaptureError> {
        let mut state = self.lock();
        if !state.streaming {
            return Err(CaptureError::io("VIDIOC_DQBUF", einval("not streaming")));
        }
        if let Some(limit) = self.config.fail_after {
            if state.sequence >= limit {
                return Err(CaptureError::io(
                    "VIDIOC_DQBUF",
                    io::Error::new(io::ErrorKind::Other, "synthetic I/O failure"),
                ));
            }
        }
        let now = Instant::now();
        if !self.has_ready_frame(&state, now) {
            return Err(CaptureError::NoData);
        }
        let index = state.queued.pop_front().ok_or(CaptureError::NoData)?;
        let sequence = state.sequence;
        state.sequence = state.sequence.wrapping_add(1);
        if let Some(interval) = self.config.frame_interval {
            state.next_fill_at = Some(now + interval);
        }
        let bytes_used = self.fill(index, sequence);
        Ok(Dequeued {
            index,
            bytes_used,
            sequence,
        })
    }

    fn stream_on(&self) -> Result<(), CaptureError> {
        let mut state = self.lock();
        state.streaming = true;
        state.next_fill_at = self.config.frame_interval.map(|i| Instant::now() + i);
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    fn stream_off(&self) -> Result<(), CaptureError> {
        let mut state = self.lock();
        state.streaming = false;
        state.queued.clear();
        Ok(())
    }

    fn wait_ready(&self, timeout: Duration) -> Result<bool, CaptureError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            let now = Instant::now();
            if self.has_ready_frame(&state, now) {
                return Ok(true);
            }
            if now >= deadline {
                return Ok(false);
            }
            let mut wait = deadline - now;
            if state.streaming && !state.queued.is_empty() {
                if let Some(at) = state.next_fill_at {
                    wait = wait.min(at.saturating_duration_since(now));
                }
            }
            state = self
                .ready
                .wait_timeout(state, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn unmap(&mut self, buffers: Vec<MappedBuffer>) -> Result<(), CaptureError> {
        for buffer in buffers {
            let slot = self
                .allocations
                .get_mut(buffer.index as usize)
                .and_then(Option::take)
                .ok_or_else(|| CaptureError::io("munmap", einval("buffer not mapped")))?;
            free_allocation(slot);
        }
        Ok(())
    }
}

fn free_allocation(allocation: Allocation) {
    // SAFETY: produced by `Box::into_raw` on a boxed slice of `len` bytes.
    unsafe {
        drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
            allocation.ptr.as_ptr(),
            allocation.len,
        )));
    }
}

impl Drop for StubDevice {
    fn drop(&mut self) {
        for allocation in self.allocations.drain(..).flatten() {
            free_allocation(allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped_device(config: StubConfig, count: u32) -> (StubDevice, Vec<MappedBuffer>) {
        let mut device = StubDevice::new("stub://test", config);
        let buffers = device.request_buffers(count).expect("request buffers");
        (device, buffers)
    }

    #[test]
    fn grants_at_most_max_buffers() {
        let config = StubConfig {
            max_buffers: 3,
            ..StubConfig::default()
        };
        let (_device, buffers) = mapped_device(config, 8);
        assert_eq!(buffers.len(), 3);
        assert_eq!(buffers[2].index, 2);
        assert_eq!(buffers[0].length(), 64 * 36 * 2);
    }

    #[test]
    fn fills_queued_buffers_in_fifo_order() -> Result<()> {
        let (device, buffers) = mapped_device(StubConfig::default(), 4);
        device.queue(2)?;
        device.queue(0)?;
        device.stream_on()?;

        let first = device.dequeue()?;
        let second = device.dequeue()?;
        assert_eq!((first.index, first.sequence), (2, 0));
        assert_eq!((second.index, second.sequence), (0, 1));
        assert!(matches!(device.dequeue(), Err(CaptureError::NoData)));

        let plane = &buffers[0].planes[0];
        let bytes = unsafe { std::slice::from_raw_parts(plane.as_ptr(), plane.len()) };
        assert_eq!(frame_sequence(bytes), Some(1));
        Ok(())
    }

    #[test]
    fn rejects_double_queue() -> Result<()> {
        let (device, _buffers) = mapped_device(StubConfig::default(), 2);
        device.queue(1)?;
        assert!(device.queue(1).is_err());
        assert!(device.queue(9).is_err());
        Ok(())
    }

    #[test]
    fn wait_ready_times_out_without_queued_buffers() -> Result<()> {
        let (device, _buffers) = mapped_device(StubConfig::default(), 2);
        device.stream_on()?;
        assert!(!device.wait_ready(Duration::from_millis(20))?);
        device.queue(0)?;
        assert!(device.wait_ready(Duration::from_millis(20))?);
        Ok(())
    }

    #[test]
    fn stream_off_returns_every_buffer() -> Result<()> {
        let (device, _buffers) = mapped_device(StubConfig::default(), 3);
        for index in 0..3 {
            device.queue(index)?;
        }
        assert_eq!(device.queued_len(), 3);
        device.stream_off()?;
        assert_eq!(device.queued_len(), 0);
        Ok(())
    }

    #[test]
    fn negotiate_keeps_unsupported_formats() -> Result<()> {
        let mut device = StubDevice::new("stub://test", StubConfig::default());
        let format = device.negotiate(&FormatRequest {
            width: Some(1280),
            height: Some(720),
            fourcc: Some(FourCc::new(b"MJPG")),
        })?;
        assert_eq!(format.resolution, Resolution::new(1280, 720));
        assert_eq!(format.fourcc, FourCc::UYVY);
        Ok(())
    }

    #[test]
    fn fail_after_simulates_io_error() -> Result<()> {
        let config = StubConfig {
            fail_after: Some(1),
            ..StubConfig::default()
        };
        let (device, _buffers) = mapped_device(config, 2);
        device.queue(0)?;
        device.queue(1)?;
        device.stream_on()?;
        device.dequeue()?;
        let err = device.dequeue().unwrap_err();
        assert!(!err.is_transient());
        Ok(())
    }

    #[test]
    fn unmap_frees_buffers() -> Result<()> {
        let (mut device, buffers) = mapped_device(StubConfig::default(), 2);
        device.unmap(buffers)?;
        assert!(device.queue(0).is_err());
        Ok(())
    }
}
