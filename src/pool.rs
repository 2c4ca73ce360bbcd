//! Buffer pool: mapped capture memory and its ownership bookkeeping.
//!
//! Every buffer is owned either by the driver (queued, being filled) or by the
//! consumer (dequeued, being read or transmitted). Ownership alternates
//! strictly per index:
//! - `acquire()` moves one buffer Driver -> Consumer and hands out a
//!   `CapturedFrame` token.
//! - `release(frame)` consumes the token and moves the buffer back.
//!
//! `CapturedFrame` is move-only, and the byte views it unlocks borrow it. A
//! frame therefore cannot be released twice, and its bytes cannot be read
//! after release.

use anyhow::{Context, Result};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::capture::{CaptureDevice, MappedBuffer};
use crate::error::CaptureError;

/// Fewest buffers the relay can rotate (one filling, one draining).
pub const MIN_BUFFERS: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    Driver,
    Consumer,
}

/// A filled buffer on loan from the pool.
///
/// The holder must hand it back through `BufferPool::release` (directly or via
/// a `FrameRecycler`).
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a captured frame must be released back to the pool"]
pub struct CapturedFrame {
    index: u32,
    bytes_used: u32,
    sequence: u32,
}

impl CapturedFrame {
    pub(crate) fn new(index: u32, bytes_used: u32, sequence: u32) -> Self {
        Self {
            index,
            bytes_used,
            sequence,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn bytes_used(&self) -> u32 {
        self.bytes_used
    }

    /// Driver sequence number of the fill.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// Anything that takes drained frames back.
///
/// `BufferPool` is the production implementation. The frame queue only needs
/// this to return evicted frames.
pub trait FrameRecycler: Send + Sync {
    fn recycle(&self, frame: CapturedFrame) -> Result<(), CaptureError>;
}

pub struct BufferPool {
    device: Box<dyn CaptureDevice>,
    buffers: Vec<MappedBuffer>,
    ownership: Mutex<Vec<Ownership>>,
}

impl BufferPool {
    /// Request `count` buffers from the device and map them.
    ///
    /// Buffers start consumer-owned; `start()` hands them to the driver.
    pub fn init(mut device: Box<dyn CaptureDevice>, count: u32) -> Result<Self> {
        let buffers = device
            .request_buffers(count)
            .with_context(|| format!("request {} buffers from {}", count, device.name()))?;
        let granted = buffers.len() as u32;
        if granted < MIN_BUFFERS {
            let name = device.name().to_string();
            if let Err(err) = device.unmap(buffers) {
                log::warn!("BufferPool: unmap after short grant failed: {}", err);
            }
            return Err(CaptureError::InsufficientBuffers {
                device: name,
                granted,
                required: MIN_BUFFERS,
            }
            .into());
        }
        for buffer in &buffers {
            log::debug!(
                "BufferPool: buffer {} mapped, {} plane(s), {} bytes",
                buffer.index,
                buffer.planes.len(),
                buffer.length()
            );
        }
        log::info!(
            "BufferPool: {} buffers mapped on {} ({} requested)",
            granted,
            device.name(),
            count
        );
        Ok(Self {
            device,
            ownership: Mutex::new(vec![Ownership::Consumer; buffers.len()]),
            buffers,
        })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Queue every buffer and start streaming.
    pub fn start(&self) -> Result<(), CaptureError> {
        for buffer in &self.buffers {
            self.release_index(buffer.index)?;
            log::debug!("BufferPool: queued buffer {}", buffer.index);
        }
        self.device.stream_on()
    }

    /// Stop streaming. The driver hands every buffer back, so all indices
    /// become consumer-owned.
    pub fn stop(&self) -> Result<(), CaptureError> {
        self.device.stream_off()?;
        let mut ownership = self.lock();
        for state in ownership.iter_mut() {
            *state = Ownership::Consumer;
        }
        Ok(())
    }

    /// Block until the driver has a filled buffer. `Ok(false)` on timeout.
    pub fn wait_ready(&self, timeout: Duration) -> Result<bool, CaptureError> {
        self.device.wait_ready(timeout)
    }

    /// Take the next filled buffer from the driver.
    pub fn acquire(&self) -> Result<CapturedFrame, CaptureError> {
        let dequeued = self.device.dequeue()?;
        let mut ownership = self.lock();
        let state = ownership.get_mut(dequeued.index as usize).ok_or_else(|| {
            CaptureError::desync(dequeued.index, "driver returned an unknown buffer index")
        })?;
        if *state != Ownership::Driver {
            return Err(CaptureError::desync(
                dequeued.index,
                "driver returned a buffer the consumer already owns",
            ));
        }
        *state = Ownership::Consumer;
        let length = self.buffers[dequeued.index as usize].length() as u32;
        Ok(CapturedFrame::new(
            dequeued.index,
            dequeued.bytes_used.min(length),
            dequeued.sequence,
        ))
    }

    /// Hand a drained buffer back to the driver.
    pub fn release(&self, frame: CapturedFrame) -> Result<(), CaptureError> {
        self.release_index(frame.index)
    }

    fn release_index(&self, index: u32) -> Result<(), CaptureError> {
        let mut ownership = self.lock();
        let state = ownership
            .get_mut(index as usize)
            .ok_or_else(|| CaptureError::desync(index, "release of an unknown buffer index"))?;
        if *state != Ownership::Consumer {
            return Err(CaptureError::desync(
                index,
                "release of a buffer the driver already owns",
            ));
        }
        // Queue while holding the lock so a concurrent acquire cannot observe
        // the buffer as driver-owned before the driver has it.
        self.device.queue(index)?;
        *state = Ownership::Driver;
        Ok(())
    }

    /// Filled bytes of a captured frame.
    pub fn bytes<'a>(&'a self, frame: &'a CapturedFrame) -> &'a [u8] {
        let plane = &self.buffers[frame.index as usize].planes[0];
        let len = (frame.bytes_used as usize).min(plane.len());
        // SAFETY: the frame token proves consumer ownership; the driver does
        // not touch the buffer until the token is released, and the mapping
        // outlives `self`.
        unsafe { std::slice::from_raw_parts(plane.as_ptr(), len) }
    }

    /// Mutable view of a captured frame, for in-place conversion.
    pub fn bytes_mut<'a>(&'a self, frame: &'a mut CapturedFrame) -> &'a mut [u8] {
        let plane = &self.buffers[frame.index as usize].planes[0];
        let len = (frame.bytes_used as usize).min(plane.len());
        // SAFETY: as in `bytes`, and the exclusive borrow of the unique token
        // rules out any other view of this buffer.
        unsafe { std::slice::from_raw_parts_mut(plane.as_ptr(), len) }
    }

    /// Mapped length of a buffer, regardless of how much was filled.
    pub fn buffer_len(&self, index: u32) -> Option<usize> {
        self.buffers.get(index as usize).map(MappedBuffer::length)
    }

    pub fn ownership(&self, index: u32) -> Option<Ownership> {
        self.lock().get(index as usize).copied()
    }

    pub fn driver_owned(&self) -> usize {
        self.lock()
            .iter()
            .filter(|state| **state == Ownership::Driver)
            .count()
    }

    pub fn consumer_owned(&self) -> usize {
        self.len() - self.driver_owned()
    }

    /// Unmap every buffer.
    pub fn teardown(mut self) -> Result<(), CaptureError> {
        self.unmap_all()
    }

    fn unmap_all(&mut self) -> Result<(), CaptureError> {
        if self.buffers.is_empty() {
            return Ok(());
        }
        let buffers = std::mem::take(&mut self.buffers);
        log::debug!("BufferPool: unmapping {} buffers", buffers.len());
        self.device.unmap(buffers)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Ownership>> {
        self.ownership.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FrameRecycler for BufferPool {
    fn recycle(&self, frame: CapturedFrame) -> Result<(), CaptureError> {
        self.release(frame)
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Err(err) = self.unmap_all() {
            log::error!("BufferPool: unmap failed: {}", err);
        }
    }
}
