//! Capture sources.
//!
//! A capture source follows the V4L2 mmap streaming protocol:
//! - negotiate a format,
//! - request and map N indexed buffers (plane-aware),
//! - queue drained buffers to the driver, dequeue filled ones,
//! - start/stop streaming,
//! - poll for readiness with a timeout.
//!
//! Sources:
//! - `stub://` synthetic device (testing, demos)
//! - V4L2 device nodes (feature: v4l2)
//!
//! Buffer ownership bookkeeping lives in `BufferPool`, not here. Devices only
//! speak the protocol.

use anyhow::Result;
use std::ptr::NonNull;
use std::time::Duration;

use crate::error::CaptureError;
use crate::format::{FourCc, Resolution};

pub mod stub;
#[cfg(all(feature = "v4l2", target_os = "linux"))]
pub mod v4l2;

pub use stub::{StubConfig, StubDevice};
#[cfg(all(feature = "v4l2", target_os = "linux"))]
pub use v4l2::V4l2Device;

/// Format overrides applied during negotiation. `None` keeps the driver value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FormatRequest {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fourcc: Option<FourCc>,
}

/// Format the driver actually settled on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub resolution: Resolution,
    pub fourcc: FourCc,
}

/// One mapped plane of a device buffer.
///
/// The mapping stays valid until the owning device unmaps it. Access is
/// coordinated by buffer ownership: only the current owner (driver or
/// consumer) touches the bytes.
#[derive(Debug)]
pub struct MappedPlane {
    ptr: NonNull<u8>,
    len: usize,
    mem_offset: u32,
}

// The plane is a plain address range; ownership of the bytes is tracked by
// `BufferPool`.
unsafe impl Send for MappedPlane {}
unsafe impl Sync for MappedPlane {}

impl MappedPlane {
    /// # Safety
    ///
    /// `ptr` must point to `len` bytes that stay mapped until the creating
    /// device releases this plane.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize, mem_offset: u32) -> Self {
        Self {
            ptr,
            len,
            mem_offset,
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mem_offset(&self) -> u32 {
        self.mem_offset
    }
}

/// A device buffer and its mapped planes.
#[derive(Debug)]
pub struct MappedBuffer {
    pub index: u32,
    pub planes: Vec<MappedPlane>,
}

impl MappedBuffer {
    /// Length of the first plane, which carries packed 4:2:2 data.
    pub fn length(&self) -> usize {
        self.planes.first().map(MappedPlane::len).unwrap_or(0)
    }
}

/// A filled buffer handed back by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dequeued {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
}

/// Capture-source boundary.
///
/// Streaming operations take `&self` because buffer release may happen on the
/// processing thread while the capture thread waits for the next frame.
pub trait CaptureDevice: Send + Sync {
    /// Device path or URI, for logs.
    fn name(&self) -> &str;

    /// Apply format overrides and return what the driver accepted.
    fn negotiate(&mut self, request: &FormatRequest) -> Result<NegotiatedFormat>;

    /// Request `count` buffers and map them. The driver may grant fewer.
    fn request_buffers(&mut self, count: u32) -> Result<Vec<MappedBuffer>, CaptureError>;

    /// Hand a drained buffer to the driver.
    fn queue(&self, index: u32) -> Result<(), CaptureError>;

    /// Take the next filled buffer. `CaptureError::NoData` when none is ready.
    fn dequeue(&self) -> Result<Dequeued, CaptureError>;

    fn stream_on(&self) -> Result<(), CaptureError>;

    /// Stop streaming. The driver gives every queued buffer back.
    fn stream_off(&self) -> Result<(), CaptureError>;

    /// Wait until a filled buffer can be dequeued. `Ok(false)` on timeout.
    fn wait_ready(&self, timeout: Duration) -> Result<bool, CaptureError>;

    /// Unmap buffers returned by `request_buffers`.
    fn unmap(&mut self, buffers: Vec<MappedBuffer>) -> Result<(), CaptureError>;
}

/// Open the capture source named by `path`.
///
/// `stub://` paths build a synthetic device. Anything else is a V4L2 device
/// node and needs the `v4l2` feature.
pub fn open_device(path: &str, stub: StubConfig) -> Result<Box<dyn CaptureDevice>> {
    if path.starts_with("stub://") {
        return Ok(Box::new(StubDevice::new(path, stub)));
    }
    open_hardware_device(path)
}

#[cfg(all(feature = "v4l2", target_os = "linux"))]
fn open_hardware_device(path: &str) -> Result<Box<dyn CaptureDevice>> {
    Ok(Box::new(V4l2Device::open(path)?))
}

#[cfg(not(all(feature = "v4l2", target_os = "linux")))]
fn open_hardware_device(path: &str) -> Result<Box<dyn CaptureDevice>> {
    Err(anyhow::anyhow!(
        "cannot open {}: built without V4L2 support (enable the `v4l2` feature)",
        path
    ))
}
