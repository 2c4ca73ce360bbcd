//! Frame sinks (network transmitters).
//!
//! A sink publishes a named video stream and accepts packed UYVY frames:
//! - `send_sync` blocks until the sink is done with the memory,
//! - `send_async` returns at once, and the caller keeps the memory valid and
//!   unmodified until the next send on the same sink,
//! - `has_receivers` probes for attached receivers with a timeout.
//!
//! Sinks:
//! - `stub` recording sink (tests, dry runs)
//! - NDI sender (feature: ndi)

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SinkKind;
use crate::format::{FourCc, FrameRate, Resolution};

#[cfg(feature = "ndi")]
pub mod ndi;
pub mod stub;

#[cfg(feature = "ndi")]
pub use ndi::NdiSender;
pub use stub::{SendMode, StubSink, Submission};

/// Transmission descriptor for one frame.
#[derive(Clone, Copy, Debug)]
pub struct OutgoingFrame<'a> {
    pub resolution: Resolution,
    pub frame_rate: FrameRate,
    pub fourcc: FourCc,
    pub data: &'a [u8],
}

impl<'a> OutgoingFrame<'a> {
    /// A packed UYVY frame, the only layout sinks accept.
    pub fn uyvy(resolution: Resolution, frame_rate: FrameRate, data: &'a [u8]) -> Self {
        Self {
            resolution,
            frame_rate,
            fourcc: FourCc::UYVY,
            data,
        }
    }

    /// Bytes per line of packed 4:2:2.
    pub fn line_stride(&self) -> u32 {
        self.resolution.width.saturating_mul(2)
    }
}

pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    /// Wait up to `timeout` for at least one receiver. `false` when none.
    fn has_receivers(&self, timeout: Duration) -> bool;

    /// Send and block until the sink has consumed `frame.data`.
    ///
    /// Also completes any outstanding asynchronous send.
    fn send_sync(&self, frame: &OutgoingFrame<'_>) -> Result<()>;

    /// Queue a frame and return immediately.
    ///
    /// # Safety
    ///
    /// `frame.data` must stay valid and unmodified until the next
    /// `send_async`, `send_sync` or `flush` call on this sink returns.
    unsafe fn send_async(&self, frame: &OutgoingFrame<'_>) -> Result<()>;

    /// Wait until the sink no longer references any asynchronously sent
    /// memory.
    fn flush(&self) -> Result<()>;
}

/// Open the sink selected by `kind`, publishing `stream_name`.
pub fn open_sink(
    kind: SinkKind,
    stream_name: &str,
    ndi_library: Option<&Path>,
) -> Result<Arc<dyn Sink>> {
    match kind {
        SinkKind::Stub => {
            log::info!("sink: publishing {} on the stub sink", stream_name);
            Ok(Arc::new(StubSink::new(stream_name)))
        }
        SinkKind::Ndi => open_ndi(stream_name, ndi_library),
    }
}

#[cfg(feature = "ndi")]
fn open_ndi(stream_name: &str, ndi_library: Option<&Path>) -> Result<Arc<dyn Sink>> {
    Ok(Arc::new(NdiSender::create(stream_name, ndi_library)?))
}

#[cfg(not(feature = "ndi"))]
fn open_ndi(stream_name: &str, _ndi_library: Option<&Path>) -> Result<Arc<dyn Sink>> {
    Err(anyhow::anyhow!(
        "cannot publish {}: built without NDI support (enable the `ndi` feature)",
        stream_name
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uyvy_frames_use_two_bytes_per_pixel() {
        let data = [0u8; 8];
        let frame = OutgoingFrame::uyvy(Resolution::new(2, 2), FrameRate::default(), &data);
        assert_eq!(frame.line_stride(), 4);
        assert_eq!(frame.fourcc, FourCc::UYVY);
    }

    #[test]
    fn stub_sink_opens_by_kind() -> Result<()> {
        let sink = open_sink(SinkKind::Stub, "Stream", None)?;
        assert_eq!(sink.name(), "Stream");
        Ok(())
    }

    #[cfg(not(feature = "ndi"))]
    #[test]
    fn ndi_needs_the_feature() {
        let err = open_sink(SinkKind::Ndi, "Stream", None)
            .err()
            .expect("ndi without feature");
        assert!(err.to_string().contains("ndi"));
    }
}
