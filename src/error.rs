//! Typed errors for the steady-state capture path.
//!
//! Initialization and orchestration use `anyhow`. The buffer protocol uses
//! `CaptureError` so the capture loop can tell a transient "no data yet" apart
//! from the fatal cases.

use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// The driver has no filled buffer yet. Retry.
    #[error("no frame ready")]
    NoData,

    /// The source did not signal readiness in time.
    #[error("capture source stalled: no frame within {0:?}")]
    Stalled(Duration),

    /// Buffer ownership no longer matches the driver's view.
    #[error("buffer {index} ownership desync: {reason}")]
    Desync { index: u32, reason: String },

    /// The device returned fewer buffers than the pipeline can rotate.
    #[error("insufficient buffer memory on {device}: granted {granted}, need at least {required}")]
    InsufficientBuffers {
        device: String,
        granted: u32,
        required: u32,
    },

    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl CaptureError {
    pub fn io(op: &'static str, source: io::Error) -> Self {
        CaptureError::Io { op, source }
    }

    pub fn desync(index: u32, reason: impl Into<String>) -> Self {
        CaptureError::Desync {
            index,
            reason: reason.into(),
        }
    }

    /// Only `NoData` is retried. Everything else ends the relay.
    pub fn is_transient(&self) -> bool {
        matches!(self, CaptureError::NoData)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("frame too short for {width}x{height}: expected {expected} bytes, got {actual}")]
    ShortFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("frame dimensions overflow: {width}x{height}")]
    Overflow { width: u32, height: u32 },
}
