//! Pixel format, resolution and frame-rate types shared by the capture and
//! sink sides of the relay.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Four-character pixel format code, stored in V4L2/NDI byte order.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const UYVY: FourCc = FourCc(*b"UYVY");
    pub const YUYV: FourCc = FourCc(*b"YUYV");

    pub const fn new(code: &[u8; 4]) -> Self {
        FourCc(*code)
    }

    /// Little-endian packed code, as used by `v4l2_fourcc()` and the NDI SDK.
    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub const fn from_u32(code: u32) -> Self {
        FourCc(code.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b == 0 {
                break;
            }
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({})", self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Byte size of one packed 4:2:2 frame (2 bytes per pixel).
    pub fn packed_422_len(&self) -> usize {
        self.width as usize * self.height as usize * 2
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Frame rate as a rational `numerator / denominator` frames per second.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRate {
    pub numerator: u32,
    pub denominator: u32,
}

impl FrameRate {
    pub const NTSC_30: FrameRate = FrameRate {
        numerator: 30_000,
        denominator: 1_001,
    };

    pub fn new(numerator: u32, denominator: u32) -> Result<Self> {
        let rate = Self {
            numerator,
            denominator,
        };
        rate.validate()?;
        Ok(rate)
    }

    pub fn validate(&self) -> Result<()> {
        if self.numerator == 0 {
            return Err(anyhow!("frame rate numerator must be greater than zero"));
        }
        if self.denominator == 0 {
            return Err(anyhow!("frame rate denominator must be greater than zero"));
        }
        Ok(())
    }

    /// Nominal time between two frames.
    pub fn frame_interval(&self) -> Duration {
        if self.numerator == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(
            (self.denominator as u64 * 1_000_000_000) / self.numerator as u64,
        )
    }

    pub fn as_f64(&self) -> f64 {
        self.numerator as f64 / self.denominator.max(1) as f64
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::NTSC_30
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Pixel format requested from the capture device.
///
/// The sink accepts UYVY only. `Yuyv` frames are converted before submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    /// Keep whatever format the driver is currently configured for.
    #[default]
    Native,
    Uyvy,
    Yuyv,
}

impl CaptureFormat {
    /// Format to request from the driver, if any.
    pub fn requested_fourcc(&self) -> Option<FourCc> {
        match self {
            CaptureFormat::Native => None,
            CaptureFormat::Uyvy => Some(FourCc::UYVY),
            CaptureFormat::Yuyv => Some(FourCc::YUYV),
        }
    }
}
