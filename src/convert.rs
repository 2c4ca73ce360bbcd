//! Pixel-format conversion to the sink's UYVY layout.
//!
//! Packed 4:2:2 YUYV (`Y0 U Y1 V`) and UYVY (`U Y0 V Y1`) differ only in
//! byte order within each luma/chroma pair, so the conversion is an in-place
//! pairwise swap.

use anyhow::{anyhow, Result};

use crate::error::ConvertError;
use crate::format::{FourCc, Resolution};

/// Per-frame transform applied before submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Conversion {
    Passthrough,
    YuyvToUyvy,
}

impl Conversion {
    /// Pick the transform for frames arriving in `fourcc`.
    pub fn for_source(fourcc: FourCc) -> Result<Self> {
        if fourcc == FourCc::UYVY {
            Ok(Conversion::Passthrough)
        } else if fourcc == FourCc::YUYV {
            Ok(Conversion::YuyvToUyvy)
        } else {
            Err(anyhow!(
                "unsupported capture pixel format {} (expected UYVY or YUYV)",
                fourcc
            ))
        }
    }

    pub fn is_passthrough(&self) -> bool {
        *self == Conversion::Passthrough
    }

    pub fn apply(&self, data: &mut [u8], resolution: Resolution) -> Result<(), ConvertError> {
        match self {
            Conversion::Passthrough => Ok(()),
            Conversion::YuyvToUyvy => yuyv_to_uyvy_in_place(data, resolution),
        }
    }
}

/// Convert one YUYV frame to UYVY in place.
///
/// Only the first `width * height * 2` bytes are touched; drivers may pad the
/// buffer past the image.
pub fn yuyv_to_uyvy_in_place(data: &mut [u8], resolution: Resolution) -> Result<(), ConvertError> {
    let Resolution { width, height } = resolution;
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(2))
        .ok_or(ConvertError::Overflow { width, height })?;
    if data.len() < expected {
        return Err(ConvertError::ShortFrame {
            width,
            height,
            expected,
            actual: data.len(),
        });
    }
    for pair in data[..expected].chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swaps_luma_and_chroma() -> Result<(), ConvertError> {
        // Y0 U Y1 V for a 2x1 image.
        let mut frame = [0x10, 0x80, 0x20, 0x90];
        yuyv_to_uyvy_in_place(&mut frame, Resolution::new(2, 1))?;
        assert_eq!(frame, [0x80, 0x10, 0x90, 0x20]);
        Ok(())
    }

    #[test]
    fn leaves_padding_alone() -> Result<(), ConvertError> {
        let mut frame = [1, 2, 3, 4, 0xEE, 0xFF];
        yuyv_to_uyvy_in_place(&mut frame, Resolution::new(2, 1))?;
        assert_eq!(frame, [2, 1, 4, 3, 0xEE, 0xFF]);
        Ok(())
    }

    #[test]
    fn short_frame_is_an_error() {
        let mut frame = [0u8; 6];
        let err = yuyv_to_uyvy_in_place(&mut frame, Resolution::new(2, 2)).unwrap_err();
        assert_eq!(
            err,
            ConvertError::ShortFrame {
                width: 2,
                height: 2,
                expected: 8,
                actual: 6
            }
        );
        assert_eq!(frame, [0u8; 6]);
    }

    #[test]
    fn conversion_follows_source_format() -> Result<()> {
        assert_eq!(Conversion::for_source(FourCc::UYVY)?, Conversion::Passthrough);
        assert_eq!(Conversion::for_source(FourCc::YUYV)?, Conversion::YuyvToUyvy);
        assert!(Conversion::for_source(FourCc::new(b"MJPG")).is_err());
        Ok(())
    }
}
