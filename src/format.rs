//! Pixel encodings and format negotiation.
//!
//! The device is free to coerce a format request. `negotiate` always returns
//! what the driver actually selected; buffer sizing and any downstream
//! conversion must use that, never the request.

use std::fmt;
use std::str::FromStr;

use crate::device::{DeviceHandle, VideoBackend};
use crate::error::{CaptureError, Result};

/// Four-character pixel format code as used by V4L2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// Little-endian packing used by the kernel (`v4l2_fourcc`).
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub fn from_u32(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() { b as char } else { '.' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// Byte layout of the pixels a device produces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PixelEncoding {
    /// Packed 4:2:2, Y0 U Y1 V.
    #[default]
    Yuyv,
    /// Packed 4:2:2, U Y0 V Y1.
    Uyvy,
    /// Semi-planar 4:2:0.
    Nv12,
    Rgb24,
    Bgr24,
    Grey,
    /// Compressed; `bytes_used` varies per frame.
    Mjpeg,
    Other(FourCC),
}

impl PixelEncoding {
    pub fn fourcc(self) -> FourCC {
        match self {
            PixelEncoding::Yuyv => FourCC::new(b"YUYV"),
            PixelEncoding::Uyvy => FourCC::new(b"UYVY"),
            PixelEncoding::Nv12 => FourCC::new(b"NV12"),
            PixelEncoding::Rgb24 => FourCC::new(b"RGB3"),
            PixelEncoding::Bgr24 => FourCC::new(b"BGR3"),
            PixelEncoding::Grey => FourCC::new(b"GREY"),
            PixelEncoding::Mjpeg => FourCC::new(b"MJPG"),
            PixelEncoding::Other(code) => code,
        }
    }

    pub fn from_fourcc(code: FourCC) -> Self {
        match &code.0 {
            b"YUYV" => PixelEncoding::Yuyv,
            b"UYVY" => PixelEncoding::Uyvy,
            b"NV12" => PixelEncoding::Nv12,
            b"RGB3" => PixelEncoding::Rgb24,
            b"BGR3" => PixelEncoding::Bgr24,
            b"GREY" => PixelEncoding::Grey,
            b"MJPG" => PixelEncoding::Mjpeg,
            _ => PixelEncoding::Other(code),
        }
    }

    /// Bytes per line for packed and planar encodings, `None` when compressed or unknown.
    pub fn bytes_per_line(self, width: u32) -> Option<u32> {
        match self {
            PixelEncoding::Yuyv | PixelEncoding::Uyvy => width.checked_mul(2),
            PixelEncoding::Rgb24 | PixelEncoding::Bgr24 => width.checked_mul(3),
            PixelEncoding::Nv12 | PixelEncoding::Grey => Some(width),
            PixelEncoding::Mjpeg | PixelEncoding::Other(_) => None,
        }
    }

    /// Size of one uncompressed image, `None` when compressed or unknown.
    pub fn image_size(self, width: u32, height: u32) -> Option<u32> {
        match self {
            PixelEncoding::Nv12 => width
                .checked_mul(height)
                .and_then(|luma| luma.checked_add(luma / 2)),
            _ => self
                .bytes_per_line(width)
                .and_then(|stride| stride.checked_mul(height)),
        }
    }
}

impl fmt::Display for PixelEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fourcc())
    }
}

impl FromStr for PixelEncoding {
    type Err = String;

    /// Accepts the common names (`yuyv`, `mjpeg`, `rgb24`, ...) or any
    /// four-character code.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let named = match trimmed.to_ascii_lowercase().as_str() {
            "yuyv" | "yuy2" => Some(PixelEncoding::Yuyv),
            "uyvy" => Some(PixelEncoding::Uyvy),
            "nv12" => Some(PixelEncoding::Nv12),
            "rgb24" | "rgb3" => Some(PixelEncoding::Rgb24),
            "bgr24" | "bgr3" => Some(PixelEncoding::Bgr24),
            "grey" | "gray" => Some(PixelEncoding::Grey),
            "mjpeg" | "mjpg" => Some(PixelEncoding::Mjpeg),
            _ => None,
        };
        if let Some(encoding) = named {
            return Ok(encoding);
        }
        let bytes = trimmed.as_bytes();
        if bytes.len() == 4 && bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            let mut code = [0u8; 4];
            code.copy_from_slice(bytes);
            return Ok(PixelEncoding::from_fourcc(FourCC(code)));
        }
        Err(format!("unknown pixel format {trimmed:?}"))
    }
}

/// What the caller asks the device for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatRequest {
    pub width: u32,
    pub height: u32,
    pub encoding: PixelEncoding,
}

impl Default for FormatRequest {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            encoding: PixelEncoding::Yuyv,
        }
    }
}

/// The format the device actually selected. Fixed once negotiated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub encoding: PixelEncoding,
    pub bytes_per_line: u32,
    /// Driver's upper bound for one frame.
    pub size_image: u32,
}

impl CaptureFormat {
    /// True when the device honoured geometry and encoding exactly.
    pub fn matches(&self, request: &FormatRequest) -> bool {
        self.width == request.width
            && self.height == request.height
            && self.encoding == request.encoding
    }
}

impl fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.encoding)
    }
}

/// Issue a format-set request and read back what the device chose.
///
/// Only a failing call is an error; a coerced format is not.
pub fn negotiate<B: VideoBackend>(
    device: &mut DeviceHandle<B>,
    request: &FormatRequest,
) -> Result<CaptureFormat> {
    let actual = device
        .backend_mut()
        .set_format(request)
        .map_err(|source| CaptureError::DeviceRejectedFormat { source })?;

    if actual.matches(request) {
        log::debug!("Negotiator: {} accepted {}", device.path(), actual);
    } else {
        log::warn!(
            "Negotiator: {} coerced {}x{} {} to {}",
            device.path(),
            request.width,
            request.height,
            request.encoding,
            actual
        );
    }
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trips_through_kernel_packing() {
        // V4L2_PIX_FMT_YUYV
        assert_eq!(PixelEncoding::Yuyv.fourcc().to_u32(), 0x5659_5559);
        assert_eq!(
            PixelEncoding::from_fourcc(FourCC::from_u32(0x4750_4a4d)),
            PixelEncoding::Mjpeg
        );
    }

    #[test]
    fn parses_names_and_raw_codes() {
        assert_eq!("yuyv".parse::<PixelEncoding>(), Ok(PixelEncoding::Yuyv));
        assert_eq!("MJPG".parse::<PixelEncoding>(), Ok(PixelEncoding::Mjpeg));
        assert_eq!(
            "H264".parse::<PixelEncoding>(),
            Ok(PixelEncoding::Other(FourCC::new(b"H264")))
        );
        assert!("not-a-format".parse::<PixelEncoding>().is_err());
    }

    #[test]
    fn image_sizes_follow_layout() {
        assert_eq!(PixelEncoding::Yuyv.image_size(640, 480), Some(614_400));
        assert_eq!(PixelEncoding::Nv12.image_size(4, 2), Some(12));
        assert_eq!(PixelEncoding::Mjpeg.image_size(640, 480), None);
    }
}
