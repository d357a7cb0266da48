use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::bus::BusError;

/// Pixel formats a bus frame can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// YCbCr 4:2:2, 16 bits per pixel
    Uyvy,
    /// UYVY plane followed by an 8-bit alpha plane
    Uyva,
    Bgra,
    Bgrx,
    Rgba,
    Rgbx,
}

impl PixelFormat {
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Uyvy => *b"UYVY",
            PixelFormat::Uyva => *b"UYVA",
            PixelFormat::Bgra => *b"BGRA",
            PixelFormat::Bgrx => *b"BGRX",
            PixelFormat::Rgba => *b"RGBA",
            PixelFormat::Rgbx => *b"RGBX",
        }
    }

    pub fn from_fourcc(code: [u8; 4]) -> Option<Self> {
        match &code {
            b"UYVY" => Some(PixelFormat::Uyvy),
            b"UYVA" => Some(PixelFormat::Uyva),
            b"BGRA" => Some(PixelFormat::Bgra),
            b"BGRX" => Some(PixelFormat::Bgrx),
            b"RGBA" => Some(PixelFormat::Rgba),
            b"RGBX" => Some(PixelFormat::Rgbx),
            _ => None,
        }
    }

    /// Bytes per pixel of the primary plane
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Uyvy | PixelFormat::Uyva => 2,
            _ => 4,
        }
    }

    /// True for the 32-bit RGB(A) layouts the preview cache stores as-is
    pub fn is_rgba_layout(self) -> bool {
        matches!(self, PixelFormat::Rgba | PixelFormat::Rgbx)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.fourcc();
        f.write_str(std::str::from_utf8(&code).unwrap_or("????"))
    }
}

/// Frame rate as an exact rational.
///
/// Broadcast rates such as 29.97 are not representable as floats without
/// drift, so the numerator/denominator pair is carried end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRate {
    pub numerator: i32,
    pub denominator: i32,
}

impl FrameRate {
    pub const NTSC_24: FrameRate = FrameRate::new(24000, 1001);
    pub const NTSC_30: FrameRate = FrameRate::new(30000, 1001);
    pub const NTSC_60: FrameRate = FrameRate::new(60000, 1001);

    pub const fn new(numerator: i32, denominator: i32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Map a decoder-reported fps to the nearest broadcast rational.
    ///
    /// The value is truncated to hundredths before lookup, so 23.976 maps to
    /// the 23.97 row. Unlisted rates fall back to 30000/1001.
    pub fn from_fps(fps: f64) -> Self {
        if !fps.is_finite() || fps <= 0.0 {
            return Self::NTSC_30;
        }

        let hundredths = (fps * 100.0 + 1e-6).floor() as i64;
        match hundredths {
            2397 => Self::NTSC_24,
            2997 => Self::NTSC_30,
            3000 => Self::new(30000, 1000),
            5994 => Self::NTSC_60,
            6000 => Self::new(60000, 3000),
            _ => Self::NTSC_30,
        }
    }

    pub fn as_f64(self) -> f64 {
        if self.denominator == 0 {
            return 0.0;
        }
        self.numerator as f64 / self.denominator as f64
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

/// Scan layout of a video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrameFormat {
    /// Field 0 on even lines, field 1 on odd lines
    Interleaved,
    #[default]
    Progressive,
    Field0,
    Field1,
}

/// A video frame with its pixel data.
///
/// `data` is a reference-counted view, so handing the frame to a sender
/// shares the allocation instead of copying it.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub frame_rate: FrameRate,
    pub frame_format: FrameFormat,
    /// Bytes between the start of consecutive rows
    pub stride: u32,
    /// Timecode in 100 ns units
    pub timecode: Option<i64>,
    /// Sender-side submission time in 100 ns units
    pub timestamp: Option<i64>,
    pub data: Bytes,
}

impl VideoFrame {
    /// Build a frame with a tightly packed stride, checking the buffer length
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        frame_rate: FrameRate,
        data: Bytes,
    ) -> Result<Self, BusError> {
        let Some(stride) = width.checked_mul(format.bytes_per_pixel()) else {
            return Err(BusError::InvalidFrame(format!(
                "{}x{} {} row size overflows",
                width, height, format
            )));
        };
        Self::with_stride(width, height, stride, format, frame_rate, data)
    }

    pub fn with_stride(
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
        frame_rate: FrameRate,
        data: Bytes,
    ) -> Result<Self, BusError> {
        let min_stride = width.checked_mul(format.bytes_per_pixel());
        if width == 0 || height == 0 || min_stride.map_or(true, |min| stride < min) {
            return Err(BusError::InvalidFrame(format!(
                "{}x{} {} with stride {}",
                width, height, format, stride
            )));
        }

        let frame = Self {
            width,
            height,
            format,
            frame_rate,
            frame_format: FrameFormat::Progressive,
            stride,
            timecode: None,
            timestamp: None,
            data,
        };

        let expected = frame.expected_len();
        if frame.data.len() != expected {
            return Err(BusError::BufferLength {
                expected,
                actual: frame.data.len(),
            });
        }

        Ok(frame)
    }

    pub fn frame_format(mut self, frame_format: FrameFormat) -> Self {
        self.frame_format = frame_format;
        self
    }

    pub fn timecode(mut self, timecode: i64) -> Self {
        self.timecode = Some(timecode);
        self
    }

    /// `stride × height`, plus the trailing alpha plane for UYVA
    pub fn expected_len(&self) -> usize {
        let primary = self.stride as usize * self.height as usize;
        match self.format {
            PixelFormat::Uyva => primary + self.width as usize * self.height as usize,
            _ => primary,
        }
    }

    /// Outgoing copy of this frame's format that shares the same pixel bytes
    pub fn relay(&self) -> VideoFrame {
        VideoFrame {
            width: self.width,
            height: self.height,
            format: self.format,
            frame_rate: self.frame_rate,
            frame_format: self.frame_format,
            stride: self.stride,
            timecode: None,
            timestamp: None,
            data: self.data.clone(),
        }
    }

    /// Pixel rows with stride padding removed, as owned bytes
    pub fn packed_rows(&self) -> Vec<u8> {
        let row = self.width as usize * self.format.bytes_per_pixel() as usize;
        let stride = self.stride as usize;
        let plane = &self.data[..stride * self.height as usize];

        if row == stride {
            return plane.to_vec();
        }

        let mut packed = Vec::with_capacity(row * self.height as usize);
        for line in plane.chunks_exact(stride) {
            packed.extend_from_slice(&line[..row]);
        }
        packed
    }
}

/// Interleaved 32-bit float audio
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u32,
    pub samples_per_channel: u32,
    pub timecode: Option<i64>,
    pub data: std::sync::Arc<[f32]>,
}

impl AudioFrame {
    /// Build a frame from interleaved samples; samples per channel is derived
    pub fn interleaved(
        sample_rate: u32,
        channels: u32,
        samples: Vec<f32>,
    ) -> Result<Self, BusError> {
        if channels == 0 || sample_rate == 0 {
            return Err(BusError::InvalidFrame(format!(
                "audio with {} channels at {} Hz",
                channels, sample_rate
            )));
        }

        Ok(Self {
            sample_rate,
            channels,
            samples_per_channel: (samples.len() / channels as usize) as u32,
            timecode: None,
            data: samples.into(),
        })
    }
}

/// Per-frame metadata, XML by convention
#[derive(Debug, Clone)]
pub struct MetadataFrame {
    pub timecode: Option<i64>,
    pub data: String,
}

/// Result of a single capture call
#[derive(Debug, Clone)]
pub enum Frame {
    /// Nothing arrived within the timeout
    None,
    Video(VideoFrame),
    Audio(AudioFrame),
    Metadata(MetadataFrame),
    /// The receiver reported an error (usually a lost connection)
    Error,
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::None => "none",
            Frame::Video(_) => "video",
            Frame::Audio(_) => "audio",
            Frame::Metadata(_) => "metadata",
            Frame::Error => "error",
        }
    }
}
