//! Media decoding boundary and a still-image implementation

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbaImage;
use tracing::info;

/// One decoded RGBA video frame
#[derive(Debug, Clone)]
pub struct DecodedVideo {
    pub width: u32,
    pub height: u32,
    /// Frame rate as reported by the decoder
    pub fps: f64,
    pub pixels: Vec<u8>,
}

/// One decoded chunk of interleaved f32 audio
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub channels: u32,
    pub samples: Vec<f32>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to open {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("decode failed: {0}")]
    Decode(String),
}

/// Sample format requested from the audio decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    F32,
}

pub trait VideoStream: Send {
    /// Next frame, or `None` at end of stream
    fn next_frame(&mut self) -> Result<Option<DecodedVideo>, DecodeError>;
}

pub trait AudioStream: Send {
    /// Next chunk, or `None` at end of stream
    fn next_chunk(&mut self) -> Result<Option<DecodedAudio>, DecodeError>;
}

/// Opens media files as independent video and audio streams
pub trait MediaDecoder: Send + Sync {
    type Video: VideoStream;
    type Audio: AudioStream;

    fn open_video(&self, path: &Path) -> Result<Self::Video, DecodeError>;

    fn open_audio(&self, path: &Path, format: SampleFormat) -> Result<Self::Audio, DecodeError>;
}

/// Plays a single image as a fixed-length clip with a silent soundtrack.
///
/// With an empty path the decoder serves the image it was built with;
/// otherwise the file is decoded on every open.
#[derive(Clone)]
pub struct StillImageDecoder {
    fallback: Option<Arc<RgbaImage>>,
    fps: f64,
    frames: u32,
    sample_rate: u32,
    channels: u32,
}

impl StillImageDecoder {
    pub fn new(fps: f64, frames: u32) -> Self {
        Self {
            fallback: None,
            fps,
            frames,
            sample_rate: 48000,
            channels: 2,
        }
    }

    /// Serve `image` when opened with an empty path
    pub fn with_image(mut self, image: RgbaImage) -> Self {
        self.fallback = Some(Arc::new(image));
        self
    }

    pub fn with_audio(mut self, sample_rate: u32, channels: u32) -> Self {
        self.sample_rate = sample_rate;
        self.channels = channels;
        self
    }

    fn load(&self, path: &Path) -> Result<Arc<RgbaImage>, DecodeError> {
        if path.as_os_str().is_empty() {
            return self.fallback.clone().ok_or_else(|| DecodeError::Open {
                path: path.to_path_buf(),
                reason: "no image configured".into(),
            });
        }

        let image = image::open(path).map_err(|e| DecodeError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        info!(
            path = %path.display(),
            width = image.width(),
            height = image.height(),
            "Still image loaded"
        );
        Ok(Arc::new(image.into_rgba8()))
    }
}

/// Horizontal gradient used when no image is configured
pub fn gradient(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        let r = (x * 255 / width.max(1)) as u8;
        let g = (y * 255 / height.max(1)) as u8;
        image::Rgba([r, g, 128, 255])
    })
}

impl MediaDecoder for StillImageDecoder {
    type Video = StillVideo;
    type Audio = SilentAudio;

    fn open_video(&self, path: &Path) -> Result<StillVideo, DecodeError> {
        Ok(StillVideo {
            image: self.load(path)?,
            fps: self.fps,
            remaining: self.frames,
        })
    }

    fn open_audio(&self, path: &Path, format: SampleFormat) -> Result<SilentAudio, DecodeError> {
        let SampleFormat::F32 = format;
        if !path.as_os_str().is_empty() && !path.exists() {
            return Err(DecodeError::Open {
                path: path.to_path_buf(),
                reason: "file not found".into(),
            });
        }

        // One chunk per video frame so both streams have the same duration
        let per_frame = if self.fps > 0.0 {
            (self.sample_rate as f64 / self.fps).round() as usize
        } else {
            0
        };

        Ok(SilentAudio {
            sample_rate: self.sample_rate,
            channels: self.channels,
            chunk_len: per_frame * self.channels as usize,
            remaining: self.frames,
        })
    }
}

pub struct StillVideo {
    image: Arc<RgbaImage>,
    fps: f64,
    remaining: u32,
}

impl VideoStream for StillVideo {
    fn next_frame(&mut self) -> Result<Option<DecodedVideo>, DecodeError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;

        Ok(Some(DecodedVideo {
            width: self.image.width(),
            height: self.image.height(),
            fps: self.fps,
            pixels: self.image.as_raw().clone(),
        }))
    }
}

pub struct SilentAudio {
    sample_rate: u32,
    channels: u32,
    chunk_len: usize,
    remaining: u32,
}

impl AudioStream for SilentAudio {
    fn next_chunk(&mut self) -> Result<Option<DecodedAudio>, DecodeError> {
        if self.remaining == 0 || self.chunk_len == 0 {
            return Ok(None);
        }
        self.remaining -= 1;

        Ok(Some(DecodedAudio {
            sample_rate: self.sample_rate,
            channels: self.channels,
            samples: vec![0.0; self.chunk_len],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_still_video_plays_fixed_length() {
        let decoder = StillImageDecoder::new(29.97, 3).with_image(gradient(8, 4));
        let mut video = decoder.open_video(Path::new("")).unwrap();

        let mut count = 0;
        while let Some(frame) = video.next_frame().unwrap() {
            assert_eq!((frame.width, frame.height), (8, 4));
            assert_eq!(frame.pixels.len(), 8 * 4 * 4);
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_silent_audio_matches_video_duration() {
        let decoder = StillImageDecoder::new(25.0, 2).with_audio(48000, 2);
        let mut audio = decoder
            .open_audio(Path::new(""), SampleFormat::F32)
            .unwrap();

        let chunk = audio.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.samples.len(), 1920 * 2);
        assert!(audio.next_chunk().unwrap().is_some());
        assert!(audio.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_missing_file_fails_to_open() {
        let decoder = StillImageDecoder::new(30.0, 1);
        let path = Path::new("/nonexistent/hermes-still.png");

        assert!(matches!(decoder.open_video(path), Err(DecodeError::Open { .. })));
        assert!(decoder.open_audio(path, SampleFormat::F32).is_err());
        assert!(decoder.open_video(Path::new("")).is_err());
    }
}
