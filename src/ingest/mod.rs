//! Media-file-to-bus publishing.
//!
//! Video and audio run as two independent loops over the same sender and
//! never synchronize with each other; pacing is left to the sender's clock.
//! Both loops reopen the media from the start when it runs out (loop
//! playback) until the shutdown token fires.

pub mod decoder;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bus::{AudioFrame, BusError, FrameRate, PixelFormat, Sender, VideoFrame};
use decoder::{AudioStream, DecodeError, MediaDecoder, SampleFormat, VideoStream};

pub use decoder::{gradient, DecodedAudio, DecodedVideo, StillImageDecoder};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("{0} produced no {1} before end of stream")]
    Empty(PathBuf, &'static str),

    #[error("ingest task failed: {0}")]
    Join(String),
}

/// Ingestion counters
#[derive(Default)]
pub struct IngestStats {
    /// Video frames sent since the media was last (re)opened
    pub video_frames: AtomicU64,
    pub video_loops: AtomicU64,
    pub audio_frames: AtomicU64,
    pub audio_loops: AtomicU64,
    pub sample_rate: AtomicU32,
    pub channels: AtomicU32,
    pub samples_per_channel: AtomicU32,
    /// Frames the sender refused; playback carries on past them
    pub send_errors: AtomicU64,
    fps: ArcSwap<(f64, FrameRate)>,
}

/// Point-in-time copy of the ingestion counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IngestSnapshot {
    /// Decoder-reported fps
    pub fps: f64,
    /// `fps` truncated to hundredths, the value the rate table is keyed on
    pub fps_fixed: f64,
    pub frame_rate: FrameRate,
    pub video_frames: u64,
    pub video_loops: u64,
    pub audio_frames: u64,
    pub audio_loops: u64,
    pub sample_rate: u32,
    pub channels: u32,
    pub samples_per_channel: u32,
    pub send_errors: u64,
}

impl IngestStats {
    /// Last decoder fps and the rational it was mapped to
    pub fn frame_rate(&self) -> (f64, FrameRate) {
        **self.fps.load()
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        let (fps, frame_rate) = self.frame_rate();
        IngestSnapshot {
            fps,
            fps_fixed: (fps * 100.0 + 1e-6).floor() / 100.0,
            frame_rate,
            video_frames: self.video_frames.load(Ordering::Relaxed),
            video_loops: self.video_loops.load(Ordering::Relaxed),
            audio_frames: self.audio_frames.load(Ordering::Relaxed),
            audio_loops: self.audio_loops.load(Ordering::Relaxed),
            sample_rate: self.sample_rate.load(Ordering::Relaxed),
            channels: self.channels.load(Ordering::Relaxed),
            samples_per_channel: self.samples_per_channel.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

/// Publishes one media file to a sender
pub struct Ingest<D: MediaDecoder, S: Sender> {
    decoder: Arc<D>,
    sender: Arc<S>,
    path: PathBuf,
    stats: Arc<IngestStats>,
}

impl<D: MediaDecoder, S: Sender> Clone for Ingest<D, S> {
    fn clone(&self) -> Self {
        Self {
            decoder: Arc::clone(&self.decoder),
            sender: Arc::clone(&self.sender),
            path: self.path.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<D: MediaDecoder + 'static, S: Sender + 'static> Ingest<D, S> {
    pub fn new(decoder: Arc<D>, sender: Arc<S>, path: impl Into<PathBuf>) -> Self {
        Self {
            decoder,
            sender,
            path: path.into(),
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Start both loops on the blocking pool
    pub fn spawn(
        &self,
        shutdown: CancellationToken,
    ) -> (
        JoinHandle<Result<(), IngestError>>,
        JoinHandle<Result<(), IngestError>>,
    ) {
        let video = {
            let ingest = self.clone();
            let shutdown = shutdown.clone();
            tokio::task::spawn_blocking(move || ingest.run_video(&shutdown))
        };
        let audio = {
            let ingest = self.clone();
            tokio::task::spawn_blocking(move || ingest.run_audio(&shutdown))
        };
        (video, audio)
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn run_video(&self, shutdown: &CancellationToken) -> Result<(), IngestError> {
        info!("Video ingest started");

        while !shutdown.is_cancelled() {
            let mut stream = self.decoder.open_video(&self.path)?;
            self.stats.video_frames.store(0, Ordering::Relaxed);
            let mut played = 0u64;

            while let Some(decoded) = stream.next_frame()? {
                self.send_video(decoded)?;
                played += 1;
                if shutdown.is_cancelled() {
                    return Ok(());
                }
            }

            if played == 0 {
                return Err(IngestError::Empty(self.path.clone(), "video"));
            }
            self.stats.video_loops.fetch_add(1, Ordering::Relaxed);
            debug!(frames = played, "Video reached end of stream, replaying");
        }

        Ok(())
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn run_audio(&self, shutdown: &CancellationToken) -> Result<(), IngestError> {
        info!("Audio ingest started");

        while !shutdown.is_cancelled() {
            let mut stream = self.decoder.open_audio(&self.path, SampleFormat::F32)?;
            let mut played = 0u64;

            while let Some(decoded) = stream.next_chunk()? {
                self.send_audio(decoded)?;
                played += 1;
                if shutdown.is_cancelled() {
                    return Ok(());
                }
            }

            if played == 0 {
                return Err(IngestError::Empty(self.path.clone(), "audio"));
            }
            self.stats.audio_loops.fetch_add(1, Ordering::Relaxed);
            debug!(chunks = played, "Audio reached end of stream, replaying");
        }

        Ok(())
    }

    fn send_video(&self, decoded: DecodedVideo) -> Result<(), IngestError> {
        let frame_rate = FrameRate::from_fps(decoded.fps);
        if self.stats.frame_rate() != (decoded.fps, frame_rate) {
            self.stats.fps.store(Arc::new((decoded.fps, frame_rate)));
        }

        let frame = VideoFrame::new(
            decoded.width,
            decoded.height,
            PixelFormat::Rgba,
            frame_rate,
            Bytes::from(decoded.pixels),
        )?;

        match self.sender.send_video(&frame) {
            Ok(()) => {
                self.stats.video_frames.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("ingest_video_frames_total").increment(1);
            }
            Err(e) => self.record_send_error("video", &e),
        }
        Ok(())
    }

    fn send_audio(&self, decoded: DecodedAudio) -> Result<(), IngestError> {
        let frame =
            AudioFrame::interleaved(decoded.sample_rate, decoded.channels, decoded.samples)?;

        self.stats
            .sample_rate
            .store(frame.sample_rate, Ordering::Relaxed);
        self.stats.channels.store(frame.channels, Ordering::Relaxed);
        self.stats
            .samples_per_channel
            .store(frame.samples_per_channel, Ordering::Relaxed);

        match self.sender.send_audio(&frame) {
            Ok(()) => {
                self.stats.audio_frames.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.record_send_error("audio", &e),
        }
        Ok(())
    }

    fn record_send_error(&self, kind: &'static str, error: &BusError) {
        self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest_send_errors_total", "kind" => kind)
            .increment(1);
        warn!(kind, error = %error, "Failed to send ingest frame");
    }
}
