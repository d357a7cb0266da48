use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::bus::{Frame, FrameRate, Performance, PixelFormat, VideoFrame};

/// Relay counters, shared with the status loop
#[derive(Default)]
pub struct RelayStats {
    counters: CachePadded<Counters>,
    last_format: ArcSwapOption<VideoFormat>,
}

#[derive(Default)]
struct Counters {
    captures: AtomicU64,
    video: AtomicU64,
    audio: AtomicU64,
    metadata: AtomicU64,
    none: AtomicU64,
    errors: AtomicU64,
    frames_sent: AtomicU64,
    audio_sent: AtomicU64,
    send_errors: AtomicU64,
    preview_skipped: AtomicU64,
    received_total: AtomicU64,
    received_dropped: AtomicU64,
}

/// Format of the most recent video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub frame_rate: FrameRate,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySnapshot {
    pub captures: u64,
    pub video: u64,
    pub audio: u64,
    pub metadata: u64,
    pub none: u64,
    pub errors: u64,
    pub frames_sent: u64,
    pub audio_sent: u64,
    pub send_errors: u64,
    pub preview_skipped: u64,
    /// Receiver-side video frame totals
    pub received_total: u64,
    pub received_dropped: u64,
}

impl RelayStats {
    pub(super) fn record_capture(&self, frame: &Frame) {
        let c = &self.counters;
        c.captures.fetch_add(1, Ordering::Relaxed);
        let counter = match frame {
            Frame::None => &c.none,
            Frame::Video(_) => &c.video,
            Frame::Audio(_) => &c.audio,
            Frame::Metadata(_) => &c.metadata,
            Frame::Error => &c.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_captures_total", "kind" => frame.kind())
            .increment(1);
    }

    pub(super) fn record_format(&self, frame: &VideoFrame) {
        let format = VideoFormat {
            width: frame.width,
            height: frame.height,
            pixel_format: frame.format,
            frame_rate: frame.frame_rate,
        };
        if self.last_format().as_ref() != Some(&format) {
            self.last_format.store(Some(Arc::new(format)));
        }
    }

    pub(super) fn record_video_sent(&self) {
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_frames_sent_total").increment(1);
    }

    pub(super) fn record_audio_sent(&self) {
        self.counters.audio_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_send_error(&self) {
        self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_send_errors_total").increment(1);
    }

    pub(super) fn record_preview_skipped(&self) {
        self.counters
            .preview_skipped
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_performance(&self, performance: Performance) {
        let c = &self.counters;
        c.received_total
            .store(performance.total_frames, Ordering::Relaxed);
        c.received_dropped
            .store(performance.dropped_frames, Ordering::Relaxed);
    }

    pub fn last_format(&self) -> Option<VideoFormat> {
        self.last_format.load().as_deref().copied()
    }

    pub fn snapshot(&self) -> RelaySnapshot {
        let c = &self.counters;
        RelaySnapshot {
            captures: c.captures.load(Ordering::Relaxed),
            video: c.video.load(Ordering::Relaxed),
            audio: c.audio.load(Ordering::Relaxed),
            metadata: c.metadata.load(Ordering::Relaxed),
            none: c.none.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            audio_sent: c.audio_sent.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
            preview_skipped: c.preview_skipped.load(Ordering::Relaxed),
            received_total: c.received_total.load(Ordering::Relaxed),
            received_dropped: c.received_dropped.load(Ordering::Relaxed),
        }
    }
}
