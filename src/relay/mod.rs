//! Receiver-to-sender relay loop with preview tap.
//!
//! Every captured video frame is forwarded unchanged to the sender (the
//! outgoing frame shares the captured bytes). RGBA/RGBX frames are also
//! copied into the preview cache under the output name; other pixel formats
//! are only previewed when conversion is enabled.

mod stats;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bus::{Frame, Receiver, Sender, VideoFrame};
use crate::preview::{convert, PreviewCache};
use crate::RelayConfig;

pub use stats::{RelayStats, RelaySnapshot, VideoFormat};

/// Relay from one receiver to one sender
pub struct Relay<R: Receiver, S: Sender> {
    receiver: R,
    sender: Arc<S>,
    cache: Arc<PreviewCache>,
    output: String,
    capture_timeout: Duration,
    convert_formats: bool,
    stats: Arc<RelayStats>,
}

impl<R: Receiver, S: Sender> Relay<R, S> {
    pub fn new(
        receiver: R,
        sender: Arc<S>,
        cache: Arc<PreviewCache>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            receiver,
            output: sender.name().to_string(),
            sender,
            cache,
            capture_timeout: Duration::from_millis(config.capture_timeout_ms),
            convert_formats: false,
            stats: Arc::new(RelayStats::default()),
        }
    }

    /// Also preview BGRA/BGRX/UYVY/UYVA frames by converting them to RGBA
    pub fn convert_formats(mut self, enabled: bool) -> Self {
        self.convert_formats = enabled;
        self
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    pub fn receiver(&self) -> &R {
        &self.receiver
    }

    /// Run until `shutdown` fires. Blocks the calling thread.
    #[instrument(skip_all, fields(output = %self.output))]
    pub fn run(&mut self, shutdown: &CancellationToken) {
        info!(
            timeout_ms = self.capture_timeout.as_millis() as u64,
            "Relay started"
        );

        while !shutdown.is_cancelled() {
            self.step();
        }

        info!(captures = self.stats.snapshot().captures, "Relay stopped");
    }

    /// One capture/forward iteration
    pub fn step(&mut self) {
        let frame = self.receiver.capture(self.capture_timeout);
        self.stats.record_capture(&frame);

        match frame {
            Frame::Video(video) => self.relay_video(video),
            Frame::Audio(audio) => {
                if let Err(e) = self.sender.send_audio(&audio) {
                    self.stats.record_send_error();
                    warn!(error = %e, "Failed to send audio frame");
                } else {
                    self.stats.record_audio_sent();
                }
            }
            Frame::Error => debug!("Capture returned an error"),
            Frame::None | Frame::Metadata(_) => {}
        }

        self.stats.record_performance(self.receiver.performance());
    }

    fn relay_video(&mut self, input: VideoFrame) {
        let started = Instant::now();
        self.stats.record_format(&input);
        self.update_preview(&input);

        let output = input.relay();
        let sent = self.sender.send_video(&output);
        self.receiver.release(input);

        match sent {
            Ok(()) => {
                self.stats.record_video_sent();
                metrics::histogram!("relay_frame_time_us")
                    .record(started.elapsed().as_micros() as f64);
            }
            Err(e) => {
                self.stats.record_send_error();
                warn!(error = %e, "Failed to send video frame");
            }
        }
    }

    fn update_preview(&self, frame: &VideoFrame) {
        let pixels = if self.convert_formats {
            Some(convert::to_rgba(frame))
        } else {
            convert::rgba_passthrough(frame)
        };

        let Some(pixels) = pixels else {
            self.stats.record_preview_skipped();
            return;
        };

        if let Err(e) = self
            .cache
            .set_frame(&self.output, &pixels, frame.width, frame.height)
        {
            warn!(error = %e, "Rejected preview frame");
        }
    }
}
