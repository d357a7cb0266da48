//! Periodic status reporting

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{FrameRate, Sender, SourceDescriptor};
use crate::ingest::{IngestSnapshot, IngestStats};
use crate::relay::{RelaySnapshot, RelayStats};
use crate::server::PreviewServer;

/// Everything the status line shows
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub version: String,
    pub input: SourceDescriptor,
    pub output: String,
    pub output_connections: usize,
    pub sources: Vec<String>,
    pub frame_rate: Option<FrameRate>,
    pub relay: RelaySnapshot,
    pub viewers: usize,
    /// Streams with a cached preview
    pub previews: Vec<String>,
    pub ingest: Option<IngestSnapshot>,
}

pub struct StatusReporter<S: Sender> {
    version: String,
    input: SourceDescriptor,
    sources: Vec<SourceDescriptor>,
    output: Arc<S>,
    relay: Arc<RelayStats>,
    ingest: Option<Arc<IngestStats>>,
    preview: Option<PreviewServer>,
}

impl<S: Sender + 'static> StatusReporter<S> {
    pub fn new(
        version: String,
        input: SourceDescriptor,
        sources: Vec<SourceDescriptor>,
        output: Arc<S>,
        relay: Arc<RelayStats>,
    ) -> Self {
        Self {
            version,
            input,
            sources,
            output,
            relay,
            ingest: None,
            preview: None,
        }
    }

    pub fn with_ingest(mut self, stats: Arc<IngestStats>) -> Self {
        self.ingest = Some(stats);
        self
    }

    pub fn with_preview(mut self, server: PreviewServer) -> Self {
        self.preview = Some(server);
        self
    }

    /// Gather a report. Blocks briefly on the sender's connection count.
    pub fn report(&self) -> StatusReport {
        StatusReport {
            version: self.version.clone(),
            input: self.input.clone(),
            output: self.output.name().to_string(),
            output_connections: self.output.connection_count(Duration::from_millis(10)),
            sources: self
                .sources
                .iter()
                .map(|source| source.name.clone())
                .collect(),
            frame_rate: self.relay.last_format().map(|format| format.frame_rate),
            relay: self.relay.snapshot(),
            viewers: self.preview.as_ref().map_or(0, PreviewServer::viewers),
            previews: self
                .preview
                .as_ref()
                .map(PreviewServer::streams)
                .unwrap_or_default(),
            ingest: self.ingest.as_ref().map(|stats| stats.snapshot()),
        }
    }

    /// Log a report every `interval` until shutdown
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let reporter = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || reporter.report()).await {
                Ok(report) => log_report(&report),
                Err(e) => warn!(error = %e, "Status report failed"),
            }
        }
    }
}

fn log_report(report: &StatusReport) {
    let frame_rate = report
        .frame_rate
        .map(|rate| rate.to_string())
        .unwrap_or_else(|| "-".into());

    info!(
        version = %report.version,
        input = %report.input.name,
        address = %report.input.address,
        output = %report.output,
        connections = report.output_connections,
        sources = ?report.sources,
        frames_sent = report.relay.frames_sent,
        audio_sent = report.relay.audio_sent,
        send_errors = report.relay.send_errors,
        frame_rate = %frame_rate,
        captures = report.relay.captures,
        capture_errors = report.relay.errors,
        capture_none = report.relay.none,
        received = report.relay.received_total,
        dropped = report.relay.received_dropped,
        preview_skipped = report.relay.preview_skipped,
        previews = ?report.previews,
        viewers = report.viewers,
        "status"
    );

    if let Some(ingest) = &report.ingest {
        info!(
            video_frames = ingest.video_frames,
            video_loops = ingest.video_loops,
            fps = ingest.fps,
            fps_fixed = ingest.fps_fixed,
            frame_rate = %ingest.frame_rate,
            audio_frames = ingest.audio_frames,
            audio_loops = ingest.audio_loops,
            sample_rate = ingest.sample_rate,
            channels = ingest.channels,
            samples = ingest.samples_per_channel,
            send_errors = ingest.send_errors,
            "ingest"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LoopbackBus, ReceiverSettings, VideoBus};
    use crate::ingest::{gradient, Ingest, StillImageDecoder};
    use crate::preview::PreviewCache;

    #[test]
    fn test_report_reflects_bus_state() {
        let bus = LoopbackBus::default();
        let output = Arc::new(bus.create_sender("copy", false, false).unwrap());
        let _viewer = bus
            .connect(output.descriptor(), &ReceiverSettings::default())
            .unwrap();

        let input = SourceDescriptor::new("CAM (main)", "10.0.0.9:5961");
        let reporter = StatusReporter::new(
            bus.version(),
            input.clone(),
            vec![input.clone()],
            Arc::clone(&output),
            Arc::new(RelayStats::default()),
        );

        let report = reporter.report();
        assert_eq!(report.output, "copy");
        assert_eq!(report.output_connections, 1);
        assert_eq!(report.sources, vec!["CAM (main)".to_string()]);
        assert_eq!(report.frame_rate, None);
        assert_eq!(report.relay, RelaySnapshot::default());
        assert!(report.previews.is_empty());
        assert_eq!(report.ingest, None);
    }

    #[tokio::test]
    async fn test_report_includes_ingest_and_previews() {
        let bus = LoopbackBus::default();
        let output = Arc::new(bus.create_sender("copy", false, false).unwrap());
        let input = Arc::new(bus.create_sender("mock", false, false).unwrap());

        let shutdown = CancellationToken::new();
        let decoder = StillImageDecoder::new(59.94, 2).with_image(gradient(4, 2));
        let ingest = Ingest::new(Arc::new(decoder), Arc::clone(&input), "");
        let (video, audio) = ingest.spawn(shutdown.clone());

        let stats = ingest.stats();
        tokio::time::timeout(Duration::from_secs(5), async {
            while stats.frame_rate().0 == 0.0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        shutdown.cancel();
        video.await.unwrap().unwrap();
        audio.await.unwrap().unwrap();

        let cache = Arc::new(PreviewCache::new());
        cache.reset("copy");
        let server = PreviewServer::new(cache, 20, CancellationToken::new());

        let reporter = StatusReporter::new(
            bus.version(),
            input.descriptor().clone(),
            Vec::new(),
            output,
            Arc::new(RelayStats::default()),
        )
        .with_ingest(stats)
        .with_preview(server);

        let report = reporter.report();
        assert_eq!(report.previews, vec!["copy".to_string()]);
        assert_eq!(report.viewers, 0);

        let ingest = report.ingest.unwrap();
        assert_eq!(ingest.fps_fixed, 59.94);
        assert_eq!(ingest.frame_rate, FrameRate::NTSC_60);
        assert_eq!(ingest.send_errors, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let bus = LoopbackBus::default();
        let output = Arc::new(bus.create_sender("copy", false, false).unwrap());
        let input = SourceDescriptor::new("CAM (main)", "");
        let reporter = Arc::new(StatusReporter::new(
            bus.version(),
            input,
            Vec::new(),
            output,
            Arc::new(RelayStats::default()),
        ));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(reporter.run(Duration::from_millis(5), shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
