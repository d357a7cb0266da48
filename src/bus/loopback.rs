//! In-process video bus.
//!
//! Senders publish named sources into a bounded per-source queue and
//! receivers connected to a source pull from it. Each frame is delivered to
//! one receiver. When a queue is full the oldest frame is dropped and counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use flume::{Receiver as FlumeReceiver, RecvTimeoutError, Sender as FlumeSender, TrySendError};
use tracing::{debug, info};

use super::{
    AudioFrame, Bandwidth, BusError, Finder, Frame, Performance, Receiver, ReceiverSettings,
    Sender, SourceDescriptor, VideoBus, VideoFrame,
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Loopback bus shared by every handle created from it
#[derive(Clone)]
pub struct LoopbackBus {
    hub: Arc<Hub>,
}

struct Hub {
    host: String,
    queue_depth: usize,
    sources: Mutex<HashMap<String, Arc<Channel>>>,
    generation: AtomicU64,
    next_port: AtomicU64,
}

struct Channel {
    descriptor: SourceDescriptor,
    tx: FlumeSender<Frame>,
    rx: FlumeReceiver<Frame>,
    dropped: AtomicU64,
    receivers: AtomicUsize,
    closed: AtomicBool,
}

impl Hub {
    fn sources(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Channel>>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Channel {
    /// Queue a frame, evicting the oldest one if the queue is full
    fn push(&self, frame: Frame) {
        let mut frame = frame;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if self.rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    frame = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

impl LoopbackBus {
    /// Create a bus whose sources are advertised as `HOST (name)`
    pub fn new(host: impl Into<String>, queue_depth: usize) -> Self {
        Self {
            hub: Arc::new(Hub {
                host: host.into(),
                queue_depth: queue_depth.max(1),
                sources: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                next_port: AtomicU64::new(5961),
            }),
        }
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new("HERMES", 4)
    }
}

impl VideoBus for LoopbackBus {
    type Finder = LoopbackFinder;
    type Receiver = LoopbackReceiver;
    type Sender = LoopbackSender;

    fn version(&self) -> String {
        format!("hermes-loopback {}", env!("CARGO_PKG_VERSION"))
    }

    fn finder(&self, _show_local_sources: bool) -> Result<LoopbackFinder, BusError> {
        Ok(LoopbackFinder {
            hub: Arc::clone(&self.hub),
            seen: AtomicU64::new(0),
        })
    }

    fn connect(
        &self,
        source: &SourceDescriptor,
        settings: &ReceiverSettings,
    ) -> Result<LoopbackReceiver, BusError> {
        let channel = self
            .hub
            .sources()
            .get(&source.name)
            .cloned()
            .ok_or_else(|| BusError::Connect(source.name.clone()))?;

        channel.receivers.fetch_add(1, Ordering::Relaxed);
        debug!(
            source = %source.name,
            color_format = ?settings.color_format,
            bandwidth = ?settings.bandwidth,
            "Loopback receiver connected"
        );

        Ok(LoopbackReceiver {
            channel,
            bandwidth: settings.bandwidth,
            video_frames: 0,
        })
    }

    fn create_sender(
        &self,
        name: &str,
        clock_video: bool,
        clock_audio: bool,
    ) -> Result<LoopbackSender, BusError> {
        let display_name = format!("{} ({})", self.hub.host, name);
        let mut sources = self.hub.sources();

        if sources.contains_key(&display_name) {
            return Err(BusError::Send {
                name: name.to_string(),
                reason: "source already published".into(),
            });
        }

        let port = self.hub.next_port.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = flume::bounded(self.hub.queue_depth);
        let channel = Arc::new(Channel {
            descriptor: SourceDescriptor::new(display_name.clone(), format!("127.0.0.1:{}", port)),
            tx,
            rx,
            dropped: AtomicU64::new(0),
            receivers: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        sources.insert(display_name.clone(), Arc::clone(&channel));
        drop(sources);
        self.hub.generation.fetch_add(1, Ordering::Release);

        info!(source = %display_name, clock_video, clock_audio, "Loopback source published");

        Ok(LoopbackSender {
            name: name.to_string(),
            channel,
            hub: Arc::clone(&self.hub),
            clock_video,
            clock_audio,
            video_pacer: Mutex::new(Pacer::default()),
            audio_pacer: Mutex::new(Pacer::default()),
        })
    }
}

pub struct LoopbackFinder {
    hub: Arc<Hub>,
    seen: AtomicU64,
}

impl Finder for LoopbackFinder {
    fn wait_for_sources(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.hub.generation.load(Ordering::Acquire);
            if current != self.seen.swap(current, Ordering::Relaxed) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(POLL_INTERVAL.min(remaining));
        }
    }

    fn current_sources(&self) -> Vec<SourceDescriptor> {
        let mut sources: Vec<_> = self
            .hub
            .sources()
            .values()
            .map(|channel| channel.descriptor.clone())
            .collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        sources
    }
}

pub struct LoopbackReceiver {
    channel: Arc<Channel>,
    bandwidth: Bandwidth,
    video_frames: u64,
}

impl LoopbackReceiver {
    fn accepts(&self, frame: &Frame) -> bool {
        match (self.bandwidth, frame) {
            (Bandwidth::MetadataOnly, Frame::Metadata(_)) => true,
            (Bandwidth::MetadataOnly, _) => false,
            (Bandwidth::AudioOnly, Frame::Video(_)) => false,
            _ => true,
        }
    }
}

impl Receiver for LoopbackReceiver {
    fn capture(&mut self, timeout: Duration) -> Frame {
        match self.channel.rx.recv_timeout(timeout) {
            Ok(frame) if self.accepts(&frame) => {
                if matches!(frame, Frame::Video(_)) {
                    self.video_frames += 1;
                }
                frame
            }
            Ok(_) => Frame::None,
            Err(RecvTimeoutError::Timeout) if self.channel.closed.load(Ordering::Acquire) => {
                Frame::Error
            }
            Err(RecvTimeoutError::Timeout) => Frame::None,
            Err(RecvTimeoutError::Disconnected) => Frame::Error,
        }
    }

    fn performance(&self) -> Performance {
        Performance {
            total_frames: self.video_frames,
            dropped_frames: self.channel.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for LoopbackReceiver {
    fn drop(&mut self) {
        self.channel.receivers.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct LoopbackSender {
    name: String,
    channel: Arc<Channel>,
    hub: Arc<Hub>,
    clock_video: bool,
    clock_audio: bool,
    video_pacer: Mutex<Pacer>,
    audio_pacer: Mutex<Pacer>,
}

impl LoopbackSender {
    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.channel.descriptor
    }
}

impl Sender for LoopbackSender {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_video(&self, frame: &VideoFrame) -> Result<(), BusError> {
        if self.clock_video {
            let rate = frame.frame_rate.as_f64();
            if rate > 0.0 {
                self.video_pacer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .wait(Duration::from_secs_f64(1.0 / rate));
            }
        }

        self.channel.push(Frame::Video(frame.clone()));
        Ok(())
    }

    fn send_audio(&self, frame: &AudioFrame) -> Result<(), BusError> {
        if self.clock_audio && frame.sample_rate > 0 {
            let period = frame.samples_per_channel as f64 / frame.sample_rate as f64;
            self.audio_pacer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .wait(Duration::from_secs_f64(period));
        }

        self.channel.push(Frame::Audio(frame.clone()));
        Ok(())
    }

    fn connection_count(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let count = self.channel.receivers.load(Ordering::Relaxed);
            if count > 0 || Instant::now() >= deadline {
                return count;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(POLL_INTERVAL.min(remaining));
        }
    }
}

impl Drop for LoopbackSender {
    fn drop(&mut self) {
        self.channel.closed.store(true, Ordering::Release);
        self.hub.sources().remove(&self.channel.descriptor.name);
        self.hub.generation.fetch_add(1, Ordering::Release);
        debug!(source = %self.channel.descriptor.name, "Loopback source withdrawn");
    }
}

/// Sleeps so that successive calls are spaced one period apart
#[derive(Default)]
struct Pacer {
    next: Option<Instant>,
}

impl Pacer {
    fn wait(&mut self, period: Duration) {
        let now = Instant::now();
        let start = match self.next {
            Some(deadline) if deadline > now => {
                thread::sleep(deadline - now);
                deadline
            }
            // Fell behind by more than a period: restart the clock
            Some(deadline) if now.duration_since(deadline) > period => now,
            Some(deadline) => deadline,
            None => now,
        };
        self.next = Some(start + period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{FrameRate, PixelFormat};
    use bytes::Bytes;

    fn video(fill: u8) -> VideoFrame {
        VideoFrame::new(
            2,
            2,
            PixelFormat::Rgba,
            FrameRate::NTSC_30,
            Bytes::from(vec![fill; 16]),
        )
        .unwrap()
    }

    #[test]
    fn test_publish_discover_receive() {
        let bus = LoopbackBus::default();
        let sender = bus.create_sender("program", false, false).unwrap();
        assert_eq!(sender.descriptor().name, "HERMES (program)");

        let finder = bus.finder(true).unwrap();
        assert!(finder.wait_for_sources(Duration::ZERO));
        assert!(!finder.wait_for_sources(Duration::ZERO));

        let sources = finder.current_sources();
        assert_eq!(sources.len(), 1);

        let mut receiver = bus
            .connect(&sources[0], &ReceiverSettings::default())
            .unwrap();
        assert_eq!(sender.connection_count(Duration::ZERO), 1);

        sender.send_video(&video(9)).unwrap();
        match receiver.capture(Duration::from_millis(100)) {
            Frame::Video(frame) => assert_eq!(frame.data[0], 9),
            other => panic!("expected video, got {}", other.kind()),
        }
        assert!(matches!(receiver.capture(Duration::ZERO), Frame::None));
        assert_eq!(receiver.performance().total_frames, 1);
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let bus = LoopbackBus::new("HOST", 2);
        let sender = bus.create_sender("out", false, false).unwrap();
        let mut receiver = bus
            .connect(sender.descriptor(), &ReceiverSettings::default())
            .unwrap();

        for fill in 1..=4 {
            sender.send_video(&video(fill)).unwrap();
        }

        let mut seen = Vec::new();
        while let Frame::Video(frame) = receiver.capture(Duration::ZERO) {
            seen.push(frame.data[0]);
        }
        assert_eq!(seen, vec![3, 4]);
        assert_eq!(receiver.performance().dropped_frames, 2);
    }

    #[test]
    fn test_duplicate_sender_rejected() {
        let bus = LoopbackBus::default();
        let _first = bus.create_sender("dup", false, false).unwrap();
        assert!(bus.create_sender("dup", false, false).is_err());
    }

    #[test]
    fn test_withdrawn_source_reports_error() {
        let bus = LoopbackBus::default();
        let sender = bus.create_sender("gone", false, false).unwrap();
        let mut receiver = bus
            .connect(sender.descriptor(), &ReceiverSettings::default())
            .unwrap();
        drop(sender);

        assert!(matches!(receiver.capture(Duration::ZERO), Frame::Error));
        assert!(bus.finder(true).unwrap().current_sources().is_empty());
    }

    #[test]
    fn test_audio_only_skips_video() {
        let bus = LoopbackBus::default();
        let sender = bus.create_sender("audio", false, false).unwrap();
        let settings = ReceiverSettings {
            bandwidth: Bandwidth::AudioOnly,
            ..Default::default()
        };
        let mut receiver = bus.connect(sender.descriptor(), &settings).unwrap();

        sender.send_video(&video(1)).unwrap();
        sender
            .send_audio(&AudioFrame::interleaved(48000, 2, vec![0.0; 96]).unwrap())
            .unwrap();

        assert!(matches!(receiver.capture(Duration::ZERO), Frame::None));
        assert!(matches!(receiver.capture(Duration::ZERO), Frame::Audio(_)));
    }

    #[test]
    fn test_clocked_video_is_paced() {
        let bus = LoopbackBus::new("HOST", 16);
        let sender = bus.create_sender("paced", true, false).unwrap();
        let frame = VideoFrame::new(
            1,
            1,
            PixelFormat::Rgba,
            FrameRate::new(50, 1),
            Bytes::from(vec![0u8; 4]),
        )
        .unwrap();

        let start = Instant::now();
        for _ in 0..4 {
            sender.send_video(&frame).unwrap();
        }
        // First frame goes out immediately, the next three wait 20ms each
        assert!(start.elapsed() >= Duration::from_millis(55));
    }
}
