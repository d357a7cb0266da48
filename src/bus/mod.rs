//! Network video bus boundary.
//!
//! The transport that discovers sources, receives frames and publishes new
//! sources is an external collaborator. This module fixes the contract the
//! rest of the crate needs from it; [`loopback`] provides an in-process
//! implementation.

pub mod discovery;
pub mod frame;
pub mod loopback;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use discovery::{discover, extract_source_name, select_source};
pub use frame::{
    AudioFrame, Frame, FrameFormat, FrameRate, MetadataFrame, PixelFormat, VideoFrame,
};
pub use loopback::LoopbackBus;

/// Errors raised at the bus boundary
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no sources found")]
    NoSources,

    #[error("source {name:?} not found, available: {available:?}")]
    SourceNotFound {
        name: String,
        available: Vec<String>,
    },

    #[error("failed to connect to {0}")]
    Connect(String),

    #[error("sender {name:?}: {reason}")]
    Send { name: String, reason: String },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("frame buffer is {actual} bytes, expected {expected}")]
    BufferLength { expected: usize, actual: usize },
}

/// A discoverable network video source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Display name, usually `MACHINE (Stream Name)`
    pub name: String,
    pub address: String,
}

impl SourceDescriptor {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// Color format requested from the receiver (without alpha / with alpha)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorFormat {
    BgrxBgra,
    UyvyBgra,
    #[default]
    RgbxRgba,
    UyvyRgba,
    Fastest,
}

/// Receiver bandwidth negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bandwidth {
    MetadataOnly,
    AudioOnly,
    Lowest,
    #[default]
    Highest,
}

/// Settings for connecting a receiver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverSettings {
    pub color_format: ColorFormat,
    pub bandwidth: Bandwidth,
    /// Deliver fielded video as-is instead of de-interlacing
    pub allow_fields: bool,
    /// Name the receiver advertises on the network
    pub name: Option<String>,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            color_format: ColorFormat::RgbxRgba,
            bandwidth: Bandwidth::Highest,
            allow_fields: true,
            name: None,
        }
    }
}

/// Receiver frame counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Performance {
    pub total_frames: u64,
    pub dropped_frames: u64,
}

/// Source discovery handle
pub trait Finder: Send {
    /// Block up to `timeout`; true when the source list changed and more may follow
    fn wait_for_sources(&self, timeout: Duration) -> bool;

    fn current_sources(&self) -> Vec<SourceDescriptor>;
}

/// Receiving side of a connection to one source
pub trait Receiver: Send {
    /// Wait up to `timeout` for the next frame
    fn capture(&mut self, timeout: Duration) -> Frame;

    /// Hand a captured video frame back to the receiver.
    ///
    /// Its bytes must not be relied upon by the caller afterwards except
    /// through views already passed on to a sender.
    fn release(&mut self, frame: VideoFrame) {
        drop(frame);
    }

    fn performance(&self) -> Performance;
}

/// A published source
pub trait Sender: Send + Sync {
    fn name(&self) -> &str;

    fn send_video(&self, frame: &VideoFrame) -> Result<(), BusError>;

    fn send_audio(&self, frame: &AudioFrame) -> Result<(), BusError>;

    /// Number of receivers connected, waiting up to `timeout` for one to appear
    fn connection_count(&self, timeout: Duration) -> usize;
}

/// Entry point of a video bus implementation
pub trait VideoBus: Send + Sync {
    type Finder: Finder;
    type Receiver: Receiver;
    type Sender: Sender;

    fn version(&self) -> String;

    fn finder(&self, show_local_sources: bool) -> Result<Self::Finder, BusError>;

    fn connect(
        &self,
        source: &SourceDescriptor,
        settings: &ReceiverSettings,
    ) -> Result<Self::Receiver, BusError>;

    /// Publish a new source. Clocked streams are paced by the sender itself.
    fn create_sender(
        &self,
        name: &str,
        clock_video: bool,
        clock_audio: bool,
    ) -> Result<Self::Sender, BusError>;
}
