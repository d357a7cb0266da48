pub mod bus;
pub mod error;
pub mod ingest;
pub mod preview;
pub mod relay;
pub mod server;
pub mod status;

use std::path::Path;

use arc_swap::ArcSwap;
use config::{Environment, File};
use serde::{Deserialize, Serialize};

use bus::{Bandwidth, ColorFormat, ReceiverSettings};

pub use error::{Error, Result};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub preview: PreviewConfig,
    pub server: ServerConfig,
    pub ingest: IngestConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Stream name of the source to relay; first discovered source when unset
    pub input: Option<String>,
    pub output: String,
    pub capture_timeout_ms: u64,
    pub color_format: ColorFormat,
    pub bandwidth: Bandwidth,
    pub allow_fields: bool,
    pub discovery_wait_ms: u64,
    pub discovery_attempts: u32,
    pub clock_video: bool,
    pub clock_audio: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// JPEG quality, 1-100
    pub quality: u8,
    /// Convert BGRA/BGRX/UYVY/UYVA frames for preview
    pub convert_formats: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub enabled: bool,
    /// Image to publish; a generated gradient when empty
    pub path: String,
    pub source_name: String,
    pub fps: f64,
    pub frames: u32,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u32,
    /// Host label in published source names
    pub host: String,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            input: None,
            output: "copy".into(),
            capture_timeout_ms: 1000,
            color_format: ColorFormat::RgbxRgba,
            bandwidth: Bandwidth::Highest,
            allow_fields: true,
            discovery_wait_ms: 1000,
            discovery_attempts: 5,
            clock_video: false,
            clock_audio: false,
        }
    }
}

impl RelayConfig {
    pub fn receiver_settings(&self) -> ReceiverSettings {
        ReceiverSettings {
            color_format: self.color_format,
            bandwidth: self.bandwidth,
            allow_fields: self.allow_fields,
            name: Some(format!("{} relay", self.output)),
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            quality: 20,
            convert_formats: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8086".into(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: String::new(),
            source_name: "mock".into(),
            fps: 29.97,
            frames: 300,
            width: 1280,
            height: 720,
            sample_rate: 48000,
            channels: 2,
            host: "HERMES".into(),
            queue_depth: 4,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

impl Config {
    /// Load from an optional TOML file overlaid with `HERMES_*` environment
    /// variables (`HERMES_RELAY__OUTPUT=program`)
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_file {
            if !Path::new(path).exists() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("config file {path} not found"),
                )));
            }
            builder = builder.add_source(File::with_name(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("HERMES")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.relay.output, "copy");
        assert_eq!(config.relay.capture_timeout_ms, 1000);
        assert_eq!(config.preview.quality, 20);
        assert!(!config.preview.convert_formats);
        assert_eq!(config.server.bind, "0.0.0.0:8086");
    }

    #[test]
    fn test_load_toml_overrides_defaults() {
        let name = format!("hermes-config-{}.toml", std::process::id());
        let path = std::env::temp_dir().join(name);
        let toml = r#"
[relay]
input = "Camera 2"
output = "program"
color_format = "uyvy_rgba"

[preview]
quality = 75
"#;
        std::fs::write(&path, toml).unwrap();

        let config = Config::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.relay.input.as_deref(), Some("Camera 2"));
        assert_eq!(config.relay.output, "program");
        assert_eq!(config.relay.color_format, ColorFormat::UyvyRgba);
        assert_eq!(config.preview.quality, 75);
        // Untouched sections keep their defaults
        assert_eq!(config.relay.capture_timeout_ms, 1000);
        assert_eq!(config.server.bind, "0.0.0.0:8086");
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(matches!(
            Config::load(Some("/nonexistent/hermes.toml")),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_receiver_settings_from_config() {
        let settings = RelayConfig::default().receiver_settings();
        assert_eq!(settings.color_format, ColorFormat::RgbxRgba);
        assert!(settings.allow_fields);
        assert_eq!(settings.name.as_deref(), Some("copy relay"));
    }
}
