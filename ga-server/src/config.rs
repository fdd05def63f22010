//! Configuration for the streaming server.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ga_core::bbr::governor::{BITRATE_MAX_KBPS, BITRATE_MIN_KBPS};
use ga_core::bbr::{BbrConfig, RttFixed};
use ga_core::error::GaError;
use ga_core::pipeline::{CropRect, PipelineSettings};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub video: VideoConfig,
    pub encoder: EncoderConfig,
    pub audio: AudioConfig,
    pub control: ControlConfig,
    pub bbr: BbrSection,
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address both the media and control sockets bind to.
    pub bind_address: String,
    /// UDP port media is streamed from.
    pub transport_port: u16,
    /// Largest UDP datagram sent.
    pub mtu: usize,
}

/// Video capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Capture rectangle; the whole frame when absent.
    pub crop: Option<CropConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CropConfig {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

/// Initial video encoder parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub bitrate_kbps: u32,
    /// Constant rate factor, 0..=51.
    pub crf: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Control channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Run the control server (and input replay).
    pub enabled: bool,
    /// TCP port for control connections.
    pub port: u16,
}

/// Adaptive bitrate tuning.
///
/// The controller starts from `[encoder] bitrate_kbps`, the rate the
/// encoder actually runs at.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BbrSection {
    /// RTT rise over the minimum that triggers a back-off (ms).
    pub rtt_inflation_ms: u32,
    /// Minimum time between upward probes (ms).
    pub probe_interval_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            transport_port: 8554,
            mtu: 1400,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            crop: None,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            bitrate_kbps: 200,
            crf: 23,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8555,
        }
    }
}

impl Default for BbrSection {
    fn default() -> Self {
        Self {
            rtt_inflation_ms: 5,
            probe_interval_ms: 4000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// The default configuration as TOML.
    pub fn default_toml() -> Result<String, GaError> {
        toml::to_string_pretty(&Self::default()).map_err(|e| GaError::Config(e.to_string()))
    }

    fn bind_ip(&self) -> Result<IpAddr, GaError> {
        self.network.bind_address.parse().map_err(|e| {
            GaError::Config(format!("bad bind_address {:?}: {e}", self.network.bind_address))
        })
    }

    /// TCP address of the control server.
    pub fn control_addr(&self) -> Result<SocketAddr, GaError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.control.port))
    }

    /// Convert to pipeline settings, clamping values into usable ranges.
    ///
    /// The crop rectangle is passed through unchecked; stages reject an
    /// invalid one during initialisation.
    pub fn to_pipeline_settings(&self) -> Result<PipelineSettings, GaError> {
        let even = |v: u32| (v & !1).max(2);
        let mut settings = PipelineSettings::default();

        settings.crop = self.video.crop.map(|c| CropRect {
            left: c.left,
            top: c.top,
            right: c.right,
            bottom: c.bottom,
        });
        settings.video.width = even(self.video.width);
        settings.video.height = even(self.video.height);
        settings.video.fps = self.video.fps.clamp(1, 120);
        settings.encoder.bitrate_kbps = self
            .encoder
            .bitrate_kbps
            .clamp(BITRATE_MIN_KBPS, BITRATE_MAX_KBPS);
        settings.encoder.crf = self.encoder.crf.min(51);
        settings.audio.enabled = self.audio.enabled;
        settings.audio.sample_rate = self.audio.sample_rate;
        settings.audio.channels = self.audio.channels;
        settings.control_enabled = self.control.enabled;
        settings.transport.bind = SocketAddr::new(self.bind_ip()?, self.network.transport_port);
        settings.transport.mtu = self.network.mtu.clamp(64, 65_507);

        Ok(settings)
    }

    /// Convert the `[bbr]` section to controller settings. The starting
    /// bitrate is the encoder's, clamped the same way.
    pub fn to_bbr_config(&self) -> BbrConfig {
        BbrConfig {
            initial_bitrate_kbps: self
                .encoder
                .bitrate_kbps
                .clamp(BITRATE_MIN_KBPS, BITRATE_MAX_KBPS),
            rtt_inflation: RttFixed::from_millis(self.bbr.rtt_inflation_ms.max(1)),
            probe_interval: Duration::from_millis(self.bbr.probe_interval_ms.max(1)),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
