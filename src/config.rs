//! Configuration management for the UE-Bot bridge
//!
//! Values are layered: built-in defaults, then an optional TOML file
//! (a partial overlay, every field optional), then `UEBOT_*` environment
//! variables. CLI flags are applied on top by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::DeviceLinkConfig;
use crate::gateway::GatewayConfig;
use crate::health::HealthConfig;
use crate::protocol::AudioFormat;
use crate::relay::RelayConfig;
use crate::vad::VadConfig;
use crate::{Error, Result};

/// Bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP/WebSocket listener
    pub server: ServerConfig,

    /// Device multiplexing and heartbeat
    pub relay: RelayConfig,

    /// Upstream AI gateway connection
    pub gateway: GatewayConfig,

    /// Health monitor cadence and thresholds
    pub health: HealthConfig,

    /// Settings used when running as a device
    pub device: DeviceConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path devices connect to
    pub ws_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            ws_path: "/ws/esp32".to_string(),
        }
    }
}

/// Device-side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Relay WebSocket URL
    pub relay_url: String,
    pub link: DeviceLinkConfig,
    pub vad: VadConfig,
    pub format: AudioFormat,
    /// Samples per frame fed to the voice activity controller
    pub frame_samples: usize,
    /// Interval between `device:status` reports
    #[serde(with = "millis")]
    pub status_interval: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://192.168.1.100:8080/ws/esp32".to_string(),
            link: DeviceLinkConfig::default(),
            vad: VadConfig::default(),
            format: AudioFormat::default(),
            frame_samples: 512,
            status_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from the given file (or the default location)
    /// and apply environment overrides
    ///
    /// A missing default file is not an error; a missing explicit file is.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, or an
    /// environment override is malformed
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };

        config.apply_env()?;
        Ok(config)
    }

    /// Parse a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is not valid TOML
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&raw)?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply `UEBOT_*` environment variable overrides
    ///
    /// # Errors
    ///
    /// Returns error if a numeric variable does not parse
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = var("UEBOT_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("UEBOT_PORT") {
            self.server.port = parse_var("UEBOT_PORT", &port)?;
        }
        if let Some(path) = var("UEBOT_WS_PATH") {
            self.server.ws_path = path;
        }
        if let Some(url) = var("UEBOT_GATEWAY_URL") {
            self.gateway.url = url;
        }
        if let Some(ms) = var("UEBOT_HEARTBEAT_INTERVAL_MS") {
            self.relay.heartbeat_interval =
                Duration::from_millis(parse_var("UEBOT_HEARTBEAT_INTERVAL_MS", &ms)?);
        }
        if let Some(url) = var("UEBOT_RELAY_URL") {
            self.device.relay_url = url;
        }
        if let Some(id) = var("UEBOT_DEVICE_ID") {
            self.device.link.device_id = id;
        }
        Ok(())
    }

    /// Socket address the relay listens on
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: invalid value '{value}'")))
}

/// Default config file location
///
/// `~/.config/uebot/bridge/config.toml` on Linux
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "uebot", "uebot")
        .map(|d| d.config_dir().join("bridge").join("config.toml"))
}

/// Serde helper for durations expressed in milliseconds
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// # Errors
    ///
    /// Propagates serializer errors
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// # Errors
    ///
    /// Returns error if the value is not an unsigned integer
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
