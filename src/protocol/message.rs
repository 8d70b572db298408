//! JSON control messages exchanged between devices and the relay

use serde::{Deserialize, Serialize};

/// PCM format of an audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            bits_per_sample: 16,
            channels: 1,
        }
    }
}

impl AudioFormat {
    /// Bytes per second of audio in this format
    #[must_use]
    pub fn bytes_per_second(&self) -> u64 {
        u64::from(self.sample_rate)
            * u64::from(self.bits_per_sample / 8)
            * u64::from(self.channels)
    }

    /// Check the format is something the relay can forward
    ///
    /// # Errors
    ///
    /// Returns a description of the first unsupported field
    pub fn validate(&self) -> Result<(), String> {
        if !(8_000..=48_000).contains(&self.sample_rate) {
            return Err(format!("unsupported sample rate {}", self.sample_rate));
        }
        if !matches!(self.bits_per_sample, 8 | 16 | 24 | 32) {
            return Err(format!("unsupported bit depth {}", self.bits_per_sample));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(format!("unsupported channel count {}", self.channels));
        }
        Ok(())
    }
}

/// Hardware a device declares at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub microphone: bool,
    #[serde(default)]
    pub speaker: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            microphone: true,
            speaker: true,
        }
    }
}

/// `device:register` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub firmware_version: String,
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Session the device held before a reconnect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// `device:registered` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredPayload {
    pub session_id: String,
    pub device_id: String,
    pub heartbeat_interval_ms: u64,
}

/// `audio:start` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioStartPayload {
    pub stream_id: u16,
    pub format: AudioFormat,
}

/// `audio:end` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioEndPayload {
    pub stream_id: u16,
}

/// `audio:response` payload, announcing the binary playback frames that follow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioResponsePayload {
    pub stream_id: u16,
    pub format: AudioFormat,
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// `command:execute` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// `device:status` telemetry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Battery charge in percent, absent on mains power
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<u8>,
    /// WiFi signal strength in dBm
    pub rssi: i32,
    pub free_heap: u32,
    pub recording: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_ms: Option<u64>,
}

/// Protocol error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidMessage,
    NotRegistered,
    NoActiveStream,
    StreamMismatch,
    InvalidFormat,
    UnexpectedMessage,
    HandshakeTimeout,
    Internal,
}

/// `error` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Every JSON message kind on the device connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "device:register")]
    Register { payload: RegisterPayload },

    #[serde(rename = "device:registered")]
    Registered { payload: RegisteredPayload },

    #[serde(rename = "audio:start")]
    AudioStart { payload: AudioStartPayload },

    #[serde(rename = "audio:end")]
    AudioEnd { payload: AudioEndPayload },

    #[serde(rename = "audio:response")]
    AudioResponse { payload: AudioResponsePayload },

    #[serde(rename = "command:execute")]
    CommandExecute { payload: CommandPayload },

    #[serde(rename = "device:status")]
    Status { payload: DeviceStatus },

    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    #[serde(rename = "error")]
    Error { payload: ErrorPayload },
}

impl Message {
    /// Build an `error` message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            payload: ErrorPayload {
                code,
                message: message.into(),
            },
        }
    }

    /// Wire name of this message kind
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "device:register",
            Self::Registered { .. } => "device:registered",
            Self::AudioStart { .. } => "audio:start",
            Self::AudioEnd { .. } => "audio:end",
            Self::AudioResponse { .. } => "audio:response",
            Self::CommandExecute { .. } => "command:execute",
            Self::Status { .. } => "device:status",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize to a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error for malformed JSON or an unknown `type`
    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
