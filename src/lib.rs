//! UE-Bot bridge - session relay between voice modules and an AI gateway
//!
//! This library provides:
//! - The device wire protocol (JSON control messages, binary audio frames)
//! - On-device voice activity detection and the device link
//! - The relay that multiplexes device connections
//! - The shared upstream gateway client with request correlation
//! - Health monitoring and the HTTP/WebSocket server
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 Voice modules                    │
//! │   VAD  │  DeviceLink  │  playback  │  commands   │
//! └───────────────────────┬──────────────────────────┘
//!                         │ ws (JSON + binary frames)
//! ┌───────────────────────▼──────────────────────────┐
//! │                  Bridge relay                    │
//! │  Registry  │  Streams  │  Heartbeat  │  Health   │
//! └───────────────────────┬──────────────────────────┘
//!                         │ ws (correlated requests)
//! ┌───────────────────────▼──────────────────────────┐
//! │                   AI gateway                     │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod gateway;
pub mod health;
pub mod protocol;
pub mod reconnect;
pub mod relay;
pub mod server;
pub mod transport;
pub mod vad;

pub use config::Config;
pub use error::{Error, RequestError, Result};
