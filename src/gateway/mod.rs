//! Upstream AI gateway client
//!
//! A single persistent connection shared by every device. Requests carry a
//! uuid and resolve when the matching response arrives; a dropped
//! connection fails everything in flight at once and triggers backoff
//! reconnects.

mod client;
mod message;
mod pending;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reconnect::ReconnectPolicy;

pub use client::{GatewayClient, GatewayEvent};
pub use message::{GatewayMessage, error_text};
pub use pending::{Outcome, PendingRequest, PendingTable};

/// Gateway connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// WebSocket URL of the gateway
    pub url: String,
    /// Default timeout for `voice.utterance` requests
    #[serde(with = "crate::config::millis")]
    pub request_timeout: Duration,
    /// Timeout for health probes
    #[serde(with = "crate::config::millis")]
    pub health_timeout: Duration,
    /// How often abandoned requests are swept
    #[serde(with = "crate::config::millis")]
    pub sweep_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".to_string(),
            request_timeout: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            reconnect: ReconnectPolicy::default(),
        }
    }
}
