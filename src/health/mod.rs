//! Service health
//!
//! The monitor probes the gateway on an interval and caches the aggregated
//! report; the HTTP routes expose it to orchestrators.

pub mod api;
mod monitor;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use monitor::{
    DependencyReport, DependencyStatus, DeviceCounter, GatewayProbe, HealthMonitor, HealthReport,
    HealthStatus, aggregate, gateway_report,
};

/// Health check settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Time between background checks
    #[serde(with = "crate::config::millis")]
    pub interval: Duration,
    /// Timeout for a single gateway probe
    #[serde(with = "crate::config::millis")]
    pub probe_timeout: Duration,
    /// Probe latency above which the gateway counts as degraded
    #[serde(with = "crate::config::millis")]
    pub degraded_latency: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            degraded_latency: Duration::from_secs(1),
        }
    }
}
