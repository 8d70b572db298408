//! Aggregated health status

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use super::HealthConfig;
use crate::gateway::{GatewayClient, GatewayEvent};
use crate::reconnect::LinkState;
use crate::relay::DeviceRouter;

/// Overall status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Status of one dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyStatus {
    Up,
    Degraded,
    Down,
}

/// Report for one dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    pub status: DependencyStatus,
    /// Required dependencies make the whole service unhealthy when down
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Full health report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub dependencies: BTreeMap<String, DependencyReport>,
    pub devices: usize,
    pub uptime_secs: u64,
    pub version: String,
    pub checked_at: DateTime<Utc>,
}

/// Upstream connection as seen by the monitor
#[async_trait]
pub trait GatewayProbe: Send + Sync + 'static {
    fn link_state(&self) -> LinkState;

    /// Round-trip latency, `None` if the probe failed
    async fn probe(&self, timeout: Duration) -> Option<Duration>;
}

/// Source of the connected device count
#[async_trait]
pub trait DeviceCounter: Send + Sync + 'static {
    async fn device_count(&self) -> usize;
}

#[async_trait]
impl GatewayProbe for GatewayClient {
    fn link_state(&self) -> LinkState {
        self.state()
    }

    async fn probe(&self, timeout: Duration) -> Option<Duration> {
        Self::probe(self, timeout).await
    }
}

#[async_trait]
impl DeviceCounter for DeviceRouter {
    async fn device_count(&self) -> usize {
        Self::device_count(self).await
    }
}

/// Classify the gateway from its link state and probe latency
#[must_use]
pub fn gateway_report(
    state: LinkState,
    latency: Option<Duration>,
    degraded_latency: Duration,
) -> DependencyReport {
    let latency_ms = latency.map(|l| u64::try_from(l.as_millis()).unwrap_or(u64::MAX));
    let (status, message) = match (state, latency) {
        (LinkState::Connected, Some(l)) if l > degraded_latency => (
            DependencyStatus::Degraded,
            Some(format!("probe took {}ms", l.as_millis())),
        ),
        (LinkState::Connected, Some(_)) => (DependencyStatus::Up, None),
        (LinkState::Connected, None) => {
            (DependencyStatus::Down, Some("probe failed".to_string()))
        }
        (other, _) => (DependencyStatus::Down, Some(format!("gateway {other}"))),
    };

    DependencyReport {
        status,
        required: true,
        latency_ms,
        message,
    }
}

/// Overall status from dependency reports
///
/// A required dependency that is down makes the service unhealthy; any
/// degraded or optional-down dependency makes it degraded.
#[must_use]
pub fn aggregate<'a>(reports: impl IntoIterator<Item = &'a DependencyReport>) -> HealthStatus {
    let mut status = HealthStatus::Healthy;
    for report in reports {
        match (report.status, report.required) {
            (DependencyStatus::Down, true) => return HealthStatus::Unhealthy,
            (DependencyStatus::Down | DependencyStatus::Degraded, _) => {
                status = HealthStatus::Degraded;
            }
            (DependencyStatus::Up, _) => {}
        }
    }
    status
}

struct Inner {
    config: HealthConfig,
    gateway: Arc<dyn GatewayProbe>,
    devices: Arc<dyn DeviceCounter>,
    started: tokio::time::Instant,
    latest: watch::Sender<Option<HealthReport>>,
}

/// Periodically checks dependencies and caches the latest report
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.inner.config)
            .field("latest", &self.latest().map(|r| r.status))
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    #[must_use]
    pub fn new(
        config: HealthConfig,
        gateway: Arc<dyn GatewayProbe>,
        devices: Arc<dyn DeviceCounter>,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                config,
                gateway,
                devices,
                started: tokio::time::Instant::now(),
                latest,
            }),
        }
    }

    /// Run every check now and cache the result
    pub async fn check_health(&self) -> HealthReport {
        let state = self.inner.gateway.link_state();
        let latency = if state == LinkState::Connected {
            self.inner.gateway.probe(self.inner.config.probe_timeout).await
        } else {
            None
        };
        let gateway = gateway_report(state, latency, self.inner.config.degraded_latency);
        let devices = self.inner.devices.device_count().await;

        let mut dependencies = BTreeMap::new();
        dependencies.insert("gateway".to_string(), gateway);
        let status = aggregate(dependencies.values());

        let report = HealthReport {
            status,
            dependencies,
            devices,
            uptime_secs: self.inner.started.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            checked_at: Utc::now(),
        };

        let previous = self.inner.latest.send_replace(Some(report.clone()));
        if previous.as_ref().map(|r| r.status) != Some(report.status) {
            tracing::info!(status = ?report.status, devices, "health status changed");
        }
        report
    }

    /// Most recent cached report
    #[must_use]
    pub fn latest(&self) -> Option<HealthReport> {
        self.inner.latest.borrow().clone()
    }

    /// Watch report updates
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<HealthReport>> {
        self.inner.latest.subscribe()
    }

    /// Whether the last check found the service able to take traffic
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner
            .latest
            .borrow()
            .as_ref()
            .is_some_and(|r| r.status != HealthStatus::Unhealthy)
    }

    /// Check on a fixed interval, and immediately when the gateway is
    /// reported unreachable
    pub async fn run(
        self,
        mut gateway_events: Option<broadcast::Receiver<GatewayEvent>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let period = self.inner.config.interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_health().await;
                }
                event = recv_event(gateway_events.as_mut()) => match event {
                    Ok(GatewayEvent::Unreachable) => {
                        tracing::warn!("gateway unreachable, rechecking health");
                        self.check_health().await;
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => gateway_events = None,
                },
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            }
        }
        tracing::debug!("health monitor stopped");
    }
}

async fn recv_event(
    events: Option<&mut broadcast::Receiver<GatewayEvent>>,
) -> Result<GatewayEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
