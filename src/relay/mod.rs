//! Device relay
//!
//! Accepts device connections, runs the registration handshake and
//! heartbeat, tracks one audio stream per device and hands audio to an
//! [`AudioPipeline`]. Results come back through [`Relay::deliver`], routed
//! by device id.

mod pipeline;
mod registry;
mod session;
mod stream;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::transport::Connection;

pub use pipeline::{AudioPipeline, GatewayPipeline, NullPipeline, Outbound};
pub use registry::{
    AcceptedFrame, Device, DeviceRegistry, DeviceRouter, DeviceSnapshot, DeviceState,
    DisconnectReason, Registration, RegistryError, RegistryEvent, Replaced,
};
pub use stream::{
    AbortReason, AudioStream, SequenceCheck, StreamContext, StreamState, StreamSummary,
};

/// Relay timing and limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Time a new connection has to send `device:register`
    #[serde(with = "crate::config::millis")]
    pub handshake_timeout: Duration,
    /// Interval between relay pings
    #[serde(with = "crate::config::millis")]
    pub heartbeat_interval: Duration,
    /// Heartbeat intervals without inbound traffic before eviction
    pub missed_heartbeats: u32,
    /// A stream with no audio for this long is aborted
    #[serde(with = "crate::config::millis")]
    pub stream_idle_timeout: Duration,
    #[serde(with = "crate::config::millis")]
    pub stream_check_interval: Duration,
    /// How long a closed session can be resumed
    #[serde(with = "crate::config::millis")]
    pub session_resume: Duration,
    /// Per-device outbound queue depth
    pub outbound_queue: usize,
    /// Largest PCM payload per playback frame
    pub max_frame_payload: usize,
    /// Cap on a buffered utterance
    pub max_utterance_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            missed_heartbeats: 3,
            stream_idle_timeout: Duration::from_secs(10),
            stream_check_interval: Duration::from_secs(1),
            session_resume: Duration::from_secs(300),
            outbound_queue: 64,
            max_frame_payload: 1024,
            max_utterance_bytes: 1024 * 1024,
        }
    }
}

impl RelayConfig {
    /// Silence after which a device is evicted
    #[must_use]
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.missed_heartbeats.max(1))
    }
}

/// Multiplexes device connections
///
/// Cheap to clone; clones share the registry and pipeline.
#[derive(Clone)]
pub struct Relay {
    config: Arc<RelayConfig>,
    router: DeviceRouter,
    pipeline: Arc<dyn AudioPipeline>,
    connections: Arc<AtomicU64>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("config", &self.config)
            .field("connections", &self.connections.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Relay {
    #[must_use]
    pub fn new(config: RelayConfig, router: DeviceRouter, pipeline: Arc<dyn AudioPipeline>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            router,
            pipeline,
            connections: Arc::new(AtomicU64::new(0)),
            shutdown: Arc::new(shutdown),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    #[must_use]
    pub const fn router(&self) -> &DeviceRouter {
        &self.router
    }

    /// Serve one device connection on its own task
    pub fn accept(&self, connection: Connection) -> JoinHandle<()> {
        let connection_id = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(connection_id, "device connection accepted");
        tokio::spawn(session::run(self.clone(), connection, connection_id))
    }

    /// Queue a message for a device; see [`DeviceRouter::deliver`]
    pub async fn deliver(&self, device_id: &str, message: Outbound) -> bool {
        self.router.deliver(device_id, message).await
    }

    pub async fn device_count(&self) -> usize {
        self.router.device_count().await
    }

    /// Close every device connection
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}
