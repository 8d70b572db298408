//! Registry of connected devices

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

use super::pipeline::Outbound;
use super::stream::{AudioStream, SequenceCheck, StreamContext, StreamSummary};
use crate::protocol::{AudioFormat, Capabilities, DeviceStatus, ErrorCode, RegisterPayload};

/// Connection phase of a device record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
    Error,
}

/// A registered device
#[derive(Debug)]
pub struct Device {
    pub device_id: String,
    pub name: Option<String>,
    pub firmware_version: String,
    pub capabilities: Capabilities,
    pub state: DeviceState,
    pub session_id: String,
    /// Connection currently owning this record
    pub connection_id: u64,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub telemetry: Option<DeviceStatus>,
    pub(crate) stream: Option<AudioStream>,
    pub(crate) outbound: mpsc::Sender<Outbound>,
}

/// Serializable view of a device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub name: Option<String>,
    pub firmware_version: String,
    pub capabilities: Capabilities,
    pub state: DeviceState,
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub telemetry: Option<DeviceStatus>,
    pub active_stream: Option<u16>,
}

impl From<&Device> for DeviceSnapshot {
    fn from(device: &Device) -> Self {
        Self {
            device_id: device.device_id.clone(),
            name: device.name.clone(),
            firmware_version: device.firmware_version.clone(),
            capabilities: device.capabilities,
            state: device.state,
            session_id: device.session_id.clone(),
            connected_at: device.connected_at,
            last_seen: device.last_seen,
            telemetry: device.telemetry.clone(),
            active_stream: device.stream.as_ref().map(AudioStream::stream_id),
        }
    }
}

/// Why a device operation was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The device re-registered on another connection
    Superseded,
    /// The device broke the protocol; report `code` and keep going
    Violation { code: ErrorCode, message: String },
}

impl RegistryError {
    fn violation(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Violation {
            code,
            message: message.into(),
        }
    }
}

/// Outcome of a registration
#[derive(Debug)]
pub struct Registration {
    pub session_id: String,
    pub resumed: bool,
    /// Previous connection of the same device, now detached
    pub replaced: Option<Replaced>,
}

/// What was left of a superseded connection
#[derive(Debug)]
pub struct Replaced {
    pub connection_id: u64,
    pub stream: Option<AudioStream>,
}

/// Accepted binary frame
#[derive(Debug, Clone)]
pub struct AcceptedFrame {
    pub check: SequenceCheck,
    pub context: Arc<StreamContext>,
}

/// Devices keyed by id, plus recently closed sessions for resumption
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
    recent_sessions: HashMap<String, (String, Instant)>,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device on a connection
    ///
    /// An existing record for the same device id is replaced. The session id
    /// the device offers is reissued when it matches its live session or one
    /// closed less than `resume_window` ago.
    pub fn register(
        &mut self,
        payload: RegisterPayload,
        connection_id: u64,
        outbound: mpsc::Sender<Outbound>,
        resume_window: Duration,
        now: Instant,
    ) -> Registration {
        let previous = self.devices.remove(&payload.device_id);
        let recent = self.recent_sessions.remove(&payload.device_id);

        let live_session = previous.as_ref().map(|d| d.session_id.as_str());
        let recent_session = recent
            .as_ref()
            .filter(|(_, closed_at)| now.saturating_duration_since(*closed_at) < resume_window)
            .map(|(id, _)| id.as_str());

        let resumed = payload
            .session_id
            .as_deref()
            .is_some_and(|offered| Some(offered) == live_session || Some(offered) == recent_session);
        let session_id = match payload.session_id {
            Some(id) if resumed => id,
            _ => Uuid::new_v4().to_string(),
        };

        let replaced = previous.map(|old| Replaced {
            connection_id: old.connection_id,
            stream: old.stream,
        });

        let timestamp = Utc::now();
        self.devices.insert(
            payload.device_id.clone(),
            Device {
                device_id: payload.device_id,
                name: payload.name,
                firmware_version: payload.firmware_version,
                capabilities: payload.capabilities,
                state: DeviceState::Registered,
                session_id: session_id.clone(),
                connection_id,
                connected_at: timestamp,
                last_seen: timestamp,
                telemetry: None,
                stream: None,
                outbound,
            },
        );

        Registration {
            session_id,
            resumed,
            replaced,
        }
    }

    /// Remove a device if `connection_id` still owns it
    ///
    /// The session is remembered for resumption.
    pub fn unregister(&mut self, device_id: &str, connection_id: u64, now: Instant) -> Option<Device> {
        if self.devices.get(device_id)?.connection_id != connection_id {
            return None;
        }
        let mut device = self.devices.remove(device_id)?;
        device.state = DeviceState::Disconnected;
        self.recent_sessions
            .insert(device_id.to_string(), (device.session_id.clone(), now));
        Some(device)
    }

    /// Drop remembered sessions older than `window`
    pub fn prune_sessions(&mut self, window: Duration, now: Instant) {
        self.recent_sessions
            .retain(|_, (_, closed_at)| now.saturating_duration_since(*closed_at) < window);
    }

    #[must_use]
    pub fn get(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    #[must_use]
    pub fn list(&self) -> Vec<&Device> {
        self.devices.values().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Outbound queue for a device
    #[must_use]
    pub fn outbound(&self, device_id: &str) -> Option<mpsc::Sender<Outbound>> {
        self.devices.get(device_id).map(|d| d.outbound.clone())
    }

    fn owned(&mut self, device_id: &str, connection_id: u64) -> Result<&mut Device, RegistryError> {
        match self.devices.get_mut(device_id) {
            Some(device) if device.connection_id == connection_id => {
                device.last_seen = Utc::now();
                Ok(device)
            }
            _ => Err(RegistryError::Superseded),
        }
    }

    /// Record inbound activity
    ///
    /// # Errors
    ///
    /// `Superseded` if another connection owns the device
    pub fn touch(&mut self, device_id: &str, connection_id: u64) -> Result<(), RegistryError> {
        self.owned(device_id, connection_id).map(|_| ())
    }

    /// Store the latest telemetry
    ///
    /// # Errors
    ///
    /// `Superseded` if another connection owns the device
    pub fn update_status(
        &mut self,
        device_id: &str,
        connection_id: u64,
        status: DeviceStatus,
    ) -> Result<(), RegistryError> {
        self.owned(device_id, connection_id)?.telemetry = Some(status);
        Ok(())
    }

    /// Open a stream, returning the one it replaces
    ///
    /// # Errors
    ///
    /// `Superseded` if another connection owns the device, or a violation
    /// for an unusable format
    pub fn start_stream(
        &mut self,
        device_id: &str,
        connection_id: u64,
        stream_id: u16,
        format: AudioFormat,
        now: Instant,
    ) -> Result<(Arc<StreamContext>, Option<AudioStream>), RegistryError> {
        if let Err(reason) = format.validate() {
            return Err(RegistryError::violation(ErrorCode::InvalidFormat, reason));
        }

        let device = self.owned(device_id, connection_id)?;
        let stream = AudioStream::new(
            StreamContext {
                device_id: device.device_id.clone(),
                session_id: device.session_id.clone(),
                stream_id,
                format,
            },
            now,
        );
        let context = Arc::clone(stream.context());
        let replaced = device.stream.replace(stream);
        Ok((context, replaced))
    }

    /// Validate and account for a binary frame
    ///
    /// # Errors
    ///
    /// `Superseded`, or a violation if no stream is open or the stream id
    /// does not match
    pub fn accept_frame(
        &mut self,
        device_id: &str,
        connection_id: u64,
        stream_id: u16,
        sequence: u16,
        len: usize,
        now: Instant,
    ) -> Result<AcceptedFrame, RegistryError> {
        let device = self.owned(device_id, connection_id)?;
        let Some(stream) = device.stream.as_mut() else {
            return Err(RegistryError::violation(
                ErrorCode::NoActiveStream,
                "audio data without audio:start",
            ));
        };
        if stream.stream_id() != stream_id {
            return Err(RegistryError::violation(
                ErrorCode::StreamMismatch,
                format!("active stream is {}, got {stream_id}", stream.stream_id()),
            ));
        }

        Ok(AcceptedFrame {
            check: stream.accept(sequence, len, now),
            context: Arc::clone(stream.context()),
        })
    }

    /// Close the active stream
    ///
    /// # Errors
    ///
    /// `Superseded`, or a violation if no stream is open or the id differs
    pub fn end_stream(
        &mut self,
        device_id: &str,
        connection_id: u64,
        stream_id: u16,
        now: Instant,
    ) -> Result<(Arc<StreamContext>, StreamSummary), RegistryError> {
        let device = self.owned(device_id, connection_id)?;
        match device.stream.as_ref().map(AudioStream::stream_id) {
            None => Err(RegistryError::violation(
                ErrorCode::NoActiveStream,
                "audio:end without audio:start",
            )),
            Some(active) if active != stream_id => Err(RegistryError::violation(
                ErrorCode::StreamMismatch,
                format!("active stream is {active}, got {stream_id}"),
            )),
            Some(_) => {
                let mut stream = device
                    .stream
                    .take()
                    .ok_or(RegistryError::Superseded)?;
                let summary = stream.finish(now);
                Ok((Arc::clone(stream.context()), summary))
            }
        }
    }

    /// Remove the active stream if it has seen no audio for `timeout`
    pub fn take_idle_stream(
        &mut self,
        device_id: &str,
        connection_id: u64,
        timeout: Duration,
        now: Instant,
    ) -> Option<AudioStream> {
        let device = self.devices.get_mut(device_id)?;
        if device.connection_id != connection_id {
            return None;
        }
        if device.stream.as_ref()?.is_idle(now, timeout) {
            device.stream.take()
        } else {
            None
        }
    }
}

/// Why a device left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Connection closed by the device or the network
    Closed,
    /// Same device registered on a new connection
    Replaced,
    /// Malformed binary frame
    TransportError,
    /// Relay shutting down
    Shutdown,
}

/// Registry change notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Connected {
        device_id: String,
        session_id: String,
        resumed: bool,
    },
    Disconnected {
        device_id: String,
        reason: DisconnectReason,
    },
    /// Heartbeats missed; connection was closed by the relay
    Evicted { device_id: String },
}

/// Shared handle to the registry
///
/// Cheap to clone; all clones see the same devices.
#[derive(Debug, Clone)]
pub struct DeviceRouter {
    registry: Arc<Mutex<DeviceRegistry>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for DeviceRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRouter {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            registry: Arc::new(Mutex::new(DeviceRegistry::new())),
            events,
        }
    }

    /// Lock the registry
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, DeviceRegistry> {
        self.registry.lock().await
    }

    /// Subscribe to registry events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub async fn device_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    pub async fn devices(&self) -> Vec<DeviceSnapshot> {
        let registry = self.registry.lock().await;
        let mut devices: Vec<DeviceSnapshot> =
            registry.list().into_iter().map(DeviceSnapshot::from).collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    pub async fn device(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.registry.lock().await.get(device_id).map(DeviceSnapshot::from)
    }

    /// Queue a message for a device
    ///
    /// Returns `false`, after logging, if the device is unknown or its
    /// queue is full or closed. Nothing is held back for later delivery.
    pub async fn deliver(&self, device_id: &str, message: Outbound) -> bool {
        let Some(outbound) = self.registry.lock().await.outbound(device_id) else {
            tracing::warn!(device_id, kind = message.kind(), "dropping message for unknown device");
            return false;
        };

        match outbound.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                tracing::warn!(device_id, kind = message.kind(), "device queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                tracing::warn!(device_id, kind = message.kind(), "device disconnected, dropping message");
                false
            }
        }
    }
}
