//! Device-side connection to the relay
//!
//! A [`DeviceLink`] owns one logical connection: it registers, streams
//! audio, answers heartbeats and, when the connection drops without
//! `close()` being called, reconnects with exponential backoff. Everything
//! the relay sends arrives as a [`LinkEvent`] on the channel returned by
//! [`DeviceLink::new`].

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::protocol::{
    AudioEndPayload, AudioFormat, AudioFrame, AudioResponsePayload, AudioStartPayload,
    Capabilities, CommandPayload, DeviceStatus, ErrorPayload, Message, RegisterPayload,
    RegisteredPayload, chunk_frames,
};
use crate::reconnect::{ConnectionState, LinkState, ReconnectPolicy, Retry};
use crate::transport::{Connection, Connector, Frame};
use crate::{Error, Result};

/// Device identity and link tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceLinkConfig {
    pub device_id: String,
    /// Display name sent at registration, omitted when empty
    pub name: String,
    pub firmware_version: String,
    pub capabilities: Capabilities,
    /// Time allowed for `device:registered` to arrive
    #[serde(with = "crate::config::millis")]
    pub handshake_timeout: Duration,
    /// Largest PCM payload per binary frame
    pub max_frame_payload: usize,
    /// Depth of the inbound event channel
    pub event_queue: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for DeviceLinkConfig {
    fn default() -> Self {
        Self {
            device_id: "esp32-001".to_string(),
            name: "UE-Bot Voice Module".to_string(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: Capabilities::default(),
            handshake_timeout: Duration::from_secs(10),
            max_frame_payload: 1024,
            event_queue: 64,
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(5_000),
                factor: 2,
                max_delay: Duration::from_secs(60),
                max_attempts: 10,
            },
        }
    }
}

/// Session granted by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub device_id: String,
    pub heartbeat_interval: Duration,
    /// The relay reissued the session held before a reconnect
    pub resumed: bool,
}

/// Something that happened on the link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Registered with the relay
    Connected(SessionInfo),
    /// Connection lost; any active stream was abandoned
    Disconnected,
    /// Waiting `delay` before reconnect attempt number `attempt` (1-based)
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect attempts exhausted, link is in `Error`
    GaveUp,
    /// Header announcing playback frames
    Playback(AudioResponsePayload),
    /// One binary playback frame
    PlaybackChunk(AudioFrame),
    Command(CommandPayload),
    /// The relay rejected something we sent
    ServerError(ErrorPayload),
}

#[derive(Debug, Clone, Copy)]
struct ActiveStream {
    stream_id: u16,
    next_sequence: u16,
    bytes: u64,
}

struct Inner {
    config: DeviceLinkConfig,
    connector: Arc<dyn Connector>,
    conn: Mutex<ConnectionState>,
    state_tx: watch::Sender<LinkState>,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    stream: Mutex<Option<ActiveStream>>,
    session: Mutex<Option<SessionInfo>>,
    next_stream_id: AtomicU16,
    events: mpsc::Sender<LinkEvent>,
    shutdown: watch::Sender<bool>,
    supervising: AtomicBool,
}

/// Connection from a device to the relay
#[derive(Clone)]
pub struct DeviceLink {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("device_id", &self.inner.config.device_id)
            .field("endpoint", &self.inner.connector.endpoint())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

enum Step {
    Run(mpsc::Receiver<Frame>),
    Wait(Retry),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl DeviceLink {
    /// Create a link and the receiver for its events
    #[must_use]
    pub fn new(
        config: DeviceLinkConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (events, events_rx) = mpsc::channel(config.event_queue.max(1));
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        let (shutdown, _) = watch::channel(false);

        let link = Self {
            inner: Arc::new(Inner {
                config,
                connector,
                conn: Mutex::new(ConnectionState::new()),
                state_tx,
                outbound: Mutex::new(None),
                stream: Mutex::new(None),
                session: Mutex::new(None),
                next_stream_id: AtomicU16::new(1),
                events,
                shutdown,
                supervising: AtomicBool::new(false),
            }),
        };
        (link, events_rx)
    }

    #[must_use]
    pub fn config(&self) -> &DeviceLinkConfig {
        &self.inner.config
    }

    /// Current connection phase
    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.inner.state_tx.borrow()
    }

    /// Watch connection phase changes
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state_tx.subscribe()
    }

    /// Session granted at the last successful registration
    #[must_use]
    pub fn session(&self) -> Option<SessionInfo> {
        lock(&self.inner.session).clone()
    }

    /// Whether an audio stream is open
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        lock(&self.inner.stream).is_some()
    }

    /// Open the connection and register
    ///
    /// On failure the link is left in `Error` with a retry scheduled; the
    /// background task keeps trying until it succeeds, gives up or the link
    /// is closed.
    ///
    /// # Errors
    ///
    /// Returns the connect or handshake error of the first attempt, or
    /// `Error::Unavailable` if the link is already running or was closed
    pub async fn connect(&self) -> Result<SessionInfo> {
        if self.inner.supervising.swap(true, Ordering::SeqCst) {
            return Err(Error::Unavailable("link already started".to_string()));
        }
        self.transition(|c, _| c.restart());

        match self.establish().await {
            Ok((session, receiver)) => {
                self.spawn_supervisor(Step::Run(receiver));
                Ok(session)
            }
            Err(e) => {
                tracing::warn!(
                    device_id = %self.inner.config.device_id,
                    endpoint = %self.inner.connector.endpoint(),
                    error = %e,
                    "initial connect failed"
                );
                let retry = self.transition(|c, policy| c.failed(Instant::now(), policy, true));
                self.spawn_supervisor(Step::Wait(retry));
                Err(e)
            }
        }
    }

    /// Announce a new audio stream and return its id
    ///
    /// A stream still open is ended first.
    ///
    /// # Errors
    ///
    /// Returns `Error::Unavailable` when not connected, or an invalid format
    pub async fn start_audio_stream(&self, format: AudioFormat) -> Result<u16> {
        format.validate().map_err(Error::Protocol)?;
        if self.is_streaming() {
            self.end_audio_stream().await?;
        }

        let stream_id = self.allocate_stream_id();
        self.send(&Message::AudioStart {
            payload: AudioStartPayload { stream_id, format },
        })
        .await?;

        *lock(&self.inner.stream) = Some(ActiveStream {
            stream_id,
            next_sequence: 0,
            bytes: 0,
        });
        tracing::debug!(stream_id, "audio stream started");
        Ok(stream_id)
    }

    /// Send PCM for the active stream
    ///
    /// Returns `false` when no stream is open or the link is down.
    pub async fn send_audio_chunk(&self, pcm: &[u8]) -> bool {
        let Some(sender) = lock(&self.inner.outbound).clone() else {
            return false;
        };

        let frames = {
            let mut stream = lock(&self.inner.stream);
            let Some(active) = stream.as_mut() else {
                return false;
            };
            let (frames, next) = chunk_frames(
                active.stream_id,
                active.next_sequence,
                &Bytes::copy_from_slice(pcm),
                self.inner.config.max_frame_payload,
            );
            active.next_sequence = next;
            active.bytes += pcm.len() as u64;
            frames
        };

        for frame in frames {
            if sender.send(Frame::Binary(frame.encode())).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Close the active stream
    ///
    /// # Errors
    ///
    /// Returns `Error::Unavailable` if no stream is open or the link is down
    pub async fn end_audio_stream(&self) -> Result<()> {
        let Some(active) = lock(&self.inner.stream).take() else {
            return Err(Error::Unavailable("no active stream".to_string()));
        };

        tracing::debug!(
            stream_id = active.stream_id,
            bytes = active.bytes,
            "audio stream ended"
        );
        self.send(&Message::AudioEnd {
            payload: AudioEndPayload {
                stream_id: active.stream_id,
            },
        })
        .await
    }

    /// Best-effort telemetry; never waits on a full queue
    pub fn send_status(&self, status: DeviceStatus) -> bool {
        let Some(sender) = lock(&self.inner.outbound).clone() else {
            return false;
        };
        let Ok(json) = (Message::Status { payload: status }).to_json() else {
            return false;
        };
        sender.try_send(Frame::Text(json)).is_ok()
    }

    /// Intentional, terminal disconnect
    pub fn close(&self) {
        lock(&self.inner.conn).close();
        self.inner.state_tx.send_replace(LinkState::Disconnected);
        lock(&self.inner.outbound).take();
        lock(&self.inner.stream).take();
        self.inner.shutdown.send_replace(true);
        tracing::info!(device_id = %self.inner.config.device_id, "device link closed");
    }

    fn allocate_stream_id(&self) -> u16 {
        loop {
            let id = self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    async fn send(&self, message: &Message) -> Result<()> {
        let sender = lock(&self.inner.outbound)
            .clone()
            .ok_or_else(|| Error::Unavailable("not connected".to_string()))?;
        sender
            .send(Frame::Text(message.to_json()?))
            .await
            .map_err(|_| Error::Transport("connection closed".to_string()))
    }

    async fn emit(&self, event: LinkEvent) {
        let _ = self.inner.events.send(event).await;
    }

    /// Apply a state transition and publish the resulting phase
    fn transition<T>(&self, f: impl FnOnce(&mut ConnectionState, &ReconnectPolicy) -> T) -> T {
        let mut conn = lock(&self.inner.conn);
        let out = f(&mut conn, &self.inner.config.reconnect);
        self.inner.state_tx.send_replace(conn.state());
        out
    }

    fn spawn_supervisor(&self, first: Step) {
        let link = self.clone();
        tokio::spawn(async move { link.supervise(first).await });
    }

    async fn supervise(self, mut step: Step) {
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            let retry = match step {
                Step::Run(receiver) => {
                    self.pump(receiver, &mut shutdown).await;
                    self.abandon_connection().await;
                    self.transition(|c, policy| c.failed(Instant::now(), policy, false))
                }
                Step::Wait(retry) => retry,
            };

            let (attempt, delay) = match retry {
                Retry::Stop => break,
                Retry::GiveUp => {
                    tracing::error!(
                        device_id = %self.inner.config.device_id,
                        "reconnect attempts exhausted"
                    );
                    // Released before announcing so a caller reacting to
                    // `GaveUp` can connect again
                    self.inner.supervising.store(false, Ordering::SeqCst);
                    self.emit(LinkEvent::GaveUp).await;
                    return;
                }
                Retry::After { attempt, delay, .. } => (attempt + 1, delay),
            };

            tracing::info!(attempt, delay_ms = delay.as_millis(), "reconnecting to relay");
            self.emit(LinkEvent::Reconnecting { attempt, delay }).await;

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = async { let _ = shutdown.wait_for(|closed| *closed).await; } => break,
            }

            step = match self.establish().await {
                Ok((_, receiver)) => Step::Run(receiver),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                    Step::Wait(self.transition(|c, policy| c.failed(Instant::now(), policy, false)))
                }
            };
        }

        self.inner.supervising.store(false, Ordering::SeqCst);
    }

    /// One connect + register attempt
    async fn establish(&self) -> Result<(SessionInfo, mpsc::Receiver<Frame>)> {
        if !self.transition(|c, _| c.begin_attempt()) {
            return Err(Error::Unavailable("link closed".to_string()));
        }

        let Connection {
            sender,
            mut receiver,
        } = self.inner.connector.connect().await?;

        let previous = lock(&self.inner.session)
            .as_ref()
            .map(|s| s.session_id.clone());
        let config = &self.inner.config;
        let register = Message::Register {
            payload: RegisterPayload {
                device_id: config.device_id.clone(),
                name: (!config.name.is_empty()).then(|| config.name.clone()),
                firmware_version: config.firmware_version.clone(),
                capabilities: config.capabilities,
                session_id: previous.clone(),
            },
        };
        sender
            .send(Frame::Text(register.to_json()?))
            .await
            .map_err(|_| Error::Handshake("connection closed before register".to_string()))?;

        let registered = tokio::time::timeout(
            config.handshake_timeout,
            await_registered(&sender, &mut receiver),
        )
        .await
        .map_err(|_| Error::Handshake("timed out waiting for device:registered".to_string()))??;

        let session = SessionInfo {
            resumed: previous.as_deref() == Some(registered.session_id.as_str()),
            session_id: registered.session_id,
            device_id: registered.device_id,
            heartbeat_interval: Duration::from_millis(registered.heartbeat_interval_ms),
        };

        {
            let mut conn = lock(&self.inner.conn);
            if conn.is_closed() {
                return Err(Error::Unavailable("link closed".to_string()));
            }
            conn.connected();
            *lock(&self.inner.outbound) = Some(sender);
            *lock(&self.inner.session) = Some(session.clone());
            self.inner.state_tx.send_replace(conn.state());
        }

        tracing::info!(
            device_id = %session.device_id,
            session_id = %session.session_id,
            resumed = session.resumed,
            "registered with relay"
        );
        self.emit(LinkEvent::Connected(session.clone())).await;
        Ok((session, receiver))
    }

    /// Dispatch inbound frames until the connection ends or the link closes
    async fn pump(&self, mut receiver: mpsc::Receiver<Frame>, shutdown: &mut watch::Receiver<bool>) {
        loop {
            let frame = tokio::select! {
                frame = receiver.recv() => frame,
                _ = async { let _ = shutdown.wait_for(|closed| *closed).await; } => return,
            };

            match frame {
                None => {
                    tracing::warn!(device_id = %self.inner.config.device_id, "relay connection lost");
                    return;
                }
                Some(Frame::Text(text)) => self.handle_text(&text).await,
                Some(Frame::Binary(data)) => match AudioFrame::decode(data) {
                    Ok(frame) => self.emit(LinkEvent::PlaybackChunk(frame)).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed playback frame, dropping connection");
                        return;
                    }
                },
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        let message = match Message::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable message from relay");
                return;
            }
        };

        match message {
            Message::Ping { id } => {
                if let Err(e) = self.send(&Message::Pong { id }).await {
                    tracing::debug!(error = %e, "failed to answer ping");
                }
            }
            Message::AudioResponse { payload } => self.emit(LinkEvent::Playback(payload)).await,
            Message::CommandExecute { payload } => self.emit(LinkEvent::Command(payload)).await,
            Message::Error { payload } => {
                tracing::warn!(code = ?payload.code, message = %payload.message, "relay error");
                self.emit(LinkEvent::ServerError(payload)).await;
            }
            Message::Pong { .. } => {}
            other => tracing::debug!(kind = other.kind(), "ignoring unexpected message"),
        }
    }

    /// Drop the outbound half and abandon any open stream
    async fn abandon_connection(&self) {
        lock(&self.inner.outbound).take();
        if let Some(active) = lock(&self.inner.stream).take() {
            tracing::warn!(
                stream_id = active.stream_id,
                bytes = active.bytes,
                "audio stream abandoned on disconnect"
            );
        }
        if !lock(&self.inner.conn).is_closed() {
            self.emit(LinkEvent::Disconnected).await;
        }
    }
}

/// Wait for `device:registered`, answering pings meanwhile
async fn await_registered(
    sender: &mpsc::Sender<Frame>,
    receiver: &mut mpsc::Receiver<Frame>,
) -> Result<RegisteredPayload> {
    loop {
        let Some(frame) = receiver.recv().await else {
            return Err(Error::Handshake("connection closed during handshake".to_string()));
        };
        let Frame::Text(text) = frame else {
            continue;
        };

        match Message::from_json(&text)? {
            Message::Registered { payload } => return Ok(payload),
            Message::Ping { id } => {
                let pong = Message::Pong { id }.to_json()?;
                let _ = sender.send(Frame::Text(pong)).await;
            }
            Message::Error { payload } => return Err(Error::Handshake(payload.message)),
            other => tracing::debug!(kind = other.kind(), "ignoring message before registration"),
        }
    }
}
