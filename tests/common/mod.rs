//! Shared test utilities
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use uebot_bridge::gateway::GatewayMessage;
use uebot_bridge::protocol::{
    AudioEndPayload, AudioFormat, AudioFrame, AudioStartPayload, Capabilities, ErrorPayload,
    Message, RegisterPayload, RegisteredPayload,
};
use uebot_bridge::relay::{
    AbortReason, AudioPipeline, DeviceRouter, Relay, RelayConfig, StreamContext, StreamSummary,
};
use uebot_bridge::transport::{Connection, Frame, memory};

/// How long a test waits for any single frame
pub const WAIT: Duration = Duration::from_secs(5);

/// Relay settings with short timers
pub fn relay_config() -> RelayConfig {
    RelayConfig {
        handshake_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(1),
        missed_heartbeats: 3,
        stream_idle_timeout: Duration::from_secs(2),
        stream_check_interval: Duration::from_millis(250),
        ..RelayConfig::default()
    }
}

/// Relay with a recording pipeline
pub fn relay(config: RelayConfig) -> (Relay, mpsc::UnboundedReceiver<Recorded>) {
    let (pipeline, recorded) = RecordingPipeline::new();
    let relay = Relay::new(config, DeviceRouter::new(), Arc::new(pipeline));
    (relay, recorded)
}

pub fn register_payload(device_id: &str, session_id: Option<&str>) -> RegisterPayload {
    RegisterPayload {
        device_id: device_id.to_string(),
        name: Some("test module".to_string()),
        firmware_version: "1.0.0".to_string(),
        capabilities: Capabilities::default(),
        session_id: session_id.map(ToString::to_string),
    }
}

/// Pipeline call as observed by [`RecordingPipeline`]
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Started {
        device_id: String,
        stream_id: u16,
    },
    Chunk {
        device_id: String,
        stream_id: u16,
        sequence: u16,
        payload: Bytes,
    },
    Finished {
        device_id: String,
        summary: StreamSummary,
    },
    Aborted {
        device_id: String,
        stream_id: u16,
        reason: AbortReason,
    },
}

/// Pipeline that reports every call on a channel
pub struct RecordingPipeline {
    tx: mpsc::UnboundedSender<Recorded>,
}

impl RecordingPipeline {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Recorded>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl AudioPipeline for RecordingPipeline {
    async fn stream_started(&self, ctx: &StreamContext) {
        let _ = self.tx.send(Recorded::Started {
            device_id: ctx.device_id.clone(),
            stream_id: ctx.stream_id,
        });
    }

    async fn audio_chunk(&self, ctx: &StreamContext, sequence: u16, payload: Bytes) {
        let _ = self.tx.send(Recorded::Chunk {
            device_id: ctx.device_id.clone(),
            stream_id: ctx.stream_id,
            sequence,
            payload,
        });
    }

    async fn stream_finished(&self, ctx: &StreamContext, summary: StreamSummary) {
        let _ = self.tx.send(Recorded::Finished {
            device_id: ctx.device_id.clone(),
            summary,
        });
    }

    async fn stream_aborted(&self, ctx: &StreamContext, reason: AbortReason) {
        let _ = self.tx.send(Recorded::Aborted {
            device_id: ctx.device_id.clone(),
            stream_id: ctx.stream_id,
            reason,
        });
    }
}

/// Next pipeline call, failing the test if none arrives
pub async fn next_recorded(rx: &mut mpsc::UnboundedReceiver<Recorded>) -> Recorded {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("pipeline call timed out")
        .expect("pipeline dropped")
}

/// Scripted voice module talking to a relay over an in-memory connection
pub struct FakeDevice {
    pub conn: Connection,
}

impl FakeDevice {
    /// Open a connection without registering
    pub fn connect(relay: &Relay) -> Self {
        let (local, remote) = memory::pair();
        relay.accept(remote);
        Self { conn: local }
    }

    /// Connect and complete the handshake
    pub async fn register(relay: &Relay, device_id: &str) -> (Self, RegisteredPayload) {
        Self::register_with(relay, register_payload(device_id, None)).await
    }

    pub async fn register_with(relay: &Relay, payload: RegisterPayload) -> (Self, RegisteredPayload) {
        let mut device = Self::connect(relay);
        device.send(&Message::Register { payload }).await;
        match device.next_message().await {
            Message::Registered { payload } => (device, payload),
            other => panic!("expected device:registered, got {other:?}"),
        }
    }

    pub async fn send(&self, message: &Message) {
        self.conn
            .sender
            .send(Frame::Text(message.to_json().unwrap()))
            .await
            .expect("relay closed the connection");
    }

    pub async fn send_raw(&self, frame: Frame) {
        self.conn.sender.send(frame).await.expect("relay closed the connection");
    }

    pub async fn send_audio(&self, stream_id: u16, sequence: u16, payload: &[u8]) {
        let frame = AudioFrame::new(stream_id, sequence, Bytes::copy_from_slice(payload)).unwrap();
        self.send_raw(Frame::Binary(frame.encode())).await;
    }

    pub async fn start_stream(&self, stream_id: u16) {
        self.send(&Message::AudioStart {
            payload: AudioStartPayload {
                stream_id,
                format: AudioFormat::default(),
            },
        })
        .await;
    }

    pub async fn end_stream(&self, stream_id: u16) {
        self.send(&Message::AudioEnd {
            payload: AudioEndPayload { stream_id },
        })
        .await;
    }

    /// Next frame of any kind; `None` once the relay closed the connection
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::time::timeout(WAIT, self.conn.receiver.recv())
            .await
            .expect("no frame from relay")
    }

    /// Next control message, skipping heartbeat pings
    pub async fn next_message(&mut self) -> Message {
        loop {
            match self.recv().await {
                Some(Frame::Text(text)) => match Message::from_json(&text).unwrap() {
                    Message::Ping { .. } => {}
                    message => return message,
                },
                Some(Frame::Binary(_)) => panic!("unexpected binary frame"),
                None => panic!("connection closed"),
            }
        }
    }

    pub async fn next_error(&mut self) -> ErrorPayload {
        match self.next_message().await {
            Message::Error { payload } => payload,
            other => panic!("expected error, got {other:?}"),
        }
    }

    pub async fn next_audio(&mut self) -> AudioFrame {
        match self.recv().await {
            Some(Frame::Binary(data)) => AudioFrame::decode(data).unwrap(),
            other => panic!("expected audio frame, got {other:?}"),
        }
    }

    /// Wait for the relay to close the connection, ignoring anything sent first
    pub async fn closed(&mut self) {
        while self.recv().await.is_some() {}
    }
}

/// Accepts one connection from a [`memory::MemoryConnector`] and plays
/// the gateway
pub struct FakeGateway {
    pub conn: Connection,
}

impl FakeGateway {
    pub async fn accept(listener: &mut memory::MemoryListener) -> Self {
        let conn = tokio::time::timeout(WAIT, listener.accept())
            .await
            .expect("no gateway connection")
            .expect("connector dropped");
        Self { conn }
    }

    pub async fn next(&mut self) -> Option<GatewayMessage> {
        let frame = tokio::time::timeout(WAIT, self.conn.receiver.recv())
            .await
            .expect("no gateway frame")?;
        match frame {
            Frame::Text(text) => Some(GatewayMessage::from_json(&text).unwrap()),
            Frame::Binary(_) => panic!("binary frame on gateway connection"),
        }
    }

    /// Next request, answering any pings in between
    pub async fn next_request(&mut self) -> (String, Value) {
        loop {
            match self.next().await.expect("gateway connection closed") {
                GatewayMessage::Request { id, payload } => return (id, payload),
                GatewayMessage::Ping { id } => self.send(&GatewayMessage::Pong { id }).await,
                other => panic!("unexpected gateway message {other:?}"),
            }
        }
    }

    pub async fn send(&self, message: &GatewayMessage) {
        self.conn
            .sender
            .send(Frame::Text(message.to_json().unwrap()))
            .await
            .expect("client closed the connection");
    }

    pub async fn respond(&self, id: &str, payload: Value) {
        self.send(&GatewayMessage::Response {
            id: id.to_string(),
            payload: Some(payload),
            error: None,
        })
        .await;
    }
}
