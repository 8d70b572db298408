//! Downstream audio processing
//!
//! The relay hands every accepted stream to an [`AudioPipeline`]. The
//! default [`GatewayPipeline`] buffers each utterance, sends it upstream as
//! one correlated request and routes the reply back to the device.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use serde_json::json;

use super::registry::DeviceRouter;
use super::stream::{AbortReason, StreamContext, StreamSummary};
use crate::gateway::GatewayClient;
use crate::protocol::{AudioFormat, CommandPayload, ErrorCode, ErrorPayload};

/// Message queued for delivery to a device
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Synthesized speech, sent as `audio:response` plus binary frames
    Speech {
        stream_id: u16,
        format: AudioFormat,
        audio: Bytes,
        text: Option<String>,
    },
    Command(CommandPayload),
    Error(ErrorPayload),
}

impl Outbound {
    /// Short name for logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Speech { .. } => "speech",
            Self::Command(_) => "command",
            Self::Error(_) => "error",
        }
    }
}

/// Receives audio streams from the relay
///
/// Calls for one device arrive in order from that device's session task.
#[async_trait]
pub trait AudioPipeline: Send + Sync + 'static {
    /// `audio:start` accepted
    async fn stream_started(&self, _ctx: &StreamContext) {}

    /// One accepted binary frame, in arrival order
    async fn audio_chunk(&self, ctx: &StreamContext, sequence: u16, payload: Bytes);

    /// `audio:end` received
    async fn stream_finished(&self, ctx: &StreamContext, summary: StreamSummary);

    /// Stream ended without `audio:end`
    async fn stream_aborted(&self, _ctx: &StreamContext, _reason: AbortReason) {}
}

/// Pipeline that discards all audio
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPipeline;

#[async_trait]
impl AudioPipeline for NullPipeline {
    async fn audio_chunk(&self, _ctx: &StreamContext, _sequence: u16, _payload: Bytes) {}

    async fn stream_finished(&self, ctx: &StreamContext, summary: StreamSummary) {
        tracing::debug!(
            device_id = %ctx.device_id,
            stream_id = summary.stream_id,
            bytes = summary.bytes,
            "discarding utterance"
        );
    }
}

/// Reply to a `voice.utterance` request
#[derive(Debug, Default, Deserialize)]
struct VoiceReply {
    #[serde(default)]
    text: Option<String>,
    /// Base64 PCM
    #[serde(default)]
    audio: Option<String>,
    #[serde(default)]
    format: Option<AudioFormat>,
    #[serde(default)]
    command: Option<CommandPayload>,
}

struct Buffer {
    data: BytesMut,
    truncated: bool,
}

/// Forwards finished utterances to the AI gateway
#[derive(Clone)]
pub struct GatewayPipeline {
    gateway: GatewayClient,
    router: DeviceRouter,
    request_timeout: Duration,
    max_utterance_bytes: usize,
    buffers: Arc<Mutex<HashMap<(String, u16), Buffer>>>,
}

impl std::fmt::Debug for GatewayPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayPipeline")
            .field("request_timeout", &self.request_timeout)
            .field("max_utterance_bytes", &self.max_utterance_bytes)
            .finish_non_exhaustive()
    }
}

impl GatewayPipeline {
    #[must_use]
    pub fn new(
        gateway: GatewayClient,
        router: DeviceRouter,
        request_timeout: Duration,
        max_utterance_bytes: usize,
    ) -> Self {
        Self {
            gateway,
            router,
            request_timeout,
            max_utterance_bytes,
            buffers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Streams currently being buffered
    #[must_use]
    pub fn buffered_streams(&self) -> usize {
        self.buffers().len()
    }

    fn buffers(&self) -> MutexGuard<'_, HashMap<(String, u16), Buffer>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self, ctx: &StreamContext) -> Option<Buffer> {
        self.buffers().remove(&(ctx.device_id.clone(), ctx.stream_id))
    }

    async fn process(self, ctx: StreamContext, audio: Bytes, summary: StreamSummary) {
        let request = json!({
            "kind": "voice.utterance",
            "device_id": ctx.device_id,
            "session_id": ctx.session_id,
            "stream_id": ctx.stream_id,
            "format": ctx.format,
            "duration_ms": u64::try_from(summary.duration.as_millis()).unwrap_or(u64::MAX),
            "gaps": summary.gaps,
            "audio": base64::engine::general_purpose::STANDARD.encode(&audio),
        });

        let reply = match self.gateway.request(request, self.request_timeout).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(device_id = %ctx.device_id, stream_id = ctx.stream_id, error = %e, "utterance request failed");
                self.router
                    .deliver(
                        &ctx.device_id,
                        Outbound::Error(ErrorPayload {
                            code: ErrorCode::Internal,
                            message: format!("gateway request failed: {e}"),
                        }),
                    )
                    .await;
                return;
            }
        };

        let reply: VoiceReply = match serde_json::from_value(reply) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(device_id = %ctx.device_id, error = %e, "unrecognized gateway reply");
                return;
            }
        };

        let audio = match reply.audio.as_deref().map(|a| base64::engine::general_purpose::STANDARD.decode(a)) {
            Some(Ok(pcm)) => Some(Bytes::from(pcm)),
            Some(Err(e)) => {
                tracing::warn!(device_id = %ctx.device_id, error = %e, "reply audio is not base64");
                None
            }
            None => None,
        };

        if audio.is_some() || reply.text.is_some() {
            self.router
                .deliver(
                    &ctx.device_id,
                    Outbound::Speech {
                        stream_id: ctx.stream_id,
                        format: reply.format.unwrap_or(ctx.format),
                        audio: audio.unwrap_or_default(),
                        text: reply.text,
                    },
                )
                .await;
        }
        if let Some(command) = reply.command {
            self.router.deliver(&ctx.device_id, Outbound::Command(command)).await;
        }
    }
}

#[async_trait]
impl AudioPipeline for GatewayPipeline {
    async fn stream_started(&self, ctx: &StreamContext) {
        self.buffers().insert(
            (ctx.device_id.clone(), ctx.stream_id),
            Buffer {
                data: BytesMut::new(),
                truncated: false,
            },
        );
    }

    async fn audio_chunk(&self, ctx: &StreamContext, _sequence: u16, payload: Bytes) {
        let mut buffers = self.buffers();
        let Some(buffer) = buffers.get_mut(&(ctx.device_id.clone(), ctx.stream_id)) else {
            return;
        };
        if buffer.data.len() + payload.len() > self.max_utterance_bytes {
            if !buffer.truncated {
                tracing::warn!(device_id = %ctx.device_id, stream_id = ctx.stream_id, "utterance exceeds buffer, truncating");
            }
            buffer.truncated = true;
            return;
        }
        buffer.data.extend_from_slice(&payload);
    }

    async fn stream_finished(&self, ctx: &StreamContext, summary: StreamSummary) {
        let Some(buffer) = self.take(ctx) else {
            return;
        };
        if buffer.data.is_empty() {
            tracing::debug!(device_id = %ctx.device_id, stream_id = ctx.stream_id, "empty utterance ignored");
            return;
        }

        tracing::info!(
            device_id = %ctx.device_id,
            stream_id = ctx.stream_id,
            bytes = buffer.data.len(),
            chunks = summary.chunks,
            gaps = summary.gaps,
            "utterance forwarded upstream"
        );
        tokio::spawn(self.clone().process(ctx.clone(), buffer.data.freeze(), summary));
    }

    async fn stream_aborted(&self, ctx: &StreamContext, reason: AbortReason) {
        if self.take(ctx).is_some() {
            tracing::debug!(device_id = %ctx.device_id, stream_id = ctx.stream_id, %reason, "buffered utterance discarded");
        }
    }
}
