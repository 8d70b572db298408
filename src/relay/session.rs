//! Per-connection task on the relay side

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use super::pipeline::Outbound;
use super::registry::{AcceptedFrame, DisconnectReason, RegistryError, RegistryEvent};
use super::stream::{AbortReason, SequenceCheck};
use super::{Relay, RelayConfig};
use crate::protocol::{
    AudioFrame, AudioResponsePayload, ErrorCode, Message, RegisterPayload, RegisteredPayload,
    chunk_frames,
};
use crate::transport::{Connection, Frame};

/// Why the session loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Closed,
    Evicted,
    /// Another connection registered the same device
    Superseded,
    TransportError,
    Shutdown,
}

struct Session {
    relay: Relay,
    config: Arc<RelayConfig>,
    conn: Connection,
    connection_id: u64,
    device_id: String,
    last_activity: Instant,
}

pub(super) async fn run(relay: Relay, mut conn: Connection, connection_id: u64) {
    let mut shutdown = relay.shutdown_signal();
    let config = Arc::clone(&relay.config);

    let registered = tokio::select! {
        result = tokio::time::timeout(config.handshake_timeout, await_register(&mut conn)) => result,
        _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => return,
    };
    let payload = match registered {
        Ok(Some(payload)) => payload,
        Ok(None) => {
            tracing::debug!(connection_id, "connection closed before registration");
            return;
        }
        Err(_) => {
            tracing::warn!(connection_id, "registration handshake timed out");
            send(
                &conn,
                &Message::error(ErrorCode::HandshakeTimeout, "no device:register received"),
            )
            .await;
            return;
        }
    };

    let device_id = payload.device_id.clone();
    let (outbound_tx, mut outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
    let registration = {
        let mut registry = relay.router.lock().await;
        let now = Instant::now();
        registry.prune_sessions(config.session_resume, now);
        registry.register(payload, connection_id, outbound_tx, config.session_resume, now)
    };

    if let Some(replaced) = registration.replaced {
        tracing::info!(
            device_id = %device_id,
            old_connection = replaced.connection_id,
            connection_id,
            "device re-registered, replacing connection"
        );
        relay.router.publish(RegistryEvent::Disconnected {
            device_id: device_id.clone(),
            reason: DisconnectReason::Replaced,
        });
        if let Some(stream) = replaced.stream {
            relay
                .pipeline
                .stream_aborted(stream.context(), AbortReason::Superseded)
                .await;
        }
    }

    let heartbeat_interval_ms =
        u64::try_from(config.heartbeat_interval.as_millis()).unwrap_or(u64::MAX);
    let ack = Message::Registered {
        payload: RegisteredPayload {
            session_id: registration.session_id.clone(),
            device_id: device_id.clone(),
            heartbeat_interval_ms,
        },
    };
    if !send(&conn, &ack).await {
        relay
            .router
            .lock()
            .await
            .unregister(&device_id, connection_id, Instant::now());
        return;
    }

    tracing::info!(
        device_id = %device_id,
        session_id = %registration.session_id,
        resumed = registration.resumed,
        connection_id,
        "device registered"
    );
    relay.router.publish(RegistryEvent::Connected {
        device_id: device_id.clone(),
        session_id: registration.session_id,
        resumed: registration.resumed,
    });

    let mut session = Session {
        relay,
        config,
        conn,
        connection_id,
        device_id,
        last_activity: Instant::now(),
    };
    let exit = session.serve(&mut outbound_rx, &mut shutdown).await;
    session.cleanup(exit).await;
}

/// Read frames until a valid `device:register` arrives
///
/// Returns `None` if the connection closes first.
async fn await_register(conn: &mut Connection) -> Option<RegisterPayload> {
    loop {
        let text = match conn.receiver.recv().await? {
            Frame::Text(text) => text,
            Frame::Binary(_) => {
                send(
                    conn,
                    &Message::error(ErrorCode::NotRegistered, "audio before device:register"),
                )
                .await;
                continue;
            }
        };

        match Message::from_json(&text) {
            Ok(Message::Register { payload }) if payload.device_id.trim().is_empty() => {
                send(
                    conn,
                    &Message::error(ErrorCode::InvalidMessage, "device_id must not be empty"),
                )
                .await;
            }
            Ok(Message::Register { payload }) => return Some(payload),
            Ok(Message::Ping { id }) => {
                send(conn, &Message::Pong { id }).await;
            }
            Ok(other) => {
                send(
                    conn,
                    &Message::error(
                        ErrorCode::NotRegistered,
                        format!("register before sending {}", other.kind()),
                    ),
                )
                .await;
            }
            Err(e) => {
                send(conn, &Message::error(ErrorCode::InvalidMessage, e.to_string())).await;
            }
        }
    }
}

/// Send a control message; false once the connection is gone
async fn send(conn: &Connection, message: &Message) -> bool {
    match message.to_json() {
        Ok(json) => conn.sender.send(Frame::Text(json)).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, kind = message.kind(), "failed to encode message");
            true
        }
    }
}

impl Session {
    async fn serve(
        &mut self,
        outbound: &mut mpsc::Receiver<Outbound>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Exit {
        let start = Instant::now();
        let liveness = self.config.liveness_timeout();

        let mut heartbeat = interval_at(
            start + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stream_check = interval_at(
            start + self.config.stream_check_interval,
            self.config.stream_check_interval,
        );
        stream_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping_id: u64 = 0;

        loop {
            tokio::select! {
                frame = self.conn.receiver.recv() => {
                    let Some(frame) = frame else {
                        return Exit::Closed;
                    };
                    self.last_activity = Instant::now();
                    let handled = match frame {
                        Frame::Text(text) => self.on_text(&text).await,
                        Frame::Binary(data) => self.on_binary(data).await,
                    };
                    if let Err(exit) = handled {
                        return exit;
                    }
                }
                message = outbound.recv() => {
                    let Some(message) = message else {
                        return Exit::Superseded;
                    };
                    if !self.write_outbound(message).await {
                        return Exit::Closed;
                    }
                }
                _ = heartbeat.tick() => {
                    if self.last_activity.elapsed() >= liveness {
                        return Exit::Evicted;
                    }
                    ping_id += 1;
                    if !send(&self.conn, &Message::Ping { id: Some(ping_id.to_string()) }).await {
                        return Exit::Closed;
                    }
                }
                _ = stream_check.tick() => self.check_idle_stream().await,
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => return Exit::Shutdown,
            }
        }
    }

    async fn reply_error(&self, code: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(device_id = %self.device_id, ?code, %message, "protocol error");
        send(&self.conn, &Message::error(code, message)).await;
    }

    /// Report a violation, or stop if the connection was superseded
    async fn refuse(&self, error: RegistryError) -> Result<(), Exit> {
        match error {
            RegistryError::Superseded => Err(Exit::Superseded),
            RegistryError::Violation { code, message } => {
                self.reply_error(code, message).await;
                Ok(())
            }
        }
    }

    async fn on_text(&mut self, text: &str) -> Result<(), Exit> {
        let message = match Message::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                self.reply_error(ErrorCode::InvalidMessage, e.to_string()).await;
                return Ok(());
            }
        };

        match message {
            Message::AudioStart { payload } => {
                let started = self.relay.router.lock().await.start_stream(
                    &self.device_id,
                    self.connection_id,
                    payload.stream_id,
                    payload.format,
                    Instant::now(),
                );
                let (context, replaced) = match started {
                    Ok(started) => started,
                    Err(e) => return self.refuse(e).await,
                };

                if let Some(old) = replaced {
                    tracing::info!(
                        device_id = %self.device_id,
                        old_stream = old.stream_id(),
                        stream_id = payload.stream_id,
                        "stream replaced by new audio:start"
                    );
                    self.relay
                        .pipeline
                        .stream_aborted(old.context(), AbortReason::Replaced)
                        .await;
                }
                tracing::debug!(device_id = %self.device_id, stream_id = payload.stream_id, "stream started");
                self.relay.pipeline.stream_started(&context).await;
            }
            Message::AudioEnd { payload } => {
                let ended = self.relay.router.lock().await.end_stream(
                    &self.device_id,
                    self.connection_id,
                    payload.stream_id,
                    Instant::now(),
                );
                let (context, summary) = match ended {
                    Ok(ended) => ended,
                    Err(e) => return self.refuse(e).await,
                };

                tracing::info!(
                    device_id = %self.device_id,
                    stream_id = summary.stream_id,
                    bytes = summary.bytes,
                    chunks = summary.chunks,
                    gaps = summary.gaps,
                    duration_ms = summary.duration.as_millis(),
                    "stream ended"
                );
                self.relay.pipeline.stream_finished(&context, summary).await;
            }
            Message::Status { payload } => {
                let updated = self.relay.router.lock().await.update_status(
                    &self.device_id,
                    self.connection_id,
                    payload,
                );
                if let Err(e) = updated {
                    return self.refuse(e).await;
                }
            }
            Message::Ping { id } => {
                send(&self.conn, &Message::Pong { id }).await;
            }
            Message::Pong { .. } => {
                let touched = self
                    .relay
                    .router
                    .lock()
                    .await
                    .touch(&self.device_id, self.connection_id);
                if let Err(e) = touched {
                    return self.refuse(e).await;
                }
            }
            Message::Error { payload } => {
                tracing::warn!(
                    device_id = %self.device_id,
                    code = ?payload.code,
                    message = %payload.message,
                    "device reported error"
                );
            }
            Message::Register { .. } => {
                self.reply_error(ErrorCode::UnexpectedMessage, "already registered")
                    .await;
            }
            other @ (Message::Registered { .. }
            | Message::AudioResponse { .. }
            | Message::CommandExecute { .. }) => {
                self.reply_error(
                    ErrorCode::UnexpectedMessage,
                    format!("{} is not accepted from devices", other.kind()),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn on_binary(&mut self, data: Bytes) -> Result<(), Exit> {
        let frame = match AudioFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(device_id = %self.device_id, error = %e, "malformed audio frame, closing connection");
                return Err(Exit::TransportError);
            }
        };

        let accepted = self.relay.router.lock().await.accept_frame(
            &self.device_id,
            self.connection_id,
            frame.stream_id,
            frame.sequence,
            frame.len(),
            Instant::now(),
        );
        let AcceptedFrame { check, context } = match accepted {
            Ok(accepted) => accepted,
            Err(e) => return self.refuse(e).await,
        };

        match check {
            SequenceCheck::InOrder => {}
            SequenceCheck::Gap { missing } => {
                tracing::warn!(
                    device_id = %self.device_id,
                    stream_id = frame.stream_id,
                    sequence = frame.sequence,
                    missing,
                    "sequence gap"
                );
            }
            SequenceCheck::Stale => {
                tracing::debug!(
                    device_id = %self.device_id,
                    stream_id = frame.stream_id,
                    sequence = frame.sequence,
                    "dropping stale frame"
                );
                return Ok(());
            }
        }

        self.relay
            .pipeline
            .audio_chunk(&context, frame.sequence, frame.payload)
            .await;
        Ok(())
    }

    async fn write_outbound(&self, message: Outbound) -> bool {
        match message {
            Outbound::Speech {
                stream_id,
                format,
                audio,
                text,
            } => {
                let header = Message::AudioResponse {
                    payload: AudioResponsePayload {
                        stream_id,
                        format,
                        total_bytes: audio.len() as u64,
                        text,
                    },
                };
                if !send(&self.conn, &header).await {
                    return false;
                }
                let (frames, _) = chunk_frames(stream_id, 0, &audio, self.config.max_frame_payload);
                for frame in frames {
                    if self.conn.sender.send(Frame::Binary(frame.encode())).await.is_err() {
                        return false;
                    }
                }
                tracing::debug!(device_id = %self.device_id, stream_id, bytes = audio.len(), "playback sent");
                true
            }
            Outbound::Command(payload) => {
                tracing::debug!(device_id = %self.device_id, command = %payload.command, "command sent");
                send(&self.conn, &Message::CommandExecute { payload }).await
            }
            Outbound::Error(payload) => send(&self.conn, &Message::Error { payload }).await,
        }
    }

    async fn check_idle_stream(&self) {
        let idle = self.relay.router.lock().await.take_idle_stream(
            &self.device_id,
            self.connection_id,
            self.config.stream_idle_timeout,
            Instant::now(),
        );
        if let Some(stream) = idle {
            tracing::warn!(
                device_id = %self.device_id,
                stream_id = stream.stream_id(),
                bytes = stream.bytes(),
                "stream idle, aborting"
            );
            self.relay
                .pipeline
                .stream_aborted(stream.context(), AbortReason::Idle)
                .await;
        }
    }

    async fn cleanup(self, exit: Exit) {
        if exit == Exit::Superseded {
            tracing::debug!(
                device_id = %self.device_id,
                connection_id = self.connection_id,
                "connection superseded"
            );
            return;
        }

        let removed = self.relay.router.lock().await.unregister(
            &self.device_id,
            self.connection_id,
            Instant::now(),
        );
        let Some(device) = removed else {
            return;
        };

        let abort_reason = if exit == Exit::Evicted {
            AbortReason::Evicted
        } else {
            AbortReason::Disconnected
        };
        if let Some(stream) = device.stream {
            self.relay
                .pipeline
                .stream_aborted(stream.context(), abort_reason)
                .await;
        }

        let event = match exit {
            Exit::Evicted => {
                tracing::warn!(device_id = %self.device_id, "device missed heartbeats, evicted");
                RegistryEvent::Evicted {
                    device_id: self.device_id.clone(),
                }
            }
            Exit::TransportError => RegistryEvent::Disconnected {
                device_id: self.device_id.clone(),
                reason: DisconnectReason::TransportError,
            },
            Exit::Shutdown => RegistryEvent::Disconnected {
                device_id: self.device_id.clone(),
                reason: DisconnectReason::Shutdown,
            },
            Exit::Closed | Exit::Superseded => RegistryEvent::Disconnected {
                device_id: self.device_id.clone(),
                reason: DisconnectReason::Closed,
            },
        };
        tracing::info!(device_id = %self.device_id, ?exit, "device disconnected");
        self.relay.router.publish(event);
    }
}
