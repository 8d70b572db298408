//! Device link and runner against a live relay

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{Recorded, next_recorded, relay, relay_config};
use tokio::sync::{mpsc, watch};
use uebot_bridge::device::{DeviceLink, DeviceLinkConfig, DeviceRunner, LinkEvent, WavSource};
use uebot_bridge::protocol::{AudioFormat, CommandPayload};
use uebot_bridge::reconnect::{LinkState, ReconnectPolicy};
use uebot_bridge::relay::{
    AudioPipeline, DeviceRouter, Outbound, Relay, StreamContext, StreamSummary,
};
use uebot_bridge::transport::memory::MemoryConnector;
use uebot_bridge::vad::{VadConfig, VoiceActivityController};

fn link_config(device_id: &str) -> DeviceLinkConfig {
    DeviceLinkConfig {
        device_id: device_id.to_string(),
        handshake_timeout: Duration::from_secs(2),
        max_frame_payload: 256,
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(50),
            factor: 2,
            max_delay: Duration::from_millis(400),
            max_attempts: 5,
        },
        ..DeviceLinkConfig::default()
    }
}

/// Connector whose connections are served by `relay`
fn wired(relay: &Relay) -> MemoryConnector {
    let (connector, mut listener) = MemoryConnector::new();
    let relay = relay.clone();
    tokio::spawn(async move {
        while let Some(conn) = listener.accept().await {
            relay.accept(conn);
        }
    });
    connector
}

async fn next_event(events: &mut mpsc::Receiver<LinkEvent>) -> LinkEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no link event")
        .expect("link dropped")
}

#[tokio::test]
async fn link_streams_audio_through_relay() {
    let (relay, mut recorded) = relay(relay_config());
    let connector = wired(&relay);
    let (link, mut events) = DeviceLink::new(link_config("esp32-001"), Arc::new(connector));

    let session = link.connect().await.unwrap();
    assert_eq!(session.device_id, "esp32-001");
    assert_eq!(session.heartbeat_interval, Duration::from_secs(1));
    assert!(!session.resumed);
    assert!(matches!(next_event(&mut events).await, LinkEvent::Connected(_)));

    let pcm: Vec<u8> = (0..1000u32).map(|i| (i % 199) as u8).collect();
    let stream_id = link.start_audio_stream(AudioFormat::default()).await.unwrap();
    assert!(link.send_audio_chunk(&pcm[..600]).await);
    assert!(link.send_audio_chunk(&pcm[600..]).await);
    link.end_audio_stream().await.unwrap();

    assert_eq!(
        next_recorded(&mut recorded).await,
        Recorded::Started {
            device_id: "esp32-001".to_string(),
            stream_id,
        }
    );
    let mut received = Vec::new();
    let mut sequences = Vec::new();
    let summary = loop {
        match next_recorded(&mut recorded).await {
            Recorded::Chunk {
                sequence, payload, ..
            } => {
                assert!(payload.len() <= 256);
                sequences.push(sequence);
                received.extend_from_slice(&payload);
            }
            Recorded::Finished { summary, .. } => break summary,
            other => panic!("unexpected {other:?}"),
        }
    };

    assert_eq!(received, pcm);
    assert_eq!(sequences, (0..5).collect::<Vec<u16>>());
    assert_eq!(summary.bytes, 1000);
    assert_eq!(summary.gaps, 0);
    assert!(!link.is_streaming());
}

#[tokio::test]
async fn commands_from_relay_surface_as_events() {
    let (relay, _recorded) = relay(relay_config());
    let connector = wired(&relay);
    let (link, mut events) = DeviceLink::new(link_config("esp32-002"), Arc::new(connector));
    link.connect().await.unwrap();
    assert!(matches!(next_event(&mut events).await, LinkEvent::Connected(_)));

    assert!(
        relay
            .deliver(
                "esp32-002",
                Outbound::Command(CommandPayload {
                    command: "set_led".to_string(),
                    params: serde_json::json!({"color": "blue"}),
                }),
            )
            .await
    );
    match next_event(&mut events).await {
        LinkEvent::Command(command) => {
            assert_eq!(command.command, "set_led");
            assert_eq!(command.params["color"], "blue");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn link_survives_relay_heartbeats() {
    let (relay, _recorded) = relay(relay_config());
    let connector = wired(&relay);
    let (link, _events) = DeviceLink::new(link_config("esp32-003"), Arc::new(connector));
    link.connect().await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(link.state(), LinkState::Connected);
    assert_eq!(relay.device_count().await, 1);
}

#[tokio::test]
async fn link_reconnects_and_resumes_after_relay_drops_it() {
    let (relay, _recorded) = relay(relay_config());
    let connector = wired(&relay);
    let (link, mut events) = DeviceLink::new(link_config("esp32-004"), Arc::new(connector));
    let first = link.connect().await.unwrap();
    assert!(matches!(next_event(&mut events).await, LinkEvent::Connected(_)));

    // A second registration under the same id supersedes the link's connection
    let (_intruder, _) = common::FakeDevice::register_with(
        &relay,
        common::register_payload("esp32-004", Some(&first.session_id)),
    )
    .await;

    assert_eq!(next_event(&mut events).await, LinkEvent::Disconnected);
    assert!(matches!(
        next_event(&mut events).await,
        LinkEvent::Reconnecting { attempt: 1, .. }
    ));
    match next_event(&mut events).await {
        LinkEvent::Connected(session) => {
            assert!(session.resumed);
            assert_eq!(session.session_id, first.session_id);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(link.state(), LinkState::Connected);
    link.close();
}

/// Answers every utterance with its own audio and a command
struct EchoPipeline {
    router: DeviceRouter,
    chunks: std::sync::Mutex<Vec<u8>>,
}

#[async_trait::async_trait]
impl AudioPipeline for EchoPipeline {
    async fn audio_chunk(&self, _ctx: &StreamContext, _sequence: u16, payload: Bytes) {
        self.chunks.lock().unwrap().extend_from_slice(&payload);
    }

    async fn stream_finished(&self, ctx: &StreamContext, _summary: StreamSummary) {
        let audio = Bytes::from(std::mem::take(&mut *self.chunks.lock().unwrap()));
        self.router
            .deliver(
                &ctx.device_id,
                Outbound::Speech {
                    stream_id: ctx.stream_id,
                    format: ctx.format,
                    audio,
                    text: Some("echo".to_string()),
                },
            )
            .await;
        self.router
            .deliver(
                &ctx.device_id,
                Outbound::Command(CommandPayload {
                    command: "led_on".to_string(),
                    params: serde_json::Value::Null,
                }),
            )
            .await;
    }
}

/// Half a second of tone followed by a second of silence
fn utterance_samples() -> Vec<i16> {
    let mut samples: Vec<i16> = (0..8_000)
        .map(|i| if i % 2 == 0 { 9_000 } else { -9_000 })
        .collect();
    samples.extend(std::iter::repeat_n(0, 16_000));
    samples
}

#[tokio::test(start_paused = true)]
async fn runner_sends_utterance_and_saves_playback() {
    let router = DeviceRouter::new();
    let pipeline = EchoPipeline {
        router: router.clone(),
        chunks: std::sync::Mutex::new(Vec::new()),
    };
    let relay = Relay::new(relay_config(), router, Arc::new(pipeline));
    let connector = wired(&relay);
    let (link, events) = DeviceLink::new(link_config("esp32-005"), Arc::new(connector));
    link.connect().await.unwrap();

    let vad = VoiceActivityController::new(VadConfig {
        energy_trigger: true,
        min_recording: Duration::from_millis(200),
        silence_timeout: Duration::from_millis(300),
        ..VadConfig::default()
    });
    let source = WavSource::from_samples(utterance_samples(), 16_000, 320);
    let dir = tempfile::tempdir().unwrap();

    let (_shutdown_tx, shutdown) = watch::channel(false);
    let summary = DeviceRunner::new(link.clone(), events, vad, source)
        .linger(Duration::from_secs(2))
        .save_playback(dir.path().to_path_buf())
        .run(shutdown)
        .await
        .unwrap();

    assert_eq!(summary.utterances, 1);
    assert_eq!(summary.dropped, 0);
    assert_eq!(summary.playbacks, 1);
    assert_eq!(summary.commands, vec!["led_on".to_string()]);
    assert_eq!(summary.saved.len(), 1);

    let reader = hound::WavReader::open(&summary.saved[0]).unwrap();
    assert_eq!(reader.spec().sample_rate, 16_000);
    let played: Vec<i16> = reader.into_samples::<i16>().map(Result::unwrap).collect();
    assert_eq!(&played[..4], &[9_000, -9_000, 9_000, -9_000]);

    assert_eq!(link.state(), LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn runner_fails_when_relay_stays_unreachable() {
    let (connector, _listener) = MemoryConnector::new();
    connector.set_refusing(true);
    let (link, events) = DeviceLink::new(link_config("esp32-006"), Arc::new(connector));
    assert!(link.connect().await.is_err());

    let source = WavSource::from_samples(vec![0; 16_000 * 30], 16_000, 320).realtime();
    let (_shutdown_tx, shutdown) = watch::channel(false);
    let result = DeviceRunner::new(
        link,
        events,
        VoiceActivityController::new(VadConfig::default()),
        source,
    )
    .run(shutdown)
    .await;

    assert!(matches!(result, Err(uebot_bridge::Error::Unavailable(_))));
}

#[tokio::test]
async fn runner_stops_on_shutdown() {
    let (relay, _recorded) = relay(relay_config());
    let connector = wired(&relay);
    let (link, events) = DeviceLink::new(link_config("esp32-007"), Arc::new(connector));
    link.connect().await.unwrap();

    let source = WavSource::from_samples(vec![0; 16_000 * 60], 16_000, 320).realtime();
    let (shutdown_tx, shutdown) = watch::channel(false);
    let runner = tokio::spawn(
        DeviceRunner::new(
            link,
            events,
            VoiceActivityController::new(VadConfig::default()),
            source,
        )
        .run(shutdown),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send_replace(true);
    let summary = runner.await.unwrap().unwrap();
    assert_eq!(summary.utterances, 0);
}

#[tokio::test(start_paused = true)]
async fn connect_after_giving_up_starts_a_fresh_backoff() {
    let (relay, _recorded) = relay(relay_config());
    let connector = wired(&relay);
    connector.set_refusing(true);
    let (link, mut events) =
        DeviceLink::new(link_config("esp32-008"), Arc::new(connector.clone()));

    assert!(link.connect().await.is_err());
    loop {
        if next_event(&mut events).await == LinkEvent::GaveUp {
            break;
        }
    }
    assert_eq!(link.state(), LinkState::Error);

    assert!(link.connect().await.is_err());
    assert_eq!(
        next_event(&mut events).await,
        LinkEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_millis(50)
        }
    );

    connector.set_refusing(false);
    assert!(matches!(next_event(&mut events).await, LinkEvent::Connected(_)));
    assert_eq!(link.state(), LinkState::Connected);
    assert_eq!(relay.device_count().await, 1);
    link.close();
}
