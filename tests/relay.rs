//! Relay integration tests over in-memory connections

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{FakeDevice, Recorded, next_recorded, register_payload, relay, relay_config};
use uebot_bridge::protocol::{AudioFormat, CommandPayload, DeviceStatus, ErrorCode, Message};
use uebot_bridge::relay::{AbortReason, DisconnectReason, Outbound, RegistryEvent};
use uebot_bridge::transport::Frame;

#[tokio::test]
async fn register_assigns_session_and_heartbeat() {
    let (relay, _recorded) = relay(relay_config());
    let mut events = relay.router().subscribe();

    let (_device, registered) = FakeDevice::register(&relay, "esp32-001").await;

    assert_eq!(registered.device_id, "esp32-001");
    assert!(!registered.session_id.is_empty());
    assert_eq!(registered.heartbeat_interval_ms, 1_000);
    assert_eq!(relay.device_count().await, 1);

    let event = events.recv().await.unwrap();
    assert_eq!(
        event,
        RegistryEvent::Connected {
            device_id: "esp32-001".to_string(),
            session_id: registered.session_id,
            resumed: false,
        }
    );
}

#[tokio::test]
async fn audio_reaches_pipeline_byte_exact_and_in_order() {
    let (relay, mut recorded) = relay(relay_config());
    let (device, _) = FakeDevice::register(&relay, "esp32-001").await;

    let chunks: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 100 + usize::from(i)]).collect();
    device.start_stream(1).await;
    for (seq, chunk) in chunks.iter().enumerate() {
        device.send_audio(1, u16::try_from(seq).unwrap(), chunk).await;
    }
    device.end_stream(1).await;

    assert_eq!(
        next_recorded(&mut recorded).await,
        Recorded::Started {
            device_id: "esp32-001".to_string(),
            stream_id: 1
        }
    );

    let mut received = Vec::new();
    for expected_seq in 0..6u16 {
        match next_recorded(&mut recorded).await {
            Recorded::Chunk {
                sequence, payload, ..
            } => {
                assert_eq!(sequence, expected_seq);
                received.extend_from_slice(&payload);
            }
            other => panic!("expected chunk, got {other:?}"),
        }
    }
    assert_eq!(received, chunks.concat());

    match next_recorded(&mut recorded).await {
        Recorded::Finished { summary, .. } => {
            assert_eq!(summary.stream_id, 1);
            assert_eq!(summary.bytes, received.len() as u64);
            assert_eq!(summary.chunks, 6);
            assert_eq!(summary.gaps, 0);
        }
        other => panic!("expected finish, got {other:?}"),
    }
}

#[tokio::test]
async fn interleaved_devices_keep_their_own_order() {
    let (relay, mut recorded) = relay(relay_config());
    let (a, _) = FakeDevice::register(&relay, "kitchen").await;
    let (b, _) = FakeDevice::register(&relay, "bedroom").await;

    a.start_stream(1).await;
    b.start_stream(7).await;
    for seq in 0..20u16 {
        let byte = u8::try_from(seq).unwrap();
        a.send_audio(1, seq, &[byte; 32]).await;
        b.send_audio(7, seq, &[byte.wrapping_add(100); 48]).await;
    }
    a.end_stream(1).await;
    b.end_stream(7).await;

    let mut kitchen = Vec::new();
    let mut bedroom = Vec::new();
    let mut finished = 0;
    while finished < 2 {
        match next_recorded(&mut recorded).await {
            Recorded::Chunk {
                device_id,
                stream_id,
                sequence,
                ..
            } => match device_id.as_str() {
                "kitchen" => {
                    assert_eq!(stream_id, 1);
                    kitchen.push(sequence);
                }
                "bedroom" => {
                    assert_eq!(stream_id, 7);
                    bedroom.push(sequence);
                }
                other => panic!("unknown device {other}"),
            },
            Recorded::Finished { .. } => finished += 1,
            Recorded::Started { .. } => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    let expected: Vec<u16> = (0..20).collect();
    assert_eq!(kitchen, expected);
    assert_eq!(bedroom, expected);
}

#[tokio::test]
async fn sequence_gaps_forward_and_stale_frames_drop() {
    let (relay, mut recorded) = relay(relay_config());
    let (device, _) = FakeDevice::register(&relay, "esp32-001").await;

    device.start_stream(2).await;
    device.send_audio(2, 0, b"aa").await;
    device.send_audio(2, 3, b"bb").await;
    device.send_audio(2, 1, b"late").await;
    device.send_audio(2, 4, b"cc").await;
    device.end_stream(2).await;

    let _started = next_recorded(&mut recorded).await;
    let mut sequences = Vec::new();
    loop {
        match next_recorded(&mut recorded).await {
            Recorded::Chunk { sequence, .. } => sequences.push(sequence),
            Recorded::Finished { summary, .. } => {
                assert_eq!(summary.chunks, 3);
                assert_eq!(summary.bytes, 6);
                assert_eq!(summary.gaps, 1);
                break;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(sequences, vec![0, 3, 4]);
}

#[tokio::test]
async fn messages_before_register_are_refused() {
    let (relay, _recorded) = relay(relay_config());
    let mut device = FakeDevice::connect(&relay);

    device.send_audio(1, 0, b"early").await;
    assert_eq!(device.next_error().await.code, ErrorCode::NotRegistered);

    device
        .send(&Message::Status {
            payload: DeviceStatus::default(),
        })
        .await;
    assert_eq!(device.next_error().await.code, ErrorCode::NotRegistered);

    device.send(&Message::Ping { id: Some("p1".to_string()) }).await;
    assert_eq!(
        device.next_message().await,
        Message::Pong {
            id: Some("p1".to_string())
        }
    );

    device
        .send(&Message::Register {
            payload: register_payload("  ", None),
        })
        .await;
    assert_eq!(device.next_error().await.code, ErrorCode::InvalidMessage);

    device
        .send(&Message::Register {
            payload: register_payload("esp32-001", None),
        })
        .await;
    assert!(matches!(device.next_message().await, Message::Registered { .. }));
}

#[tokio::test]
async fn protocol_violations_keep_the_connection_open() {
    let (relay, _recorded) = relay(relay_config());
    let (mut device, _) = FakeDevice::register(&relay, "esp32-001").await;

    device.send_audio(5, 0, b"orphan").await;
    assert_eq!(device.next_error().await.code, ErrorCode::NoActiveStream);

    device.end_stream(5).await;
    assert_eq!(device.next_error().await.code, ErrorCode::NoActiveStream);

    device.start_stream(1).await;
    device.send_audio(2, 0, b"wrong").await;
    assert_eq!(device.next_error().await.code, ErrorCode::StreamMismatch);

    device
        .send(&Message::AudioStart {
            payload: uebot_bridge::protocol::AudioStartPayload {
                stream_id: 3,
                format: AudioFormat {
                    sample_rate: 4_000,
                    ..AudioFormat::default()
                },
            },
        })
        .await;
    assert_eq!(device.next_error().await.code, ErrorCode::InvalidFormat);

    device.send_raw(Frame::Text("{not json".to_string())).await;
    assert_eq!(device.next_error().await.code, ErrorCode::InvalidMessage);

    device
        .send(&Message::Register {
            payload: register_payload("esp32-001", None),
        })
        .await;
    assert_eq!(device.next_error().await.code, ErrorCode::UnexpectedMessage);

    device
        .send(&Message::CommandExecute {
            payload: CommandPayload {
                command: "volume".to_string(),
                params: serde_json::Value::Null,
            },
        })
        .await;
    assert_eq!(device.next_error().await.code, ErrorCode::UnexpectedMessage);

    assert_eq!(relay.device_count().await, 1);
}

#[tokio::test]
async fn malformed_frame_closes_connection() {
    let (relay, mut recorded) = relay(relay_config());
    let mut events = relay.router().subscribe();
    let (mut device, _) = FakeDevice::register(&relay, "esp32-001").await;
    let _connected = events.recv().await.unwrap();

    device.start_stream(1).await;
    device
        .send_raw(Frame::Binary(Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 9, 0])))
        .await;

    device.closed().await;
    assert_eq!(
        events.recv().await.unwrap(),
        RegistryEvent::Disconnected {
            device_id: "esp32-001".to_string(),
            reason: DisconnectReason::TransportError,
        }
    );
    assert_eq!(relay.device_count().await, 0);

    let _started = next_recorded(&mut recorded).await;
    assert_eq!(
        next_recorded(&mut recorded).await,
        Recorded::Aborted {
            device_id: "esp32-001".to_string(),
            stream_id: 1,
            reason: AbortReason::Disconnected,
        }
    );
}

#[tokio::test]
async fn second_audio_start_replaces_stream() {
    let (relay, mut recorded) = relay(relay_config());
    let (device, _) = FakeDevice::register(&relay, "esp32-001").await;

    device.start_stream(1).await;
    device.send_audio(1, 0, b"first").await;
    device.start_stream(2).await;
    device.send_audio(2, 0, b"second").await;
    device.end_stream(2).await;

    let seen: Vec<Recorded> = [
        next_recorded(&mut recorded).await,
        next_recorded(&mut recorded).await,
        next_recorded(&mut recorded).await,
        next_recorded(&mut recorded).await,
        next_recorded(&mut recorded).await,
    ]
    .into();

    assert_eq!(
        seen[2],
        Recorded::Aborted {
            device_id: "esp32-001".to_string(),
            stream_id: 1,
            reason: AbortReason::Replaced,
        }
    );
    assert!(matches!(seen[3], Recorded::Started { stream_id: 2, .. }));
    assert!(matches!(seen[4], Recorded::Chunk { stream_id: 2, .. }));
    match next_recorded(&mut recorded).await {
        Recorded::Finished { summary, .. } => assert_eq!(summary.bytes, 6),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn silent_device_is_evicted() {
    let (relay, _recorded) = relay(relay_config());
    let mut events = relay.router().subscribe();
    let (mut device, _) = FakeDevice::register(&relay, "esp32-001").await;
    let _connected = events.recv().await.unwrap();

    let started = tokio::time::Instant::now();
    let mut pings = 0;
    while let Some(frame) = device.recv().await {
        if let Frame::Text(text) = frame {
            if matches!(Message::from_json(&text).unwrap(), Message::Ping { .. }) {
                pings += 1;
            }
        }
    }

    assert_eq!(pings, 2);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
    assert_eq!(
        events.recv().await.unwrap(),
        RegistryEvent::Evicted {
            device_id: "esp32-001".to_string()
        }
    );
    assert_eq!(relay.device_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn answering_pings_keeps_device_registered() {
    let (relay, _recorded) = relay(relay_config());
    let (mut device, _) = FakeDevice::register(&relay, "esp32-001").await;

    let started = tokio::time::Instant::now();
    while started.elapsed() < Duration::from_secs(10) {
        let Some(Frame::Text(text)) = device.recv().await else {
            panic!("connection closed while answering pings");
        };
        if let Message::Ping { id } = Message::from_json(&text).unwrap() {
            device.send(&Message::Pong { id }).await;
        }
    }

    assert_eq!(relay.device_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn handshake_times_out() {
    let (relay, _recorded) = relay(relay_config());
    let mut device = FakeDevice::connect(&relay);

    assert_eq!(device.next_error().await.code, ErrorCode::HandshakeTimeout);
    device.closed().await;
    assert_eq!(relay.device_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn idle_stream_is_aborted() {
    let mut config = relay_config();
    config.heartbeat_interval = Duration::from_secs(30);
    let (relay, mut recorded) = relay(config);
    let (device, _) = FakeDevice::register(&relay, "esp32-001").await;

    device.start_stream(4).await;
    device.send_audio(4, 0, b"then silence").await;

    let _started = next_recorded(&mut recorded).await;
    let _chunk = next_recorded(&mut recorded).await;
    assert_eq!(
        next_recorded(&mut recorded).await,
        Recorded::Aborted {
            device_id: "esp32-001".to_string(),
            stream_id: 4,
            reason: AbortReason::Idle,
        }
    );
    assert_eq!(relay.router().device("esp32-001").await.unwrap().active_stream, None);
}

#[tokio::test]
async fn reregister_replaces_connection_and_resumes_session() {
    let (relay, mut recorded) = relay(relay_config());
    let mut events = relay.router().subscribe();

    let (mut first, registered) = FakeDevice::register(&relay, "esp32-001").await;
    let _connected = events.recv().await.unwrap();
    first.start_stream(1).await;
    let _started = next_recorded(&mut recorded).await;

    let (_second, resumed) = FakeDevice::register_with(
        &relay,
        register_payload("esp32-001", Some(&registered.session_id)),
    )
    .await;
    assert_eq!(resumed.session_id, registered.session_id);

    first.closed().await;
    assert_eq!(
        events.recv().await.unwrap(),
        RegistryEvent::Disconnected {
            device_id: "esp32-001".to_string(),
            reason: DisconnectReason::Replaced,
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        RegistryEvent::Connected {
            device_id: "esp32-001".to_string(),
            session_id: registered.session_id,
            resumed: true,
        }
    );
    assert_eq!(
        next_recorded(&mut recorded).await,
        Recorded::Aborted {
            device_id: "esp32-001".to_string(),
            stream_id: 1,
            reason: AbortReason::Superseded,
        }
    );
    assert_eq!(relay.device_count().await, 1);
}

#[tokio::test]
async fn unknown_session_is_not_resumed() {
    let (relay, _recorded) = relay(relay_config());
    let (_device, registered) = FakeDevice::register_with(
        &relay,
        register_payload("esp32-001", Some("made-up-session")),
    )
    .await;
    assert_ne!(registered.session_id, "made-up-session");
}

#[tokio::test]
async fn session_resumes_after_disconnect() {
    let (relay, _recorded) = relay(relay_config());
    let mut events = relay.router().subscribe();

    let (device, registered) = FakeDevice::register(&relay, "esp32-001").await;
    let _connected = events.recv().await.unwrap();
    drop(device);
    assert!(matches!(
        events.recv().await.unwrap(),
        RegistryEvent::Disconnected {
            reason: DisconnectReason::Closed,
            ..
        }
    ));

    let (_device, again) = FakeDevice::register_with(
        &relay,
        register_payload("esp32-001", Some(&registered.session_id)),
    )
    .await;
    assert_eq!(again.session_id, registered.session_id);
}

#[tokio::test]
async fn speech_is_delivered_as_header_and_frames() {
    let mut config = relay_config();
    config.max_frame_payload = 1024;
    let (relay, _recorded) = relay(config);
    let (mut device, _) = FakeDevice::register(&relay, "esp32-001").await;

    let audio: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
    assert!(
        relay
            .deliver(
                "esp32-001",
                Outbound::Speech {
                    stream_id: 9,
                    format: AudioFormat::default(),
                    audio: Bytes::from(audio.clone()),
                    text: Some("hello".to_string()),
                },
            )
            .await
    );

    match device.next_message().await {
        Message::AudioResponse { payload } => {
            assert_eq!(payload.stream_id, 9);
            assert_eq!(payload.total_bytes, 2500);
            assert_eq!(payload.text.as_deref(), Some("hello"));
        }
        other => panic!("expected audio:response, got {other:?}"),
    }

    let mut received = Vec::new();
    for expected_seq in 0..3u16 {
        let frame = device.next_audio().await;
        assert_eq!(frame.stream_id, 9);
        assert_eq!(frame.sequence, expected_seq);
        assert!(frame.len() <= 1024);
        received.extend_from_slice(&frame.payload);
    }
    assert_eq!(received, audio);

    assert!(
        relay
            .deliver(
                "esp32-001",
                Outbound::Command(CommandPayload {
                    command: "set_volume".to_string(),
                    params: serde_json::json!({"level": 3}),
                }),
            )
            .await
    );
    assert!(matches!(
        device.next_message().await,
        Message::CommandExecute { payload } if payload.command == "set_volume"
    ));
}

#[tokio::test]
async fn delivery_to_unknown_device_is_dropped() {
    let (relay, _recorded) = relay(relay_config());
    let delivered = relay
        .deliver(
            "nobody",
            Outbound::Command(CommandPayload {
                command: "noop".to_string(),
                params: serde_json::Value::Null,
            }),
        )
        .await;
    assert!(!delivered);
}

#[tokio::test]
async fn status_updates_telemetry() {
    let (relay, _recorded) = relay(relay_config());
    let (mut device, _) = FakeDevice::register(&relay, "esp32-001").await;

    device
        .send(&Message::Status {
            payload: DeviceStatus {
                battery: Some(80),
                rssi: -52,
                free_heap: 120_000,
                recording: false,
                uptime_ms: Some(1_000),
            },
        })
        .await;
    // Round trip so the status has been handled
    device.send(&Message::Ping { id: None }).await;
    assert_eq!(device.next_message().await, Message::Pong { id: None });

    let snapshot = relay.router().device("esp32-001").await.unwrap();
    let telemetry = snapshot.telemetry.unwrap();
    assert_eq!(telemetry.battery, Some(80));
    assert_eq!(telemetry.rssi, -52);
    assert_eq!(snapshot.name.as_deref(), Some("test module"));
}

#[tokio::test]
async fn shutdown_closes_devices() {
    let (relay, _recorded) = relay(relay_config());
    let mut events = relay.router().subscribe();
    let (mut device, _) = FakeDevice::register(&relay, "esp32-001").await;
    let _connected = events.recv().await.unwrap();

    relay.shutdown();
    device.closed().await;
    assert_eq!(
        events.recv().await.unwrap(),
        RegistryEvent::Disconnected {
            device_id: "esp32-001".to_string(),
            reason: DisconnectReason::Shutdown,
        }
    );
}
