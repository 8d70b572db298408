//! Gateway client integration tests against a scripted gateway

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::FakeGateway;
use serde_json::json;
use uebot_bridge::RequestError;
use uebot_bridge::gateway::{GatewayClient, GatewayConfig, GatewayEvent, GatewayMessage};
use uebot_bridge::reconnect::{LinkState, ReconnectPolicy};
use uebot_bridge::transport::memory::{MemoryConnector, MemoryListener};

fn config() -> GatewayConfig {
    GatewayConfig {
        url: "memory".to_string(),
        request_timeout: Duration::from_secs(5),
        health_timeout: Duration::from_secs(1),
        sweep_interval: Duration::from_millis(100),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            factor: 2,
            max_delay: Duration::from_secs(1),
            max_attempts: 3,
        },
    }
}

async fn connected() -> (GatewayClient, FakeGateway, MemoryConnector, MemoryListener) {
    let (connector, mut listener) = MemoryConnector::new();
    let client = GatewayClient::new(config(), Arc::new(connector.clone()));
    client.connect().await.unwrap();
    let gateway = FakeGateway::accept(&mut listener).await;
    (client, gateway, connector, listener)
}

#[tokio::test]
async fn responses_resolve_the_matching_request() {
    let (client, mut gateway, _connector, _listener) = connected().await;
    assert_eq!(client.state(), LinkState::Connected);

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.request(json!({"n": 1}), Duration::from_secs(5)).await }
    });
    let (id_a, payload_a) = gateway.next_request().await;
    let second = tokio::spawn({
        let client = client.clone();
        async move { client.request(json!({"n": 2}), Duration::from_secs(5)).await }
    });
    let (id_b, payload_b) = gateway.next_request().await;

    assert_ne!(id_a, id_b);
    assert_eq!(payload_a, json!({"n": 1}));
    assert_eq!(payload_b, json!({"n": 2}));

    // Answer out of order
    gateway.respond(&id_b, json!({"answer": "b"})).await;
    gateway.respond(&id_a, json!({"answer": "a"})).await;

    assert_eq!(first.await.unwrap(), Ok(json!({"answer": "a"})));
    assert_eq!(second.await.unwrap(), Ok(json!({"answer": "b"})));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn error_responses_become_remote_errors() {
    let (client, mut gateway, _connector, _listener) = connected().await;

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.request(json!({}), Duration::from_secs(5)).await }
    });
    let (id, _) = gateway.next_request().await;
    gateway
        .send(&GatewayMessage::Response {
            id,
            payload: None,
            error: Some(json!({"code": 503, "message": "model overloaded"})),
        })
        .await;

    assert_eq!(
        call.await.unwrap(),
        Err(RequestError::Remote("model overloaded".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out_and_late_reply_is_dropped() {
    let (client, mut gateway, _connector, _listener) = connected().await;

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.request(json!({}), Duration::from_secs(1)).await }
    });
    let (id, _) = gateway.next_request().await;

    assert_eq!(call.await.unwrap(), Err(RequestError::Timeout));
    assert_eq!(client.pending_requests(), 0);

    gateway.respond(&id, json!({"too": "late"})).await;

    // The connection is still usable afterwards
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.request(json!({"again": true}), Duration::from_secs(1)).await }
    });
    let (id, _) = gateway.next_request().await;
    gateway.respond(&id, json!("ok")).await;
    assert_eq!(call.await.unwrap(), Ok(json!("ok")));
}

#[tokio::test]
async fn connection_loss_rejects_every_pending_request() {
    let (client, mut gateway, connector, _listener) = connected().await;
    let mut events = client.subscribe();
    connector.set_refusing(true);

    let calls: Vec<_> = (0..3)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.request(json!({"i": i}), Duration::from_secs(30)).await })
        })
        .collect();
    for _ in 0..3 {
        gateway.next_request().await;
    }
    assert_eq!(client.pending_requests(), 3);

    drop(gateway);

    for call in calls {
        assert_eq!(call.await.unwrap(), Err(RequestError::ConnectionLost));
    }
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(
        events.recv().await.unwrap(),
        GatewayEvent::Disconnected { rejected: 3 }
    );
    assert!(matches!(
        events.recv().await.unwrap(),
        GatewayEvent::Reconnecting { attempt: 1, .. }
    ));
    client.close();
}

#[tokio::test]
async fn reconnects_after_drop() {
    let (client, gateway, _connector, mut listener) = connected().await;
    let mut events = client.subscribe();

    drop(gateway);
    assert_eq!(
        events.recv().await.unwrap(),
        GatewayEvent::Disconnected { rejected: 0 }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        GatewayEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_millis(100)
        }
    );

    let mut gateway = FakeGateway::accept(&mut listener).await;
    assert_eq!(events.recv().await.unwrap(), GatewayEvent::Connected);
    assert_eq!(client.state(), LinkState::Connected);

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.request(json!({}), Duration::from_secs(5)).await }
    });
    let (id, _) = gateway.next_request().await;
    gateway.respond(&id, json!(1)).await;
    assert_eq!(call.await.unwrap(), Ok(json!(1)));
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts() {
    let (connector, _listener) = MemoryConnector::new();
    connector.set_refusing(true);
    let client = GatewayClient::new(config(), Arc::new(connector.clone()));
    let mut events = client.subscribe();

    tokio_test::assert_err!(client.connect().await);

    let mut delays = Vec::new();
    loop {
        match events.recv().await.unwrap() {
            GatewayEvent::Reconnecting { attempt, delay } => {
                assert_eq!(usize::try_from(attempt).unwrap(), delays.len() + 1);
                delays.push(delay.as_millis());
            }
            GatewayEvent::Unreachable => break,
            other => panic!("unexpected {other:?}"),
        }
    }

    assert_eq!(delays, vec![100, 200, 400]);
    assert_eq!(connector.attempts(), 4);
    assert_eq!(client.state(), LinkState::Error);
    assert_eq!(
        client.request(json!({}), Duration::from_secs(1)).await,
        Err(RequestError::NotConnected)
    );
}

#[tokio::test]
async fn close_rejects_pending_and_refuses_new_requests() {
    let (client, mut gateway, _connector, _listener) = connected().await;

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.request(json!({}), Duration::from_secs(30)).await }
    });
    gateway.next_request().await;

    client.close();
    assert_eq!(call.await.unwrap(), Err(RequestError::Closed));
    assert_eq!(client.state(), LinkState::Disconnected);
    assert_eq!(
        client.request(json!({}), Duration::from_secs(1)).await,
        Err(RequestError::Closed)
    );
}

#[tokio::test]
async fn probe_measures_ping_round_trip() {
    let (client, mut gateway, _connector, _listener) = connected().await;

    let probe = tokio::spawn({
        let client = client.clone();
        async move { client.health_check().await }
    });
    match gateway.next().await.unwrap() {
        GatewayMessage::Ping { id } => gateway.send(&GatewayMessage::Pong { id }).await,
        other => panic!("expected ping, got {other:?}"),
    }
    assert!(probe.await.unwrap());
}

#[tokio::test]
async fn gateway_pings_are_answered_and_events_published() {
    let (client, mut gateway, _connector, _listener) = connected().await;
    let mut events = client.subscribe();

    gateway
        .send(&GatewayMessage::Ping {
            id: "hb-1".to_string(),
        })
        .await;
    assert_eq!(
        gateway.next().await.unwrap(),
        GatewayMessage::Pong {
            id: "hb-1".to_string()
        }
    );

    gateway
        .send(&GatewayMessage::Event {
            payload: json!({"kind": "announcement"}),
        })
        .await;
    assert_eq!(
        events.recv().await.unwrap(),
        GatewayEvent::Notification(json!({"kind": "announcement"}))
    );

    // Unknown response ids are ignored
    gateway.respond("never-sent", json!(null)).await;
    assert_eq!(client.state(), LinkState::Connected);
}

#[tokio::test]
async fn request_before_connect_is_not_connected() {
    let (connector, _listener) = MemoryConnector::new();
    let client = GatewayClient::new(config(), Arc::new(connector));
    assert_eq!(
        client.request(json!({}), Duration::from_secs(1)).await,
        Err(RequestError::NotConnected)
    );
    assert!(!client.health_check().await);
}

#[tokio::test(start_paused = true)]
async fn connect_after_giving_up_starts_a_fresh_backoff() {
    let (connector, mut listener) = MemoryConnector::new();
    connector.set_refusing(true);
    let client = GatewayClient::new(config(), Arc::new(connector.clone()));
    let mut events = client.subscribe();

    tokio_test::assert_err!(client.connect().await);
    loop {
        if events.recv().await.unwrap() == GatewayEvent::Unreachable {
            break;
        }
    }
    assert_eq!(client.state(), LinkState::Error);

    tokio_test::assert_err!(client.connect().await);
    assert_eq!(
        events.recv().await.unwrap(),
        GatewayEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_millis(100)
        }
    );

    connector.set_refusing(false);
    let _gateway = FakeGateway::accept(&mut listener).await;
    assert_eq!(events.recv().await.unwrap(), GatewayEvent::Connected);
    assert_eq!(client.state(), LinkState::Connected);
    client.close();
}

#[tokio::test(start_paused = true)]
async fn requests_racing_a_drop_never_wait_for_their_timeout() {
    let (client, gateway, connector, _listener) = connected().await;
    connector.set_refusing(true);

    let calls: Vec<_> = (0..16)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.request(json!({"i": i}), Duration::from_secs(30)).await })
        })
        .collect();
    drop(gateway);

    let started = tokio::time::Instant::now();
    for call in calls {
        let outcome = call.await.unwrap();
        assert!(
            matches!(
                outcome,
                Err(RequestError::ConnectionLost | RequestError::NotConnected)
            ),
            "unexpected outcome {outcome:?}"
        );
    }
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(client.pending_requests(), 0);
    client.close();
}
