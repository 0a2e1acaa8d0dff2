// tests/connection_integration_test.rs
//! Connection manager integration tests over a scripted transport.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use common::{collect_until, MockTransport, OpenBehavior};
use courier::bus::TransportEvent;
use courier::transport::{Frame, TransportSignal};
use courier::{
    ConnectionConfig, ConnectionManager, ConnectionState, Courier, GatewayConfig,
    StaticCredentials,
};

fn config() -> ConnectionConfig {
    ConnectionConfig::new("ws://mock.test")
}

fn build_courier(manager: ConnectionManager) -> Courier {
    Courier::with_connection(
        manager,
        GatewayConfig::new("http://api.test"),
        Arc::new(StaticCredentials::new(None)),
    )
    .expect("valid gateway config")
}

fn chat(text: &str) -> TransportSignal {
    TransportSignal::Frame(Frame::Text(
        json!({"type": "chat", "text": text}).to_string(),
    ))
}

#[tokio::test(start_paused = true)]
async fn test_router_dispatch_over_managed_connection() {
    let transport = Arc::new(MockTransport::new());
    let manager = ConnectionManager::new(config(), transport.clone(), common::bus());
    let courier = build_courier(manager);

    let chats = Arc::new(Mutex::new(Vec::new()));
    let typing = Arc::new(Mutex::new(0));
    let router = courier.router();
    {
        let chats = chats.clone();
        let typing = typing.clone();
        router
            .route("chat", move |payload| {
                let text = payload["text"].as_str().unwrap_or_default().to_string();
                chats.lock().unwrap().push(text);
            })
            .route("typing", move |_| *typing.lock().unwrap() += 1);
    }

    let mut rx = courier.bus().subscribe();
    courier.connection().connect();
    collect_until(&mut rx, |e| matches!(e, TransportEvent::Connected)).await;

    let mut peer = transport.next_peer().await.expect("accepted channel");
    peer.signals.send(chat("one")).unwrap();
    peer.signals
        .send(TransportSignal::Frame(Frame::Text(r#"{"type":"typing"}"#.into())))
        .unwrap();
    peer.signals.send(chat("two")).unwrap();
    collect_until(&mut rx, |e| {
        matches!(e, TransportEvent::Message { payload } if payload["text"] == "two")
    })
    .await;

    assert_eq!(*chats.lock().unwrap(), vec!["one".to_string(), "two".to_string()]);
    assert_eq!(*typing.lock().unwrap(), 1);

    assert!(courier
        .connection()
        .send(&json!({"type": "chat", "text": "reply"})));
    let Some(Frame::Text(sent)) = peer.frames.recv().await else {
        panic!("expected a text frame");
    };
    assert_eq!(
        serde_json::from_str::<Value>(&sent).unwrap(),
        json!({"type": "chat", "text": "reply"})
    );

    router.detach();
}

#[tokio::test(start_paused = true)]
async fn test_lifecycle_events_across_drop_and_reconnect() {
    let transport = Arc::new(MockTransport::new());
    let bus = common::bus();
    let manager = ConnectionManager::new(config(), transport.clone(), bus.clone());
    let mut rx = bus.subscribe();

    manager.connect();
    collect_until(&mut rx, |e| matches!(e, TransportEvent::Connected)).await;

    // Peer vanishes without a close frame.
    drop(transport.next_peer().await);
    let events = collect_until(&mut rx, |e| matches!(e, TransportEvent::Connected)).await;
    assert_eq!(
        events,
        vec![
            TransportEvent::Disconnected {
                code: None,
                reason: "transport channel dropped".to_string()
            },
            TransportEvent::Reconnecting {
                attempt: 1,
                delay_ms: 3000
            },
            TransportEvent::Connected,
        ]
    );
    assert_eq!(transport.open_count(), 2);
    assert_eq!(manager.reconnect_attempt(), 0);

    manager.disconnect();
    let events = collect_until(&mut rx, |e| matches!(e, TransportEvent::Disconnected { .. })).await;
    assert_eq!(
        events,
        vec![TransportEvent::Disconnected {
            code: Some(1000),
            reason: "client disconnect".to_string()
        }]
    );
    assert_eq!(manager.state(), ConnectionState::Closed);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_then_manual_recovery() {
    let transport = Arc::new(MockTransport::with_default(OpenBehavior::Refuse(
        "connection refused".to_string(),
    )));
    let bus = common::bus();
    let config = config()
        .with_max_reconnect_attempts(2)
        .with_reconnect_base_delay(Duration::from_millis(500));
    let manager = ConnectionManager::new(config, transport.clone(), bus.clone());
    let mut rx = bus.subscribe();

    manager.connect();
    let events =
        collect_until(&mut rx, |e| matches!(e, TransportEvent::ReconnectFailed { .. })).await;
    let refused = TransportEvent::Error {
        message: "Connection error: connection refused".to_string(),
    };
    assert_eq!(
        events,
        vec![
            refused.clone(),
            TransportEvent::Reconnecting {
                attempt: 1,
                delay_ms: 500
            },
            refused.clone(),
            TransportEvent::Reconnecting {
                attempt: 2,
                delay_ms: 1000
            },
            refused,
            TransportEvent::ReconnectFailed { attempts: 2 },
        ]
    );
    assert_eq!(manager.state(), ConnectionState::ReconnectFailed);

    transport.push_behavior(OpenBehavior::Accept).await;
    manager.connect();
    collect_until(&mut rx, |e| matches!(e, TransportEvent::Connected)).await;
    assert_eq!(transport.open_count(), 4);
    assert_eq!(manager.reconnect_attempt(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_open_times_out_then_recovers() {
    let transport = Arc::new(MockTransport::new());
    transport.push_behavior(OpenBehavior::Stall).await;
    let bus = common::bus();
    let config = config().with_connect_timeout(Duration::from_millis(2000));
    let manager = ConnectionManager::new(config, transport.clone(), bus.clone());
    let mut rx = bus.subscribe();

    let started = tokio::time::Instant::now();
    manager.connect();
    let events = collect_until(&mut rx, |e| matches!(e, TransportEvent::Connected)).await;

    assert_eq!(events.len(), 3);
    assert!(matches!(&events[0], TransportEvent::Error { message } if message.starts_with("Timeout")));
    assert_eq!(
        events[1],
        TransportEvent::Reconnecting {
            attempt: 1,
            delay_ms: 3000
        }
    );
    assert_eq!(started.elapsed(), Duration::from_millis(5000));
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_offline_courier_never_opens_transport() {
    let courier = Courier::new(
        ConnectionConfig::offline(),
        GatewayConfig::new("http://api.test"),
        Arc::new(StaticCredentials::new(None)),
    )
    .unwrap();
    let mut rx = courier.bus().subscribe();

    assert!(courier.connection().send(&json!({"type": "queued"})));
    courier.connection().connect();
    let events = collect_until(&mut rx, |e| matches!(e, TransportEvent::Connected)).await;

    assert_eq!(events, vec![TransportEvent::Connected]);
    assert!(courier.connection().config().offline);
}
