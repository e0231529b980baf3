use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use httpmock::prelude::*;
use push_channel::{
    BayeuxTransport, ClientConfig, ConnectionState, Delivery, MetaEvent, PrintIn, Session,
    SessionContext, Transport, Ui,
};
use serde_json::json;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const PATH: &str = "/cometd";
const USER: &str = "/service/user";
const WAIT: Duration = Duration::from_secs(5);

fn test_config(server: &MockServer) -> ClientConfig {
    let mut config = ClientConfig::new(server.url(PATH));
    config.transport.connect_timeout_secs = 5;
    config.transport.long_poll_margin_secs = 2;
    config.transport.initial_retry_ms = 10;
    config.transport.max_retry_ms = 50;
    config
}

async fn mock_handshake<'a>(server: &'a MockServer, client_id: &str) -> httpmock::Mock<'a> {
    let body = json!([{
        "channel": "/meta/handshake",
        "successful": true,
        "clientId": client_id,
        "version": "1.0",
        "supportedConnectionTypes": ["long-polling"],
        "advice": {"reconnect": "retry", "interval": 0, "timeout": 1000},
    }]);
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path(PATH)
                .body_contains("/meta/handshake")
                .body_contains("authToken");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(body);
        })
        .await
}

async fn mock_connect(server: &MockServer, data: Vec<serde_json::Value>) -> httpmock::Mock<'_> {
    let mut body = data;
    body.push(json!({
        "channel": "/meta/connect",
        "successful": true,
        "advice": {"interval": 100},
    }));
    server
        .mock_async(|when, then| {
            when.method(POST).path(PATH).body_contains("/meta/connect");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::Value::Array(body));
        })
        .await
}

async fn mock_disconnect(server: &MockServer) -> httpmock::Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method(POST).path(PATH).body_contains("/meta/disconnect");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!([{"channel": "/meta/disconnect", "successful": true}]));
        })
        .await
}

fn meta_events(transport: &BayeuxTransport) -> mpsc::UnboundedReceiver<MetaEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    transport.add_meta_listener(Arc::new(move |event| {
        let _ = tx.send(event);
    }));
    rx
}

fn deliveries(transport: &BayeuxTransport, pattern: &str) -> mpsc::UnboundedReceiver<Delivery> {
    let (tx, rx) = mpsc::unbounded_channel();
    transport.add_listener(
        pattern,
        Arc::new(move |delivery| {
            let _ = tx.send(delivery);
        }),
    );
    rx
}

/// Wait for the first item satisfying `pred`, skipping the rest.
async fn next_matching<T: std::fmt::Debug>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    pred: impl Fn(&T) -> bool,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let item = rx.recv().await.expect("channel closed");
            if pred(&item) {
                return item;
            }
        }
    })
    .await
    .expect("timed out waiting for item")
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn is_connected(event: &MetaEvent) -> bool {
    matches!(
        event,
        MetaEvent::Connect {
            successful: true,
            ..
        }
    )
}

async fn connected_transport(server: &MockServer) -> (BayeuxTransport, mpsc::UnboundedReceiver<MetaEvent>) {
    let transport = BayeuxTransport::new(&test_config(server)).unwrap();
    let mut meta = meta_events(&transport);
    transport.handshake(json!({"authToken": "token-1"}));
    next_matching(&mut meta, is_connected).await;
    (transport, meta)
}

struct TestSession;

impl Session for TestSession {
    fn is_logged_in(&self) -> bool {
        true
    }

    fn auth_token(&self) -> String {
        "token-1".to_string()
    }
}

struct AutoAck;

#[async_trait]
impl Ui for AutoAck {
    async fn acknowledge_wake_up(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Test 1: handshake then long poll
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_then_connect() {
    let server = MockServer::start_async().await;
    let handshake = mock_handshake(&server, "client-1").await;
    let connect = mock_connect(&server, vec![]).await;

    let transport = BayeuxTransport::new(&test_config(&server)).unwrap();
    let mut meta = meta_events(&transport);
    transport.handshake(json!({"authToken": "token-1"}));

    assert_eq!(
        next_matching(&mut meta, |_| true).await,
        MetaEvent::Handshake {
            successful: true,
            error: None
        }
    );
    next_matching(&mut meta, is_connected).await;
    assert_eq!(transport.client_id().as_deref(), Some("client-1"));
    handshake.assert_hits_async(1).await;
    assert!(connect.hits_async().await >= 1);
}

// ---------------------------------------------------------------------------
// Test 2: data messages reach matching listeners
// ---------------------------------------------------------------------------

#[tokio::test]
async fn data_messages_reach_matching_listeners() {
    let server = MockServer::start_async().await;
    mock_handshake(&server, "client-1").await;
    mock_connect(
        &server,
        vec![json!({"channel": USER, "data": {"event": "NULL"}})],
    )
    .await;

    let transport = BayeuxTransport::new(&test_config(&server)).unwrap();
    let mut wildcard = deliveries(&transport, "/service/*");
    let mut other = deliveries(&transport, "/service/device");
    transport.handshake(json!({"authToken": "token-1"}));

    let delivery = next_matching(&mut wildcard, |_| true).await;
    assert_eq!(delivery, Delivery::Message(json!({"event": "NULL"})));
    assert!(other.try_recv().is_err());
}

// ---------------------------------------------------------------------------
// Test 3: rejected handshakes follow server advice
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejected_handshake_is_retried() {
    let server = MockServer::start_async().await;
    let handshake = server
        .mock_async(|when, then| {
            when.method(POST).path(PATH).body_contains("/meta/handshake");
            then.status(200).json_body(json!([{
                "channel": "/meta/handshake",
                "successful": false,
                "error": "403::Unauthorized",
                "advice": {"reconnect": "retry"},
            }]));
        })
        .await;

    let transport = BayeuxTransport::new(&test_config(&server)).unwrap();
    let mut meta = meta_events(&transport);
    transport.handshake(json!({"authToken": "bad"}));

    for _ in 0..2 {
        let event = next_matching(&mut meta, |_| true).await;
        assert_eq!(
            event,
            MetaEvent::Handshake {
                successful: false,
                error: Some("403::Unauthorized".into())
            }
        );
    }
    assert!(handshake.hits_async().await >= 2);
    assert!(transport.client_id().is_none());
    transport.disconnect(true);
}

#[tokio::test]
async fn reconnect_none_stops_the_driver() {
    let server = MockServer::start_async().await;
    let handshake = server
        .mock_async(|when, then| {
            when.method(POST).path(PATH).body_contains("/meta/handshake");
            then.status(200).json_body(json!([{
                "channel": "/meta/handshake",
                "successful": false,
                "error": "403::Unauthorized",
                "advice": {"reconnect": "none"},
            }]));
        })
        .await;

    let transport = BayeuxTransport::new(&test_config(&server)).unwrap();
    let mut meta = meta_events(&transport);
    transport.handshake(json!({"authToken": "bad"}));
    next_matching(&mut meta, |_| true).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    handshake.assert_hits_async(1).await;
}

// ---------------------------------------------------------------------------
// Test 4: publish outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejected_publish_is_delivered_as_failure() {
    let server = MockServer::start_async().await;
    mock_handshake(&server, "client-1").await;
    mock_connect(&server, vec![]).await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(PATH).body_contains(USER);
            then.status(200).json_body(json!([{
                "channel": USER,
                "successful": false,
                "error": "403::denied",
            }]));
        })
        .await;

    let (transport, mut meta) = connected_transport(&server).await;
    let mut user = deliveries(&transport, USER);
    transport.publish(USER, json!({"user": "alice"})).unwrap();

    let delivery = next_matching(&mut user, |_| true).await;
    assert_eq!(delivery, Delivery::PublishFailed("403::denied".into()));
    let event = next_matching(&mut meta, |e| matches!(e, MetaEvent::Unsuccessful { .. })).await;
    assert_eq!(
        event,
        MetaEvent::Unsuccessful {
            channel: USER.into(),
            error: Some("403::denied".into())
        }
    );
}

#[tokio::test]
async fn http_error_on_publish_is_delivered_as_failure() {
    let server = MockServer::start_async().await;
    mock_handshake(&server, "client-1").await;
    mock_connect(&server, vec![]).await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(PATH).body_contains(USER);
            then.status(503).body("Service Unavailable");
        })
        .await;

    let (transport, _meta) = connected_transport(&server).await;
    let mut user = deliveries(&transport, USER);
    transport.publish(USER, json!({})).unwrap();

    let delivery = next_matching(&mut user, |_| true).await;
    match delivery {
        Delivery::PublishFailed(message) => assert!(message.contains("503"), "{message}"),
        other => panic!("expected publish failure, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Test 5: connect failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_connect_is_reported_and_retried() {
    let server = MockServer::start_async().await;
    mock_handshake(&server, "client-1").await;
    let connect = server
        .mock_async(|when, then| {
            when.method(POST).path(PATH).body_contains("/meta/connect");
            then.status(502);
        })
        .await;

    let transport = BayeuxTransport::new(&test_config(&server)).unwrap();
    let mut meta = meta_events(&transport);
    transport.handshake(json!({"authToken": "token-1"}));

    for _ in 0..2 {
        next_matching(&mut meta, |e| {
            matches!(
                e,
                MetaEvent::Connect {
                    successful: false,
                    ..
                }
            )
        })
        .await;
    }
    assert!(connect.hits_async().await >= 2);
    transport.disconnect(true);
}

#[tokio::test]
async fn unknown_client_triggers_rehandshake() {
    let server = MockServer::start_async().await;
    let handshake = mock_handshake(&server, "client-1").await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(PATH).body_contains("/meta/connect");
            then.status(200).json_body(json!([{
                "channel": "/meta/connect",
                "successful": false,
                "error": "402::Unknown client",
            }]));
        })
        .await;

    let transport = BayeuxTransport::new(&test_config(&server)).unwrap();
    let mut meta = meta_events(&transport);
    transport.handshake(json!({"authToken": "token-1"}));

    for _ in 0..2 {
        next_matching(&mut meta, |e| {
            matches!(
                e,
                MetaEvent::Handshake {
                    successful: true,
                    ..
                }
            )
        })
        .await;
    }
    assert!(handshake.hits_async().await >= 2);
    transport.disconnect(true);
}

// ---------------------------------------------------------------------------
// Test 6: disconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disconnect_stops_long_polling() {
    let server = MockServer::start_async().await;
    mock_handshake(&server, "client-1").await;
    let connect = mock_connect(&server, vec![]).await;
    let disconnect = mock_disconnect(&server).await;

    let (transport, mut meta) = connected_transport(&server).await;
    transport.disconnect(true);
    assert_eq!(
        next_matching(&mut meta, |e| matches!(e, MetaEvent::Disconnect { .. })).await,
        MetaEvent::Disconnect { successful: true }
    );
    assert!(transport.client_id().is_none());

    tokio::time::sleep(Duration::from_millis(200)).await;
    disconnect.assert_hits_async(1).await;
    let settled = connect.hits_async().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(connect.hits_async().await, settled);

    assert!(matches!(
        transport.publish(USER, json!({})),
        Err(push_channel::Error::NotHandshaken)
    ));
}

// ---------------------------------------------------------------------------
// Test 7: session context end to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn session_polls_user_channel_and_dispatches_print_in() {
    let server = MockServer::start_async().await;
    mock_handshake(&server, "client-1").await;
    mock_connect(&server, vec![]).await;
    let disconnect = mock_disconnect(&server).await;
    let poll = server
        .mock_async(|when, then| {
            when.method(POST)
                .path(PATH)
                .body_contains(USER)
                .body_contains("alice");
            then.status(200).json_body(json!([
                {"channel": USER, "successful": true},
                {"channel": USER, "data": {"event": "PRINT_IN", "msgTime": 7, "data": {"jobs": 1}}},
            ]));
        })
        .await;

    let config = test_config(&server);
    let transport = Arc::new(BayeuxTransport::new(&config).unwrap());
    let ctx = SessionContext::new(transport, Arc::new(TestSession), Arc::new(AutoAck), &config)
        .unwrap();
    ctx.configure_watchdog().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<PrintIn>();
    ctx.user().on_poll_invitation(|| push_channel::UserPollArgs {
        user: "alice".into(),
        ..Default::default()
    });
    ctx.user().on_print_in(move |event, repoll| {
        let _ = tx.send(event);
        repoll.skip();
    });
    ctx.login();

    let event = next_matching(&mut rx, |_| true).await;
    assert_eq!(event.msg_time, Some(7));
    assert_eq!(event.data, json!({"jobs": 1}));
    poll.assert_hits_async(1).await;
    assert!(ctx.user().is_subscribed());
    assert!(!ctx.user().is_poll_pending());
    assert!(ctx.watchdog().is_running());
    assert_eq!(ctx.connection().state(), ConnectionState::Connected);

    ctx.logout();
    assert!(!ctx.connection().is_on());
    assert!(!ctx.user().is_subscribed());
    assert!(!ctx.watchdog().is_running());
    tokio::time::sleep(Duration::from_millis(200)).await;
    disconnect.assert_hits_async(1).await;
}

#[tokio::test]
async fn maintenance_event_logs_out() {
    let server = MockServer::start_async().await;
    mock_handshake(&server, "client-1").await;
    mock_connect(&server, vec![]).await;
    mock_disconnect(&server).await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(PATH).body_contains(USER);
            then.status(200).json_body(json!([
                {"channel": USER, "successful": true},
                {"channel": USER, "data": {"event": "SYS_MAINTENANCE", "msg": "upgrade"}},
            ]));
        })
        .await;

    let config = test_config(&server);
    let transport = Arc::new(BayeuxTransport::new(&config).unwrap());
    let ctx = SessionContext::new(transport, Arc::new(TestSession), Arc::new(AutoAck), &config)
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    ctx.user().on_maintenance(move |msg| {
        let _ = tx.send(msg);
    });
    ctx.login();

    assert_eq!(next_matching(&mut rx, |_| true).await, "upgrade");
    let connection = ctx.connection().clone();
    wait_until(|| !connection.is_on()).await;
    assert!(!ctx.user().is_subscribed());
    assert_eq!(ctx.connection().state(), ConnectionState::Closed);
}
