//! End-to-end tests for the WebSocket subscription protocol.
//!
//! Each test runs a real monitor over a temporary log directory and the
//! axum router on an ephemeral port, then talks to it with a WebSocket client.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chatpulse_monitor::ingest::MonitorHandle;
use chatpulse_server::config::Config;
use chatpulse_server::hub::ConnectionHub;
use chatpulse_server::notifications::NotificationManager;
use chatpulse_server::routes::{create_router, AppState};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Test Helpers
// =============================================================================

struct TestServer {
    addr: SocketAddr,
    notifications: Arc<NotificationManager>,
    monitor: MonitorHandle,
    _root: TempDir,
}

async fn start_server() -> TestServer {
    let root = TempDir::new().unwrap();
    let mut monitor_config = chatpulse_monitor::Config::default_for(root.path());
    monitor_config.debounce = Duration::from_millis(100);

    let config = Config {
        port: 0,
        monitor: monitor_config,
    };

    let notifications = Arc::new(NotificationManager::new(ConnectionHub::new()));
    let monitor = MonitorHandle::start(&config.monitor, notifications.clone())
        .await
        .expect("monitor starts");

    let state = AppState::new(config, notifications.clone(), monitor.reader());
    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        notifications,
        monitor,
        _root: root,
    }
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _response) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("websocket handshake");
    client
}

async fn next_json(client: &mut Client) -> Value {
    timeout(Duration::from_secs(10), async {
        loop {
            let frame = client
                .next()
                .await
                .expect("stream open")
                .expect("frame ok");
            if let Message::Text(text) = frame {
                return serde_json::from_str::<Value>(text.as_str()).expect("json frame");
            }
        }
    })
    .await
    .expect("no message in time")
}

async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

fn append_user_line(path: &Path, text: &str) {
    let line = format!(
        "{{\"type\":\"user\",\"timestamp\":\"{}\",\"message\":{{\"role\":\"user\",\"content\":\"{text}\"}}}}\n",
        Utc::now().to_rfc3339()
    );
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(line.as_bytes()).unwrap();
    file.sync_all().unwrap();
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        sleep(Duration::from_millis(20)).await;
    }
}

// =============================================================================
// Protocol Tests
// =============================================================================

/// The first frame on every connection is the connection acknowledgement.
#[tokio::test]
async fn connection_is_acknowledged_with_client_id() {
    let server = start_server().await;
    let mut client = connect(server.addr).await;

    let ack = next_json(&mut client).await;

    assert_eq!(ack["type"], "connection");
    assert!(ack["data"]["clientId"].as_str().is_some_and(|id| !id.is_empty()));

    server.monitor.shutdown().await.unwrap();
}

#[tokio::test]
async fn subscribe_and_unsubscribe_are_confirmed() {
    let server = start_server().await;
    let mut client = connect(server.addr).await;
    let _ack = next_json(&mut client).await;

    send_json(
        &mut client,
        serde_json::json!({"type": "subscribe", "channel": "conversations"}),
    )
    .await;
    let confirmed = next_json(&mut client).await;
    assert_eq!(confirmed["type"], "subscription_confirmed");
    assert_eq!(confirmed["data"]["channel"], "conversations");
    assert_eq!(server.notifications.subscriber_count("conversations"), 1);

    send_json(
        &mut client,
        serde_json::json!({"type": "unsubscribe", "channel": "conversations"}),
    )
    .await;
    let confirmed = next_json(&mut client).await;
    assert_eq!(confirmed["type"], "unsubscription_confirmed");
    assert_eq!(server.notifications.subscriber_count("conversations"), 0);

    server.monitor.shutdown().await.unwrap();
}

#[tokio::test]
async fn bad_control_message_gets_error_and_connection_survives() {
    let server = start_server().await;
    let mut client = connect(server.addr).await;
    let _ack = next_json(&mut client).await;

    client
        .send(Message::Text("{\"type\":\"dance\"}".into()))
        .await
        .unwrap();
    let reply = next_json(&mut client).await;
    assert_eq!(reply["type"], "error");

    send_json(
        &mut client,
        serde_json::json!({"type": "subscribe", "channel": "conversations"}),
    )
    .await;
    let confirmed = next_json(&mut client).await;
    assert_eq!(confirmed["type"], "subscription_confirmed");

    server.monitor.shutdown().await.unwrap();
}

// =============================================================================
// State Change Delivery
// =============================================================================

/// A new conversation file reaches a subscribed client as a state change.
#[tokio::test]
async fn state_change_reaches_subscriber() {
    let server = start_server().await;
    let mut client = connect(server.addr).await;
    let _ack = next_json(&mut client).await;

    send_json(
        &mut client,
        serde_json::json!({"type": "subscribe", "channel": "conversations"}),
    )
    .await;
    let _confirmed = next_json(&mut client).await;

    let project = server.monitor.watch_dir().join("-home-dev-app");
    fs::create_dir_all(&project).unwrap();
    append_user_line(&project.join("live.jsonl"), "Ship it");

    let event = timeout(Duration::from_secs(10), async {
        loop {
            let frame = next_json(&mut client).await;
            if frame["type"] == "conversation_state_change"
                && frame["data"]["newState"] == "assistant_working"
            {
                return frame;
            }
        }
    })
    .await
    .expect("state change delivered");

    assert_eq!(event["data"]["conversationId"], "-home-dev-app/live");
    assert_eq!(event["data"]["context"]["projectPath"], "-home-dev-app");

    server.monitor.shutdown().await.unwrap();
}

/// Closing the socket removes the connection and all its subscriptions.
#[tokio::test]
async fn disconnect_cleans_up_subscriptions() {
    let server = start_server().await;
    let mut client = connect(server.addr).await;
    let _ack = next_json(&mut client).await;

    send_json(
        &mut client,
        serde_json::json!({"type": "subscribe", "channel": "conversation:abc"}),
    )
    .await;
    let _confirmed = next_json(&mut client).await;
    assert_eq!(server.notifications.hub().connection_count(), 1);

    client.close(None).await.unwrap();
    drop(client);

    let notifications = server.notifications.clone();
    wait_until(|| notifications.hub().connection_count() == 0).await;
    assert_eq!(server.notifications.subscriber_count("conversation:abc"), 0);

    server.monitor.shutdown().await.unwrap();
}
