//! Integration tests for the realtime channel against a local websocket server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use threadline_rs_client::{ChannelState, RealtimeChannel, RealtimeConfig, RealtimeHooks};

/// Polls `cond` until it holds or the budget runs out.
async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_full_lifecycle_against_live_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (auth_tx, auth_rx) = oneshot::channel();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut captured = None;
        let mut socket = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            captured = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            Ok(resp)
        })
        .await
        .unwrap();
        let _ = auth_tx.send(captured);

        socket
            .send(Message::Text(
                r#"{"event":"chat:message","data":{"body":"welcome"}}"#.into(),
            ))
            .await
            .unwrap();

        while let Some(Ok(message)) = socket.next().await {
            if let Message::Text(text) = message {
                let _ = frame_tx.send(text);
            }
        }
    });

    let connected = Arc::new(AtomicUsize::new(0));
    let hooks = RealtimeHooks::new().on_connect({
        let connected = Arc::clone(&connected);
        move || {
            connected.fetch_add(1, Ordering::SeqCst);
        }
    });

    let config = RealtimeConfig::new(format!("ws://{addr}"), Some("tok-123".to_string()));
    let mut channel = RealtimeChannel::connect(config, hooks);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    channel.on("chat:message", move |data| {
        let _ = event_tx.send(data);
    });

    wait_for("connection", || channel.state() == ChannelState::Connected).await;
    assert_eq!(connected.load(Ordering::SeqCst), 1);
    assert_eq!(
        auth_rx.await.unwrap().as_deref(),
        Some("Bearer tok-123"),
        "handshake must carry the bearer token"
    );

    let inbound = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inbound, json!({"body": "welcome"}));

    channel.emit("order:update", json!({"id": 7, "status": "shipped"}));
    let outbound = tokio::time::timeout(Duration::from_secs(5), frame_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let outbound: serde_json::Value = serde_json::from_str(&outbound).unwrap();
    assert_eq!(outbound["event"], "order:update");
    assert_eq!(outbound["data"], json!({"id": 7, "status": "shipped"}));

    channel.disconnect().await;
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn test_no_token_never_dials() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accepts = Arc::new(AtomicUsize::new(0));
    tokio::spawn({
        let accepts = Arc::clone(&accepts);
        async move {
            while listener.accept().await.is_ok() {
                accepts.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    let config = RealtimeConfig::new(format!("ws://{addr}"), None);
    let channel = RealtimeChannel::connect(config, RealtimeHooks::new());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert_eq!(accepts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_server_drop_fires_disconnect_then_retries_to_errored() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Accept one connection, close it immediately, then go away so every
    // reconnect attempt is refused.
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
        socket.close(None).await.unwrap();
        drop(listener);
    });

    let disconnects = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let hooks = RealtimeHooks::new()
        .on_disconnect({
            let disconnects = Arc::clone(&disconnects);
            move || {
                disconnects.fetch_add(1, Ordering::SeqCst);
            }
        })
        .on_error({
            let errors = Arc::clone(&errors);
            move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            }
        });

    let mut config = RealtimeConfig::new(format!("ws://{addr}"), Some("tok-123".to_string()));
    config.reconnect_delay = Duration::from_millis(20);
    config.max_reconnect_attempts = 2;
    let channel = RealtimeChannel::connect(config, hooks);

    wait_for("errored state", || channel.state() == ChannelState::Errored).await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert!(errors.load(Ordering::SeqCst) >= 1);
    assert!(channel.last_error().is_some());
}

#[tokio::test]
async fn test_unreachable_server_exhausts_attempt_budget() {
    // Bind then drop to get a port that refuses connections.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = RealtimeConfig::new(format!("ws://{addr}"), Some("tok-123".to_string()));
    config.reconnect_delay = Duration::from_millis(10);
    config.max_reconnect_attempts = 3;
    let channel = RealtimeChannel::connect(config, RealtimeHooks::new());

    wait_for("errored state", || channel.state() == ChannelState::Errored).await;
    assert!(channel.last_error().is_some());

    // The budget is spent; the channel must not flip back to connecting.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(channel.state(), ChannelState::Errored);
}
