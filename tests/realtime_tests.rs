//! Realtime channel integration tests against a local WebSocket server:
//! session-driven lifecycle, fanout delivery, reconnect backoff, and
//! outbound frames.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_async, accept_hdr_async,
    tungstenite::handshake::server::{Request, Response},
    tungstenite::Message,
};

use lanewire::config::ClientConfig;
use lanewire::error::LanewireError;
use lanewire::realtime::{
    ChannelState, ChatPayload, Fanout, MessageType, RealtimeChannel, RealtimeMessage,
};
use lanewire::session::SessionManager;
use lanewire::store::CredentialStore;

use support::{shipper, MemoryCredentialStore};

async fn bind_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    (listener, format!("ws://{addr}"))
}

fn test_config(realtime_url: &str) -> ClientConfig {
    ClientConfig::default()
        .with_api_url("http://127.0.0.1:9")
        .with_realtime_url(realtime_url)
        .with_reconnect_delays(Duration::from_millis(20), Duration::from_millis(100))
}

fn client_parts(
    config: &ClientConfig,
) -> (Arc<SessionManager>, Arc<Fanout>, Arc<RealtimeChannel>) {
    let store: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::new());
    let manager = SessionManager::new(store, config);
    let fanout = Fanout::new();
    let channel = RealtimeChannel::new(Arc::clone(&manager), Arc::clone(&fanout), config);
    (manager, fanout, channel)
}

async fn wait_for_state(channel: &RealtimeChannel, target: ChannelState) {
    let mut states = channel.state_changes();
    timeout(Duration::from_secs(2), async {
        loop {
            if *states.borrow() == target {
                return;
            }
            states.changed().await.expect("state channel closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("channel never reached {target:?}"));
}

fn notification_frame(id: &str) -> String {
    json!({
        "type": "notification",
        "payload": {"id": id, "title": "New bid", "body": "A carrier bid on your job"}
    })
    .to_string()
}

#[tokio::test]
async fn login_opens_socket_with_user_id_and_bearer_token() {
    let (listener, url) = bind_server().await;
    let config = test_config(&url);
    let (manager, _fanout, channel) = client_parts(&config);

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let query = Arc::new(Mutex::new(String::new()));
        let auth = Arc::new(Mutex::new(String::new()));
        let query_capture = Arc::clone(&query);
        let auth_capture = Arc::clone(&auth);
        let mut ws = accept_hdr_async(stream, move |req: &Request, response: Response| {
            *query_capture.lock().expect("query lock") =
                req.uri().query().unwrap_or_default().to_string();
            *auth_capture.lock().expect("auth lock") = req
                .headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            Ok(response)
        })
        .await
        .expect("handshake");
        let _ = timeout(Duration::from_millis(200), ws.next()).await;
        let query = query.lock().expect("query lock").clone();
        let auth = auth.lock().expect("auth lock").clone();
        (query, auth)
    });

    manager.login(shipper(), "a1", "r1").unwrap();
    wait_for_state(&channel, ChannelState::Connected).await;

    let (query, auth) = server.await.expect("server task");
    assert_eq!(query, "user_id=u-1");
    assert_eq!(auth, "Bearer a1");
}

#[tokio::test]
async fn inbound_frames_fan_out_by_message_type() {
    let (listener, url) = bind_server().await;
    let config = test_config(&url);
    let (manager, fanout, channel) = client_parts(&config);

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    let _notification_sub = fanout.subscribe(MessageType::Notification, move |message| {
        let _ = notify_tx.send(message.clone());
    });
    let (chat_tx, mut chat_rx) = mpsc::unbounded_channel();
    let _chat_sub = fanout.subscribe(MessageType::ChatMessage, move |message| {
        let _ = chat_tx.send(message.clone());
    });

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("handshake");
        ws.send(Message::Text(notification_frame("n-1").into()))
            .await
            .expect("send notification");
        ws.send(Message::Text(
            json!({
                "type": "chat_message",
                "payload": {
                    "conversation_id": "c-1",
                    "sender_id": "u-9",
                    "body": "Loaded and rolling",
                    "sent_at": "2026-08-04T10:00:00Z"
                }
            })
            .to_string()
            .into(),
        ))
        .await
        .expect("send chat");
        let _ = timeout(Duration::from_millis(500), ws.next()).await;
    });

    manager.login(shipper(), "a1", "r1").unwrap();

    let notification = timeout(Duration::from_secs(2), notify_rx.recv())
        .await
        .expect("notification timeout")
        .expect("notification");
    let RealtimeMessage::Notification(payload) = notification else {
        panic!("wrong variant");
    };
    assert_eq!(payload.id, "n-1");

    let chat = timeout(Duration::from_secs(2), chat_rx.recv())
        .await
        .expect("chat timeout")
        .expect("chat");
    let RealtimeMessage::ChatMessage(payload) = chat else {
        panic!("wrong variant");
    };
    assert_eq!(payload.body, "Loaded and rolling");
    // The notification subscriber saw exactly its own type.
    assert!(notify_rx.try_recv().is_err());
}

#[tokio::test]
async fn malformed_frame_is_dropped_without_killing_the_channel() {
    let (listener, url) = bind_server().await;
    let config = test_config(&url);
    let (manager, fanout, _channel) = client_parts(&config);

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let _sub = fanout.subscribe(MessageType::Notification, move |message| {
        let _ = seen_tx.send(message.clone());
    });

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("handshake");
        ws.send(Message::Text("this is not json".to_string().into()))
            .await
            .expect("send garbage");
        ws.send(Message::Text(
            json!({"type": "telemetry", "payload": {}}).to_string().into(),
        ))
        .await
        .expect("send unknown type");
        ws.send(Message::Text(notification_frame("n-2").into()))
            .await
            .expect("send valid");
        let _ = timeout(Duration::from_millis(500), ws.next()).await;
    });

    manager.login(shipper(), "a1", "r1").unwrap();

    let delivered = timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .expect("delivery timeout")
        .expect("delivery");
    let RealtimeMessage::Notification(payload) = delivered else {
        panic!("wrong variant");
    };
    assert_eq!(payload.id, "n-2");
}

#[tokio::test]
async fn logout_closes_the_socket_promptly() {
    let (listener, url) = bind_server().await;
    let config = test_config(&url);
    let (manager, _fanout, channel) = client_parts(&config);

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("handshake");
        // Drain until the peer closes.
        let closed = timeout(Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | None => return true,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return true,
                }
            }
        })
        .await;
        closed.unwrap_or(false)
    });

    manager.login(shipper(), "a1", "r1").unwrap();
    wait_for_state(&channel, ChannelState::Connected).await;

    manager.logout().unwrap();
    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert!(server.await.expect("server task"));
}

#[tokio::test]
async fn reconnects_with_backoff_after_unexpected_close() {
    let (listener, url) = bind_server().await;
    let config = test_config(&url);
    let (manager, _fanout, channel) = client_parts(&config);

    let (reconnected_tx, reconnected_rx) = tokio::sync::oneshot::channel();
    let server = tokio::spawn(async move {
        // First connection is dropped immediately, simulating a crash.
        let (stream, _) = listener.accept().await.expect("accept one");
        let ws = accept_async(stream).await.expect("handshake one");
        drop(ws);
        // The channel should come back on its own.
        let (stream, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("no reconnect")
            .expect("accept two");
        let mut ws = accept_async(stream).await.expect("handshake two");
        let _ = reconnected_tx.send(());
        let _ = timeout(Duration::from_secs(1), ws.next()).await;
    });

    manager.login(shipper(), "a1", "r1").unwrap();
    timeout(Duration::from_secs(2), reconnected_rx)
        .await
        .expect("reconnect timeout")
        .expect("server dropped");
    wait_for_state(&channel, ChannelState::Connected).await;
    server.await.expect("server task");
}

#[tokio::test]
async fn close_mid_backoff_cancels_the_pending_reconnect() {
    let (listener, url) = bind_server().await;
    let config = ClientConfig::default()
        .with_api_url("http://127.0.0.1:9")
        .with_realtime_url(&url)
        // Long enough that logout always lands inside the backoff window.
        .with_reconnect_delays(Duration::from_millis(200), Duration::from_millis(400));
    let (manager, _fanout, channel) = client_parts(&config);

    let first = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept one");
        let ws = accept_async(stream).await.expect("handshake one");
        drop(ws);
        listener
    });

    manager.login(shipper(), "a1", "r1").unwrap();
    let listener = first.await.expect("server task");

    let mut states = channel.state_changes();
    timeout(Duration::from_secs(2), async {
        loop {
            if matches!(*states.borrow(), ChannelState::Backoff(_)) {
                return;
            }
            states.changed().await.expect("state channel closed");
        }
    })
    .await
    .expect("channel never entered backoff");

    manager.logout().unwrap();
    assert_eq!(channel.state(), ChannelState::Disconnected);

    // No reconnect fires after the cancelled backoff timer would have run.
    let reconnect = timeout(Duration::from_millis(700), listener.accept()).await;
    assert!(reconnect.is_err());
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn outbound_messages_reach_the_server_as_envelopes() {
    let (listener, url) = bind_server().await;
    let config = test_config(&url);
    let (manager, _fanout, channel) = client_parts(&config);

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("handshake");
        let frame = timeout(Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return text.to_string(),
                    Some(Ok(_)) => {}
                    other => panic!("connection ended early: {other:?}"),
                }
            }
        })
        .await
        .expect("no outbound frame");
        serde_json::from_str::<Value>(&frame).expect("frame should be JSON")
    });

    manager.login(shipper(), "a1", "r1").unwrap();
    wait_for_state(&channel, ChannelState::Connected).await;

    channel
        .send(RealtimeMessage::ChatMessage(ChatPayload {
            conversation_id: "c-1".to_string(),
            sender_id: "u-1".to_string(),
            body: "On my way to pickup".to_string(),
            sent_at: chrono::Utc::now(),
        }))
        .unwrap();

    let envelope = server.await.expect("server task");
    assert_eq!(envelope["type"], "chat_message");
    assert_eq!(envelope["payload"]["conversation_id"], "c-1");
    assert_eq!(envelope["payload"]["body"], "On my way to pickup");
}

#[tokio::test]
async fn send_fails_while_disconnected() {
    let config = test_config("ws://127.0.0.1:9");
    let (_manager, _fanout, channel) = client_parts(&config);

    let result = channel.send(RealtimeMessage::ChatMessage(ChatPayload {
        conversation_id: "c-1".to_string(),
        sender_id: "u-1".to_string(),
        body: "hello".to_string(),
        sent_at: chrono::Utc::now(),
    }));
    assert!(matches!(result, Err(LanewireError::InvalidState(_))));
}

#[tokio::test]
async fn session_expiry_closes_the_channel() {
    let (listener, url) = bind_server().await;
    // The refresh endpoint is unreachable, so a forced refresh fails fast
    // and expires the session.
    let config = test_config(&url);
    let (manager, _fanout, channel) = client_parts(&config);

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("handshake");
        let closed = timeout(Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | None => return true,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return true,
                }
            }
        })
        .await;
        closed.unwrap_or(false)
    });

    manager.login(shipper(), "a1", "r1").unwrap();
    wait_for_state(&channel, ChannelState::Connected).await;

    let result = manager.refresh_after_unauthorized().await;
    assert!(matches!(result, Err(LanewireError::RefreshFailed(_))));
    assert!(server.await.expect("server task"));
    assert_eq!(channel.state(), ChannelState::Disconnected);
}
