//! Integration tests for the blind relay's connection boundary: real TCP
//! sockets, real WebSocket upgrades, no mocking.

use std::time::Duration;

use ciphermesh_relay::RelayConfig;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

async fn spawn_relay() -> (u16, tokio::sync::oneshot::Sender<()>) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = RelayConfig {
        tls: false,
        port,
        ..RelayConfig::default()
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        ciphermesh_relay::server::run(config, shutdown).await.unwrap();
    });

    // Give the listener a moment to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, shutdown_tx)
}

async fn connect(port: u16) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let url = format!("ws://127.0.0.1:{port}");
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

fn join_frame(nickname: &str, public_key: &str) -> String {
    json!({
        "type": "join",
        "version": 1,
        "timestamp": 1_700_000_000_000i64,
        "nickname": nickname,
        "publicKey": public_key,
    })
    .to_string()
}

async fn recv_json(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> Value {
    let msg = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended")
        .expect("websocket error");
    match msg {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn join_ack_lists_no_peers_when_first_to_connect() {
    let (port, _shutdown) = spawn_relay().await;
    let mut alice = connect(port).await;
    alice.send(Message::Text(join_frame("alice", "pk-alice").into())).await.unwrap();

    let ack = recv_json(&mut alice).await;
    assert_eq!(ack["type"], "join_ack");
    assert_eq!(ack["peers"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn second_peer_sees_first_in_roster_and_first_gets_peer_joined() {
    let (port, _shutdown) = spawn_relay().await;
    let mut alice = connect(port).await;
    alice.send(Message::Text(join_frame("alice", "pk-alice").into())).await.unwrap();
    let _ = recv_json(&mut alice).await;

    let mut bob = connect(port).await;
    bob.send(Message::Text(join_frame("bob", "pk-bob").into())).await.unwrap();
    let bob_ack = recv_json(&mut bob).await;
    assert_eq!(bob_ack["peers"].as_array().unwrap().len(), 1);
    assert_eq!(bob_ack["peers"][0]["nickname"], "alice");

    let peer_joined = recv_json(&mut alice).await;
    assert_eq!(peer_joined["type"], "peer_joined");
    assert_eq!(peer_joined["nickname"], "bob");
}

#[tokio::test]
async fn duplicate_nickname_is_rejected() {
    let (port, _shutdown) = spawn_relay().await;
    let mut alice = connect(port).await;
    alice.send(Message::Text(join_frame("alice", "pk-1").into())).await.unwrap();
    let _ = recv_json(&mut alice).await;

    let mut impostor = connect(port).await;
    impostor.send(Message::Text(join_frame("alice", "pk-2").into())).await.unwrap();
    let err = recv_json(&mut impostor).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "NICKNAME_TAKEN");
}

#[tokio::test]
async fn relay_forwards_encrypted_message_without_inspecting_payload() {
    let (port, _shutdown) = spawn_relay().await;
    let mut alice = connect(port).await;
    alice.send(Message::Text(join_frame("alice", "pk-alice").into())).await.unwrap();
    let _ = recv_json(&mut alice).await;

    let mut bob = connect(port).await;
    bob.send(Message::Text(join_frame("bob", "pk-bob").into())).await.unwrap();
    let _ = recv_json(&mut bob).await;
    let _ = recv_json(&mut alice).await; // peer_joined for bob

    let envelope = json!({
        "type": "encrypted_message",
        "version": 1,
        "timestamp": 1_700_000_000_001i64,
        "from": "alice",
        "to": "bob",
        "payload": {
            "ciphertext": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"opaque-bytes"),
            "nonce": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [7u8; 24]),
        }
    });
    alice.send(Message::Text(envelope.to_string().into())).await.unwrap();

    let received = recv_json(&mut bob).await;
    assert_eq!(received["type"], "encrypted_message");
    assert_eq!(received["payload"]["ciphertext"], envelope["payload"]["ciphertext"]);
}

#[tokio::test]
async fn offline_message_is_queued_and_flushed_on_reconnect_with_same_key() {
    let (port, _shutdown) = spawn_relay().await;
    let mut alice = connect(port).await;
    alice.send(Message::Text(join_frame("alice", "pk-alice").into())).await.unwrap();
    let _ = recv_json(&mut alice).await;

    // Bob isn't connected yet; send to him anyway.
    let envelope = json!({
        "type": "encrypted_message",
        "version": 1,
        "timestamp": 1_700_000_000_002i64,
        "from": "alice",
        "to": "bob",
        "payload": {
            "ciphertext": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"queued"),
            "nonce": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [1u8; 24]),
        }
    });
    alice.send(Message::Text(envelope.to_string().into())).await.unwrap();

    // Give the relay a moment to process before Bob joins.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut bob = connect(port).await;
    bob.send(Message::Text(join_frame("bob", "pk-bob").into())).await.unwrap();
    let ack = recv_json(&mut bob).await;
    assert_eq!(ack["queuedCount"], 1);

    let queued = recv_json(&mut bob).await;
    assert_eq!(queued["type"], "encrypted_message");
    assert_eq!(queued["payload"]["ciphertext"], envelope["payload"]["ciphertext"]);
}

#[tokio::test]
async fn list_rooms_reflects_change_room() {
    let (port, _shutdown) = spawn_relay().await;
    let mut alice = connect(port).await;
    alice.send(Message::Text(join_frame("alice", "pk-alice").into())).await.unwrap();
    let _ = recv_json(&mut alice).await;

    alice
        .send(Message::Text(
            json!({"type": "change_room", "version": 1, "timestamp": 1_700_000_000_003i64, "room": "project-x"})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
    let changed = recv_json(&mut alice).await;
    assert_eq!(changed["type"], "room_changed");
    assert_eq!(changed["room"], "project-x");

    alice
        .send(Message::Text(
            json!({"type": "list_rooms", "version": 1, "timestamp": 1_700_000_000_004i64})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
    let rooms = recv_json(&mut alice).await;
    assert_eq!(rooms["type"], "room_list");
    assert!(rooms["rooms"].as_array().unwrap().iter().any(|r| r == "project-x"));
}
