use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use ciphermesh_wire::{validate_encrypted_message, validate_frame, validate_nickname, Body, Dispatch, Frame};

use crate::error::RelayError;
use crate::registry::{SessionHandle, SessionRegistry, DEFAULT_ROOM};
use crate::RelayConfig;

/// Frames larger than this are rejected before any parsing is attempted.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Per-session cap enforced by [`crate::registry::RateLimiter`].
const MESSAGES_PER_SECOND: u32 = 30;

/// Either side of an optionally-TLS-terminated connection, so the accept
/// loop can hand both plaintext and TLS sockets to the same websocket
/// upgrade path.
enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Build a `rustls::ServerConfig`-backed acceptor from the configured
/// certificate/key paths, or `None` if TLS was requested but no material is
/// configured — the caller falls back to plaintext and logs a warning.
fn load_tls_acceptor(config: &RelayConfig) -> Result<Option<tokio_rustls::TlsAcceptor>, RelayError> {
    let (Some(cert_path), Some(key_path)) = (&config.tls_cert_path, &config.tls_key_path) else {
        return Ok(None);
    };

    let cert_file = std::fs::File::open(cert_path)?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut io::BufReader::new(cert_file))
        .collect::<Result<_, _>>()?;

    let key_file = std::fs::File::open(key_path)?;
    let key = rustls_pemfile::private_key(&mut io::BufReader::new(key_file))?
        .ok_or_else(|| RelayError::TlsConfig("no private key found in PEM file".to_string()))?;

    let server_config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RelayError::TlsConfig(e.to_string()))?;

    Ok(Some(tokio_rustls::TlsAcceptor::from(Arc::new(server_config))))
}

/// Run the relay server until `shutdown` resolves, draining in-flight
/// connections as their tasks return.
pub async fn run(config: RelayConfig, shutdown: impl std::future::Future<Output = ()>) -> Result<(), RelayError> {
    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "relay listening");

    let tls_acceptor = if config.tls {
        match load_tls_acceptor(&config)? {
            Some(acceptor) => Some(acceptor),
            None => {
                tracing::warn!("TLS requested but no certificate configured — serving plaintext");
                None
            }
        }
    } else {
        None
    };

    let registry = Arc::new(SessionRegistry::new());
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received, no longer accepting new connections");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let registry = Arc::clone(&registry);
                let tls_acceptor = tls_acceptor.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer_addr, tls_acceptor, registry).await {
                        tracing::debug!(%peer_addr, error = %e, "connection closed");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    registry: Arc<SessionRegistry>,
) -> Result<(), RelayError> {
    let stream = match tls_acceptor {
        Some(acceptor) => MaybeTlsStream::Tls(Box::new(acceptor.accept(stream).await?)),
        None => MaybeTlsStream::Plain(stream),
    };

    let ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig {
        max_message_size: Some(MAX_FRAME_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..Default::default()
    };
    let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    // First frame must be a `join`.
    let first = match ws_stream.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => return Ok(()),
    };
    let (nickname, public_key) = match parse_join(&first) {
        Ok(pair) => pair,
        Err(e) => {
            let _ = send_error(&mut ws_sink, ciphermesh_wire::ErrorCode::InvalidMessage, &e.to_string()).await;
            return Ok(());
        }
    };

    if registry.nickname_taken(DEFAULT_ROOM, &nickname) {
        let _ = send_error(&mut ws_sink, ciphermesh_wire::ErrorCode::NicknameTaken, "nickname already in use").await;
        return Ok(());
    }

    let session_id = Uuid::new_v4().to_string();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);

    let roster_before: Vec<_> = registry
        .room_roster(DEFAULT_ROOM)
        .into_iter()
        .map(|(sid, nick, pk)| ciphermesh_wire::PeerSummary {
            session_id: sid,
            nickname: nick,
            public_key: pk,
        })
        .collect();

    let handle = SessionHandle {
        session_id: session_id.clone(),
        nickname: nickname.clone(),
        public_key: public_key.clone(),
        room: DEFAULT_ROOM.to_string(),
        outbound: outbound_tx.clone(),
        rate_limiter: crate::registry::RateLimiter::new(MESSAGES_PER_SECOND),
    };
    let flushed = registry.join(handle);
    let queued_count = flushed.len() as u32;

    let join_ack = Frame::new(
        Body::JoinAck {
            session_id: session_id.clone(),
            peers: roster_before,
            queued_count: if queued_count > 0 { Some(queued_count) } else { None },
            room: Some(DEFAULT_ROOM.to_string()),
        },
        now_ms(),
    );
    send_frame(&outbound_tx, &join_ack)?;
    for frame in flushed {
        let _ = outbound_tx.send(frame).await;
    }

    broadcast(
        &registry,
        DEFAULT_ROOM,
        &session_id,
        &Frame::new(
            Body::PeerJoined {
                session_id: session_id.clone(),
                nickname: nickname.clone(),
                public_key: public_key.clone(),
            },
            now_ms(),
        ),
    );

    tracing::info!(%peer_addr, %session_id, %nickname, "session joined");

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        match ws_stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_FRAME_SIZE {
                    let _ = outbound_tx
                        .send(error_text(ciphermesh_wire::ErrorCode::PayloadTooLarge, "frame too large"))
                        .await;
                    continue;
                }
                if !registry.check_rate(&session_id) {
                    let _ = outbound_tx
                        .send(error_text(ciphermesh_wire::ErrorCode::RateLimited, "rate limit exceeded"))
                        .await;
                    continue;
                }
                handle_frame(&registry, &session_id, &nickname, &public_key, &text, &outbound_tx).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(%session_id, error = %e, "websocket error");
                break;
            }
        }
    }

    writer.abort();
    registry.leave(&session_id);
    broadcast(
        &registry,
        DEFAULT_ROOM,
        &session_id,
        &Frame::new(Body::PeerLeft { session_id: session_id.clone() }, now_ms()),
    );
    tracing::info!(%session_id, %nickname, "session left");

    Ok(())
}

/// Parse and structurally validate the inbound frame, dispatching routing
/// and room frames. Ciphertext payloads are forwarded byte-for-byte to
/// their destination without ever being decoded or logged.
async fn handle_frame(
    registry: &SessionRegistry,
    session_id: &str,
    nickname: &str,
    public_key: &str,
    text: &str,
    outbound: &mpsc::Sender<String>,
) {
    let raw: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            let _ = outbound
                .send(error_text(ciphermesh_wire::ErrorCode::InvalidMessage, "malformed JSON"))
                .await;
            return;
        }
    };

    let kind = raw.get("type").and_then(Value::as_str).unwrap_or_default();

    match kind {
        "encrypted_message" => {
            if let Err(e) = validate_encrypted_message(&raw) {
                let _ = outbound
                    .send(error_text(ciphermesh_wire::ErrorCode::InvalidMessage, &e.to_string()))
                    .await;
                return;
            }
            route_encrypted(registry, &raw, text).await;
        }
        "ping" => {
            let _ = outbound.send(frame_text(&Frame::new(Body::Pong, now_ms()))).await;
        }
        "change_room" => match validate_frame(&raw) {
            Ok(Frame { body: Body::ChangeRoom { room }, .. }) => {
                if let Some(old_room) = registry.change_room(session_id, &room) {
                    broadcast(
                        registry,
                        &old_room,
                        session_id,
                        &Frame::new(Body::PeerLeft { session_id: session_id.to_string() }, now_ms()),
                    );
                }
                let _ = outbound
                    .send(frame_text(&Frame::new(Body::RoomChanged { room: room.clone() }, now_ms())))
                    .await;
                broadcast(
                    registry,
                    &room,
                    session_id,
                    &Frame::new(
                        Body::PeerJoined {
                            session_id: session_id.to_string(),
                            nickname: nickname.to_string(),
                            public_key: public_key.to_string(),
                        },
                        now_ms(),
                    ),
                );
            }
            _ => {
                let _ = outbound
                    .send(error_text(ciphermesh_wire::ErrorCode::InvalidMessage, "malformed change_room"))
                    .await;
            }
        },
        "list_rooms" => {
            let rooms = registry.room_list();
            let _ = outbound
                .send(frame_text(&Frame::new(Body::RoomList { rooms }, now_ms())))
                .await;
        }
        "key_update" => match validate_frame(&raw) {
            Ok(Frame { body: Body::KeyUpdate { public_key }, .. }) => {
                broadcast(
                    registry,
                    DEFAULT_ROOM,
                    session_id,
                    &Frame::new(
                        Body::PeerKeyUpdated {
                            session_id: session_id.to_string(),
                            public_key,
                        },
                        now_ms(),
                    ),
                );
            }
            _ => {
                let _ = outbound
                    .send(error_text(ciphermesh_wire::ErrorCode::InvalidMessage, "malformed key_update"))
                    .await;
            }
        },
        other => {
            let _ = outbound
                .send(error_text(ciphermesh_wire::ErrorCode::InvalidMessage, &format!("unknown frame type: {other}")))
                .await;
        }
    }
}

/// Route an `encrypted_message` to its destination by nickname, queuing it
/// if the recipient is currently offline. The relay only reads `to`/`from`
/// for routing — `raw_text` (the original, unparsed wire bytes) is what
/// actually gets forwarded, so the payload is never re-encoded.
async fn route_encrypted(registry: &SessionRegistry, raw: &Value, raw_text: &str) {
    let Some(to) = raw.get("to").and_then(Value::as_str) else {
        return;
    };
    match registry.find_by_nickname(DEFAULT_ROOM, to) {
        Some((_, sender)) => {
            let _ = sender.send(raw_text.to_string()).await;
        }
        None => registry.queue_offline(to, raw_text.to_string()),
    }
}

fn parse_join(text: &str) -> Result<(String, String), RelayError> {
    let raw: Value = serde_json::from_str(text)?;
    let frame = validate_frame(&raw)?;
    match frame.body {
        Body::Join { nickname, public_key } => {
            validate_nickname(&nickname)?;
            Ok((nickname, public_key))
        }
        _ => Err(RelayError::InvalidKeyMaterial("first frame was not a join".to_string())),
    }
}

fn broadcast(registry: &SessionRegistry, room: &str, except: &str, frame: &Frame) {
    let text = frame_text(frame);
    for (_, sender) in registry.room_members(room, except) {
        let _ = sender.try_send(text.clone());
    }
}

fn send_frame(sender: &mpsc::Sender<String>, frame: &Frame) -> Result<(), RelayError> {
    sender
        .try_send(frame_text(frame))
        .map_err(|_| RelayError::PayloadTooLarge(MAX_FRAME_SIZE))
}

async fn send_error<S>(sink: &mut S, code: ciphermesh_wire::ErrorCode, message: &str) -> Result<(), RelayError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let frame = Frame::new(Body::Error { code, message: message.to_string() }, now_ms());
    sink.send(Message::Text(frame_text(&frame).into())).await?;
    Ok(())
}

fn error_text(code: ciphermesh_wire::ErrorCode, message: &str) -> String {
    frame_text(&Frame::new(Body::Error { code, message: message.to_string() }, now_ms()))
}

fn frame_text(frame: &Frame) -> String {
    serde_json::to_string(frame).expect("Frame serialization is infallible")
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
