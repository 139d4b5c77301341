use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ciphermesh_wire::ProtocolError),

    #[error("crypto error: {0}")]
    Crypto(#[from] ciphermesh_crypto::CryptoError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("tls configuration error: {0}")]
    TlsConfig(String),

    #[error("nickname already taken: {0}")]
    NicknameTaken(String),

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("frame exceeds the {0}-byte size limit")]
    PayloadTooLarge(usize),
}
