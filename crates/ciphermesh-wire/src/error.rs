use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("missing or invalid field: {0}")]
    MissingField(&'static str),

    #[error("unsupported protocol version")]
    UnsupportedVersion,

    #[error("unknown frame type: {0}")]
    UnknownType(String),

    #[error("invalid base64 in field {0}")]
    InvalidBase64(&'static str),

    #[error("field {field} must decode to {expected} bytes, got {actual}")]
    WrongLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("nickname must be 1-20 characters of [A-Za-z0-9_-]")]
    InvalidNickname,

    #[error("no ratchet session for peer {0}")]
    NoSession(String),

    #[error("crypto error: {0}")]
    Crypto(String),
}

impl From<ciphermesh_crypto::CryptoError> for ProtocolError {
    fn from(e: ciphermesh_crypto::CryptoError) -> Self {
        Self::Crypto(e.to_string())
    }
}
