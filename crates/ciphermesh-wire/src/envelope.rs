use serde::{Deserialize, Serialize};

/// The protocol version every frame must carry. The Wire Validator rejects
/// anything else outright.
pub const PROTOCOL_VERSION: u8 = 1;

/// A summary of one connected peer, as sent in `join_ack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub nickname: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// The `payload` object of an `encrypted_message` frame. Which fields are
/// present selects the dispatch path: `ephemeralPublicKey` (+ `counter`,
/// `previousCounter`) means the ratchet path; `deniable: true` means the
/// deniable path; otherwise the static box path applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub ciphertext: String,
    pub nonce: String,
    #[serde(rename = "ephemeralPublicKey", skip_serializing_if = "Option::is_none")]
    pub ephemeral_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter: Option<u32>,
    #[serde(rename = "previousCounter", skip_serializing_if = "Option::is_none")]
    pub previous_counter: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deniable: Option<bool>,
}

/// `error` frame's machine-readable code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "NICKNAME_TAKEN")]
    NicknameTaken,
    #[serde(rename = "INVALID_MESSAGE")]
    InvalidMessage,
    #[serde(rename = "PEER_NOT_FOUND")]
    PeerNotFound,
    #[serde(rename = "RATE_LIMITED")]
    RateLimited,
    #[serde(rename = "PAYLOAD_TOO_LARGE")]
    PayloadTooLarge,
}

/// The body of a wire frame, tagged on the wire by its `type` field. Common
/// envelope fields (`version`, `timestamp`) live on [`Frame`], which wraps
/// one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Body {
    #[serde(rename = "join")]
    Join {
        nickname: String,
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    #[serde(rename = "join_ack")]
    JoinAck {
        #[serde(rename = "sessionId")]
        session_id: String,
        peers: Vec<PeerSummary>,
        #[serde(rename = "queuedCount", skip_serializing_if = "Option::is_none")]
        queued_count: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        room: Option<String>,
    },
    #[serde(rename = "peer_joined")]
    PeerJoined {
        #[serde(rename = "sessionId")]
        session_id: String,
        nickname: String,
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    #[serde(rename = "peer_left")]
    PeerLeft {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "peer_key_updated")]
    PeerKeyUpdated {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    #[serde(rename = "encrypted_message")]
    EncryptedMessage {
        from: String,
        to: String,
        payload: Payload,
    },
    #[serde(rename = "error")]
    Error { code: ErrorCode, message: String },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "key_update")]
    KeyUpdate {
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    #[serde(rename = "change_room")]
    ChangeRoom { room: String },
    #[serde(rename = "room_changed")]
    RoomChanged { room: String },
    #[serde(rename = "list_rooms")]
    ListRooms,
    #[serde(rename = "room_list")]
    RoomList { rooms: Vec<String> },
}

/// A complete wire frame: `{ type, version, timestamp, ...body }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub version: u8,
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: Body,
}

impl Frame {
    /// Build a frame carrying `body`, stamped with the current protocol
    /// version and the given timestamp (caller supplies `now_ms` so this
    /// crate stays free of a direct wall-clock dependency).
    pub fn new(body: Body, timestamp_ms: i64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            timestamp: timestamp_ms,
            body,
        }
    }
}
