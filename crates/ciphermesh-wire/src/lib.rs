pub mod envelope;
pub mod error;
pub mod registry;
pub mod validate;

pub use envelope::{Body, ErrorCode, Frame, Payload, PeerSummary, PROTOCOL_VERSION};
pub use error::ProtocolError;
pub use registry::{HandshakeRegistry, PEER_KEY_GRACE};
pub use validate::{validate_encrypted_message, validate_frame, validate_nickname, Dispatch};
