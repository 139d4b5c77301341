use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;

use crate::envelope::{Frame, PROTOCOL_VERSION};
use crate::error::ProtocolError;

/// Which encryption path a validated `encrypted_message` frame dispatches
/// to, with its fields already base64-decoded to the exact lengths the
/// corresponding crypto primitive expects.
#[derive(Debug, Clone)]
pub enum Dispatch {
    Ratchet {
        from: String,
        to: String,
        ciphertext: Vec<u8>,
        nonce: [u8; 24],
        ephemeral_public: [u8; 32],
        counter: u32,
        previous_counter: u32,
    },
    Static {
        from: String,
        to: String,
        ciphertext: Vec<u8>,
        nonce: [u8; 24],
    },
    Deniable {
        from: String,
        to: String,
        ciphertext: Vec<u8>,
        nonce: [u8; 24],
    },
}

/// Structural checks common to every frame: must be a JSON object, must
/// carry `version == 1`, must carry a `type`, must carry a finite
/// `timestamp`. Returns the frame's `type` string on success.
fn check_envelope(raw: &Value) -> Result<String, ProtocolError> {
    let obj = raw.as_object().ok_or(ProtocolError::NotAnObject)?;

    let version = obj
        .get("version")
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::MissingField("version"))?;
    if version != u64::from(PROTOCOL_VERSION) {
        return Err(ProtocolError::UnsupportedVersion);
    }

    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField("type"))?;

    let timestamp = obj
        .get("timestamp")
        .and_then(Value::as_f64)
        .ok_or(ProtocolError::MissingField("timestamp"))?;
    if !timestamp.is_finite() {
        return Err(ProtocolError::MissingField("timestamp"));
    }

    Ok(kind.to_string())
}

/// Validate a raw frame and, for any kind other than `encrypted_message`,
/// parse it into a strongly-typed [`Frame`]. Use [`validate_encrypted_message`]
/// for the `encrypted_message` kind, which needs its payload decoded rather
/// than just type-checked.
pub fn validate_frame(raw: &Value) -> Result<Frame, ProtocolError> {
    let kind = check_envelope(raw)?;
    if kind == "encrypted_message" {
        // Use validate_encrypted_message for this kind instead.
        return Err(ProtocolError::UnknownType(kind));
    }
    serde_json::from_value(raw.clone()).map_err(|_| ProtocolError::UnknownType(kind))
}

/// Validate and decode an `encrypted_message` frame's payload, selecting the
/// dispatch path from the fields present in `payload`: ratchet if
/// `ephemeralPublicKey` is present, else deniable if `deniable` is `true`,
/// else static.
pub fn validate_encrypted_message(raw: &Value) -> Result<Dispatch, ProtocolError> {
    let kind = check_envelope(raw)?;
    if kind != "encrypted_message" {
        return Err(ProtocolError::UnknownType(kind));
    }
    let obj = raw.as_object().expect("checked by check_envelope");

    let from = obj
        .get("from")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField("from"))?
        .to_string();
    let to = obj
        .get("to")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField("to"))?
        .to_string();
    let payload = obj
        .get("payload")
        .and_then(Value::as_object)
        .ok_or(ProtocolError::MissingField("payload"))?;

    let ciphertext_b64 = payload
        .get("ciphertext")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField("payload.ciphertext"))?;
    let ciphertext = decode_base64(ciphertext_b64, "payload.ciphertext")?;

    let nonce_b64 = payload
        .get("nonce")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField("payload.nonce"))?;
    let nonce = decode_fixed::<24>(nonce_b64, "payload.nonce")?;

    if let Some(eph_b64) = payload.get("ephemeralPublicKey").and_then(Value::as_str) {
        let ephemeral_public = decode_fixed::<32>(eph_b64, "payload.ephemeralPublicKey")?;
        let counter = non_negative_u32(payload.get("counter"), "payload.counter")?;
        let previous_counter =
            non_negative_u32(payload.get("previousCounter"), "payload.previousCounter")?;
        return Ok(Dispatch::Ratchet {
            from,
            to,
            ciphertext,
            nonce,
            ephemeral_public,
            counter,
            previous_counter,
        });
    }

    if payload.get("deniable").and_then(Value::as_bool) == Some(true) {
        return Ok(Dispatch::Deniable {
            from,
            to,
            ciphertext,
            nonce,
        });
    }

    Ok(Dispatch::Static {
        from,
        to,
        ciphertext,
        nonce,
    })
}

fn decode_base64(s: &str, field: &'static str) -> Result<Vec<u8>, ProtocolError> {
    BASE64.decode(s).map_err(|_| ProtocolError::InvalidBase64(field))
}

fn decode_fixed<const N: usize>(s: &str, field: &'static str) -> Result<[u8; N], ProtocolError> {
    let bytes = decode_base64(s, field)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| ProtocolError::WrongLength {
            field,
            expected: N,
            actual: len,
        })
}

fn non_negative_u32(v: Option<&Value>, field: &'static str) -> Result<u32, ProtocolError> {
    let n = v.and_then(Value::as_i64).ok_or(ProtocolError::MissingField(field))?;
    u32::try_from(n).map_err(|_| ProtocolError::MissingField(field))
}

/// Validate a `join` frame's nickname: 1-20 characters of `[A-Za-z0-9_-]`.
pub fn validate_nickname(nickname: &str) -> Result<(), ProtocolError> {
    if nickname.is_empty() || nickname.len() > 20 {
        return Err(ProtocolError::InvalidNickname);
    }
    if !nickname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ProtocolError::InvalidNickname);
    }
    Ok(())
}
