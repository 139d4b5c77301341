//! The per-peer secure channel at the core of CipherMesh: identity keypair
//! lifecycle, a Double Ratchet session for per-message forward secrecy,
//! length-hiding padding, anti-replay, trust-on-first-use with SAS
//! verification, and encrypted persistence of session state.
//!
//! This crate holds no knowledge of transport (relay or P2P) or wire
//! framing — see `ciphermesh-wire` for the envelope types and the registry
//! that ties a peer's public key to its ratchet.

pub mod deniable;
pub mod error;
pub mod identity;
pub mod nonce;
pub mod padding;
pub mod ratchet;
pub mod static_box;
pub mod trust;
pub mod vault;

pub use deniable::DeniableChannel;
pub use error::CryptoError;
pub use identity::{fingerprint_of, Identity};
pub use nonce::NonceManager;
pub use ratchet::{Ratchet, RatchetSnapshot, SendResult};
pub use trust::{sas, TrustOutcome, TrustStore};
pub use vault::StateVault;
