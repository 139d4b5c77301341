use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use blake2::digest::consts::U32;
use blake2::digest::Digest;
use blake2::Blake2b;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::identity::fingerprint_of;

type Blake2b256 = Blake2b<U32>;

const SAS_DOMAIN: &[u8] = b"CipherMesh-SAS-v1";

/// Outcome of checking an observed peer key against the trust store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustOutcome {
    /// Never seen this nickname before.
    NewPeer,
    /// Matches the pinned key.
    Trusted,
    /// Differs from the pinned key, and the pinned key was never verified.
    Mismatch,
    /// Differs from the pinned key, and the pinned key *was* verified —
    /// this is the case that most warrants suspicion.
    VerifiedMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub fingerprint: String,
    pub public_key: String, // base64
    pub first_seen: u64,
    pub last_seen: u64,
    pub verified: bool,
}

/// Trust-on-first-use identity store, persisted as JSON under
/// `.ciphermesh/trusted-peers.json`. Keyed by lowercase nickname.
pub struct TrustStore {
    path: PathBuf,
    records: HashMap<String, PeerRecord>,
}

impl TrustStore {
    /// Load an existing store from `path`, or start empty if it doesn't
    /// exist yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| CryptoError::StorageError(e.to_string()))?;
            serde_json::from_str(&raw).map_err(|e| CryptoError::Serialization(e.to_string()))?
        } else {
            HashMap::new()
        };
        Ok(Self { path, records })
    }

    fn persist(&self) -> Result<(), CryptoError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CryptoError::StorageError(e.to_string()))?;
        }
        let raw = serde_json::to_string_pretty(&self.records)
            .map_err(|e| CryptoError::Serialization(e.to_string()))?;
        std::fs::write(&self.path, raw).map_err(|e| CryptoError::StorageError(e.to_string()))
    }

    /// Check an observed `(nickname, public_key)` pair against the pinned
    /// record. On `Trusted`, bumps `last_seen` and persists.
    pub fn check(&mut self, nickname: &str, public: &[u8; 32]) -> Result<TrustOutcome, CryptoError> {
        let key = nickname.to_lowercase();
        let encoded = BASE64.encode(public);

        match self.records.get_mut(&key) {
            None => Ok(TrustOutcome::NewPeer),
            Some(record) if record.public_key == encoded => {
                record.last_seen = now_secs();
                self.persist()?;
                Ok(TrustOutcome::Trusted)
            }
            Some(record) if record.verified => {
                tracing::warn!(nickname = %nickname, "key mismatch against a SAS-verified peer");
                Ok(TrustOutcome::VerifiedMismatch)
            }
            Some(_) => {
                tracing::warn!(nickname = %nickname, "key mismatch against an unverified pinned peer");
                Ok(TrustOutcome::Mismatch)
            }
        }
    }

    /// Pin a newly-observed peer, unverified.
    pub fn record(&mut self, nickname: &str, public: &[u8; 32]) -> Result<(), CryptoError> {
        let key = nickname.to_lowercase();
        let now = now_secs();
        self.records.insert(
            key,
            PeerRecord {
                fingerprint: fingerprint_of(public),
                public_key: BASE64.encode(public),
                first_seen: now,
                last_seen: now,
                verified: false,
            },
        );
        self.persist()
    }

    /// User-accepted trust update: replace the pinned key and clear
    /// `verified` (the user must re-verify via SAS for the new key).
    pub fn update(&mut self, nickname: &str, public: &[u8; 32]) -> Result<(), CryptoError> {
        self.replace(nickname, public, false)
    }

    /// Authenticated in-channel rotation: replace the pinned key but
    /// preserve `verified`, since the rotation was proven over an
    /// already-trusted channel.
    pub fn auto_update(&mut self, nickname: &str, public: &[u8; 32]) -> Result<(), CryptoError> {
        let key = nickname.to_lowercase();
        let was_verified = self.records.get(&key).is_some_and(|r| r.verified);
        self.replace(nickname, public, was_verified)
    }

    fn replace(&mut self, nickname: &str, public: &[u8; 32], verified: bool) -> Result<(), CryptoError> {
        let key = nickname.to_lowercase();
        let now = now_secs();
        let first_seen = self.records.get(&key).map_or(now, |r| r.first_seen);
        self.records.insert(
            key,
            PeerRecord {
                fingerprint: fingerprint_of(public),
                public_key: BASE64.encode(public),
                first_seen,
                last_seen: now,
                verified,
            },
        );
        self.persist()
    }

    /// Mark a pinned peer as SAS-verified.
    pub fn mark_verified(&mut self, nickname: &str) -> Result<(), CryptoError> {
        let key = nickname.to_lowercase();
        if let Some(record) = self.records.get_mut(&key) {
            record.verified = true;
        }
        self.persist()
    }

    pub fn get(&self, nickname: &str) -> Option<&PeerRecord> {
        self.records.get(&nickname.to_lowercase())
    }
}

/// Compute the 6-digit Short Authentication String for a pair of public
/// keys. Sorts the two keys byte-lexicographically first so both parties
/// compute the same value regardless of call order: `sas(a,b) == sas(b,a)`.
pub fn sas(my_public: &[u8; 32], peer_public: &[u8; 32]) -> String {
    let (first, second) = if my_public <= peer_public {
        (my_public, peer_public)
    } else {
        (peer_public, my_public)
    };

    let mut hasher = Blake2b256::new();
    hasher.update(first);
    hasher.update(second);
    hasher.update(SAS_DOMAIN);
    let digest = hasher.finalize();

    let n = (u32::from(digest[0]) << 16) | (u32::from(digest[1]) << 8) | u32::from(digest[2]);
    format!("{:06}", n % 1_000_000)
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
