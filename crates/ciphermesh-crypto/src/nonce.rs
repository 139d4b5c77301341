use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand_core::{OsRng, RngCore};

/// Structured nonce length in bytes: 8 (timestamp) + 4 (counter) + 12 (random).
pub const NONCE_LEN: usize = 24;

/// Maximum acceptable clock drift between nonce timestamp and local time.
pub const MAX_DRIFT_MS: i64 = 30_000;

/// Generates and validates the 24-byte structured nonces used across every
/// encrypt path (ratchet, static box, deniable channel).
///
/// A single `NonceManager` owns one process-wide send counter (wrapping at
/// 2^32) and a per-peer "last accepted counter" map for replay rejection on
/// receive.
pub struct NonceManager {
    send_counter: u32,
    last_accepted: HashMap<String, i64>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self {
            send_counter: 0,
            last_accepted: HashMap::new(),
        }
    }

    /// Produce a fresh nonce: big-endian timestamp, big-endian counter
    /// (post-increment, wrapping), then 12 random bytes.
    pub fn generate(&mut self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        let ts = now_ms();
        nonce[0..8].copy_from_slice(&ts.to_be_bytes());
        nonce[8..12].copy_from_slice(&self.send_counter.to_be_bytes());
        self.send_counter = self.send_counter.wrapping_add(1);
        OsRng.fill_bytes(&mut nonce[12..24]);
        nonce
    }

    /// Validate a received nonce for `peer`: reject malformed length, reject
    /// timestamps drifted more than [`MAX_DRIFT_MS`], reject counters that do
    /// not strictly exceed the last one accepted for this peer. Accepting
    /// updates the per-peer high-water mark.
    pub fn validate(&mut self, peer: &str, nonce: &[u8]) -> bool {
        if nonce.len() != NONCE_LEN {
            tracing::warn!(%peer, len = nonce.len(), "rejected nonce: wrong length");
            return false;
        }
        let ts = i64::from_be_bytes(nonce[0..8].try_into().expect("8 bytes"));
        let counter = i64::from(u32::from_be_bytes(
            nonce[8..12].try_into().expect("4 bytes"),
        ));

        if (now_ms() - ts).abs() > MAX_DRIFT_MS {
            tracing::warn!(%peer, "rejected nonce: timestamp outside drift window");
            return false;
        }

        let last = self.last_accepted.get(peer).copied().unwrap_or(-1);
        if counter <= last {
            tracing::warn!(%peer, counter, last, "rejected nonce: replay or out-of-order counter");
            return false;
        }

        self.last_accepted.insert(peer.to_string(), counter);
        true
    }

    /// Forget a peer's replay-tracking state (e.g. on disconnect).
    pub fn remove_peer(&mut self, peer: &str) {
        self.last_accepted.remove(peer);
    }
}

impl Default for NonceManager {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
