use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use blake2::digest::consts::{U32, U64};
use blake2::digest::{Digest, KeyInit as Blake2KeyInit, Mac};
use blake2::{Blake2b, Blake2bMac};
use crypto_secretbox::aead::{Aead, KeyInit as SecretboxKeyInit};
use crypto_secretbox::{Key as SecretboxKey, XSalsa20Poly1305};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;
use crate::padding::{pad, secure_unpad};

type Blake2b256 = Blake2b<U32>;
type KeyedBlake2b256 = Blake2bMac<U32>;
type KeyedBlake2b512 = Blake2bMac<U64>;

/// Bound on how many message keys a single decrypt may derive to catch up
/// to an out-of-order counter. Beyond this the message is rejected, but the
/// channel itself is not torn down.
pub const MAX_SKIP: u32 = 100;

/// Skipped message keys older than this are wiped on the next decrypt.
pub const SKIPPED_KEY_TTL_MS: u64 = 60_000;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// `KDF_RK`: derive a new root key and a chain key from the current root key
/// and a fresh DH output, via keyed BLAKE2b-512.
fn kdf_rk(root_key: &[u8; 32], dh_out: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mut mac =
        KeyedBlake2b512::new_from_slice(root_key).expect("32-byte key is always valid");
    Mac::update(&mut mac, dh_out);
    let buf = mac.finalize().into_bytes();
    let mut new_root = [0u8; 32];
    let mut chain = [0u8; 32];
    new_root.copy_from_slice(&buf[0..32]);
    chain.copy_from_slice(&buf[32..64]);
    (new_root, chain)
}

/// `KDF_CK`: derive the current message key and the next chain key from a
/// chain key, via keyed BLAKE2b-256 with domain-separating bytes `0x01`/`0x02`.
fn kdf_ck(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mut mac_msg =
        KeyedBlake2b256::new_from_slice(chain_key).expect("32-byte key is always valid");
    Mac::update(&mut mac_msg, &[0x01]);
    let message_key_buf = mac_msg.finalize().into_bytes();

    let mut mac_chain =
        KeyedBlake2b256::new_from_slice(chain_key).expect("32-byte key is always valid");
    Mac::update(&mut mac_chain, &[0x02]);
    let next_chain_buf = mac_chain.finalize().into_bytes();

    let mut message_key = [0u8; 32];
    let mut next_chain_key = [0u8; 32];
    message_key.copy_from_slice(&message_key_buf);
    next_chain_key.copy_from_slice(&next_chain_buf);
    (message_key, next_chain_key)
}

fn secretbox_seal(key: &[u8; 32], nonce: &[u8; 24], plaintext: &[u8]) -> Vec<u8> {
    let cipher = XSalsa20Poly1305::new(SecretboxKey::from_slice(key));
    cipher
        .encrypt(nonce.into(), plaintext)
        .expect("encryption with a fixed-size key cannot fail")
}

fn secretbox_open(key: &[u8; 32], nonce: &[u8; 24], ciphertext: &[u8]) -> Option<Vec<u8>> {
    let cipher = XSalsa20Poly1305::new(SecretboxKey::from_slice(key));
    cipher.decrypt(nonce.into(), ciphertext).ok()
}

fn random_nonce() -> [u8; 24] {
    let mut nonce = [0u8; 24];
    rand_core::RngCore::fill_bytes(&mut OsRng, &mut nonce);
    nonce
}

/// What a successful `encrypt` emits onto the wire.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; 24],
    pub ephemeral_public: [u8; 32],
    pub counter: u32,
    pub previous_counter: u32,
}

struct SkippedEntry {
    message_key: [u8; 32],
    inserted_at_ms: u64,
}

/// Per-peer Double Ratchet session: a Diffie-Hellman "outer" ratchet over a
/// symmetric "inner" chain, giving per-message forward secrecy and
/// post-compromise security. See `SPEC_FULL.md` §4.5 for the exact algorithm
/// this implements; see `DESIGN.md` for how it's grounded in the corpus.
pub struct Ratchet {
    root_key: [u8; 32],
    send_chain_key: Option<[u8; 32]>,
    recv_chain_key: Option<[u8; 32]>,
    send_counter: u32,
    recv_counter: u32,
    previous_send_count: u32,
    my_eph_secret: Option<StaticSecret>,
    my_eph_public: Option<[u8; 32]>,
    peer_eph_public: Option<[u8; 32]>,
    initialized: bool,
    need_send_ratchet: bool,
    skipped_keys: HashMap<([u8; 32], u32), SkippedEntry>,
}

impl Drop for Ratchet {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.root_key.zeroize();
        if let Some(k) = &mut self.send_chain_key {
            k.zeroize();
        }
        if let Some(k) = &mut self.recv_chain_key {
            k.zeroize();
        }
        for entry in self.skipped_keys.values_mut() {
            entry.message_key.zeroize();
        }
    }
}

impl Ratchet {
    /// Initialize a session between `my_id`/`peer_id` (byte-lexicographically
    /// compared session identifiers — UUID in relay mode, nickname in P2P)
    /// given the two parties' long-term X25519 static keys.
    pub fn initiate(
        my_id: &str,
        peer_id: &str,
        my_static_sec: &StaticSecret,
        peer_static_pub: &[u8; 32],
    ) -> Self {
        let dh0 = my_static_sec
            .diffie_hellman(&PublicKey::from(*peer_static_pub))
            .to_bytes();
        let root_key_bytes: [u8; 32] = Blake2b256::digest(dh0).into();

        let is_initiator = my_id < peer_id;

        let (my_eph_secret, my_eph_public, peer_eph_public) = if is_initiator {
            let eph_secret = StaticSecret::random_from_rng(OsRng);
            let eph_public = PublicKey::from(&eph_secret).to_bytes();
            (Some(eph_secret), Some(eph_public), Some(*peer_static_pub))
        } else {
            // Responder keeps a copy of its static secret as a bootstrap
            // placeholder for `my_eph` until it ratchets on first send.
            (Some(my_static_sec.clone()), None, None)
        };

        Self {
            root_key: root_key_bytes,
            send_chain_key: None,
            recv_chain_key: None,
            send_counter: 0,
            recv_counter: 0,
            previous_send_count: 0,
            my_eph_secret,
            my_eph_public,
            peer_eph_public,
            initialized: true,
            need_send_ratchet: true,
            skipped_keys: HashMap::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Encrypt `plaintext`, performing a DH ratchet step first if one is due.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<SendResult, CryptoError> {
        if self.need_send_ratchet {
            let peer_eph_public = self
                .peer_eph_public
                .ok_or_else(|| CryptoError::SessionError("no peer ephemeral yet".into()))?;

            self.previous_send_count = self.send_counter;
            self.send_counter = 0;

            // Drop the old ephemeral secret (zeroized by x25519-dalek's own
            // Drop impl) and generate a fresh one.
            let new_secret = StaticSecret::random_from_rng(OsRng);
            let new_public = PublicKey::from(&new_secret).to_bytes();
            self.my_eph_secret = Some(new_secret);
            self.my_eph_public = Some(new_public);

            let dh = self
                .my_eph_secret
                .as_ref()
                .expect("just set")
                .diffie_hellman(&PublicKey::from(peer_eph_public))
                .to_bytes();
            let (new_root, chain) = kdf_rk(&self.root_key, &dh);
            self.root_key = new_root;
            self.send_chain_key = Some(chain);
            self.need_send_ratchet = false;
        }

        let chain_key = self
            .send_chain_key
            .ok_or_else(|| CryptoError::SessionError("no send chain established".into()))?;
        let (mut message_key, next_chain_key) = kdf_ck(&chain_key);
        self.send_chain_key = Some(next_chain_key);

        let mut padded = pad(plaintext);
        let nonce = random_nonce();
        let ciphertext = secretbox_seal(&message_key, &nonce, &padded);

        use zeroize::Zeroize;
        padded.zeroize();
        message_key.zeroize();

        let result = SendResult {
            ciphertext,
            nonce,
            ephemeral_public: self.my_eph_public.expect("set above"),
            counter: self.send_counter,
            previous_counter: self.previous_send_count,
        };
        self.send_counter = self.send_counter.wrapping_add(1);
        Ok(result)
    }

    /// Decrypt a received message, handling skipped keys, DH ratchet steps,
    /// and in-chain catch-up as described in `SPEC_FULL.md` §4.5.
    pub fn decrypt(
        &mut self,
        ciphertext: &[u8],
        nonce: &[u8; 24],
        eph_pub: &[u8; 32],
        counter: u32,
        previous_counter: u32,
    ) -> Result<Option<Vec<u8>>, CryptoError> {
        // 1. Skipped-key fast path.
        if let Some(mut entry) = self.skipped_keys.remove(&(*eph_pub, counter)) {
            let opened = secretbox_open(&entry.message_key, nonce, ciphertext);
            use zeroize::Zeroize;
            entry.message_key.zeroize();
            self.sweep_skipped();
            return Ok(opened.and_then(|mut p| secure_unpad(&mut p)));
        }

        // 2. DH ratchet step, if the peer presented a new ephemeral.
        if self.peer_eph_public != Some(*eph_pub) {
            if let Some(old_chain) = self.recv_chain_key {
                let old_eph = self.peer_eph_public;
                self.skip_in_chain(old_chain, previous_counter, old_eph.unwrap())?;
            }
            self.peer_eph_public = Some(*eph_pub);
            let my_secret = self
                .my_eph_secret
                .as_ref()
                .ok_or_else(|| CryptoError::SessionError("no local ephemeral secret".into()))?;
            let dh = my_secret.diffie_hellman(&PublicKey::from(*eph_pub)).to_bytes();
            let (new_root, chain) = kdf_rk(&self.root_key, &dh);
            self.root_key = new_root;
            self.recv_chain_key = Some(chain);
            self.recv_counter = 0;
            self.need_send_ratchet = true;
            tracing::debug!("DH ratchet step: peer advanced to a new ephemeral key");
        }

        // 3. In-chain skip up to `counter`.
        if counter > self.recv_counter {
            let gap = counter - self.recv_counter;
            if gap > MAX_SKIP {
                return Err(CryptoError::TooManySkipped {
                    max: MAX_SKIP,
                    requested: gap,
                });
            }
            let mut chain = self
                .recv_chain_key
                .ok_or_else(|| CryptoError::SessionError("no recv chain established".into()))?;
            while self.recv_counter < counter {
                let (message_key, next_chain) = kdf_ck(&chain);
                self.skipped_keys.insert(
                    (*eph_pub, self.recv_counter),
                    SkippedEntry {
                        message_key,
                        inserted_at_ms: now_ms(),
                    },
                );
                chain = next_chain;
                self.recv_counter += 1;
            }
            self.recv_chain_key = Some(chain);
        }

        // 4. Derive the current message key.
        let chain = self
            .recv_chain_key
            .ok_or_else(|| CryptoError::SessionError("no recv chain established".into()))?;
        let (mut message_key, next_chain) = kdf_ck(&chain);
        self.recv_chain_key = Some(next_chain);
        self.recv_counter += 1;

        // 5. Open and unpad.
        let opened = secretbox_open(&message_key, nonce, ciphertext);
        use zeroize::Zeroize;
        message_key.zeroize();

        self.sweep_skipped();

        Ok(opened.and_then(|mut p| secure_unpad(&mut p)))
    }

    fn skip_in_chain(
        &mut self,
        mut chain: [u8; 32],
        until: u32,
        eph_pub: [u8; 32],
    ) -> Result<(), CryptoError> {
        let gap = until.saturating_sub(self.recv_counter);
        if gap > MAX_SKIP {
            return Err(CryptoError::TooManySkipped {
                max: MAX_SKIP,
                requested: gap,
            });
        }
        while self.recv_counter < until {
            let (message_key, next_chain) = kdf_ck(&chain);
            self.skipped_keys.insert(
                (eph_pub, self.recv_counter),
                SkippedEntry {
                    message_key,
                    inserted_at_ms: now_ms(),
                },
            );
            chain = next_chain;
            self.recv_counter += 1;
        }
        Ok(())
    }

    fn sweep_skipped(&mut self) {
        let now = now_ms();
        let expired: Vec<_> = self
            .skipped_keys
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.inserted_at_ms) > SKIPPED_KEY_TTL_MS)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            if let Some(mut entry) = self.skipped_keys.remove(&key) {
                use zeroize::Zeroize;
                entry.message_key.zeroize();
            }
        }
    }

    #[cfg(test)]
    fn send_counter(&self) -> u32 {
        self.send_counter
    }

    #[cfg(test)]
    fn recv_counter(&self) -> u32 {
        self.recv_counter
    }

    /// Export the session to a base64-JSON snapshot, suitable for the State
    /// Vault. Every secret field travels base64-encoded.
    pub fn export(&self) -> RatchetSnapshot {
        RatchetSnapshot {
            root_key: BASE64.encode(self.root_key),
            send_chain_key: self.send_chain_key.map(|k| BASE64.encode(k)),
            recv_chain_key: self.recv_chain_key.map(|k| BASE64.encode(k)),
            send_counter: self.send_counter,
            recv_counter: self.recv_counter,
            previous_send_count: self.previous_send_count,
            my_eph_secret: self
                .my_eph_secret
                .as_ref()
                .map(|s| BASE64.encode(s.to_bytes())),
            my_eph_public: self.my_eph_public.map(|p| BASE64.encode(p)),
            peer_eph_public: self.peer_eph_public.map(|p| BASE64.encode(p)),
            initialized: self.initialized,
            need_send_ratchet: self.need_send_ratchet,
            skipped_keys: self
                .skipped_keys
                .iter()
                .map(|((eph, counter), entry)| SkippedKeySnapshot {
                    ephemeral_public: BASE64.encode(eph),
                    counter: *counter,
                    message_key: BASE64.encode(entry.message_key),
                    inserted_at_ms: entry.inserted_at_ms,
                })
                .collect(),
        }
    }

    /// Restore a session previously produced by [`Ratchet::export`].
    pub fn import(snapshot: &RatchetSnapshot) -> Result<Self, CryptoError> {
        let decode = |s: &str| -> Result<[u8; 32], CryptoError> {
            let bytes = BASE64
                .decode(s)
                .map_err(|e| CryptoError::Serialization(e.to_string()))?;
            bytes
                .try_into()
                .map_err(|_| CryptoError::Serialization("expected 32 bytes".into()))
        };
        let decode_opt = |s: &Option<String>| -> Result<Option<[u8; 32]>, CryptoError> {
            s.as_deref().map(decode).transpose()
        };

        let root_key = decode(&snapshot.root_key)?;
        let send_chain_key = decode_opt(&snapshot.send_chain_key)?;
        let recv_chain_key = decode_opt(&snapshot.recv_chain_key)?;
        let my_eph_secret = snapshot
            .my_eph_secret
            .as_deref()
            .map(decode)
            .transpose()?
            .map(StaticSecret::from);
        let my_eph_public = decode_opt(&snapshot.my_eph_public)?;
        let peer_eph_public = decode_opt(&snapshot.peer_eph_public)?;

        let mut skipped_keys = HashMap::new();
        for entry in &snapshot.skipped_keys {
            let eph = decode(&entry.ephemeral_public)?;
            let message_key = decode(&entry.message_key)?;
            skipped_keys.insert(
                (eph, entry.counter),
                SkippedEntry {
                    message_key,
                    inserted_at_ms: entry.inserted_at_ms,
                },
            );
        }

        Ok(Self {
            root_key,
            send_chain_key,
            recv_chain_key,
            send_counter: snapshot.send_counter,
            recv_counter: snapshot.recv_counter,
            previous_send_count: snapshot.previous_send_count,
            my_eph_secret,
            my_eph_public,
            peer_eph_public,
            initialized: snapshot.initialized,
            need_send_ratchet: snapshot.need_send_ratchet,
            skipped_keys,
        })
    }
}

/// Serializable form of a [`Ratchet`]. Every secret field is base64-encoded
/// text so the whole snapshot round-trips through JSON (and, in turn,
/// through the State Vault's encrypted envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetSnapshot {
    pub root_key: String,
    pub send_chain_key: Option<String>,
    pub recv_chain_key: Option<String>,
    pub send_counter: u32,
    pub recv_counter: u32,
    pub previous_send_count: u32,
    pub my_eph_secret: Option<String>,
    pub my_eph_public: Option<String>,
    pub peer_eph_public: Option<String>,
    pub initialized: bool,
    pub need_send_ratchet: bool,
    pub skipped_keys: Vec<SkippedKeySnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedKeySnapshot {
    pub ephemeral_public: String,
    pub counter: u32,
    pub message_key: String,
    pub inserted_at_ms: u64,
}
