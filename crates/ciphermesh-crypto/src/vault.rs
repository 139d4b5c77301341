use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key as SecretboxKey, XSalsa20Poly1305};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Argon2id parameters for KEK derivation. `RFC 9106`'s "interactive" profile
/// (libsodium's `OPSLIMIT_INTERACTIVE`/`MEMLIMIT_INTERACTIVE`): 64 MiB memory,
/// 2 passes, single lane. Debug builds use a far cheaper profile — full
/// interactive-strength Argon2id makes every vault test take seconds.
#[cfg(not(debug_assertions))]
fn argon2_params() -> argon2::Params {
    argon2::Params::new(65536, 2, 1, Some(32)).expect("valid argon2 params")
}
#[cfg(debug_assertions)]
fn argon2_params() -> argon2::Params {
    argon2::Params::new(256, 1, 1, Some(32)).expect("valid argon2 params")
}

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;

/// An envelope as persisted under `.ciphermesh/state/session-state.enc.json`:
/// a random salt, a random nonce, and the `secretbox` ciphertext, all
/// base64-encoded so the whole thing round-trips through plain JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// Derive a key-encryption key from a passphrase via Argon2id. If `salt` is
/// `None`, a fresh random 16-byte salt is generated (e.g. for a first save);
/// pass the stored salt back in to re-derive the same KEK for a load.
pub fn derive_kek(passphrase: &str, salt: Option<[u8; SALT_LEN]>) -> ([u8; 32], [u8; SALT_LEN]) {
    let salt = salt.unwrap_or_else(|| {
        let mut s = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut s);
        s
    });

    use argon2::Argon2;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, argon2_params());
    let mut kek = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), &salt, &mut kek)
        .expect("argon2 hash with fixed-size output cannot fail");
    (kek, salt)
}

/// Encrypted persistence for session state: identity secret, handshake
/// registry, and local session id, sealed under a passphrase-derived KEK.
pub struct StateVault {
    path: PathBuf,
}

impl StateVault {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Serialize `data` to JSON, seal it under a passphrase-derived KEK, and
    /// write the envelope to disk.
    pub fn save<T: Serialize>(&self, data: &T, passphrase: &str) -> Result<(), CryptoError> {
        let (kek, salt) = derive_kek(passphrase, None);
        let kek = Zeroizing::new(kek);

        let plaintext = serde_json::to_vec(data)
            .map_err(|e| CryptoError::Serialization(e.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = XSalsa20Poly1305::new(SecretboxKey::from_slice(kek.as_ref()));
        let ciphertext = cipher
            .encrypt(nonce.as_slice().into(), plaintext.as_slice())
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        let envelope = Envelope {
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CryptoError::StorageError(e.to_string()))?;
        }
        let raw = serde_json::to_string_pretty(&envelope)
            .map_err(|e| CryptoError::Serialization(e.to_string()))?;
        std::fs::write(&self.path, raw).map_err(|e| CryptoError::StorageError(e.to_string()))
    }

    /// Load and open the envelope under `passphrase`. Returns `None` — not
    /// an error — for a missing file, a wrong passphrase, or a corrupt
    /// envelope: all three are indistinguishable to the caller, which starts
    /// fresh in every case.
    pub fn load<T: for<'de> Deserialize<'de>>(&self, passphrase: &str) -> Option<T> {
        let result = self.try_load(passphrase);
        if result.is_none() {
            tracing::warn!(path = %self.path.display(), "vault load failed: missing file, wrong passphrase, or corrupt envelope");
        }
        result
    }

    fn try_load<T: for<'de> Deserialize<'de>>(&self, passphrase: &str) -> Option<T> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let envelope: Envelope = serde_json::from_str(&raw).ok()?;

        let salt: [u8; SALT_LEN] = BASE64.decode(&envelope.salt).ok()?.try_into().ok()?;
        let nonce: [u8; NONCE_LEN] = BASE64.decode(&envelope.nonce).ok()?.try_into().ok()?;
        let ciphertext = BASE64.decode(&envelope.ciphertext).ok()?;

        let (kek, _) = derive_kek(passphrase, Some(salt));
        let kek = Zeroizing::new(kek);

        let cipher = XSalsa20Poly1305::new(SecretboxKey::from_slice(kek.as_ref()));
        let plaintext = cipher.decrypt(nonce.as_slice().into(), ciphertext.as_slice()).ok()?;

        serde_json::from_slice(&plaintext).ok()
    }

    /// Overwrite the envelope file with zeros, then unlink it. Best-effort:
    /// a missing file is not an error.
    pub fn clear(&self) -> Result<(), CryptoError> {
        if let Ok(metadata) = std::fs::metadata(&self.path) {
            let zeros = vec![0u8; metadata.len() as usize];
            let _ = std::fs::write(&self.path, zeros);
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CryptoError::StorageError(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Fixture {
        session_id: String,
        counter: u32,
    }

    fn vault_path(dir: &TempDir) -> PathBuf {
        dir.path().join("state").join("session-state.enc.json")
    }

    #[test]
    fn roundtrip_with_correct_passphrase() {
        let dir = TempDir::new().unwrap();
        let vault = StateVault::new(vault_path(&dir));
        let data = Fixture {
            session_id: "abc-123".into(),
            counter: 7,
        };

        vault.save(&data, "hunter2").unwrap();
        let loaded: Option<Fixture> = vault.load("hunter2");
        assert_eq!(loaded, Some(data));
    }

    #[test]
    fn wrong_passphrase_returns_none() {
        let dir = TempDir::new().unwrap();
        let vault = StateVault::new(vault_path(&dir));
        let data = Fixture {
            session_id: "abc-123".into(),
            counter: 7,
        };

        vault.save(&data, "hunter2").unwrap();
        let loaded: Option<Fixture> = vault.load("hunter3");
        assert_eq!(loaded, None);
    }

    #[test]
    fn has_state_true_regardless_of_passphrase_correctness() {
        let dir = TempDir::new().unwrap();
        let vault = StateVault::new(vault_path(&dir));
        let data = Fixture {
            session_id: "abc-123".into(),
            counter: 7,
        };
        vault.save(&data, "hunter2").unwrap();

        assert!(vault.exists());
        let _: Option<Fixture> = vault.load("hunter2");
        assert!(vault.exists());
        let _: Option<Fixture> = vault.load("hunter3");
        assert!(vault.exists());
    }

    #[test]
    fn missing_file_returns_none() {
        let dir = TempDir::new().unwrap();
        let vault = StateVault::new(vault_path(&dir));
        let loaded: Option<Fixture> = vault.load("hunter2");
        assert_eq!(loaded, None);
    }

    #[test]
    fn corrupt_envelope_returns_none() {
        let dir = TempDir::new().unwrap();
        let path = vault_path(&dir);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();
        let vault = StateVault::new(path);
        let loaded: Option<Fixture> = vault.load("hunter2");
        assert_eq!(loaded, None);
    }

    #[test]
    fn clear_removes_file() {
        let dir = TempDir::new().unwrap();
        let vault = StateVault::new(vault_path(&dir));
        vault.save(&Fixture { session_id: "x".into(), counter: 1 }, "pw").unwrap();
        assert!(vault.exists());
        vault.clear().unwrap();
        assert!(!vault.exists());
    }

    #[test]
    fn clear_on_missing_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let vault = StateVault::new(vault_path(&dir));
        vault.clear().unwrap();
    }
}
