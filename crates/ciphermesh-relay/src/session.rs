use std::path::Path;

use ciphermesh_crypto::{Identity, StateVault, TrustStore};
use ciphermesh_wire::HandshakeRegistry;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Persisted shape of a [`Session`], as handed to the [`StateVault`].
/// Ratchets are serialized through `ciphermesh_crypto::RatchetSnapshot` and
/// keyed by peer id alongside each peer's public key, so the registry can be
/// rebuilt without re-running the handshake.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    identity_secret: String,
    local_session_id: Option<String>,
    peers: Vec<PersistedPeer>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedPeer {
    peer_id: String,
    public_key: String,
    ratchet: Option<ciphermesh_crypto::RatchetSnapshot>,
}

/// The explicit owning value named in `SPEC_FULL.md` §9's "Global mutable
/// state" note: identity, handshake registry, trust store, and vault, with
/// an RAII teardown that wipes every secret this process holds.
///
/// Created once at startup (or restored from an encrypted vault), consumed
/// by whatever controller drives the chat UI; neither the controller nor
/// its CLI/UI surface are part of this crate — only the value they'd hold.
pub struct Session {
    pub identity: Identity,
    pub registry: HandshakeRegistry,
    pub trust: TrustStore,
    vault: StateVault,
    pub local_session_id: Option<String>,
}

impl Session {
    /// Start a brand-new session with a fresh identity and empty registry.
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self, RelayError> {
        let data_dir = data_dir.as_ref();
        let trust = TrustStore::load(data_dir.join("trusted-peers.json"))?;
        let vault = StateVault::new(data_dir.join("state").join("session-state.enc.json"));

        Ok(Self {
            identity: Identity::new(),
            registry: HandshakeRegistry::new(),
            trust,
            vault,
            local_session_id: None,
        })
    }

    /// Restore a session from the encrypted vault under `passphrase`, or
    /// start fresh (per §7's persistence-error policy: wrong passphrase and
    /// corrupt/missing envelope are indistinguishable, and all three just
    /// mean "start fresh").
    pub fn load_or_new(data_dir: impl AsRef<Path>, passphrase: &str) -> Result<Self, RelayError> {
        let data_dir = data_dir.as_ref();
        let trust = TrustStore::load(data_dir.join("trusted-peers.json"))?;
        let vault = StateVault::new(data_dir.join("state").join("session-state.enc.json"));

        let Some(persisted): Option<PersistedState> = vault.load(passphrase) else {
            return Ok(Self {
                identity: Identity::new(),
                registry: HandshakeRegistry::new(),
                trust,
                vault,
                local_session_id: None,
            });
        };

        let secret_bytes: [u8; 32] = base64_decode_fixed(&persisted.identity_secret)?;
        let identity = Identity::from_secret_bytes(secret_bytes);

        let mut registry = HandshakeRegistry::new();
        if let Some(id) = &persisted.local_session_id {
            registry.set_local_session_id(id.clone(), &identity);
        }
        for peer in persisted.peers {
            let public_key: [u8; 32] = base64_decode_fixed(&peer.public_key)?;
            registry.register_peer(&identity, &peer.peer_id, public_key);
            if let Some(snapshot) = peer.ratchet {
                if let Some(ratchet) = registry.ratchet_mut(&peer.peer_id) {
                    *ratchet = ciphermesh_crypto::Ratchet::import(&snapshot)?;
                }
            }
        }

        Ok(Self {
            identity,
            registry,
            trust,
            vault,
            local_session_id: persisted.local_session_id,
        })
    }

    /// Seal the current identity secret and a caller-supplied peer list
    /// under `passphrase`, writing the envelope to the vault. Best-effort
    /// per §7: callers at shutdown should treat a failure here as
    /// non-fatal. The caller supplies peer ids because the registry does
    /// not expose iteration over every peer it holds.
    pub fn save_with_peers(&self, passphrase: &str, peer_ids: &[String]) -> Result<(), RelayError> {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;

        let peers = peer_ids
            .iter()
            .filter_map(|peer_id| {
                let public_key = self.registry.current_public_key(peer_id)?;
                let ratchet = self.registry.ratchet(peer_id).map(|r| r.export());
                Some(PersistedPeer {
                    peer_id: peer_id.clone(),
                    public_key: BASE64.encode(public_key),
                    ratchet,
                })
            })
            .collect();

        let persisted = PersistedState {
            identity_secret: BASE64.encode(self.identity.secret().to_bytes()),
            local_session_id: self.local_session_id.clone(),
            peers,
        };

        self.vault.save(&persisted, passphrase)?;
        Ok(())
    }

    pub fn vault_path_exists(&self) -> bool {
        self.vault.exists()
    }

    /// Tear the session down: clear the vault-backing encrypted file is left
    /// untouched (the caller decides whether to persist before dropping),
    /// but every in-memory secret this value owns is wiped by `Drop` on its
    /// fields (`Identity`, `Ratchet`s inside `HandshakeRegistry` all derive
    /// `ZeroizeOnDrop` / wipe-on-drop).
    pub fn teardown(self) {
        drop(self);
    }
}

fn base64_decode_fixed(s: &str) -> Result<[u8; 32], RelayError> {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    let bytes = BASE64
        .decode(s)
        .map_err(|e| RelayError::InvalidKeyMaterial(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| RelayError::InvalidKeyMaterial("expected 32 bytes".into()))
}
