use std::collections::HashMap;
use std::time::{Duration, Instant};

use ciphermesh_crypto::{Identity, Ratchet};

/// Grace window a peer's previous public key remains valid after an
/// in-channel key rotation, mirroring [`ciphermesh_crypto::identity::ROTATION_GRACE`].
pub const PEER_KEY_GRACE: Duration = Duration::from_secs(30);

struct PendingPeer {
    public_key: [u8; 32],
}

/// Per-peer public key + previous-key grace + ratchet lookup.
///
/// Holds every live session's ratchet, keyed by peer id (a relay session
/// UUID or a P2P nickname). A ratchet can only be created once this
/// process's own session identifier is known (needed to decide, per peer,
/// which side is the tie-broken initiator) — [`HandshakeRegistry::register_peer`]
/// defers ratchet creation for peers registered before that, and
/// [`HandshakeRegistry::set_local_session_id`] catches them up.
pub struct HandshakeRegistry {
    local_session_id: Option<String>,
    current_public: HashMap<String, [u8; 32]>,
    previous_public: HashMap<String, ([u8; 32], Instant)>,
    ratchets: HashMap<String, Ratchet>,
    pending: HashMap<String, PendingPeer>,
}

impl HandshakeRegistry {
    pub fn new() -> Self {
        Self {
            local_session_id: None,
            current_public: HashMap::new(),
            previous_public: HashMap::new(),
            ratchets: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Register (or re-register) a peer's current public key. If this
    /// process's local session id is already known, a ratchet is created
    /// immediately; otherwise the peer is parked in `pending` until
    /// [`set_local_session_id`] is called.
    pub fn register_peer(&mut self, identity: &Identity, peer: &str, public_key: [u8; 32]) {
        self.current_public.insert(peer.to_string(), public_key);

        match &self.local_session_id {
            Some(my_id) => {
                let ratchet = Ratchet::initiate(my_id, peer, identity.secret(), &public_key);
                self.ratchets.insert(peer.to_string(), ratchet);
            }
            None => {
                self.pending
                    .insert(peer.to_string(), PendingPeer { public_key });
            }
        }
    }

    /// Lazily initialize ratchets for any peer registered before the local
    /// session id was known.
    pub fn set_local_session_id(&mut self, id: impl Into<String>, identity: &Identity) {
        let id = id.into();
        self.local_session_id = Some(id.clone());

        for (peer, pending) in self.pending.drain() {
            let ratchet = Ratchet::initiate(&id, &peer, identity.secret(), &pending.public_key);
            self.ratchets.insert(peer, ratchet);
        }
    }

    /// Authenticated or user-driven key rotation: move the old public key
    /// into the grace slot (clearing whatever was there) and start its 30s
    /// wipe timer. Does not touch the ratchet — the ratchet's own DH
    /// ratchet step handles the cryptographic side of a key change on the
    /// next message that carries a new ephemeral.
    pub fn update_peer_key(&mut self, peer: &str, new_public_key: [u8; 32]) {
        if let Some(old) = self.current_public.insert(peer.to_string(), new_public_key) {
            tracing::debug!(%peer, "peer public key rotated, previous key parked in grace window");
            self.previous_public
                .insert(peer.to_string(), (old, Instant::now()));
        }
    }

    /// The peer's current public key, if registered.
    pub fn current_public_key(&self, peer: &str) -> Option<[u8; 32]> {
        self.current_public.get(peer).copied()
    }

    /// The peer's previous public key, if still within its grace window.
    pub fn previous_public_key(&self, peer: &str) -> Option<[u8; 32]> {
        match self.previous_public.get(peer) {
            Some((key, rotated_at)) if rotated_at.elapsed() < PEER_KEY_GRACE => Some(*key),
            _ => None,
        }
    }

    /// Drop any peer-previous-key entries whose grace window has elapsed.
    pub fn sweep_expired(&mut self) {
        self.previous_public
            .retain(|_, (_, rotated_at)| rotated_at.elapsed() < PEER_KEY_GRACE);
    }

    pub fn ratchet(&self, peer: &str) -> Option<&Ratchet> {
        self.ratchets.get(peer)
    }

    pub fn ratchet_mut(&mut self, peer: &str) -> Option<&mut Ratchet> {
        self.ratchets.get_mut(peer)
    }

    /// Transfer an existing ratchet (and its key bookkeeping) from
    /// `old_peer_id` to `new_peer_id` — used when a relay assigns a new
    /// session UUID to a reconnecting nickname.
    pub fn migrate_ratchet(&mut self, old_peer_id: &str, new_peer_id: &str) {
        if let Some(ratchet) = self.ratchets.remove(old_peer_id) {
            self.ratchets.insert(new_peer_id.to_string(), ratchet);
        }
        if let Some(public_key) = self.current_public.remove(old_peer_id) {
            self.current_public.insert(new_peer_id.to_string(), public_key);
        }
        if let Some(prev) = self.previous_public.remove(old_peer_id) {
            self.previous_public.insert(new_peer_id.to_string(), prev);
        }
    }

    /// Destroy every secret associated with a peer (ratchet dropped wipes
    /// its own keys via `Drop`).
    pub fn remove_peer(&mut self, peer: &str) {
        self.ratchets.remove(peer);
        self.current_public.remove(peer);
        self.previous_public.remove(peer);
        self.pending.remove(peer);
    }
}

impl Default for HandshakeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x25519_dalek::{PublicKey, StaticSecret};

    fn keypair() -> (Identity, [u8; 32]) {
        let identity = Identity::new();
        let public = identity.public();
        (identity, public)
    }

    #[test]
    fn pending_peer_gets_ratchet_once_local_id_known() {
        let mut registry = HandshakeRegistry::new();
        let (me, _) = keypair();
        let (_peer_identity, peer_pub) = keypair();

        registry.register_peer(&me, "bob", peer_pub);
        assert!(registry.ratchet("bob").is_none());

        registry.set_local_session_id("alice", &me);
        assert!(registry.ratchet("bob").is_some());
    }

    #[test]
    fn ratchet_created_immediately_when_id_already_known() {
        let mut registry = HandshakeRegistry::new();
        let (me, _) = keypair();
        registry.set_local_session_id("alice", &me);

        let (_peer_identity, peer_pub) = keypair();
        registry.register_peer(&me, "bob", peer_pub);
        assert!(registry.ratchet("bob").is_some());
    }

    #[test]
    fn update_peer_key_parks_previous_with_grace() {
        let mut registry = HandshakeRegistry::new();
        let (me, _) = keypair();
        registry.set_local_session_id("alice", &me);

        let secret = StaticSecret::random_from_rng(rand_core::OsRng);
        let pub1 = PublicKey::from(&secret).to_bytes();
        registry.register_peer(&me, "bob", pub1);

        let secret2 = StaticSecret::random_from_rng(rand_core::OsRng);
        let pub2 = PublicKey::from(&secret2).to_bytes();
        registry.update_peer_key("bob", pub2);

        assert_eq!(registry.current_public_key("bob"), Some(pub2));
        assert_eq!(registry.previous_public_key("bob"), Some(pub1));
    }

    #[test]
    fn migrate_ratchet_transfers_ownership() {
        let mut registry = HandshakeRegistry::new();
        let (me, _) = keypair();
        registry.set_local_session_id("alice", &me);

        let (_peer_identity, peer_pub) = keypair();
        registry.register_peer(&me, "old-session-id", peer_pub);
        assert!(registry.ratchet("old-session-id").is_some());

        registry.migrate_ratchet("old-session-id", "new-session-id");
        assert!(registry.ratchet("old-session-id").is_none());
        assert!(registry.ratchet("new-session-id").is_some());
    }

    #[test]
    fn remove_peer_clears_everything() {
        let mut registry = HandshakeRegistry::new();
        let (me, _) = keypair();
        registry.set_local_session_id("alice", &me);

        let (_peer_identity, peer_pub) = keypair();
        registry.register_peer(&me, "bob", peer_pub);
        registry.remove_peer("bob");

        assert!(registry.ratchet("bob").is_none());
        assert!(registry.current_public_key("bob").is_none());
    }
}
