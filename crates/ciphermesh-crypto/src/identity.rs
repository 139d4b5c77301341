use std::time::{Duration, Instant};

use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// Grace window during which a rotated-out identity secret remains usable
/// to decrypt messages that were in flight when rotation happened.
pub const ROTATION_GRACE: Duration = Duration::from_secs(30);

/// A generation of identity key material: a secret plus its derived public.
#[derive(ZeroizeOnDrop)]
struct Generation {
    #[zeroize(skip)]
    secret: StaticSecret,
    #[zeroize(skip)]
    public: PublicKey,
}

impl Generation {
    fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }
}

/// The long-term X25519 identity keypair for this node, with rotation support.
///
/// There is no username/password layer at this component's boundary — identity
/// *is* the keypair. The secret never leaves this type except through
/// [`Identity::secret`], which callers use only to seed a DH; it is wiped on
/// drop and on every rotate/destroy path.
pub struct Identity {
    current: Generation,
    previous: Option<(Generation, Instant)>,
}

impl Identity {
    /// Generate a fresh identity with no previous generation.
    pub fn new() -> Self {
        Self {
            current: Generation::generate(),
            previous: None,
        }
    }

    /// Restore an identity from a 32-byte secret (e.g. loaded from the vault).
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self {
            current: Generation { secret, public },
            previous: None,
        }
    }

    /// Current public key, 32 bytes.
    pub fn public(&self) -> [u8; 32] {
        self.current.public.to_bytes()
    }

    /// Current secret key, for deriving a DH shared secret.
    pub fn secret(&self) -> &StaticSecret {
        &self.current.secret
    }

    /// The previous generation's public key, if still within its grace window.
    pub fn previous_public(&self) -> Option<[u8; 32]> {
        self.live_previous().map(|g| g.public.to_bytes())
    }

    /// The previous generation's secret, if still within its grace window.
    pub fn previous_secret(&self) -> Option<&StaticSecret> {
        self.live_previous().map(|g| &g.secret)
    }

    fn live_previous(&self) -> Option<&Generation> {
        match &self.previous {
            Some((gen, rotated_at)) if rotated_at.elapsed() < ROTATION_GRACE => Some(gen),
            _ => None,
        }
    }

    /// Drop an expired previous generation, if its grace window has elapsed.
    ///
    /// Called opportunistically; `previous_public`/`previous_secret` already
    /// treat an expired generation as absent, so this just reclaims the
    /// zeroized memory promptly instead of waiting for the next rotation.
    pub fn sweep_expired(&mut self) {
        if let Some((_, rotated_at)) = &self.previous {
            if rotated_at.elapsed() >= ROTATION_GRACE {
                self.previous = None;
            }
        }
    }

    /// Rotate to a fresh keypair. The outgoing generation becomes the
    /// previous one (wiping whatever previous generation existed before),
    /// valid for [`ROTATION_GRACE`] before it is wiped for good.
    pub fn rotate(&mut self) -> Result<(), CryptoError> {
        let fresh = Generation::generate();
        let outgoing = std::mem::replace(&mut self.current, fresh);
        self.previous = Some((outgoing, Instant::now()));
        Ok(())
    }

    /// Immediately wipe the previous generation, without waiting for the
    /// grace window to elapse. Used when a second rotation happens before
    /// the first's grace window ran out.
    pub fn destroy_previous(&mut self) {
        self.previous = None;
    }

    /// Deterministic fingerprint: uppercase hex of the first 8 bytes of
    /// SHA-256(public key), grouped into four `XXXX:`-separated quartets.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.public())
    }

    /// Wipe every generation of key material held by this identity,
    /// current and previous alike. Consumes `self` so the caller cannot
    /// keep using the identity afterward; the actual wipe happens via
    /// `Generation`'s `ZeroizeOnDrop` as the value is dropped.
    pub fn destroy(self) {
        drop(self);
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Compute the fingerprint of a standalone public key (e.g. a peer's).
pub fn fingerprint_of(public: &[u8; 32]) -> String {
    let digest = Sha256::digest(public);
    let bytes = &digest[..8];
    let hex = hex::encode_upper(bytes);
    hex.as_bytes()
        .chunks(4)
        .map(|c| std::str::from_utf8(c).expect("hex is ascii"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let identity = Identity::new();
        assert_eq!(identity.fingerprint(), identity.fingerprint());
        assert_eq!(
            fingerprint_of(&identity.public()),
            fingerprint_of(&identity.public())
        );
    }

    #[test]
    fn fingerprint_format() {
        let identity = Identity::new();
        let fp = identity.fingerprint();
        let groups: Vec<&str> = fp.split(':').collect();
        assert_eq!(groups.len(), 4);
        for g in groups {
            assert_eq!(g.len(), 4);
            assert!(g.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn rotate_preserves_previous_during_grace() {
        let mut identity = Identity::new();
        let old_public = identity.public();
        identity.rotate().unwrap();
        assert_ne!(identity.public(), old_public);
        assert_eq!(identity.previous_public(), Some(old_public));
    }

    #[test]
    fn second_rotation_replaces_previous() {
        let mut identity = Identity::new();
        let gen0 = identity.public();
        identity.rotate().unwrap();
        let gen1 = identity.public();
        identity.rotate().unwrap();
        assert_eq!(identity.previous_public(), Some(gen1));
        assert_ne!(identity.previous_public(), Some(gen0));
    }

    #[test]
    fn destroy_previous_clears_grace_key() {
        let mut identity = Identity::new();
        identity.rotate().unwrap();
        assert!(identity.previous_public().is_some());
        identity.destroy_previous();
        assert!(identity.previous_public().is_none());
    }

    #[test]
    fn roundtrip_secret_bytes() {
        let identity = Identity::new();
        let bytes = identity.secret().to_bytes();
        let restored = Identity::from_secret_bytes(bytes);
        assert_eq!(identity.public(), restored.public());
    }

    #[test]
    fn destroy_consumes_the_identity() {
        let identity = Identity::new();
        identity.destroy();
        // `identity` is moved; nothing left to assert beyond compiling.
    }

    #[test]
    fn dh_symmetry() {
        let alice = Identity::new();
        let bob = Identity::new();
        let shared_a = alice.secret().diffie_hellman(&PublicKey::from(bob.public()));
        let shared_b = bob.secret().diffie_hellman(&PublicKey::from(alice.public()));
        assert_eq!(shared_a.as_bytes(), shared_b.as_bytes());
    }
}
