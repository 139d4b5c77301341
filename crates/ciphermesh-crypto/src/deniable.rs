use crypto_box::aead::Aead;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::padding::{pad, secure_unpad};

/// A symmetric channel derived from a shared Diffie-Hellman secret.
///
/// Either party can derive the same key from their own secret and the
/// other's public key (`crypto_box_beforenm` in libsodium terms), so a
/// ciphertext produced on this channel carries no evidence of *which* of
/// the two parties produced it — the defining property of plausible
/// deniability. This intentionally has no sender-authentication step; see
/// `DESIGN.md` for the accompanying replay-policy decision.
///
/// `SalsaBox` already models exactly this shape (DH-then-symmetric-box), so
/// it is used directly rather than manually extracting the shared key and
/// feeding it to a separate secretbox call.
#[derive(ZeroizeOnDrop)]
pub struct DeniableChannel {
    #[zeroize(skip)]
    shared: SalsaBox,
}

impl DeniableChannel {
    pub fn derive(my_secret: &[u8; 32], peer_public: &[u8; 32]) -> Self {
        let shared = SalsaBox::new(&PublicKey::from(*peer_public), &SecretKey::from(*my_secret));
        Self { shared }
    }

    pub fn encrypt(&self, plaintext: &[u8], nonce: &[u8; 24]) -> Option<Vec<u8>> {
        let mut padded = pad(plaintext);
        let result = self.shared.encrypt(nonce.into(), padded.as_slice()).ok();
        padded.zeroize();
        result
    }

    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8; 24]) -> Option<Vec<u8>> {
        let mut padded = self.shared.decrypt(nonce.into(), ciphertext).ok()?;
        secure_unpad(&mut padded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};

    fn keypair() -> ([u8; 32], [u8; 32]) {
        let secret = StaticSecret::random_from_rng(rand_core::OsRng);
        let public = XPublicKey::from(&secret);
        (public.to_bytes(), secret.to_bytes())
    }

    #[test]
    fn both_sides_derive_same_channel() {
        let (alice_pub, alice_sec) = keypair();
        let (bob_pub, bob_sec) = keypair();
        let nonce = [5u8; 24];

        let alice_channel = DeniableChannel::derive(&alice_sec, &bob_pub);
        let bob_channel = DeniableChannel::derive(&bob_sec, &alice_pub);

        let ct = alice_channel.encrypt(b"deny everything", &nonce).unwrap();
        let pt = bob_channel.decrypt(&ct, &nonce).unwrap();
        assert_eq!(pt, b"deny everything");
    }

    #[test]
    fn either_party_can_produce_a_valid_ciphertext() {
        // Symmetry: encrypting from Bob's side and decrypting on Alice's
        // side works identically — there is no directional sender key.
        let (alice_pub, alice_sec) = keypair();
        let (bob_pub, bob_sec) = keypair();
        let nonce = [6u8; 24];

        let alice_channel = DeniableChannel::derive(&alice_sec, &bob_pub);
        let bob_channel = DeniableChannel::derive(&bob_sec, &alice_pub);

        let ct = bob_channel.encrypt(b"from bob", &nonce).unwrap();
        let pt = alice_channel.decrypt(&ct, &nonce).unwrap();
        assert_eq!(pt, b"from bob");
    }

    #[test]
    fn wrong_peer_cannot_decrypt() {
        let (alice_pub, alice_sec) = keypair();
        let (bob_pub, _bob_sec) = keypair();
        let (mallory_pub, mallory_sec) = keypair();
        let nonce = [8u8; 24];

        let alice_channel = DeniableChannel::derive(&alice_sec, &bob_pub);
        let mallory_channel = DeniableChannel::derive(&mallory_sec, &alice_pub);

        let ct = alice_channel.encrypt(b"not for mallory", &nonce).unwrap();
        assert!(mallory_channel.decrypt(&ct, &nonce).is_none());
        let _ = mallory_pub;
    }
}
