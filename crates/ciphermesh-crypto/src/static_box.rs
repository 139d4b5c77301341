use crypto_box::aead::Aead;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::padding::pad;

/// Authenticated public-key encryption for the "offline fallback" path:
/// `crypto_box` (X25519 + XSalsa20-Poly1305) over a padded plaintext.
///
/// Used when no live ratchet session exists yet, or as the fallback target
/// while a ratchet key-rotation grace window is still open.
pub fn encrypt(
    plaintext: &[u8],
    nonce: &[u8; 24],
    recipient_pub: &[u8; 32],
    sender_sec: &[u8; 32],
) -> Result<Vec<u8>, CryptoError> {
    let boxed = SalsaBox::new(&PublicKey::from(*recipient_pub), &SecretKey::from(*sender_sec));
    let mut padded = pad(plaintext);
    let result = boxed
        .encrypt(nonce.into(), padded.as_slice())
        .map_err(|e| CryptoError::EncryptionError(e.to_string()));
    padded.zeroize();
    result
}

/// Open a `crypto_box` ciphertext produced by [`encrypt`]. Returns `None`
/// on any MAC failure without indicating which stage failed.
pub fn decrypt(
    ciphertext: &[u8],
    nonce: &[u8; 24],
    sender_pub: &[u8; 32],
    recipient_sec: &[u8; 32],
) -> Option<Vec<u8>> {
    let boxed = SalsaBox::new(&PublicKey::from(*sender_pub), &SecretKey::from(*recipient_sec));
    let mut padded = boxed.decrypt(nonce.into(), ciphertext).ok()?;
    let out = crate::padding::secure_unpad(&mut padded);
    out
}

/// Try every combination of current/previous sender and recipient keys, in
/// the order `(cur,cur) → (prev,cur) → (cur,prev) → (prev,prev)`, returning
/// the first that opens successfully. This is what lets a message survive
/// an identity rotation on either side during the grace window.
#[allow(clippy::too_many_arguments)]
pub fn decrypt_with_fallback(
    ciphertext: &[u8],
    nonce: &[u8; 24],
    cur_sender_pub: &[u8; 32],
    cur_recv_sec: &[u8; 32],
    prev_sender_pub: Option<&[u8; 32]>,
    prev_recv_sec: Option<&[u8; 32]>,
) -> Option<Vec<u8>> {
    let attempts: [(Option<&[u8; 32]>, Option<&[u8; 32]>); 4] = [
        (Some(cur_sender_pub), Some(cur_recv_sec)),
        (prev_sender_pub, Some(cur_recv_sec)),
        (Some(cur_sender_pub), prev_recv_sec),
        (prev_sender_pub, prev_recv_sec),
    ];

    for (sender_pub, recv_sec) in attempts {
        if let (Some(sender_pub), Some(recv_sec)) = (sender_pub, recv_sec) {
            if let Some(plaintext) = decrypt(ciphertext, nonce, sender_pub, recv_sec) {
                return Some(plaintext);
            }
        }
    }
    None
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
    fn roundtrip() {
        let (alice_pub, alice_sec) = keypair();
        let (bob_pub, bob_sec) = keypair();
        let nonce = [7u8; 24];

        let ct = encrypt(b"hello bob", &nonce, &bob_pub, &alice_sec).unwrap();
        let pt = decrypt(&ct, &nonce, &alice_pub, &bob_sec).unwrap();
        assert_eq!(pt, b"hello bob");
    }

    #[test]
    fn wrong_key_fails() {
        let (_, alice_sec) = keypair();
        let (bob_pub, _) = keypair();
        let (mallory_pub, _) = keypair();
        let nonce = [1u8; 24];

        let ct = encrypt(b"secret", &nonce, &bob_pub, &alice_sec).unwrap();
        let (_, bob_sec) = keypair();
        assert!(decrypt(&ct, &nonce, &mallory_pub, &bob_sec).is_none());
    }

    #[test]
    fn fallback_tries_all_four_combinations() {
        let (alice_pub, alice_sec) = keypair();
        let (bob_pub, bob_sec) = keypair();
        let (alice_prev_pub, alice_prev_sec) = keypair();
        let nonce = [3u8; 24];

        // Sender used their *previous* key; receiver is still on current.
        let ct = encrypt(b"rotated", &nonce, &bob_pub, &alice_prev_sec).unwrap();
        let pt = decrypt_with_fallback(
            &ct,
            &nonce,
            &alice_pub,
            &bob_sec,
            Some(&alice_prev_pub),
            None,
        );
        assert_eq!(pt, Some(b"rotated".to_vec()));
    }

    #[test]
    fn bit_flip_fails() {
        let (alice_pub, alice_sec) = keypair();
        let (bob_pub, bob_sec) = keypair();
        let nonce = [9u8; 24];

        let mut ct = encrypt(b"tamper me", &nonce, &bob_pub, &alice_sec).unwrap();
        ct[0] ^= 0xFF;
        assert!(decrypt(&ct, &nonce, &alice_pub, &bob_sec).is_none());
    }
}
