//! The encrypted envelope carried in event content.
//!
//! Wire layout (then base64): `[version=1][24-byte nonce][ciphertext‖tag]`.
//! Conversation key: HKDF-SHA256 over the x-coordinate of the secp256k1
//! ECDH point, salt `"parley-envelope-v1"`. The AEAD is XChaCha20-Poly1305
//! with AAD = sender_pubkey ‖ recipient_pubkey, so a ciphertext cannot be
//! replayed between conversations or with swapped roles.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use secp256k1::{Parity, PublicKey, XOnlyPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use parley_core::constants::MAX_ENVELOPE_PLAINTEXT;
use parley_core::error::ParleyError;
use parley_core::types::Pubkey;

use crate::keys::Keys;

const VERSION: u8 = 1;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const HKDF_SALT: &[u8] = b"parley-envelope-v1";

/// Derive the symmetric conversation key for (our secret, their x-only pub).
/// ECDH is symmetric in the x-coordinate, so both directions agree.
fn conversation_key(local: &Keys, remote: &Pubkey) -> Result<Zeroizing<[u8; 32]>, ParleyError> {
    let xonly = XOnlyPublicKey::from_slice(remote.as_bytes())
        .map_err(|e| ParleyError::BadKey(format!("remote pubkey: {e}")))?;
    // x-only keys lift to the even-parity point by convention.
    let full = PublicKey::from_x_only_public_key(xonly, Parity::Even);
    let point = secp256k1::ecdh::shared_secret_point(&full, &local.secret_key());
    let shared_x = Zeroizing::new(point[..32].to_vec());

    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), &shared_x);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(b"conversation", &mut okm[..])
        .map_err(|e| ParleyError::Internal(format!("hkdf expand: {e}")))?;
    Ok(okm)
}

fn aad(sender: &Pubkey, recipient: &Pubkey) -> [u8; 64] {
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(sender.as_bytes());
    out[32..].copy_from_slice(recipient.as_bytes());
    out
}

/// Encrypt `plaintext` to `recipient`, authenticated as `sender`.
/// Returns the base64 envelope. Plaintext is capped at 64 KiB − 1; larger
/// payloads go through the stream layer.
pub fn encrypt(
    plaintext: &[u8],
    recipient: &Pubkey,
    sender: &Keys,
) -> Result<String, ParleyError> {
    if plaintext.len() > MAX_ENVELOPE_PLAINTEXT {
        return Err(ParleyError::PlaintextTooLarge { len: plaintext.len() });
    }

    let key = conversation_key(sender, recipient)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let aad = aad(&sender.public(), recipient);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
        .map_err(|_| ParleyError::Internal("aead encryption failed".into()))?;

    let mut wire = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    wire.push(VERSION);
    wire.extend_from_slice(&nonce);
    wire.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(wire))
}

/// Decrypt a base64 envelope produced by `encrypt`. `sender` is the claimed
/// author pubkey; a wrong sender fails the AEAD tag.
pub fn decrypt(
    envelope_b64: &str,
    sender: &Pubkey,
    recipient: &Keys,
) -> Result<Vec<u8>, ParleyError> {
    let wire = BASE64
        .decode(envelope_b64.trim())
        .map_err(|e| ParleyError::DecryptFailed(format!("base64: {e}")))?;

    if wire.len() < 1 + NONCE_LEN + TAG_LEN {
        return Err(ParleyError::DecryptFailed("envelope too short".into()));
    }
    if wire[0] != VERSION {
        return Err(ParleyError::DecryptFailed(format!("unknown envelope version {}", wire[0])));
    }

    let nonce = &wire[1..1 + NONCE_LEN];
    let ciphertext = &wire[1 + NONCE_LEN..];

    let key = conversation_key(recipient, sender)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));

    let aad = aad(sender, &recipient.public());
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad: &aad })
        .map_err(|_| ParleyError::DecryptFailed("aead tag mismatch".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let envelope = encrypt(b"what is the capital of France?", &bob.public(), &alice).unwrap();
        let plain = decrypt(&envelope, &alice.public(), &bob).unwrap();
        assert_eq!(plain, b"what is the capital of France?");
    }

    #[test]
    fn wrong_recipient_cannot_decrypt() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let eve = Keys::generate();

        let envelope = encrypt(b"secret", &bob.public(), &alice).unwrap();
        assert!(decrypt(&envelope, &alice.public(), &eve).is_err());
    }

    #[test]
    fn wrong_claimed_sender_fails_tag() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let mallory = Keys::generate();

        let envelope = encrypt(b"secret", &bob.public(), &alice).unwrap();
        assert!(decrypt(&envelope, &mallory.public(), &bob).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let envelope = encrypt(b"secret", &bob.public(), &alice).unwrap();
        let mut wire = BASE64.decode(&envelope).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        let tampered = BASE64.encode(wire);
        assert!(decrypt(&tampered, &alice.public(), &bob).is_err());
    }

    #[test]
    fn plaintext_cap_enforced() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let big = vec![0u8; MAX_ENVELOPE_PLAINTEXT + 1];
        let err = encrypt(&big, &bob.public(), &alice).unwrap_err();
        assert_eq!(err.code(), "plaintext-too-large");
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let envelope = encrypt(b"", &bob.public(), &alice).unwrap();
        assert_eq!(decrypt(&envelope, &alice.public(), &bob).unwrap(), b"");
    }
}
