use secp256k1::schnorr::Signature as SchnorrSignature;
use secp256k1::{Keypair, Message, SecretKey, XOnlyPublicKey};
use zeroize::Zeroizing;

use parley_core::error::ParleyError;
use parley_core::event::{Event, UnsignedEvent};
use parley_core::types::{Pubkey, Signature};

use crate::hash::event_id;
use crate::SECP;

/// A Parley identity: secp256k1 secret key plus the derived x-only pubkey.
pub struct Keys {
    keypair: Keypair,
    public: Pubkey,
}

impl Keys {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secret = SecretKey::new(&mut rand::thread_rng());
        Self::from_secret_key(secret)
    }

    /// Restore from a 64-char hex secret (e.g. loaded from the keyfile or a
    /// scheduler dispatch).
    pub fn from_secret_hex(s: &str) -> Result<Self, ParleyError> {
        let bytes = Zeroizing::new(
            hex::decode(s.trim()).map_err(|e| ParleyError::BadKey(e.to_string()))?,
        );
        let secret =
            SecretKey::from_slice(&bytes).map_err(|e| ParleyError::BadKey(e.to_string()))?;
        Ok(Self::from_secret_key(secret))
    }

    pub fn from_secret_key(secret: SecretKey) -> Self {
        let keypair = Keypair::from_secret_key(&SECP, &secret);
        let (xonly, _parity) = XOnlyPublicKey::from_keypair(&keypair);
        Self { keypair, public: Pubkey::from_bytes(xonly.serialize()) }
    }

    pub fn public(&self) -> Pubkey {
        self.public
    }

    /// Hex-encoded secret. Only for wire fields that carry key material
    /// (stream receiver keys, scheduler dispatches); do not log.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }

    pub(crate) fn secret_key(&self) -> SecretKey {
        SecretKey::from_keypair(&self.keypair)
    }

    pub(crate) fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keys {{ public: {} }}", self.public)
    }
}

impl Clone for Keys {
    fn clone(&self) -> Self {
        Self { keypair: self.keypair, public: self.public }
    }
}

/// Fill in `pubkey`, compute the canonical id, and sign it.
pub fn sign_event(keys: &Keys, mut unsigned: UnsignedEvent) -> Event {
    unsigned.pubkey = keys.public();
    let id = event_id(&unsigned);
    let msg = Message::from_digest(id.0);
    let sig = SECP.sign_schnorr(&msg, keys.keypair());
    Event {
        id,
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig: Signature::from_bytes(sig.serialize()),
    }
}

/// Recompute the canonical id and check the Schnorr signature. Any mismatch
/// is fatal for the event.
pub fn verify_event(event: &Event) -> Result<(), ParleyError> {
    let unsigned = UnsignedEvent {
        pubkey: event.pubkey,
        created_at: event.created_at,
        kind: event.kind,
        tags: event.tags.clone(),
        content: event.content.clone(),
    };
    let expected = event_id(&unsigned);
    if expected != event.id {
        return Err(ParleyError::VerifyFailed("id does not match canonical hash".into()));
    }

    let xonly = XOnlyPublicKey::from_slice(event.pubkey.as_bytes())
        .map_err(|e| ParleyError::VerifyFailed(format!("bad pubkey: {e}")))?;
    let sig = SchnorrSignature::from_slice(event.sig.as_bytes())
        .map_err(|e| ParleyError::VerifyFailed(format!("bad signature encoding: {e}")))?;
    let msg = Message::from_digest(event.id.0);
    SECP.verify_schnorr(&sig, &msg, &xonly)
        .map_err(|e| ParleyError::VerifyFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::constants::KIND_ASK;

    #[test]
    fn sign_then_verify() {
        let keys = Keys::generate();
        let unsigned = UnsignedEvent::new(
            keys.public(),
            KIND_ASK,
            vec![vec!["t".into(), "geography".into()]],
            "capital of france?".into(),
        );
        let event = sign_event(&keys, unsigned);
        assert_eq!(event.pubkey, keys.public());
        verify_event(&event).unwrap();
    }

    #[test]
    fn tampered_content_fails_verification() {
        let keys = Keys::generate();
        let mut event = sign_event(
            &keys,
            UnsignedEvent::new(keys.public(), KIND_ASK, vec![], "original".into()),
        );
        event.content = "tampered".into();
        assert!(verify_event(&event).is_err());
    }

    #[test]
    fn foreign_signature_fails_verification() {
        let keys = Keys::generate();
        let other = Keys::generate();
        let mut event = sign_event(
            &keys,
            UnsignedEvent::new(keys.public(), KIND_ASK, vec![], "hello".into()),
        );
        // Graft the other identity's pubkey; the id no longer matches.
        event.pubkey = other.public();
        assert!(verify_event(&event).is_err());
    }

    #[test]
    fn secret_hex_round_trip() {
        let keys = Keys::generate();
        let restored = Keys::from_secret_hex(&keys.secret_hex()).unwrap();
        assert_eq!(keys.public(), restored.public());
    }
}
