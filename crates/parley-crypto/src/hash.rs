use sha2::{Digest, Sha256};

use parley_core::event::UnsignedEvent;
use parley_core::types::EventId;

/// SHA-256 of arbitrary bytes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// The canonical event id: SHA-256 of the compact-JSON serialized tuple
/// `[0, pubkey, created_at, kind, tags, content]`.
pub fn event_id(unsigned: &UnsignedEvent) -> EventId {
    EventId::from_bytes(sha256(unsigned.canonical_json().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::types::Pubkey;

    #[test]
    fn id_depends_on_every_field() {
        let base = UnsignedEvent {
            pubkey: Pubkey::from_bytes([1; 32]),
            created_at: 1_700_000_000,
            kind: 20174,
            tags: vec![vec!["t".into(), "x".into()]],
            content: "hello".into(),
        };
        let id = event_id(&base);

        let mut changed = base.clone();
        changed.content = "hello!".into();
        assert_ne!(id, event_id(&changed));

        let mut changed = base.clone();
        changed.created_at += 1;
        assert_ne!(id, event_id(&changed));

        let mut changed = base.clone();
        changed.tags.push(vec!["t".into(), "y".into()]);
        assert_ne!(id, event_id(&changed));
    }

    #[test]
    fn sha256_known_vector() {
        // sha256("abc")
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
