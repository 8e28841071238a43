use serde::{Deserialize, Serialize};

use crate::types::{now_unix, EventId, Kind, Pubkey, Signature, Timestamp};

/// The universal wire unit: a signed, content-addressed event.
///
/// `id` is the SHA-256 of the canonical serialization and `sig` a BIP-340
/// Schnorr signature over it (both computed in parley-crypto). Anything that
/// fails re-verification is dropped at the transport edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: Pubkey,
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: Signature,
}

impl Event {
    /// Canonical serialization used for the id hash:
    /// `[0, pubkey, created_at, kind, tags, content]` as compact JSON.
    pub fn canonical_json(&self) -> String {
        canonical_json(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }

    /// First value of the first tag named `name`, e.g. `tag_value("e")`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// All first values of tags named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &str) -> Vec<&'a str> {
        self.tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1))
            .map(String::as_str)
            .collect()
    }

    /// Whether a tag named `name` is present at all (with or without a value).
    pub fn has_tag(&self, name: &str) -> bool {
        self.tags
            .iter()
            .any(|t| t.first().map(String::as_str) == Some(name))
    }

    /// Hashtag values (`["t", tag]`).
    pub fn hashtags(&self) -> Vec<&str> {
        self.tag_values("t")
    }
}

/// An event before id computation and signing.
#[derive(Debug, Clone)]
pub struct UnsignedEvent {
    pub pubkey: Pubkey,
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    /// New unsigned event stamped with the current time.
    pub fn new(pubkey: Pubkey, kind: Kind, tags: Vec<Vec<String>>, content: String) -> Self {
        Self { pubkey, created_at: now_unix(), kind, tags, content }
    }

    /// Add a tag, builder style.
    pub fn tag(mut self, values: &[&str]) -> Self {
        self.tags.push(values.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Canonical serialization used for the id hash.
    pub fn canonical_json(&self) -> String {
        canonical_json(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }
}

fn canonical_json(
    pubkey: &Pubkey,
    created_at: Timestamp,
    kind: Kind,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    // Tuple serialization yields the compact array form with fields in the
    // fixed order the id hash is defined over.
    serde_json::to_string(&(0u8, pubkey, created_at, kind, tags, content))
        .expect("canonical event serialization is infallible")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            id: EventId::from_bytes([1; 32]),
            pubkey: Pubkey::from_bytes([2; 32]),
            created_at: 1_700_000_000,
            kind: 20174,
            tags: vec![
                vec!["t".into(), "geography".into()],
                vec!["t".into(), "test".into()],
                vec!["format".into(), "text".into()],
            ],
            content: "capital of france?".into(),
            sig: Signature::from_bytes([3; 64]),
        }
    }

    #[test]
    fn canonical_json_is_compact_and_ordered() {
        let ev = sample_event();
        let json = ev.canonical_json();
        let prefix = format!("[0,\"{}\",1700000000,20174,", "02".repeat(32));
        assert!(json.starts_with(&prefix));
        // No whitespace outside string values.
        let structural = &json[..json.find("capital").expect("content present")];
        assert!(!structural.contains(' '));
    }

    #[test]
    fn tag_helpers() {
        let ev = sample_event();
        assert_eq!(ev.tag_value("format"), Some("text"));
        assert_eq!(ev.hashtags(), vec!["geography", "test"]);
        assert!(!ev.has_tag("done"));
    }

    #[test]
    fn wire_serde_round_trip() {
        let ev = sample_event();
        let json = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(ev, back);
    }
}
