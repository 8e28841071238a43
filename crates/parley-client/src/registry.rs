use std::collections::HashMap;
use std::sync::Mutex;

use parley_core::constants::BID_TTL_SECS;
use parley_core::types::{Pubkey, Timestamp};
use parley_crypto::Keys;

/// A decoded bid: the outer envelope id, the expert behind the inner
/// payload, and everything the client needs to prompt.
#[derive(Debug, Clone)]
pub struct Bid {
    /// Outer envelope event id (hex). Keys the registry; the prompt's
    /// `e` tag references it.
    pub bid_id: String,
    /// Inner payload event id (hex).
    pub payload_id: String,
    pub expert_pubkey: Pubkey,
    pub offer: String,
    pub prompt_relays: Vec<String>,
    pub formats: Vec<String>,
    pub compressions: Vec<String>,
    pub methods: Vec<String>,
    pub created_at: Timestamp,
}

struct BidRecord {
    bid: Bid,
    /// Ask session keys; the conversation with this expert continues under
    /// them.
    session: Keys,
}

/// Process-local bid store. Entries expire one hour after the bid's
/// `created_at`; expired entries are pruned lazily whenever one is inserted.
#[derive(Default)]
pub struct BidRegistry {
    entries: Mutex<HashMap<String, BidRecord>>,
}

impl BidRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a bid with its ask session keys, pruning expired entries
    /// first.
    pub fn insert(&self, bid: Bid, session: Keys, now: Timestamp) {
        let mut entries = self.entries.lock().expect("bid registry mutex poisoned");
        entries.retain(|_, record| now - record.bid.created_at < BID_TTL_SECS);
        entries.insert(bid.bid_id.clone(), BidRecord { bid, session });
    }

    /// Look up a live bid and the session keys it was collected under.
    pub fn get(&self, bid_id: &str, now: Timestamp) -> Option<(Bid, Keys)> {
        let entries = self.entries.lock().expect("bid registry mutex poisoned");
        entries.get(bid_id).and_then(|record| {
            if now - record.bid.created_at >= BID_TTL_SECS {
                return None;
            }
            Some((record.bid.clone(), record.session.clone()))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("bid registry mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bid(id: &str, created_at: Timestamp) -> Bid {
        Bid {
            bid_id: id.to_string(),
            payload_id: format!("{id}-inner"),
            expert_pubkey: Pubkey::from_bytes([5; 32]),
            offer: "I can answer".into(),
            prompt_relays: vec!["ws://relay".into()],
            formats: vec!["text".into()],
            compressions: vec!["none".into()],
            methods: vec!["lightning".into()],
            created_at,
        }
    }

    #[test]
    fn insert_then_get() {
        let registry = BidRegistry::new();
        registry.insert(bid("b1", 1000), Keys::generate(), 1000);
        let (got, _) = registry.get("b1", 1001).unwrap();
        assert_eq!(got.offer, "I can answer");
    }

    #[test]
    fn expired_entries_are_invisible_and_pruned() {
        let registry = BidRegistry::new();
        registry.insert(bid("old", 1000), Keys::generate(), 1000);

        // Past the TTL the entry no longer resolves.
        assert!(registry.get("old", 1000 + BID_TTL_SECS).is_none());

        // A later insert prunes it from the map entirely.
        registry.insert(bid("new", 1000 + BID_TTL_SECS), Keys::generate(), 1000 + BID_TTL_SECS);
        assert_eq!(registry.len(), 1);
    }
}
