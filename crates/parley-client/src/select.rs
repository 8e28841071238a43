use std::collections::HashSet;

use crate::registry::Bid;

/// Caller-supplied bid selection policy. Receives bids in arrival order and
/// returns the subset to prompt; the engine then drops duplicate expert
/// pubkeys, keeping the first.
pub type BidSelector = Box<dyn Fn(&[Bid]) -> Vec<Bid> + Send + Sync>;

/// Prompt every bidder.
pub fn select_all() -> BidSelector {
    Box::new(|bids| bids.to_vec())
}

/// Prompt the first `n` bidders by arrival order.
pub fn select_first(n: usize) -> BidSelector {
    Box::new(move |bids| bids.iter().take(n).cloned().collect())
}

/// Drop later bids from an expert pubkey already selected. Arrival order is
/// preserved; distinct bid ids from distinct experts are never hidden.
pub fn dedupe_experts(bids: Vec<Bid>) -> Vec<Bid> {
    let mut seen = HashSet::new();
    bids.into_iter()
        .filter(|bid| seen.insert(bid.expert_pubkey))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::types::Pubkey;

    fn bid(id: &str, expert: u8) -> Bid {
        Bid {
            bid_id: id.to_string(),
            payload_id: String::new(),
            expert_pubkey: Pubkey::from_bytes([expert; 32]),
            offer: String::new(),
            prompt_relays: vec![],
            formats: vec![],
            compressions: vec![],
            methods: vec![],
            created_at: 0,
        }
    }

    #[test]
    fn dedupe_keeps_first_bid_per_expert() {
        let bids = vec![bid("a", 1), bid("b", 2), bid("c", 1)];
        let deduped = dedupe_experts(bids);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].bid_id, "a");
        assert_eq!(deduped[1].bid_id, "b");
    }

    #[test]
    fn select_first_respects_arrival_order() {
        let bids = vec![bid("a", 1), bid("b", 2), bid("c", 3)];
        let picked = select_first(2)(&bids);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].bid_id, "a");
    }
}
