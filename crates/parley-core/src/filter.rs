use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::types::{EventId, Kind, Pubkey, Timestamp};

/// A relay subscription filter. All populated conditions must hold; the
/// tag conditions (`#e`, `#p`, `#t`) match if the event carries any of the
/// listed values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<EventId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<Pubkey>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<Kind>>,
    #[serde(rename = "#e", skip_serializing_if = "Option::is_none")]
    pub e_tags: Option<Vec<String>>,
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub p_tags: Option<Vec<String>>,
    #[serde(rename = "#t", skip_serializing_if = "Option::is_none")]
    pub t_tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: Vec<EventId>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn authors(mut self, authors: Vec<Pubkey>) -> Self {
        self.authors = Some(authors);
        self
    }

    pub fn kinds(mut self, kinds: Vec<Kind>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn event_ref(mut self, id: &str) -> Self {
        self.e_tags.get_or_insert_with(Vec::new).push(id.to_string());
        self
    }

    pub fn pubkey_ref(mut self, pk: &Pubkey) -> Self {
        self.p_tags.get_or_insert_with(Vec::new).push(pk.to_hex());
        self
    }

    pub fn hashtags(mut self, tags: Vec<String>) -> Self {
        self.t_tags = Some(tags);
        self
    }

    pub fn since(mut self, ts: Timestamp) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Whether `event` satisfies every populated condition.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(values) = &self.e_tags {
            if !event.tag_values("e").iter().any(|v| values.iter().any(|w| w == v)) {
                return false;
            }
        }
        if let Some(values) = &self.p_tags {
            if !event.tag_values("p").iter().any(|v| values.iter().any(|w| w == v)) {
                return false;
            }
        }
        if let Some(values) = &self.t_tags {
            if !event.tag_values("t").iter().any(|v| values.iter().any(|w| w == v)) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Signature;

    fn event_with(kind: Kind, tags: Vec<Vec<String>>) -> Event {
        Event {
            id: EventId::from_bytes([9; 32]),
            pubkey: Pubkey::from_bytes([8; 32]),
            created_at: 100,
            kind,
            tags,
            content: String::new(),
            sig: Signature::from_bytes([0; 64]),
        }
    }

    #[test]
    fn hashtag_filter_matches_any_listed_value() {
        let ev = event_with(20174, vec![vec!["t".into(), "geography".into()]]);
        let f = Filter::new().kinds(vec![20174]).hashtags(vec!["history".into(), "geography".into()]);
        assert!(f.matches(&ev));

        let f = Filter::new().hashtags(vec!["math".into()]);
        assert!(!f.matches(&ev));
    }

    #[test]
    fn since_until_bounds() {
        let ev = event_with(1, vec![]);
        assert!(Filter::new().since(100).matches(&ev));
        assert!(!Filter::new().since(101).matches(&ev));
        let mut f = Filter::new();
        f.until = Some(99);
        assert!(!f.matches(&ev));
    }

    #[test]
    fn tag_filters_serialize_with_hash_names() {
        let f = Filter::new().event_ref("abcd");
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("\"#e\""));
    }
}
