//! Typed payloads carried inside event content, one struct per kind, plus a
//! kind-keyed decoder. Unknown kinds land in a catch-all variant and are
//! ignored by the engines.

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::ParleyError;
use crate::event::Event;
use crate::types::Pubkey;

// ── Expert profile (10174) ───────────────────────────────────────────────────

/// Public announcement of an expert identity: what it answers and where to
/// send prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertProfile {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub hashtags: Vec<String>,
    #[serde(default)]
    pub prompt_relays: Vec<String>,
}

// ── Bid payload (20176 content) ──────────────────────────────────────────────

/// Inner bid content, signed by the expert's real key and shipped encrypted
/// inside the 20175 envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidPayload {
    /// Human-readable offer text shown to the asker.
    pub offer: String,
    /// Relays the expert listens on for prompts.
    pub prompt_relays: Vec<String>,
    /// Accepted prompt formats (e.g. "text", "openai").
    pub formats: Vec<String>,
    /// Accepted compression codecs.
    pub compressions: Vec<String>,
    /// Accepted payment methods (e.g. "lightning").
    pub methods: Vec<String>,
}

// ── Prompt (20177 content plaintext) ─────────────────────────────────────────

/// Decrypted prompt body. Small prompts inline their content; large ones
/// carry stream metadata instead, and the stream bytes are the JSON of an
/// inline `PromptPayload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptPayload {
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamMetadata>,
}

// ── Quote (20178 content plaintext) ──────────────────────────────────────────

/// One payable invoice inside a quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    /// Payment method, e.g. "lightning".
    pub method: String,
    /// Amount unit, e.g. "sat".
    pub unit: String,
    pub amount: u64,
    /// The payable string (BOLT11 for lightning).
    pub invoice: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotePayload {
    #[serde(default)]
    pub invoices: Vec<Invoice>,
    /// Decline signal, e.g. "no_knowledge". Not an error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Proof (20179 content plaintext) ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofPayload {
    pub method: String,
    /// Hex-encoded invoice preimage.
    pub preimage: String,
}

// ── Reply (20180 content plaintext) ──────────────────────────────────────────

/// Decrypted reply body. Streamed replies carry the metadata here and the
/// answer text in the stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyPayload {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamMetadata>,
}

// ── Stream metadata (173 content) ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEncryption {
    None,
    Nip44,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamCompression {
    None,
    Gzip,
}

/// Describes a chunked stream: who authors the chunks, how to decode them,
/// and where to listen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Ephemeral x-only public key that signs the chunks. Single use.
    pub stream_id: Pubkey,
    pub encryption: StreamEncryption,
    pub compression: StreamCompression,
    #[serde(default)]
    pub binary: bool,
    pub relays: Vec<String>,
    /// Counterparty key the chunks are encrypted to, when encrypted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_pubkey: Option<Pubkey>,
    /// Ephemeral receiver secret handed to the reader, hex. Single use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_privkey: Option<String>,
}

// ── Stream chunk status ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Active,
    Done,
    Error,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Active => "active",
            ChunkStatus::Done => "done",
            ChunkStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ChunkStatus::Active),
            "done" => Some(ChunkStatus::Done),
            "error" => Some(ChunkStatus::Error),
            _ => None,
        }
    }
}

// ── Kind-keyed decoding ──────────────────────────────────────────────────────

/// An event decoded by kind into its typed payload. Encrypted kinds carry
/// their ciphertext untouched; decryption happens in the engines where the
/// keys live.
#[derive(Debug, Clone)]
pub enum ProtocolMessage {
    ExpertProfile(ExpertProfile),
    Ask { summary: String, hashtags: Vec<String> },
    /// Encrypted envelope addressed to the ask author.
    BidEnvelope { ask_id: String },
    /// Encrypted prompt addressed to an expert.
    Prompt { bid_id: String },
    /// Encrypted quote referencing a prompt.
    Quote { prompt_id: String },
    /// Encrypted proof referencing a prompt.
    Proof { prompt_id: String },
    /// Encrypted reply referencing a prompt; `done` from the tag.
    Reply { prompt_id: String, done: bool },
    StreamMetadata(StreamMetadata),
    StreamChunk { seq: u64, status: ChunkStatus },
    /// Any kind the engines do not understand.
    Unknown { kind: u32 },
}

impl ProtocolMessage {
    /// Decode the kind-dependent shape of `event`. Content decryption is the
    /// caller's concern; this only inspects kind, tags, and plaintext kinds.
    pub fn decode(event: &Event) -> Result<Self, ParleyError> {
        let e_tag = || {
            event
                .tag_value("e")
                .map(str::to_string)
                .ok_or_else(|| ParleyError::Parse(format!("kind {} missing e tag", event.kind)))
        };

        match event.kind {
            KIND_EXPERT_PROFILE => {
                let profile: ExpertProfile = serde_json::from_str(&event.content)
                    .map_err(|e| ParleyError::Parse(format!("expert profile: {e}")))?;
                Ok(ProtocolMessage::ExpertProfile(profile))
            }
            KIND_ASK => Ok(ProtocolMessage::Ask {
                summary: event.content.clone(),
                hashtags: event.hashtags().iter().map(|s| s.to_string()).collect(),
            }),
            KIND_BID => Ok(ProtocolMessage::BidEnvelope { ask_id: e_tag()? }),
            KIND_PROMPT => Ok(ProtocolMessage::Prompt { bid_id: e_tag()? }),
            KIND_QUOTE => Ok(ProtocolMessage::Quote { prompt_id: e_tag()? }),
            KIND_PROOF => Ok(ProtocolMessage::Proof { prompt_id: e_tag()? }),
            KIND_REPLY => Ok(ProtocolMessage::Reply {
                prompt_id: e_tag()?,
                done: event.has_tag("done"),
            }),
            KIND_STREAM_METADATA => {
                let meta: StreamMetadata = serde_json::from_str(&event.content)
                    .map_err(|e| ParleyError::Parse(format!("stream metadata: {e}")))?;
                Ok(ProtocolMessage::StreamMetadata(meta))
            }
            KIND_STREAM_CHUNK => {
                let seq = event
                    .tag_value("i")
                    .and_then(|v| v.parse::<u64>().ok())
                    .ok_or_else(|| ParleyError::StreamParse("chunk missing i tag".into()))?;
                let status = event
                    .tag_value("status")
                    .and_then(ChunkStatus::parse)
                    .ok_or_else(|| ParleyError::StreamParse("chunk missing status tag".into()))?;
                Ok(ProtocolMessage::StreamChunk { seq, status })
            }
            other => Ok(ProtocolMessage::Unknown { kind: other }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventId, Signature};

    fn event(kind: u32, tags: Vec<Vec<String>>, content: &str) -> Event {
        Event {
            id: EventId::from_bytes([1; 32]),
            pubkey: Pubkey::from_bytes([2; 32]),
            created_at: 0,
            kind,
            tags,
            content: content.into(),
            sig: Signature::from_bytes([0; 64]),
        }
    }

    #[test]
    fn decode_ask_collects_hashtags() {
        let ev = event(
            KIND_ASK,
            vec![vec!["t".into(), "geography".into()], vec!["t".into(), "test".into()]],
            "capital of france?",
        );
        match ProtocolMessage::decode(&ev).unwrap() {
            ProtocolMessage::Ask { summary, hashtags } => {
                assert_eq!(summary, "capital of france?");
                assert_eq!(hashtags, vec!["geography", "test"]);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn decode_reply_reads_done_tag() {
        let ev = event(
            KIND_REPLY,
            vec![vec!["e".into(), "aa".into()], vec!["done".into()]],
            "",
        );
        match ProtocolMessage::decode(&ev).unwrap() {
            ProtocolMessage::Reply { done, .. } => assert!(done),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn decode_chunk_requires_index_and_status() {
        let ev = event(
            KIND_STREAM_CHUNK,
            vec![vec!["i".into(), "3".into()], vec!["status".into(), "active".into()]],
            "",
        );
        match ProtocolMessage::decode(&ev).unwrap() {
            ProtocolMessage::StreamChunk { seq, status } => {
                assert_eq!(seq, 3);
                assert_eq!(status, ChunkStatus::Active);
            }
            other => panic!("unexpected decode: {other:?}"),
        }

        let bad = event(KIND_STREAM_CHUNK, vec![vec!["i".into(), "3".into()]], "");
        assert!(ProtocolMessage::decode(&bad).is_err());
    }

    #[test]
    fn unknown_kind_is_tolerated() {
        let ev = event(4242, vec![], "whatever");
        assert!(matches!(
            ProtocolMessage::decode(&ev).unwrap(),
            ProtocolMessage::Unknown { kind: 4242 }
        ));
    }

    #[test]
    fn quote_payload_defaults() {
        let q: QuotePayload = serde_json::from_str(r#"{"invoices":[]}"#).unwrap();
        assert!(q.invoices.is_empty());
        assert!(q.reason.is_none());

        let q: QuotePayload = serde_json::from_str(r#"{"reason":"no_knowledge"}"#).unwrap();
        assert_eq!(q.reason.as_deref(), Some("no_knowledge"));
    }
}
