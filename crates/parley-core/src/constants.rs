//! ─── Parley Protocol Constants ──────────────────────────────────────────────
//!
//! Fixed event kind numbers, protocol timeouts and size limits shared by the
//! client and expert engines.

use crate::types::Kind;

// ── Event kinds ──────────────────────────────────────────────────────────────

/// Expert profile, replaceable announcement of an expert identity.
pub const KIND_EXPERT_PROFILE: Kind = 10174;

/// Addressable expert list.
pub const KIND_EXPERT_LIST: Kind = 30174;

/// Public anonymized question summary.
pub const KIND_ASK: Kind = 20174;

/// Bid envelope, encrypted to the ask author.
pub const KIND_BID: Kind = 20175;

/// Inner bid payload, signed by the expert's real key.
pub const KIND_BID_PAYLOAD: Kind = 20176;

/// Encrypted prompt from client to expert.
pub const KIND_PROMPT: Kind = 20177;

/// Encrypted quote (invoices) from expert to client.
pub const KIND_QUOTE: Kind = 20178;

/// Encrypted payment proof (preimage) from client to expert.
pub const KIND_PROOF: Kind = 20179;

/// Encrypted reply from expert to client.
pub const KIND_REPLY: Kind = 20180;

/// Stream chunk, authored by the ephemeral stream key.
pub const KIND_STREAM_CHUNK: Kind = 20173;

/// Stream metadata descriptor.
pub const KIND_STREAM_METADATA: Kind = 173;

/// Request-bound HTTP auth token.
pub const KIND_AUTH_REQUEST: Kind = 27235;

/// Domain-scoped HTTP auth token.
pub const KIND_AUTH_DOMAIN: Kind = 27236;

// ── Protocol timing ──────────────────────────────────────────────────────────

/// How long a client collects bids after publishing an ask.
pub const DEFAULT_DISCOVERY_TIMEOUT_SECS: u64 = 10;

/// How long a client waits for a quote after sending a prompt.
pub const DEFAULT_QUOTE_TIMEOUT_SECS: u64 = 10;

/// How long a client waits for reply progress after sending a proof.
pub const DEFAULT_REPLY_TIMEOUT_SECS: u64 = 60;

/// Bid registry entries expire this long after the bid's `created_at`.
pub const BID_TTL_SECS: i64 = 3600;

/// Auth token `created_at` must be within this many seconds of server time.
pub const AUTH_TIMESTAMP_SKEW_SECS: i64 = 60;

// ── Transport ────────────────────────────────────────────────────────────────

/// Reconnect backoff cap per relay.
pub const RELAY_BACKOFF_CAP_SECS: u64 = 30;

/// Initial reconnect backoff per relay.
pub const RELAY_BACKOFF_INITIAL_SECS: u64 = 1;

/// Publish attempts within a single operation (with jitter between tries).
pub const PUBLISH_RETRY_MAX: u32 = 3;

/// Default wait for per-relay publish acks.
pub const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 10;

// ── Envelope and stream limits ───────────────────────────────────────────────

/// Maximum plaintext accepted by one envelope encryption call.
pub const MAX_ENVELOPE_PLAINTEXT: usize = 64 * 1024 - 1;

/// Plaintext budget per stream chunk when the stream is encrypted, leaving
/// headroom for the envelope framing inside the 64 KiB ciphertext cap.
pub const ENCRYPTED_CHUNK_BUDGET: usize = 48 * 1024;

/// Default rolling-compressor flush threshold.
pub const DEFAULT_MIN_CHUNK_SIZE: usize = 16 * 1024;

/// Default hard cap on a single compressed chunk.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 48 * 1024;

/// Default interval after which buffered stream data is flushed regardless
/// of size.
pub const DEFAULT_MIN_CHUNK_INTERVAL_MS: u64 = 500;

/// Default cap on chunks per stream.
pub const DEFAULT_MAX_CHUNKS: usize = 1000;

/// Default cap on total reassembled stream size.
pub const DEFAULT_MAX_RESULT_SIZE: usize = 16 * 1024 * 1024;

/// Default stream progress TTL; reset on every received chunk.
pub const DEFAULT_STREAM_TTL_SECS: u64 = 60;

// ── Docstore ─────────────────────────────────────────────────────────────────

/// Embedding count per document must stay below this (2-byte LE count field).
pub const MAX_EMBEDDINGS_PER_DOC: usize = 65536;

/// Subscription cursor batch size.
pub const DOC_BATCH_SIZE: usize = 1000;

/// Subscription re-poll interval after a partial batch.
pub const DOC_RETRY_INTERVAL_SECS: u64 = 10;

// ── Scheduler ────────────────────────────────────────────────────────────────

/// Worker heartbeat period.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Missed heartbeats before a peer is considered gone.
pub const MISSED_HEARTBEATS_MAX: u32 = 3;

/// Grace period for a worker to release a cancelled job.
pub const CANCEL_GRACE_SECS: u64 = 5;
