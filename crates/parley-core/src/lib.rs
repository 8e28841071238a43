//! parley-core
//!
//! Shared data model for the Parley protocol: the signed event wire unit,
//! relay filters, the fixed kind numbers, the protocol payload types carried
//! inside event content, and the error taxonomy used across the workspace.

pub mod constants;
pub mod error;
pub mod event;
pub mod filter;
pub mod payload;
pub mod types;

pub use constants::*;
pub use error::ParleyError;
pub use event::{Event, UnsignedEvent};
pub use filter::Filter;
pub use payload::{
    BidPayload, ChunkStatus, ExpertProfile, Invoice, PromptPayload, ProtocolMessage,
    ProofPayload, QuotePayload, ReplyPayload, StreamCompression, StreamEncryption,
    StreamMetadata,
};
pub use types::{EventId, Kind, Pubkey, Signature, Timestamp};
