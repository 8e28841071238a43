//! parley-client
//!
//! The client half of the protocol engine: publishes anonymized asks under
//! fresh session keys, collects and decrypts bids, prompts selected experts,
//! approves quotes, pays, proves payment, and consumes (possibly streamed)
//! replies. Sub-sessions for independently selected experts run in parallel
//! and fail independently.

pub mod engine;
pub mod registry;
pub mod select;

pub use engine::{
    AskClient, AskExpertOptions, AskParams, ClientConfig, ExpertReply, ExpertResult,
    QuoteDecision, SessionOutcome,
};
pub use registry::{Bid, BidRegistry};
pub use select::{select_all, select_first, BidSelector};
