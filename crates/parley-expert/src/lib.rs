//! parley-expert
//!
//! The expert half of the protocol engine: announces a profile, bids on
//! matching asks, quotes prompts (pricing plus optional RAG context),
//! verifies payment proofs, and streams replies. The answer generator, the
//! embedding model and the wallet are injected behind traits.

pub mod context;
pub mod server;
pub mod testing;
pub mod traits;

pub use context::RagContext;
pub use server::{ExpertConfig, ExpertServer};
pub use traits::{Embedder, MarginPricing, Pricing, ReplyEngine};
