//! parley-payments
//!
//! Lightning payment plumbing: BOLT11 parsing, capped payment through the
//! injected wallet, and preimage↔payment-hash verification. Wallet access
//! is serialized per wallet instance.

pub mod client;
pub mod invoice;
pub mod testing;
pub mod wallet;

pub use client::PaymentClient;
pub use invoice::{parse_invoice, verify_proof, ParsedInvoice};
pub use wallet::Wallet;
