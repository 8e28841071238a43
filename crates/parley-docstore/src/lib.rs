//! parley-docstore
//!
//! Local document + embedding storage on SQLite (WAL). Two tables:
//! `docstores` and `docs`; docs carry their embeddings as a fixed-layout
//! binary blob and an internal auto-increment `aid` that orders the
//! tailable subscription cursor. The `aid` never leaves this crate.

pub mod blob;
pub mod store;
pub mod subscription;

pub use blob::{decode_embeddings, encode_embeddings};
pub use store::{DocStore, Docstore, Document};
pub use subscription::{DocSubscription, SubscribeOptions};
