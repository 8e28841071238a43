//! parley-rag
//!
//! Vector collection store for retrieval context: one sled tree per logical
//! collection, entries bincode-encoded, brute-force top-k similarity with
//! metadata filters, plus the bridge that mirrors a docstore into a
//! collection (one entry per embedding vector).

pub mod store;
pub mod sync;

pub use store::{QueryOptions, RagEntry, RagMetadata, RagStore, SearchResult};
pub use sync::{sync, SyncConfig, SyncController};
