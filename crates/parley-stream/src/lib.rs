//! parley-stream
//!
//! Stream-over-Events: payloads larger than one envelope travel as a
//! sequence of kind-20173 chunk events authored by an ephemeral stream key.
//! The writer partitions, compresses and (optionally) encrypts; the reader
//! reassembles strictly in order under chunk-count, total-size and
//! progress-ttl bounds.
//!
//! A stream id and its receiver key are single use, scoped to one prompt or
//! reply.

pub mod reader;
pub mod writer;

pub use reader::{ReaderLimits, StreamReader};
pub use writer::{StreamWriter, WriterConfig};
