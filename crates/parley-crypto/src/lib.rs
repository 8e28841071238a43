//! parley-crypto
//!
//! Cryptographic primitives for the Parley protocol: BIP-340 Schnorr keys
//! and event signing, the canonical SHA-256 event id, the encrypted
//! envelope (static-ephemeral ECDH → HKDF-SHA256 → XChaCha20-Poly1305),
//! and the gzip payload codecs.

pub mod compress;
pub mod envelope;
pub mod hash;
pub mod keys;

pub use compress::{compress, decompress, Codec};
pub use envelope::{decrypt, encrypt};
pub use hash::{event_id, sha256};
pub use keys::{sign_event, verify_event, Keys};

use once_cell::sync::Lazy;
use secp256k1::{All, Secp256k1};

/// Shared verification/signing context. Construction is expensive; reuse.
pub(crate) static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);
