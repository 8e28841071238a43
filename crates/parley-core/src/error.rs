use thiserror::Error;

/// The workspace-wide error taxonomy.
///
/// Every variant belongs to one of the stable kinds (`auth`, `protocol`,
/// `crypto`, `transport`, `stream`, `payment`, `storage`, `fatal`) and maps
/// to a short kebab-case code; both are stable strings callers may match on
/// and the HTTP boundary maps to status codes.
#[derive(Debug, Error)]
pub enum ParleyError {
    // ── Auth errors ──────────────────────────────────────────────────────────
    #[error("authorization token missing")]
    TokenMissing,

    #[error("authorization token expired")]
    TokenExpired,

    #[error("token domain does not cover {0}")]
    DomainMismatch(String),

    #[error("token url does not match request url {0}")]
    UrlMismatch(String),

    #[error("token method does not match request method {0}")]
    MethodMismatch(String),

    #[error("token payload hash does not match request body")]
    PayloadHashMismatch,

    #[error("token timestamp outside the accepted window")]
    TokenTimestampSkew,

    #[error("token signature invalid")]
    TokenSignatureInvalid,

    #[error("permission denied")]
    PermissionDenied,

    // ── Protocol errors ──────────────────────────────────────────────────────
    #[error("unexpected event kind {kind} in state {state}")]
    UnexpectedKind { kind: u32, state: &'static str },

    #[error("referenced id unknown: {0}")]
    UnknownReference(String),

    #[error("capability mismatch: {0}")]
    CapabilityMismatch(String),

    #[error("no bids received before the discovery deadline")]
    NoBids,

    #[error("no quote received before the quote deadline")]
    NoQuote,

    #[error("expert {0} already selected in this session")]
    DuplicateExpert(String),

    #[error("malformed payload: {0}")]
    Parse(String),

    // ── Crypto errors ────────────────────────────────────────────────────────
    #[error("decryption failed: {0}")]
    DecryptFailed(String),

    #[error("event verification failed: {0}")]
    VerifyFailed(String),

    #[error("plaintext too large for one envelope: {len} bytes")]
    PlaintextTooLarge { len: usize },

    #[error("bad key material: {0}")]
    BadKey(String),

    // ── Transport errors ─────────────────────────────────────────────────────
    #[error("no relay accepted the event")]
    PublishNoRelay,

    #[error("subscription timed out")]
    SubscribeTimeout,

    #[error("relay disconnected: {0}")]
    Disconnected(String),

    #[error("relay connection failed: {0}")]
    Connect(String),

    // ── Stream errors ────────────────────────────────────────────────────────
    #[error("stream exceeded max chunk count {max}")]
    MaxChunksExceeded { max: usize },

    #[error("stream exceeded max result size {max}")]
    MaxSizeExceeded { max: usize },

    #[error("stream made no progress within the ttl")]
    TtlExceeded,

    #[error("compressed chunk exceeded size cap {max}")]
    CompressionSizeExceeded { max: usize },

    #[error("stream chunk malformed: {0}")]
    StreamParse(String),

    #[error("stream terminated by sender: [{code}] {message}")]
    StreamRemote { code: String, message: String },

    // ── Payment errors ───────────────────────────────────────────────────────
    #[error("quoted amount {amount} sats exceeds cap {cap}")]
    AmountOverCap { amount: u64, cap: u64 },

    #[error("payment failed: {0}")]
    PayFailed(String),

    #[error("payment proof invalid")]
    ProofInvalid,

    #[error("preimage does not match the invoice payment hash")]
    PreimageMismatch,

    #[error("invoice unparseable: {0}")]
    InvoiceParse(String),

    // ── Storage errors ───────────────────────────────────────────────────────
    #[error("embedding length {got} does not match docstore vector size {expected}")]
    VectorSizeMismatch { expected: usize, got: usize },

    #[error("too many embeddings: {got} (max 65535)")]
    TooManyEmbeddings { got: usize },

    #[error("uniqueness violation: {0}")]
    UniquenessViolation(String),

    #[error("embedding blob corrupt: {0} bytes")]
    BlobCorrupt(usize),

    #[error("storage error: {0}")]
    Storage(String),

    // ── Fatal ────────────────────────────────────────────────────────────────
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal invariant broken: {0}")]
    Internal(String),
}

impl ParleyError {
    /// The stable error kind this variant belongs to.
    pub fn kind(&self) -> &'static str {
        use ParleyError::*;
        match self {
            TokenMissing | TokenExpired | DomainMismatch(_) | UrlMismatch(_)
            | MethodMismatch(_) | PayloadHashMismatch | TokenTimestampSkew
            | TokenSignatureInvalid | PermissionDenied => "auth",

            UnexpectedKind { .. } | UnknownReference(_) | CapabilityMismatch(_) | NoBids
            | NoQuote | DuplicateExpert(_) | Parse(_) => "protocol",

            DecryptFailed(_) | VerifyFailed(_) | PlaintextTooLarge { .. } | BadKey(_) => "crypto",

            PublishNoRelay | SubscribeTimeout | Disconnected(_) | Connect(_) => "transport",

            MaxChunksExceeded { .. } | MaxSizeExceeded { .. } | TtlExceeded
            | CompressionSizeExceeded { .. } | StreamParse(_) | StreamRemote { .. } => "stream",

            AmountOverCap { .. } | PayFailed(_) | ProofInvalid | PreimageMismatch
            | InvoiceParse(_) => "payment",

            VectorSizeMismatch { .. } | TooManyEmbeddings { .. } | UniquenessViolation(_)
            | BlobCorrupt(_) | Storage(_) => "storage",

            Serialization(_) | Internal(_) => "fatal",
        }
    }

    /// Short kebab-case code, stable across releases.
    pub fn code(&self) -> &'static str {
        use ParleyError::*;
        match self {
            TokenMissing => "missing-token",
            TokenExpired => "expired-token",
            DomainMismatch(_) => "domain-mismatch",
            UrlMismatch(_) => "url-mismatch",
            MethodMismatch(_) => "method-mismatch",
            PayloadHashMismatch => "payload-hash-mismatch",
            TokenTimestampSkew => "timestamp-skew",
            TokenSignatureInvalid => "signature-invalid",
            PermissionDenied => "permission-denied",

            UnexpectedKind { .. } => "unexpected-kind",
            UnknownReference(_) => "unknown-reference",
            CapabilityMismatch(_) => "capability-mismatch",
            NoBids => "no-bids",
            NoQuote => "no-quote",
            DuplicateExpert(_) => "duplicate-expert",
            Parse(_) => "parse-error",

            DecryptFailed(_) => "decrypt-failed",
            VerifyFailed(_) => "verify-failed",
            PlaintextTooLarge { .. } => "plaintext-too-large",
            BadKey(_) => "bad-key",

            PublishNoRelay => "publish-no-relay",
            SubscribeTimeout => "subscribe-timeout",
            Disconnected(_) => "disconnect",
            Connect(_) => "connect-failed",

            MaxChunksExceeded { .. } => "max-chunks-exceeded",
            MaxSizeExceeded { .. } => "max-size-exceeded",
            TtlExceeded => "ttl-exceeded",
            CompressionSizeExceeded { .. } => "compression-size-exceeded",
            StreamParse(_) => "parse-error",
            StreamRemote { .. } => "remote-error",

            AmountOverCap { .. } => "amount-over-cap",
            PayFailed(_) => "pay-failed",
            ProofInvalid => "proof-invalid",
            PreimageMismatch => "preimage-mismatch",
            InvoiceParse(_) => "invoice-parse",

            VectorSizeMismatch { .. } => "vector-size-mismatch",
            TooManyEmbeddings { .. } => "too-many-embeddings",
            UniquenessViolation(_) => "uniqueness-violation",
            BlobCorrupt(_) => "blob-corrupt",
            Storage(_) => "storage",

            Serialization(_) => "serialization",
            Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for ParleyError {
    fn from(e: serde_json::Error) -> Self {
        ParleyError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_codes_are_stable() {
        let e = ParleyError::AmountOverCap { amount: 10, cap: 5 };
        assert_eq!(e.kind(), "payment");
        assert_eq!(e.code(), "amount-over-cap");

        let e = ParleyError::MaxChunksExceeded { max: 3 };
        assert_eq!(e.kind(), "stream");
        assert_eq!(e.code(), "max-chunks-exceeded");

        let e = ParleyError::VectorSizeMismatch { expected: 3, got: 4 };
        assert_eq!(e.kind(), "storage");
    }
}
