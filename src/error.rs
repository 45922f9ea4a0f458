//! Error types surfaced by the sync layer.

use thiserror::Error;

/// Errors that reach callers of the pool and loaders.
///
/// Per-relay failures never show up here on their own; they are logged and the
/// aggregate operation continues. Only when no relay could be used at all does
/// an operation fail.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("no relay could be reached")]
    NoReachableSources,

    #[error("no relays configured")]
    NoRelaysConfigured,

    #[error("rate limited, retry in {remaining_ms} ms")]
    RateLimited { remaining_ms: u64 },

    #[error("publish rejected by every relay")]
    PublishRejected,

    #[error("invalid event: {0}")]
    Invalid(#[from] ValidationError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid relay url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons an event fails integrity checks.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("id mismatch")]
    IdMismatch,

    #[error("malformed hex in {0}")]
    MalformedHex(&'static str),

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid signature encoding")]
    InvalidSignatureEncoding,

    #[error("signature does not verify")]
    BadSignature,
}

pub type SyncResult<T> = Result<T, SyncError>;
