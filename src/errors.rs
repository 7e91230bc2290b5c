//! Error types for the ezmon crate.
//!
//! One unified enumeration is used across block extraction, dependency
//! collection, the local and network stores, and session handling. It
//! integrates with `thiserror` for `Display` and source chaining.
//!
//! The taxonomy mirrors how failures are handled: parse errors degrade a
//! file to a whole-file block, lock contention is retried, cleanup
//! foreign-key violations are swallowed, transport errors downgrade the
//! session to a local spill file. Only errors that survive those policies
//! reach the caller.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the ezmon library.
pub enum EzmonError {
    /// Source file could not be parsed; the file degrades to a single
    /// whole-file block.
    #[error("cannot parse `{0}`: {1}")]
    ParseError(String, String),

    /// The store's write lock stayed contended after all retries.
    #[error("store is locked: {0}")]
    StoreContended(String),

    /// Any other database failure.
    #[error("store error: {0}")]
    StoreError(String),

    /// A persisted fingerprint row holds bytes that are not a packed
    /// u32 array; the row is quarantined by the caller.
    #[error("corrupt fingerprint for `{0}` (len {1})")]
    CorruptFingerprint(String, usize),

    /// The session token is missing, expired, or belongs to another run.
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// Authentication against the network store failed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Transport failure talking to the network store.
    #[error("network error: {0}")]
    NetworkError(String),

    /// The server answered with a non-success status.
    #[error("server returned {0}: {1}")]
    ServerStatus(u16, String),

    /// Malformed request or response body.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Operation is not legal in the session's current state.
    #[error("session state error: {0}")]
    SessionState(String),

    /// Invalid CLI or function argument.
    #[error("argument parse failed: {0}")]
    InvalidArgument(String),

    /// I/O error from an underlying reader or writer.
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),
}

impl EzmonError {
    pub fn store(msg: impl Into<String>) -> Self {
        EzmonError::StoreError(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        EzmonError::NetworkError(msg.into())
    }

    pub fn payload(msg: impl Into<String>) -> Self {
        EzmonError::InvalidPayload(msg.into())
    }
}

impl From<rusqlite::Error> for EzmonError {
    fn from(err: rusqlite::Error) -> Self {
        EzmonError::StoreError(err.to_string())
    }
}

impl From<serde_json::Error> for EzmonError {
    fn from(err: serde_json::Error) -> Self {
        EzmonError::InvalidPayload(err.to_string())
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, EzmonError>;
