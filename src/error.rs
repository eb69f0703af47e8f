/// Error taxonomy
///
/// One classification shared by every component: the RPC client tags each
/// failure with a kind, the retry loops and fallback ladder branch on the
/// kind, and anything that survives classification bubbles to the ingester
/// as an IndexError.

use thiserror::Error;

/// Classified failure kinds for access-node calls.
///
/// Kinds, not types: two different wire errors that should be handled the
/// same way get the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcErrorKind {
    /// Timeout, connection refused, 5xx. Retry, escalate to another node.
    Transient,
    /// Local or remote throttle. Delay and retry on the same node.
    RateLimited,
    /// Block/collection/tx not found. At head this usually means the data
    /// has not propagated yet.
    NotFound,
    /// The node does not implement the batched API for this spork.
    Unimplemented,
    /// The modern codec failed to decode the response body.
    CodecDecode,
    /// Bad request on our side. Not retryable.
    InvalidArgument,
    /// Everything else that will not get better on retry.
    Permanent,
}

impl RpcErrorKind {
    /// Retry on the same or an alternate endpoint without changing strategy.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            RpcErrorKind::Transient | RpcErrorKind::RateLimited | RpcErrorKind::NotFound
        )
    }

    /// Switch to the next fallback fetch tier instead of retrying.
    pub fn wants_fallback(self) -> bool {
        matches!(self, RpcErrorKind::Unimplemented | RpcErrorKind::CodecDecode)
    }
}

impl std::fmt::Display for RpcErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RpcErrorKind::Transient => "transient",
            RpcErrorKind::RateLimited => "rate_limited",
            RpcErrorKind::NotFound => "not_found",
            RpcErrorKind::Unimplemented => "unimplemented",
            RpcErrorKind::CodecDecode => "codec_decode",
            RpcErrorKind::InvalidArgument => "invalid_argument",
            RpcErrorKind::Permanent => "permanent",
        };
        f.write_str(s)
    }
}

/// A classified access-node error.
#[derive(Debug, Clone, Error)]
#[error("{method} failed ({kind}): {message}")]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub method: &'static str,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: RpcErrorKind, method: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            method,
            message: message.into(),
        }
    }

    pub fn transient(method: &'static str, message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Transient, method, message)
    }

    pub fn not_found(method: &'static str, message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::NotFound, method, message)
    }
}

/// Store-side failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Constraint violations are programming errors here: every write path
    /// uses idempotent conflict targets, so a violation means a key scheme
    /// broke. Surfaces fatally.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("database error: {0}")]
    Sql(String),

    #[error("{0}")]
    Other(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = err {
            // 23xxx is the integrity-violation class.
            if db.code().map(|c| c.starts_with("23")).unwrap_or(false) {
                return StoreError::IntegrityViolation(db.to_string());
            }
        }
        StoreError::Sql(err.to_string())
    }
}

impl StoreError {
    /// Statement/transaction timeouts are treated as Transient and the
    /// window is retried once.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sql(msg) => {
                msg.contains("timed out") || msg.contains("timeout") || msg.contains("connection")
            }
            _ => false,
        }
    }
}

/// Top-level service errors.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    /// Unrecoverable by the service itself; requires operator intervention.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("shutting down")]
    Cancelled,
}

impl IndexError {
    pub fn fatal(message: impl Into<String>) -> Self {
        IndexError::Fatal(message.into())
    }
}
