use std::collections::BTreeMap;
use std::fmt;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{error, warn};

/// Alias used throughout the library; binaries stay on `anyhow`.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Classified failure kinds the rest of the engine branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Per-request or whole-fetch deadline expired.
    NetworkTimeout,
    /// Connect/read level failure.
    NetworkConnection,
    /// 418/429 from the provider.
    RateLimit,
    /// 401/403 from the provider.
    AuthFailure,
    /// 404; terminal for the range, not for the fetch.
    ResourceNotFound,
    /// Unparseable response body.
    ProtocolFormat,
    /// Vision archive checksum did not match.
    ChecksumMismatch,
    /// Post-parse column check failed.
    SchemaMismatch,
    /// Empty result where data was expected; informational.
    DataEmpty,
    /// Raw timestamp width is neither milliseconds nor microseconds.
    TimestampFormat,
    /// Interval not available for the requested provider/market.
    UnsupportedInterval,
    /// Malformed or contradictory request rejected before any I/O.
    InvalidRequest,
    /// Post-merge structural check failed.
    Validation,
    /// Cache file or index I/O failure.
    CacheIo,
    /// A REST chunk exhausted its retry budget.
    ChunkFailure,
}

impl ErrorKind {
    /// Whether a request-level retry may succeed. This is the only place
    /// that decides retryability.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkTimeout | ErrorKind::NetworkConnection | ErrorKind::RateLimit
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NetworkTimeout => "network_timeout",
            ErrorKind::NetworkConnection => "network_connection",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::AuthFailure => "auth_failure",
            ErrorKind::ResourceNotFound => "resource_not_found",
            ErrorKind::ProtocolFormat => "protocol_format",
            ErrorKind::ChecksumMismatch => "checksum_mismatch",
            ErrorKind::SchemaMismatch => "schema_mismatch",
            ErrorKind::DataEmpty => "data_empty",
            ErrorKind::TimestampFormat => "timestamp_format",
            ErrorKind::UnsupportedInterval => "unsupported_interval",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Validation => "validation",
            ErrorKind::CacheIo => "cache_io",
            ErrorKind::ChunkFailure => "chunk_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed attempt against a specific source, kept so a terminal error
/// can report everything that was tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAttempt {
    pub source: &'static str,
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for SourceAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.source, self.kind, self.message)
    }
}

/// The single error type surfaced by the engine. Carries the classified
/// kind, a human message and a flat context map instead of a raw cause
/// chain.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: BTreeMap<&'static str, String>,
    pub attempts: Vec<SourceAttempt>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        EngineError {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
            attempts: Vec::new(),
        }
    }

    pub fn with(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.insert(key, value.to_string());
        self
    }

    pub fn with_attempts(mut self, attempts: Vec<SourceAttempt>) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Emit one structured incident record for this error. Warn level for
    /// recoverable kinds, error level for terminal ones.
    pub fn emit(&self) {
        let ctx = self
            .context
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        if self.kind.is_retryable() {
            warn!(kind = self.kind.as_str(), context = %ctx, "{}", self.message);
        } else {
            error!(kind = self.kind.as_str(), context = %ctx, "{}", self.message);
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::new(ErrorKind::CacheIo, err.to_string())
    }
}

/// Classify an HTTP status. Pure.
pub fn classify_status(status: StatusCode) -> ErrorKind {
    match status.as_u16() {
        401 | 403 => ErrorKind::AuthFailure,
        404 => ErrorKind::ResourceNotFound,
        418 | 429 => ErrorKind::RateLimit,
        500..=599 => ErrorKind::NetworkConnection,
        _ => ErrorKind::InvalidRequest,
    }
}

/// Classify a transport-level failure from the HTTP client. Pure.
pub fn classify_transport(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        return ErrorKind::NetworkTimeout;
    }
    if err.is_connect() {
        return ErrorKind::NetworkConnection;
    }
    if err.is_decode() || err.is_body() {
        return ErrorKind::ProtocolFormat;
    }
    if let Some(status) = err.status() {
        return classify_status(status);
    }
    classify_message(&err.to_string())
}

/// Last-resort classification from message tokens. Pure.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        ErrorKind::NetworkTimeout
    } else if lower.contains("connection")
        || lower.contains("reset")
        || lower.contains("broken pipe")
        || lower.contains("dns")
    {
        ErrorKind::NetworkConnection
    } else {
        ErrorKind::ProtocolFormat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_is_limited_to_transient_kinds() {
        assert!(ErrorKind::NetworkTimeout.is_retryable());
        assert!(ErrorKind::NetworkConnection.is_retryable());
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(!ErrorKind::AuthFailure.is_retryable());
        assert!(!ErrorKind::ResourceNotFound.is_retryable());
        assert!(!ErrorKind::ProtocolFormat.is_retryable());
        assert!(!ErrorKind::SchemaMismatch.is_retryable());
        assert!(!ErrorKind::ChecksumMismatch.is_retryable());
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            ErrorKind::AuthFailure
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            ErrorKind::AuthFailure
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            ErrorKind::ResourceNotFound
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            ErrorKind::RateLimit
        );
        assert_eq!(
            classify_status(StatusCode::IM_A_TEAPOT),
            ErrorKind::RateLimit
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            ErrorKind::NetworkConnection
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            ErrorKind::InvalidRequest
        );
    }

    #[test]
    fn message_classification_tokens() {
        assert_eq!(
            classify_message("operation timed out after 9s"),
            ErrorKind::NetworkTimeout
        );
        assert_eq!(
            classify_message("connection reset by peer"),
            ErrorKind::NetworkConnection
        );
        assert_eq!(
            classify_message("unexpected token at line 1"),
            ErrorKind::ProtocolFormat
        );
    }

    #[test]
    fn context_and_attempts_survive_on_the_error() {
        let err = EngineError::new(ErrorKind::ChunkFailure, "chunk exhausted retries")
            .with("symbol", "BTCUSDT")
            .with("interval", "1m")
            .with_attempts(vec![SourceAttempt {
                source: "rest",
                kind: ErrorKind::NetworkTimeout,
                message: "request timed out".into(),
            }]);
        assert_eq!(err.context.get("symbol").unwrap(), "BTCUSDT");
        assert_eq!(err.attempts.len(), 1);
        assert_eq!(err.to_string(), "chunk_failure: chunk exhausted retries");
    }
}
