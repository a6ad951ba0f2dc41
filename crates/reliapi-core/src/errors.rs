//! Normalised error codes and classification.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalised error codes for the gateway.
///
/// This is a closed set: every error surfaced in a response body, a log
/// line, or a metric label is one of these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Caller errors
    Unauthorized,
    BadRequest,
    NotFound,
    IdempotencyConflict,
    StreamAlreadyInProgress,
    StreamAlreadyCompleted,
    StreamingUnsupported,
    RateLimitReliapi,

    // Upstream errors
    ServerError,
    ClientError,
    NetworkError,
    ProviderError,
    UpstreamStreamInterrupted,

    // Budget errors
    BudgetExceeded,

    // Configuration errors
    InvalidTarget,
    UnknownProvider,
    AdapterNotFound,

    // Internal errors
    InternalError,
}

impl ErrorCode {
    /// Maps an upstream HTTP status code to an error code.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            500.. => ErrorCode::ServerError,
            401 => ErrorCode::Unauthorized,
            404 => ErrorCode::NotFound,
            409 => ErrorCode::IdempotencyConflict,
            400..=499 => ErrorCode::ClientError,
            _ => ErrorCode::InternalError,
        }
    }

    /// The canonical wire/metric representation of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            ErrorCode::StreamAlreadyInProgress => "STREAM_ALREADY_IN_PROGRESS",
            ErrorCode::StreamAlreadyCompleted => "STREAM_ALREADY_COMPLETED",
            ErrorCode::StreamingUnsupported => "STREAMING_UNSUPPORTED",
            ErrorCode::RateLimitReliapi => "RATE_LIMIT_RELIAPI",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::ClientError => "CLIENT_ERROR",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::ProviderError => "PROVIDER_ERROR",
            ErrorCode::UpstreamStreamInterrupted => "UPSTREAM_STREAM_INTERRUPTED",
            ErrorCode::BudgetExceeded => "BUDGET_EXCEEDED",
            ErrorCode::InvalidTarget => "INVALID_TARGET",
            ErrorCode::UnknownProvider => "UNKNOWN_PROVIDER",
            ErrorCode::AdapterNotFound => "ADAPTER_NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse error classification driving retryability and the envelope `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller supplied invalid input (4xx, non-retryable).
    Client,
    /// Rejected by the gateway's own rate scheduler (retryable, carries
    /// `retry_after_s`).
    RateLimit,
    /// 4xx/5xx from the upstream; retryable iff 5xx or 429.
    Upstream,
    /// Timeout, connect failure, or DNS failure (retryable).
    Network,
    /// Pre-call cost cap rejection (non-retryable).
    Budget,
    /// Idempotency key reused with a different request (non-retryable).
    IdempotencyConflict,
    /// Streaming lifecycle violation (non-retryable).
    Stream,
    /// Bad target or provider configuration (non-retryable).
    Config,
    /// Everything else; the caller may retry.
    Internal,
}

impl ErrorKind {
    /// The `type` string used in the caller-visible error envelope.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Client => "client_error",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Upstream => "upstream_error",
            ErrorKind::Network => "network_error",
            ErrorKind::Budget => "budget_error",
            ErrorKind::IdempotencyConflict => "idempotency_conflict",
            ErrorKind::Stream => "stream_error",
            ErrorKind::Config => "config_error",
            ErrorKind::Internal => "internal_error",
        }
    }

    /// Whether a caller should consider errors of this kind retryable by
    /// default. Upstream errors refine this per status code.
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::Network | ErrorKind::Internal
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
