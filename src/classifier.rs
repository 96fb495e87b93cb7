//! Upstream failure classification
//!
//! The upstream agent reports failures as free text with an occasional status
//! code, so classification is substring matching. All of it lives here so a
//! change in upstream error wording touches only this module.

use crate::agent::{ABORT_ERROR_NAME, UpstreamFailure};
use axum::http::StatusCode;
use serde::Serialize;

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request, detected before any upstream interaction
    Validation,
    ContextTooLong,
    RateLimited,
    /// The upstream session or connection died; the handle must be evicted
    SessionFault,
    Transient,
    AuthFailure,
    ModelNotFound,
    /// Deadline elapsed or the caller went away
    RequestTimeout,
    Generic,
}

const CONTEXT_TOO_LONG_PATTERNS: &[&str] = &[
    "context length",
    "context_length",
    "context window",
    "maximum context",
    "token limit",
    "too many tokens",
    "too long",
    "max_tokens",
];

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "quota exceeded",
    "throttl",
];

const SESSION_FAULT_PATTERNS: &[&str] = &[
    "not connected",
    "no session",
    "session not found",
    "session expired",
    "session closed",
    "disconnected",
    "connection closed",
    "websocket",
];

const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "econnreset",
    "econnrefused",
    "etimedout",
    "socket hang up",
    "service unavailable",
    "bad gateway",
    "network error",
    "temporarily unavailable",
];

const AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "unauthenticated",
    "invalid api key",
    "invalid_api_key",
    "invalid token",
    "authentication failed",
];

const MODEL_NOT_FOUND_PATTERNS: &[&str] = &["not found", "invalid", "does not exist", "unknown"];

const REQUEST_TIMEOUT_PATTERNS: &[&str] = &["timed out", "aborted"];

fn contains_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

/// Classify a raw upstream failure, first match wins
///
/// Order: context-too-long, rate-limited, session fault, transient, auth,
/// model-not-found, request timeout, generic. Within a kind, the numeric
/// status is checked before the message text.
pub fn classify(failure: &UpstreamFailure) -> ErrorKind {
    let text = failure.message.to_lowercase();
    let status = failure.status;

    if contains_any(&text, CONTEXT_TOO_LONG_PATTERNS) {
        return ErrorKind::ContextTooLong;
    }
    if status == Some(429) || contains_any(&text, RATE_LIMIT_PATTERNS) {
        return ErrorKind::RateLimited;
    }
    if contains_any(&text, SESSION_FAULT_PATTERNS) {
        return ErrorKind::SessionFault;
    }
    if status.is_some_and(|s| (500..600).contains(&s)) || contains_any(&text, TRANSIENT_PATTERNS) {
        return ErrorKind::Transient;
    }
    if matches!(status, Some(401) | Some(403)) || contains_any(&text, AUTH_PATTERNS) {
        return ErrorKind::AuthFailure;
    }
    if text.contains("model") && contains_any(&text, MODEL_NOT_FOUND_PATTERNS) {
        return ErrorKind::ModelNotFound;
    }
    let named_abort = failure
        .name
        .as_deref()
        .is_some_and(|name| name == ABORT_ERROR_NAME || name == "TimeoutError");
    if named_abort || contains_any(&text, REQUEST_TIMEOUT_PATTERNS) {
        return ErrorKind::RequestTimeout;
    }
    ErrorKind::Generic
}

impl ErrorKind {
    /// Whether a retry may succeed
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::SessionFault | Self::Transient
        )
    }

    /// Whether the pooled handle that produced this failure must be discarded
    ///
    /// Not the same as [`is_retryable`](Self::is_retryable): a local abort is
    /// never retried but still leaves the session in an unknown state.
    pub fn requires_eviction(self) -> bool {
        matches!(self, Self::SessionFault | Self::RequestTimeout)
    }

    pub fn status_code(self) -> StatusCode {
        match self {
            Self::Validation | Self::ContextTooLong => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::AuthFailure => StatusCode::UNAUTHORIZED,
            Self::ModelNotFound => StatusCode::NOT_FOUND,
            Self::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::SessionFault | Self::Transient | Self::Generic => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Coarse OpenAI error type
    pub fn error_type(self) -> &'static str {
        match self {
            Self::Validation | Self::ContextTooLong | Self::ModelNotFound => {
                "invalid_request_error"
            }
            Self::RateLimited => "rate_limit_error",
            Self::AuthFailure => "authentication_error",
            Self::RequestTimeout => "timeout_error",
            Self::SessionFault | Self::Transient | Self::Generic => "server_error",
        }
    }

    /// Fine-grained error code
    pub fn code(self) -> &'static str {
        match self {
            Self::Validation => "invalid_request",
            Self::ContextTooLong => "context_length_exceeded",
            Self::RateLimited => "rate_limit_exceeded",
            Self::SessionFault => "session_error",
            Self::Transient => "upstream_unavailable",
            Self::AuthFailure => "invalid_api_key",
            Self::ModelNotFound => "model_not_found",
            Self::RequestTimeout => "request_timeout",
            Self::Generic => "internal_error",
        }
    }

    /// Request parameter implicated by this kind, if any
    pub fn default_param(self) -> Option<&'static str> {
        match self {
            Self::ContextTooLong => Some("messages"),
            Self::ModelNotFound => Some("model"),
            _ => None,
        }
    }

    /// Remediation hint for the caller
    pub fn hint(self) -> &'static str {
        match self {
            Self::Validation => "Fix the request body and try again.",
            Self::ContextTooLong => "Shorten the input or start a new conversation.",
            Self::RateLimited => "Retry later; the upstream rate limit was reached.",
            Self::SessionFault => "Retry the request; a fresh upstream session will be used.",
            Self::Transient => "Retry later; the upstream service is temporarily unavailable.",
            Self::AuthFailure => "Re-authenticate and restart the gateway with fresh credentials.",
            Self::ModelNotFound => "Use a model listed by GET /v1/models.",
            Self::RequestTimeout => "Retry with a smaller request or a longer timeout.",
            Self::Generic => "Retry later; if the problem persists, check the gateway logs.",
        }
    }

    /// Label used for metrics and logs
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::ContextTooLong => "context_too_long",
            Self::RateLimited => "rate_limited",
            Self::SessionFault => "session_fault",
            Self::Transient => "transient",
            Self::AuthFailure => "auth_failure",
            Self::ModelNotFound => "model_not_found",
            Self::RequestTimeout => "request_timeout",
            Self::Generic => "generic",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-facing error body
///
/// ```json
/// {"error": {"message": "...", "type": "rate_limit_error",
///            "code": "rate_limit_exceeded", "param": null, "hint": "..."}}
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    pub param: Option<String>,
    pub hint: String,
}

impl ErrorEnvelope {
    pub fn new(kind: ErrorKind, message: impl Into<String>, param: Option<String>) -> Self {
        Self {
            error: ErrorBody {
                message: message.into(),
                error_type: kind.error_type().to_string(),
                code: kind.code().to_string(),
                param: param.or_else(|| kind.default_param().map(str::to_string)),
                hint: kind.hint().to_string(),
            },
        }
    }
}
