//! Error types for the gateway
//!
//! All errors implement `IntoResponse` for Axum handlers and render as the
//! OpenAI-style error envelope from [`crate::classifier::ErrorEnvelope`].

use crate::agent::UpstreamFailure;
use crate::classifier::{self, ErrorEnvelope, ErrorKind};
use axum::{
    Json,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read config file '{path}': {source}")]
    ConfigFileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    ConfigParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration in '{path}': {reason}")]
    ConfigValidationFailed { path: String, reason: String },

    #[error("Credentials unavailable: {0}")]
    Credentials(String),

    #[error("Invalid request: {message}")]
    Validation {
        message: String,
        param: Option<String>,
    },

    #[error("{message}")]
    Upstream { kind: ErrorKind, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Validation error without an offending parameter
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            param: None,
        }
    }

    /// Validation error naming the offending parameter
    pub fn invalid_param(message: impl Into<String>, param: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            param: Some(param.into()),
        }
    }

    /// Local abort (deadline or caller disconnect)
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Upstream {
            kind: ErrorKind::RequestTimeout,
            message: message.into(),
        }
    }

    /// Taxonomy kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Upstream { kind, .. } => *kind,
            Self::Credentials(_) => ErrorKind::AuthFailure,
            Self::Config(_)
            | Self::ConfigFileRead { .. }
            | Self::ConfigParseFailed { .. }
            | Self::ConfigValidationFailed { .. }
            | Self::Internal(_) => ErrorKind::Generic,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn requires_eviction(&self) -> bool {
        self.kind().requires_eviction()
    }

    /// Render as the caller-facing envelope
    pub fn envelope(&self) -> ErrorEnvelope {
        let (message, param) = match self {
            Self::Validation { message, param } => (message.clone(), param.clone()),
            Self::Upstream { message, .. } => (message.clone(), None),
            other => (other.to_string(), None),
        };
        ErrorEnvelope::new(self.kind(), message, param)
    }
}

impl From<UpstreamFailure> for AppError {
    fn from(failure: UpstreamFailure) -> Self {
        let kind = classifier::classify(&failure);
        Self::Upstream {
            kind,
            message: failure.message,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.kind().status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = %self.kind(), "Request failed");
        } else {
            tracing::warn!(error = %self, kind = %self.kind(), "Request rejected");
        }
        (status, Json(self.envelope())).into_response()
    }
}

/// Convenience type alias for Results
pub type AppResult<T> = Result<T, AppError>;
