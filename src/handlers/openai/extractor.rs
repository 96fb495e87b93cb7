//! JSON extractor with OpenAI-compatible error responses
//!
//! Wraps Axum's `Json` extractor so that body and syntax failures are reported
//! in the same error envelope as every other failure. OpenAI SDKs rely on
//! that shape.

use crate::classifier::{ErrorEnvelope, ErrorKind};
use axum::{
    Json,
    extract::{FromRequest, Request, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::de::DeserializeOwned;

/// OpenAI-compatible JSON extraction error
///
/// Status codes by rejection:
/// - JSON syntax errors → 400 Bad Request
/// - Data errors → 422 Unprocessable Entity
/// - Missing content type → 415 Unsupported Media Type
pub struct OpenAiJsonRejection(JsonRejection);

impl IntoResponse for OpenAiJsonRejection {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            JsonRejection::JsonSyntaxError(_) => (StatusCode::BAD_REQUEST, self.0.body_text()),
            JsonRejection::JsonDataError(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.0.body_text())
            }
            JsonRejection::MissingJsonContentType(_) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "Content-Type must be application/json".to_string(),
            ),
            _ => (StatusCode::BAD_REQUEST, self.0.body_text()),
        };
        tracing::info!(status = %status, error = %message, "Rejected request body");
        let envelope = ErrorEnvelope::new(ErrorKind::Validation, message, None);
        (status, Json(envelope)).into_response()
    }
}

/// JSON extractor producing the gateway's error envelope on rejection
///
/// Chat requests are extracted as [`serde_json::Value`] and validated field
/// by field, so that failures can name the offending parameter.
pub struct OpenAiJson<T>(pub T);

impl<S, T> FromRequest<S> for OpenAiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = OpenAiJsonRejection;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(OpenAiJson(value)),
            Err(rejection) => Err(OpenAiJsonRejection(rejection)),
        }
    }
}
