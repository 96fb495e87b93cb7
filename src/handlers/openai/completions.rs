//! OpenAI-compatible chat completions handler
//!
//! Handles POST /v1/chat/completions requests (both streaming and non-streaming).

use crate::error::AppError;
use crate::handlers::AppState;
use crate::middleware::RequestId;
use axum::{
    Extension, Json,
    extract::State,
    response::{IntoResponse, Response},
};
use serde_json::Value;

use super::extractor::OpenAiJson;

/// POST /v1/chat/completions handler
///
/// The body is validated field by field; see
/// [`ChatCompletionRequest::from_value`](super::types::ChatCompletionRequest::from_value).
/// The `model` field may name a catalog id or an upstream id. Unknown or
/// missing models resolve to the configured default.
///
/// # Response Format
///
/// **Non-streaming** (`stream: false` or omitted):
/// - `id`: Unique completion ID
/// - `object`: "chat.completion"
/// - `created`: Unix timestamp
/// - `model`: Public id of the resolved model
/// - `choices`: One assistant message with `finish_reason: "stop"`
/// - `usage`: Token usage (estimated at four characters per token)
///
/// **Streaming** (`stream: true`): see [`super::streaming`].
///
/// Failures use the `{"error": {...}}` envelope with the status derived from
/// the error kind.
pub async fn handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    OpenAiJson(body): OpenAiJson<Value>,
) -> Result<Response, AppError> {
    let ctx = state.orchestrator().prepare(request_id, &body)?;

    if ctx.stream {
        return super::streaming::respond(&state, ctx).await;
    }

    let completion = state.orchestrator().complete(ctx).await?;
    Ok(Json(completion).into_response())
}
