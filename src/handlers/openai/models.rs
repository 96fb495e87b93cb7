//! OpenAI-compatible model catalog handlers
//!
//! Handles GET /v1/models and GET /v1/models/{id}.

use crate::classifier::ErrorKind;
use crate::error::AppError;
use crate::handlers::AppState;
use axum::{
    Json,
    extract::{Path, State},
};

use super::types::{ModelObject, ModelsListResponse};

/// GET /v1/models handler
///
/// Lists every catalog entry in configuration order. Each object carries the
/// usual OpenAI fields plus `name`, `context_length` and `max_output_tokens`.
pub async fn list_handler(State(state): State<AppState>) -> Json<ModelsListResponse> {
    let models = state
        .models()
        .catalog
        .iter()
        .map(ModelObject::from)
        .collect();
    Json(ModelsListResponse::new(models))
}

/// GET /v1/models/{id} handler
///
/// Accepts a public id or an upstream id. Unknown ids yield a 404 envelope;
/// unlike chat requests there is no fallback to the default model.
pub async fn get_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ModelObject>, AppError> {
    match state.models().lookup(&id) {
        Some(model) => Ok(Json(ModelObject::from(model))),
        None => Err(AppError::Upstream {
            kind: ErrorKind::ModelNotFound,
            message: format!("model '{}' not found", id),
        }),
    }
}
