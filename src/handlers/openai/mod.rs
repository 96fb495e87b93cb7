//! OpenAI-compatible API handlers
//!
//! Provides the OpenAI-compatible surface of the gateway:
//! - `POST /v1/chat/completions` - Chat completions, optionally streamed as SSE
//! - `GET /v1/models` - List the model catalog
//! - `GET /v1/models/{id}` - Look up one catalog entry

pub mod completions;
pub mod extractor;
pub mod models;
pub mod streaming;
pub mod types;
