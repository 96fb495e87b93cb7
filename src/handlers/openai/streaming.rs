//! Server-Sent Events rendering for streaming chat completions
//!
//! # SSE Format
//!
//! Each event is formatted as:
//! ```text
//! data: {"id":"...","object":"chat.completion.chunk",...}
//!
//! ```
//!
//! The stream ends with:
//! ```text
//! data: [DONE]
//!
//! ```
//!
//! A failure before any chunk is produced is returned as a regular HTTP
//! error. A failure after output has started is sent as one final
//! `data: {"error": {...}}` event followed by `[DONE]`.

use crate::error::AppError;
use crate::handlers::AppState;
use crate::orchestrator::{RequestContext, StreamMessage};
use axum::response::{
    IntoResponse, Response,
    sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;

/// Terminal SSE payload
pub const DONE_MARKER: &str = "[DONE]";

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Start the streaming driver and turn its messages into an SSE response
///
/// Waits for the first message so that a request failing before any output
/// gets a proper HTTP status instead of a 200 with an error event.
pub async fn respond(state: &AppState, ctx: RequestContext) -> Result<Response, AppError> {
    let request_id = ctx.request_id;
    let mut rx = state.orchestrator().stream(ctx);

    let first = match rx.recv().await {
        Some(StreamMessage::Failed(e)) => return Err(e),
        Some(message) => message,
        None => {
            return Err(AppError::Internal(
                "stream ended before producing output".to_string(),
            ));
        }
    };

    tracing::debug!(request_id = %request_id, "Streaming response started");

    // Dropping the body drops `rx`, which the driver observes as a disconnect.
    let rest = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|message| (message, rx))
    });
    let events = stream::once(async move { first })
        .chain(rest)
        .flat_map(|message| stream::iter(events_for(message)))
        .map(Ok::<_, Infallible>);

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
        .into_response())
}

/// SSE events for one driver message
fn events_for(message: StreamMessage) -> Vec<Event> {
    match message {
        StreamMessage::Chunk(chunk) => vec![json_event(&chunk)],
        StreamMessage::Done => vec![Event::default().data(DONE_MARKER)],
        StreamMessage::Failed(e) => vec![
            json_event(&e.envelope()),
            Event::default().data(DONE_MARKER),
        ],
    }
}

fn json_event<T: Serialize>(payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(data) => Event::default().data(data),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize SSE payload");
            Event::default().data(r#"{"error":{"message":"serialization failed"}}"#)
        }
    }
}
