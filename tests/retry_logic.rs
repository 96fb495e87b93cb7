//! Integration tests for retry behaviour
//!
//! Checks that:
//! - Retryable failures are retried up to `max_retries` extra attempts
//! - Non-retryable failures give up after one attempt
//! - Session faults evict the handle before the next attempt
//! - Streaming requests never retry once a chunk has been sent
//! - Backoff follows `min(initial * multiplier^attempt, max)`

mod common;

use acp_gateway::retry::RetryPolicy;
use axum::http::StatusCode;
use common::*;
use serde_json::json;

fn chat(stream: bool) -> serde_json::Value {
    json!({
        "model": "sonnet",
        "stream": stream,
        "messages": [{"role": "user", "content": "Hello"}]
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff schedule
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_default_backoff_schedule() {
    let policy = RetryPolicy::default();
    let delays: Vec<u64> = (0..6).map(|a| policy.base_delay_ms(a)).collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10000, 10000]);
}

#[test]
fn test_jittered_delay_stays_within_ten_percent() {
    let policy = RetryPolicy::default();
    for _ in 0..200 {
        let delay = policy.delay_for_attempt(1).as_millis() as u64;
        assert!((1800..=2200).contains(&delay), "delay {delay} out of bounds");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Non-streaming
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rate_limit_then_success_is_retried() {
    let connector = ScriptedConnector::new();
    connector
        .script(vec![fail_status("Too many requests", 429)])
        .script(vec![text("recovered"), ok("recovered")]);
    let (app, state) = test_app(&connector);

    let response = post_chat(&app, chat(false)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "recovered");

    assert_eq!(connector.prompts().len(), 2);
    // A rate-limited handle is healthy and goes back to the pool.
    assert_eq!(connector.created(), 1);
    assert_eq!(state.metrics().requests_succeeded(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_return_last_error() {
    let connector = ScriptedConnector::new();
    for _ in 0..3 {
        connector.script(vec![fail_status("rate limit", 429)]);
    }
    let (app, state) = test_app(&connector);

    let response = post_chat(&app, chat(false)).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "rate_limit_error");

    // max_retries = 2 → three attempts in total
    assert_eq!(connector.prompts().len(), 3);
    assert_eq!(state.metrics().requests_failed(), 1);
}

#[tokio::test]
async fn test_non_retryable_failure_gives_up_immediately() {
    let connector = ScriptedConnector::new();
    connector.script(vec![fail("maximum context length exceeded")]);
    let (app, _state) = test_app(&connector);

    let response = post_chat(&app, chat(false)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "context_length_exceeded");
    assert_eq!(body["error"]["param"], "messages");
    assert_eq!(connector.prompts().len(), 1);
}

#[tokio::test]
async fn test_session_fault_evicts_before_retry() {
    let connector = ScriptedConnector::new();
    connector
        .script(vec![fail("session not found")])
        .script(vec![text("fresh"), ok("fresh")]);
    let (app, _state) = test_app(&connector);

    let response = post_chat(&app, chat(false)).await;
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(connector.created(), 2);
    assert!(eventually(|| connector.closed() == 1).await);
}

#[tokio::test]
async fn test_error_payload_in_result_is_retried() {
    let connector = ScriptedConnector::new();
    connector
        .script(vec![ok(r#"{"error": {"message": "service unavailable", "status": 503}}"#)])
        .script(vec![text("fine"), ok("fine")]);
    let (app, _state) = test_app(&connector);

    let response = post_chat(&app, chat(false)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(connector.prompts().len(), 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_streaming_retries_before_first_chunk() {
    let connector = ScriptedConnector::new();
    connector
        .script(vec![fail("ECONNRESET")])
        .script(vec![text("second try"), ok("second try")]);
    let (app, _state) = test_app(&connector);

    let response = post_chat(&app, chat(true)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("second try"));
    assert_eq!(connector.prompts().len(), 2);
}

#[tokio::test]
async fn test_streaming_never_retries_after_output() {
    let connector = ScriptedConnector::new();
    connector
        .script(vec![text("partial"), sleep_ms(20), fail("ECONNRESET")])
        .script(vec![text("should not run"), ok("should not run")]);
    let (app, state) = test_app(&connector);

    let response = post_chat(&app, chat(true)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let events = sse_data(&body_string(response).await);

    assert_eq!(connector.prompts().len(), 1);
    assert!(events.iter().any(|e| e.contains("partial")));
    assert!(!events.iter().any(|e| e.contains("should not run")));
    assert_eq!(state.metrics().requests_failed(), 1);
}

#[tokio::test]
async fn test_streaming_retry_drops_reasoning_from_failed_attempt() {
    let connector = ScriptedConnector::new();
    connector
        .script(vec![
            thought("stale"),
            sleep_ms(20),
            fail_status("service unavailable", 503),
        ])
        .script(vec![thought("fresh"), text("c"), ok("c")]);
    let (app, _state) = test_app(&connector);

    let response = post_chat(&app, chat(true)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let events = sse_data(&body_string(response).await);
    let first: serde_json::Value = serde_json::from_str(&events[0]).unwrap();

    assert_eq!(connector.prompts().len(), 2);
    assert_eq!(first["choices"][0]["delta"]["reasoning_content"], "fresh");
    assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
    assert!(!events.iter().any(|e| e.contains("stale")));
}
