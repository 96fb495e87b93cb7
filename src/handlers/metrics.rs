//! Prometheus metrics endpoint
//!
//! Exposes request metrics in Prometheus text format for scraping.

use axum::{extract::State, http::StatusCode};

use crate::handlers::AppState;

/// Metrics handler for Prometheus scraping
///
/// # Response
///
/// - `200 OK` with metrics in Prometheus text format
/// - `500 Internal Server Error` if metrics collection fails
///
/// # Example
///
/// ```bash
/// curl http://localhost:8787/metrics
/// # HELP acp_gateway_requests_total Total number of chat completion requests received
/// # TYPE acp_gateway_requests_total counter
/// acp_gateway_requests_total 42
/// ```
pub async fn handler(State(state): State<AppState>) -> (StatusCode, String) {
    match state.metrics().gather() {
        Ok(output) => (StatusCode::OK, output),
        Err(e) => {
            tracing::error!(error = %e, "Failed to gather metrics for Prometheus scraping");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to gather metrics: {}", e),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ErrorKind;
    use crate::handlers::test_support::test_state;

    #[tokio::test]
    async fn test_metrics_handler_returns_prometheus_format() {
        let state = test_state();
        state.metrics().record_model("sonnet");
        state.metrics().start_request().fail(ErrorKind::RateLimited);

        let (status, body) = handler(State(state)).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("# HELP"));
        assert!(body.contains("# TYPE"));
        assert!(body.contains(r#"acp_gateway_model_requests_total{model="sonnet"} 1"#));
        assert!(body.contains(r#"acp_gateway_errors_total{kind="rate_limited"} 1"#));
    }

    #[tokio::test]
    async fn test_concurrent_metrics_scraping() {
        let state = test_state();
        state.metrics().start_request().succeed();

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let state = state.clone();
            tasks.push(tokio::spawn(async move { handler(State(state)).await }));
        }
        for task in tasks {
            let (status, body) = task.await.unwrap();
            assert_eq!(status, StatusCode::OK);
            assert!(body.contains("acp_gateway_requests_succeeded_total 1"));
        }
    }
}
