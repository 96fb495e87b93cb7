//! Integration tests for HTTP method handling on the public routes
//!
//! `/v1/chat/completions` accepts only POST; the catalog and introspection
//! routes accept only GET. Unknown paths are 404.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::*;
use tower::ServiceExt;

async fn status_of(method: &str, uri: &str) -> StatusCode {
    let connector = ScriptedConnector::new();
    let (app, _state) = test_app(&connector);
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(r#"{"messages": [{"role": "user", "content": "Hello"}]}"#))
        .unwrap();
    app.oneshot(request).await.unwrap().status()
}

#[tokio::test]
async fn test_completions_rejects_non_post_methods() {
    for method in ["GET", "PUT", "DELETE", "PATCH"] {
        assert_eq!(
            status_of(method, "/v1/chat/completions").await,
            StatusCode::METHOD_NOT_ALLOWED,
            "{method} to /v1/chat/completions should return 405"
        );
    }
}

#[tokio::test]
async fn test_read_only_routes_reject_post() {
    for uri in ["/v1/models", "/v1/models/sonnet", "/health", "/version", "/metrics"] {
        assert_eq!(
            status_of("POST", uri).await,
            StatusCode::METHOD_NOT_ALLOWED,
            "POST to {uri} should return 405"
        );
    }
}

#[tokio::test]
async fn test_unknown_path_is_404() {
    assert_eq!(status_of("GET", "/v1/embeddings").await, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_post_completions_is_accepted() {
    assert_eq!(status_of("POST", "/v1/chat/completions").await, StatusCode::OK);
}
