//! Shared fixtures for integration tests
//!
//! [`ScriptedConnector`] stands in for the ACP agent process: each prompt
//! plays back one scripted sequence of session updates, delays and a final
//! result.

#![allow(dead_code)]

use acp_gateway::agent::{
    AgentConnector, AgentHandle, CreateOptions, SessionUpdate, UpdateSink, UpstreamFailure,
};
use acp_gateway::config::Config;
use acp_gateway::credentials::{CredentialStore, Credentials};
use acp_gateway::handlers::{AppState, build_router};
use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, Response},
};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

/// One step of a scripted prompt
#[derive(Debug, Clone)]
pub enum Step {
    Update(SessionUpdate),
    Sleep(Duration),
    Return(Result<String, UpstreamFailure>),
    /// Never complete; only cancellation ends the prompt
    Hang,
}

pub fn text(s: &str) -> Step {
    Step::Update(SessionUpdate::agent_text(s))
}

pub fn thought(s: &str) -> Step {
    Step::Update(SessionUpdate::agent_thought(s))
}

pub fn ok(s: &str) -> Step {
    Step::Return(Ok(s.to_string()))
}

pub fn fail(message: &str) -> Step {
    Step::Return(Err(UpstreamFailure::new(message)))
}

pub fn fail_status(message: &str, status: u16) -> Step {
    Step::Return(Err(UpstreamFailure::new(message).with_status(status)))
}

pub fn sleep_ms(ms: u64) -> Step {
    Step::Sleep(Duration::from_millis(ms))
}

#[derive(Default)]
struct Shared {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    create_failures: Mutex<VecDeque<UpstreamFailure>>,
    created: AtomicUsize,
    closed: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    options: Mutex<Vec<CreateOptions>>,
}

/// Connector whose handles replay queued scripts in order
///
/// When the queue is empty a prompt answers `"ok"` with one matching text
/// update.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    shared: Arc<Shared>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the script for the next prompt on any handle
    pub fn script(&self, steps: Vec<Step>) -> &Self {
        self.shared.scripts.lock().unwrap().push_back(steps);
        self
    }

    /// Make the next handle creation fail
    pub fn fail_next_create(&self, failure: UpstreamFailure) -> &Self {
        self.shared.create_failures.lock().unwrap().push_back(failure);
        self
    }

    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.shared.prompts.lock().unwrap().clone()
    }

    pub fn workspaces(&self) -> Vec<Option<PathBuf>> {
        self.shared
            .options
            .lock()
            .unwrap()
            .iter()
            .map(|o| o.workspace_root.clone())
            .collect()
    }

    pub fn models(&self) -> Vec<String> {
        self.shared
            .options
            .lock()
            .unwrap()
            .iter()
            .map(|o| o.model.clone())
            .collect()
    }
}

#[async_trait]
impl AgentConnector for ScriptedConnector {
    async fn create(&self, options: CreateOptions) -> Result<Box<dyn AgentHandle>, UpstreamFailure> {
        if let Some(failure) = self.shared.create_failures.lock().unwrap().pop_front() {
            return Err(failure);
        }
        self.shared.options.lock().unwrap().push(options);
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedHandle {
            shared: self.shared.clone(),
            sink: Mutex::new(None),
        }))
    }
}

struct ScriptedHandle {
    shared: Arc<Shared>,
    sink: Mutex<Option<UpdateSink>>,
}

#[async_trait]
impl AgentHandle for ScriptedHandle {
    async fn prompt(&self, prompt: &str) -> Result<String, UpstreamFailure> {
        self.shared.prompts.lock().unwrap().push(prompt.to_string());
        let steps = self
            .shared
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![text("ok"), ok("ok")]);

        for step in steps {
            match step {
                Step::Update(update) => {
                    let sink = self.sink.lock().unwrap().clone();
                    if let Some(sink) = sink {
                        let _ = sink.send(update).await;
                    }
                }
                Step::Sleep(duration) => tokio::time::sleep(duration).await,
                Step::Return(result) => return result,
                Step::Hang => std::future::pending::<()>().await,
            }
        }
        Ok(String::new())
    }

    fn set_update_sink(&self, sink: Option<UpdateSink>) {
        *self.sink.lock().unwrap() = sink;
    }

    async fn close(&self) {
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Configuration with fast retries and a short deadline
pub fn test_config(request_timeout_seconds: u64, max_retries: u32) -> Config {
    let toml = format!(
        r#"
[server]
host = "127.0.0.1"
port = 8787
request_timeout_seconds = {request_timeout_seconds}

[pool]
capacity = 2

[retry]
max_retries = {max_retries}
initial_delay_ms = 10
max_delay_ms = 40
backoff_multiplier = 2.0
jitter_factor = 0.0

[agent]
command = "agent-cli"

[models]
default = "sonnet"

[[models.catalog]]
id = "sonnet"
upstream_id = "claude-sonnet-4"
display_name = "Sonnet"
context_tokens = 200000
max_output_tokens = 64000

[[models.catalog]]
id = "haiku"
upstream_id = "claude-haiku-4"
display_name = "Haiku"
context_tokens = 200000
max_output_tokens = 8192
"#
    );
    Config::from_str(&toml).expect("should parse test config")
}

pub fn test_credentials() -> Arc<CredentialStore> {
    Arc::new(CredentialStore::with_credentials(Credentials::new(
        "test-token",
        "https://tenant.example.com",
    )))
}

/// Application state and router over a scripted connector
pub fn test_app_with(connector: &ScriptedConnector, config: Config) -> (Router, AppState) {
    let state = AppState::new(Arc::new(config), Arc::new(connector.clone()), test_credentials())
        .expect("AppState::new should succeed");
    (build_router(state.clone()), state)
}

pub fn test_app(connector: &ScriptedConnector) -> (Router, AppState) {
    test_app_with(connector, test_config(30, 2))
}

pub async fn post_chat(app: &Router, body: serde_json::Value) -> Response<Body> {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}

/// The `data:` payloads of an SSE body, in order
pub fn sse_data(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.trim_start().to_string())
        .collect()
}

/// Poll until `check` holds or a second has passed
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
