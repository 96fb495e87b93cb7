//! ACP client over a child process' stdio
//!
//! Speaks newline-delimited JSON-RPC 2.0. The connection owns a reader task
//! that routes responses to pending calls, forwards `session/update`
//! notifications into the installed sink and answers the few agent-to-client
//! requests a headless gateway can answer.

use super::{AgentConnector, AgentHandle, CreateOptions, SessionUpdate, UpdateSink, UpstreamFailure};
use crate::config::AgentConfig;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// ACP protocol version negotiated during `initialize`
pub const PROTOCOL_VERSION: u64 = 1;

/// Placeholder in `agent.args` replaced with the upstream model id
pub const MODEL_PLACEHOLDER: &str = "{model}";

const METHOD_NOT_FOUND: i64 = -32601;

type PendingCall = oneshot::Sender<Result<Value, UpstreamFailure>>;

/// Spawns one agent process per handle
pub struct AcpProcessConnector {
    config: AgentConfig,
}

impl AcpProcessConnector {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Command-line arguments with the model placeholder substituted
    pub fn args_for_model(&self, model: &str) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|arg| arg.replace(MODEL_PLACEHOLDER, model))
            .collect()
    }
}

#[async_trait]
impl AgentConnector for AcpProcessConnector {
    async fn create(&self, options: CreateOptions) -> Result<Box<dyn AgentHandle>, UpstreamFailure> {
        let mut command = Command::new(&self.config.command);
        command
            .args(self.args_for_model(&options.model))
            .env(&self.config.token_env, &options.api_key)
            .env(&self.config.endpoint_env, &options.api_url)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(root) = &options.workspace_root {
            command.current_dir(root);
        }

        let mut child = command.spawn().map_err(|e| {
            UpstreamFailure::new(format!(
                "failed to spawn agent command '{}': {}",
                self.config.command, e
            ))
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(UpstreamFailure::new("agent process stdio not connected"));
        };

        let connection = Connection::start(stdin, stdout);
        let cwd = match &options.workspace_root {
            Some(root) => root.clone(),
            None => std::env::current_dir()
                .map_err(|e| UpstreamFailure::new(format!("cannot resolve working directory: {}", e)))?,
        };

        let startup = Duration::from_secs(self.config.startup_timeout_seconds);
        let handshake = async {
            connection
                .request(
                    "initialize",
                    json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "clientCapabilities": {
                            "fs": {"readTextFile": false, "writeTextFile": false},
                            "terminal": false
                        }
                    }),
                )
                .await?;
            let session = connection
                .request(
                    "session/new",
                    json!({"cwd": cwd.to_string_lossy(), "mcpServers": []}),
                )
                .await?;
            session
                .get("sessionId")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| UpstreamFailure::new("session/new returned no sessionId"))
        };

        let session_id = match tokio::time::timeout(startup, handshake).await {
            Ok(Ok(session_id)) => session_id,
            Ok(Err(e)) => {
                connection.shutdown();
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                connection.shutdown();
                let _ = child.kill().await;
                return Err(UpstreamFailure::new(format!(
                    "agent startup timed out after {} seconds",
                    startup.as_secs()
                )));
            }
        };

        tracing::info!(
            model = %options.model,
            session_id = %session_id,
            workspace = %cwd.display(),
            "ACP session established"
        );

        Ok(Box::new(AcpHandle {
            connection,
            session_id,
            child: tokio::sync::Mutex::new(Some(child)),
        }))
    }
}

/// One ACP session backed by a dedicated agent process
pub struct AcpHandle {
    connection: Connection,
    session_id: String,
    child: tokio::sync::Mutex<Option<Child>>,
}

#[async_trait]
impl AgentHandle for AcpHandle {
    async fn prompt(&self, text: &str) -> Result<String, UpstreamFailure> {
        self.connection.begin_transcript();
        let result = self
            .connection
            .request(
                "session/prompt",
                json!({
                    "sessionId": self.session_id,
                    "prompt": [{"type": "text", "text": text}]
                }),
            )
            .await;
        let transcript = self.connection.take_transcript();
        let result = result?;

        match result.get("stopReason").and_then(Value::as_str) {
            Some("refusal") => Err(UpstreamFailure::new("agent refused the prompt")),
            Some("cancelled") => Err(UpstreamFailure::aborted("prompt was cancelled by the agent")),
            Some("max_tokens") if transcript.is_empty() => {
                Err(UpstreamFailure::new("max_tokens reached before any output"))
            }
            _ => Ok(transcript),
        }
    }

    fn set_update_sink(&self, sink: Option<UpdateSink>) {
        self.connection.set_sink(sink);
    }

    async fn close(&self) {
        if !self.connection.is_closed() {
            let _ = self
                .connection
                .notify("session/cancel", json!({"sessionId": self.session_id}))
                .await;
        }
        self.connection.shutdown();
        if let Some(mut child) = self.child.lock().await.take()
            && let Err(e) = child.kill().await
        {
            tracing::debug!(
                session_id = %self.session_id,
                error = %e,
                "Agent process already exited"
            );
        }
    }
}

struct Shared {
    writer: tokio::sync::Mutex<ChildStdin>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    sink: Mutex<Option<UpdateSink>>,
    transcript: Mutex<String>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// JSON-RPC connection state shared with the reader task
struct Connection {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn start(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(stdin),
            pending: Mutex::new(HashMap::new()),
            sink: Mutex::new(None),
            transcript: Mutex::new(String::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_loop(Arc::clone(&shared), stdout));
        Self { shared, reader }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, UpstreamFailure> {
        if self.is_closed() {
            return Err(UpstreamFailure::new("agent not connected"));
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, tx);

        let message = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        if let Err(e) = write_message(&self.shared, &message).await {
            lock(&self.shared.pending).remove(&id);
            return Err(e);
        }

        rx.await
            .unwrap_or_else(|_| Err(UpstreamFailure::new("agent process disconnected")))
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), UpstreamFailure> {
        let message = json!({"jsonrpc": "2.0", "method": method, "params": params});
        write_message(&self.shared, &message).await
    }

    fn set_sink(&self, sink: Option<UpdateSink>) {
        *lock(&self.shared.sink) = sink;
    }

    fn begin_transcript(&self) {
        lock(&self.shared.transcript).clear();
    }

    fn take_transcript(&self) -> String {
        std::mem::take(&mut *lock(&self.shared.transcript))
    }

    fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.reader.abort();
        fail_pending(&self.shared, "agent connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn write_message(shared: &Shared, message: &Value) -> Result<(), UpstreamFailure> {
    let mut line = message.to_string();
    line.push('\n');
    let mut writer = shared.writer.lock().await;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| UpstreamFailure::new(format!("agent disconnected: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| UpstreamFailure::new(format!("agent disconnected: {}", e)))
}

fn fail_pending(shared: &Shared, reason: &str) {
    let pending: Vec<PendingCall> = lock(&shared.pending).drain().map(|(_, tx)| tx).collect();
    for tx in pending {
        let _ = tx.send(Err(UpstreamFailure::new(reason)));
    }
}

async fn read_loop(shared: Arc<Shared>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(message) => dispatch(&shared, message).await,
                    Err(e) => tracing::debug!(error = %e, "Ignoring non-JSON line from agent"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read from agent stdout");
                break;
            }
        }
    }
    shared.closed.store(true, Ordering::SeqCst);
    fail_pending(&shared, "agent process disconnected");
}

async fn dispatch(shared: &Shared, message: Value) {
    let method = message.get("method").and_then(Value::as_str);
    let id = message.get("id").cloned().filter(|id| !id.is_null());

    match (method, id) {
        (None, Some(id)) => complete_call(shared, &id, &message),
        (Some("session/update"), None) => {
            let Some(update) = message.pointer("/params/update") else {
                return;
            };
            let update = SessionUpdate::from_value(update);
            if let SessionUpdate::AgentMessageChunk { content } = &update
                && let Some(text) = content.as_text()
            {
                lock(&shared.transcript).push_str(text);
            }
            let sink = lock(&shared.sink).clone();
            if let Some(sink) = sink
                && sink.send(update).await.is_err()
            {
                tracing::debug!("Update sink closed, dropping session update");
            }
        }
        (Some(method), Some(id)) => answer_request(shared, method, id, &message).await,
        (Some(method), None) => {
            tracing::debug!(method = %method, "Ignoring agent notification");
        }
        (None, None) => {}
    }
}

fn complete_call(shared: &Shared, id: &Value, message: &Value) {
    let Some(id) = id.as_u64() else {
        return;
    };
    let Some(tx) = lock(&shared.pending).remove(&id) else {
        tracing::debug!(id, "Response for unknown request id");
        return;
    };
    let outcome = match message.get("error") {
        Some(error) => Err(rpc_failure(error)),
        None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
    };
    let _ = tx.send(outcome);
}

/// Convert a JSON-RPC error object into an upstream failure
///
/// JSON-RPC codes are negative; positive HTTP-like codes some agents use are
/// kept as the failure status.
fn rpc_failure(error: &Value) -> UpstreamFailure {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("agent returned an error");
    let detail = error
        .get("data")
        .and_then(|data| data.get("message").or(Some(data)))
        .and_then(Value::as_str);
    let mut failure = match detail {
        Some(detail) if detail != message => UpstreamFailure::new(format!("{}: {}", message, detail)),
        _ => UpstreamFailure::new(message),
    };
    if let Some(code) = error.get("code").and_then(Value::as_i64)
        && (400..600).contains(&code)
    {
        failure.status = Some(code as u16);
    }
    failure
}

async fn answer_request(shared: &Shared, method: &str, id: Value, message: &Value) {
    let reply = match method {
        "session/request_permission" => {
            let options = message
                .pointer("/params/options")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let chosen = options
                .iter()
                .find(|option| {
                    matches!(
                        option.get("kind").and_then(Value::as_str),
                        Some("allow_once") | Some("allow_always")
                    )
                })
                .and_then(|option| option.get("optionId").and_then(Value::as_str));
            let outcome = match chosen {
                Some(option_id) => json!({"outcome": "selected", "optionId": option_id}),
                None => json!({"outcome": "cancelled"}),
            };
            json!({"jsonrpc": "2.0", "id": id, "result": {"outcome": outcome}})
        }
        other => {
            tracing::debug!(method = %other, "Rejecting unsupported agent request");
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": METHOD_NOT_FOUND, "message": format!("method not found: {}", other)}
            })
        }
    };
    if let Err(e) = write_message(shared, &reply).await {
        tracing::warn!(error = %e, "Failed to answer agent request");
    }
}
