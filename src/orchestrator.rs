//! Request orchestration
//!
//! One request moves through
//! `Validating -> Dispatching -> (Streaming | Buffering) -> Completed | Failed | Aborted`.
//!
//! The orchestrator owns the interaction between the pool, the retry policy,
//! the translator and metrics. Every request carries one
//! [`CancellationToken`], triggered by the request deadline or by the caller
//! going away. A handle that was in use when the token fired is always
//! discarded.

use crate::agent::{SessionUpdate, UpstreamFailure};
use crate::classifier::ErrorKind;
use crate::config::{ModelConfig, ModelsConfig};
use crate::error::{AppError, AppResult};
use crate::handlers::openai::types::{
    ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, completion_id, current_timestamp,
};
use crate::metrics::{Metrics, RequestTracker};
use crate::middleware::RequestId;
use crate::pool::{ClientPool, PooledHandle};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::translator::{ResponseCollector, StreamTranslator};
use regex::Regex;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Buffered session updates per in-flight prompt
const UPDATE_BUFFER: usize = 64;
/// Buffered SSE messages between the driver task and the HTTP body
const STREAM_BUFFER: usize = 64;

/// System-prompt phrases that announce the caller's workspace root
///
/// Each pattern captures either a quoted path (group 1) or a bare token
/// (group 2).
static WORKSPACE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    const PATH: &str = r#"(?:["'`]([^"'`\n]+)["'`]|(\S+))"#;
    [
        r"(?i)workspace\s+(?:is\s+)?opened\s+at:?\s*",
        r"(?i)\bcwd:\s*",
        r"(?i)current\s+working\s+directory(?:\s+is)?:?\s*",
        r"(?i)workspace\s+root(?:\s+is)?:?\s*",
    ]
    .iter()
    .filter_map(|prefix| Regex::new(&format!("{}{}", prefix, PATH)).ok())
    .collect()
});

/// Extract a workspace root from system messages, first match wins
pub fn extract_workspace_root<'a>(system_messages: impl IntoIterator<Item = &'a str>) -> Option<PathBuf> {
    for text in system_messages {
        for pattern in WORKSPACE_PATTERNS.iter() {
            let Some(captures) = pattern.captures(text) else {
                continue;
            };
            let raw = match (captures.get(1), captures.get(2)) {
                (Some(quoted), _) => quoted.as_str().trim(),
                (None, Some(bare)) => bare
                    .as_str()
                    .trim_end_matches(['.', ',', ';', ':', ')', ']', '"', '\'', '`']),
                (None, None) => continue,
            };
            if !raw.is_empty() {
                return Some(PathBuf::from(raw));
            }
        }
    }
    None
}

/// Everything one request needs after validation
pub struct RequestContext {
    pub request_id: RequestId,
    pub model: ModelConfig,
    pub prompt: String,
    pub prompt_chars: usize,
    pub stream: bool,
    pub workspace: Option<PathBuf>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    tracker: RequestTracker,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("model", &self.model.id())
            .field("prompt_chars", &self.prompt_chars)
            .field("stream", &self.stream)
            .field("workspace", &self.workspace)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Message from the streaming driver to the HTTP body
#[derive(Debug)]
pub enum StreamMessage {
    Chunk(ChatCompletionChunk),
    /// The stream finished normally; `[DONE]` follows
    Done,
    /// The stream failed; the error envelope is the last event
    Failed(AppError),
}

/// Cancels the request token when the deadline passes
struct Deadline {
    expired: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Deadline {
    fn arm(cancel: &CancellationToken, timeout: Duration) -> Self {
        let expired = Arc::new(AtomicBool::new(false));
        let flag = expired.clone();
        let cancel = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    flag.store(true, Ordering::SeqCst);
                    cancel.cancel();
                }
            }
        });
        Self { expired, task }
    }

    fn expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Result of one upstream attempt
struct AttemptOutcome {
    text: String,
}

/// Top-level per-request state machine
#[derive(Clone)]
pub struct Orchestrator {
    pool: ClientPool,
    models: Arc<ModelsConfig>,
    retry: RetryPolicy,
    metrics: Metrics,
    timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        pool: ClientPool,
        models: Arc<ModelsConfig>,
        retry: RetryPolicy,
        metrics: Metrics,
        timeout: Duration,
    ) -> Self {
        Self {
            pool,
            models,
            retry,
            metrics,
            timeout,
        }
    }

    pub fn pool(&self) -> &ClientPool {
        &self.pool
    }

    pub fn models(&self) -> &ModelsConfig {
        &self.models
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Validating: check the body and resolve model, workspace and prompt
    ///
    /// Validation failures are counted once and never reach the pool.
    pub fn prepare(&self, request_id: RequestId, body: &Value) -> AppResult<RequestContext> {
        let tracker = self.metrics.start_request();

        let request = match ChatCompletionRequest::from_value(body) {
            Ok(request) => request,
            Err(e) => {
                tracing::info!(request_id = %request_id, error = %e, "Rejected invalid request");
                tracker.fail(e.kind());
                return Err(e);
            }
        };

        let Some(model) = self.models.resolve(request.model()).cloned() else {
            let err = AppError::Upstream {
                kind: ErrorKind::ModelNotFound,
                message: format!(
                    "model '{}' not found and no default is configured",
                    request.model().unwrap_or("")
                ),
            };
            tracker.fail(err.kind());
            return Err(err);
        };
        self.metrics.record_model(model.id());

        let workspace = extract_workspace_root(request.system_contents());
        let prompt = request.to_prompt_string();
        let prompt_chars = prompt.chars().count();

        tracing::info!(
            request_id = %request_id,
            model = %model.id(),
            upstream_model = %model.upstream_id(),
            workspace = ?workspace,
            stream = request.stream(),
            messages = request.messages().len(),
            prompt_chars = prompt_chars,
            "Dispatching chat completion"
        );

        Ok(RequestContext {
            request_id,
            model,
            prompt,
            prompt_chars,
            stream: request.stream(),
            workspace,
            timeout: self.timeout,
            cancel: CancellationToken::new(),
            tracker,
        })
    }

    /// Buffering: run a non-streaming request to completion
    ///
    /// The work runs in its own task. If this future is dropped (caller
    /// disconnect), the request token is cancelled and the task aborts the
    /// upstream call and discards the handle.
    pub async fn complete(&self, ctx: RequestContext) -> AppResult<ChatCompletion> {
        let guard = ctx.cancel.clone().drop_guard();
        let this = self.clone();
        let result = tokio::spawn(async move { this.run_buffered(ctx).await })
            .await
            .map_err(|e| AppError::Internal(format!("request task failed: {}", e)));
        guard.disarm();
        result?
    }

    async fn run_buffered(&self, ctx: RequestContext) -> AppResult<ChatCompletion> {
        let RequestContext {
            request_id,
            model,
            prompt,
            prompt_chars,
            workspace,
            timeout,
            cancel,
            tracker,
            ..
        } = ctx;
        let deadline = Deadline::arm(&cancel, timeout);
        let attempt_ctx = AttemptContext {
            request_id,
            model: &model,
            prompt: &prompt,
            workspace: workspace.as_ref(),
            cancel: &cancel,
            deadline: &deadline,
            timeout,
        };

        let result = self
            .retry
            .run(&cancel, |attempt| self.attempt_buffered(&attempt_ctx, attempt))
            .await
            .map_err(|e| attempt_ctx.settle_error(e));

        match result {
            Ok(outcome) => {
                tracker.succeed();
                tracing::info!(
                    request_id = %request_id,
                    model = %model.id(),
                    response_chars = outcome.text.len(),
                    "Chat completion finished"
                );
                Ok(ChatCompletion::new(
                    completion_id(),
                    outcome.text,
                    model.id().to_string(),
                    prompt_chars,
                    current_timestamp(),
                ))
            }
            Err(e) => {
                tracker.fail(e.kind());
                tracing::warn!(
                    request_id = %request_id,
                    model = %model.id(),
                    error_kind = %e.kind(),
                    error = %e,
                    "Chat completion failed"
                );
                Err(e)
            }
        }
    }

    async fn attempt_buffered(
        &self,
        ctx: &AttemptContext<'_>,
        attempt: u32,
    ) -> AppResult<AttemptOutcome> {
        let handle = ctx.acquire(&self.pool, attempt).await?;
        let (tx, mut rx) = mpsc::channel(UPDATE_BUFFER);
        handle.set_update_sink(Some(tx));

        let mut collector = ResponseCollector::new();
        let result = {
            let prompt = handle.prompt(ctx.prompt);
            tokio::pin!(prompt);
            loop {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => break Err(ctx.abort_error()),
                    _ = handle.revoked() => break Err(revoked_error()),
                    Some(update) = rx.recv() => collector.on_update(update),
                    result = &mut prompt => break result.map_err(AppError::from),
                }
            }
        };
        handle.set_update_sink(None);
        while let Ok(update) = rx.try_recv() {
            collector.on_update(update);
        }

        let result = settle_prompt(result);
        self.return_handle(ctx, handle, result.as_ref().err()).await;

        let text = result?;
        let text = if collector.received_text() {
            collector.into_text()
        } else {
            text
        };
        Ok(AttemptOutcome { text })
    }

    /// Streaming: start the driver task and hand back its message channel
    pub fn stream(&self, ctx: RequestContext) -> mpsc::Receiver<StreamMessage> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let this = self.clone();
        tokio::spawn(async move { this.run_streaming(ctx, tx).await });
        rx
    }

    async fn run_streaming(&self, ctx: RequestContext, tx: mpsc::Sender<StreamMessage>) {
        let RequestContext {
            request_id,
            model,
            prompt,
            workspace,
            timeout,
            cancel,
            tracker,
            ..
        } = ctx;
        let deadline = Deadline::arm(&cancel, timeout);
        let attempt_ctx = AttemptContext {
            request_id,
            model: &model,
            prompt: &prompt,
            workspace: workspace.as_ref(),
            cancel: &cancel,
            deadline: &deadline,
            timeout,
        };
        let mut translator = StreamTranslator::new(completion_id(), model.id(), current_timestamp());

        let mut attempt = 0;
        let result = loop {
            let err = match self
                .attempt_streaming(&attempt_ctx, attempt, &mut translator, &tx)
                .await
            {
                Ok(()) => break Ok(()),
                Err(e) => attempt_ctx.settle_error(e),
            };

            // Retrying after output was sent would duplicate it.
            if translator.emitted() > 0 || cancel.is_cancelled() {
                break Err(err);
            }
            match self.retry.decide(attempt, err.is_retryable()) {
                RetryDecision::GiveUp => break Err(err),
                RetryDecision::Retry(delay) => {
                    tracing::warn!(
                        request_id = %request_id,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Streaming attempt failed before output, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break Err(attempt_ctx.abort_error()),
                        _ = tx.closed() => {
                            cancel.cancel();
                            break Err(attempt_ctx.abort_error());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    translator.reset();
                    attempt += 1;
                }
            }
        };

        match result {
            Ok(()) => {
                for chunk in translator.finish() {
                    if tx.send(StreamMessage::Chunk(chunk)).await.is_err() {
                        break;
                    }
                }
                let _ = tx.send(StreamMessage::Done).await;
                tracker.succeed();
                tracing::info!(
                    request_id = %request_id,
                    model = %model.id(),
                    chunks = translator.emitted(),
                    "Streaming completion finished"
                );
            }
            Err(e) => {
                tracker.fail(e.kind());
                tracing::warn!(
                    request_id = %request_id,
                    model = %model.id(),
                    error_kind = %e.kind(),
                    chunks = translator.emitted(),
                    error = %e,
                    "Streaming completion failed"
                );
                let _ = tx.send(StreamMessage::Failed(e)).await;
            }
        }
    }

    async fn attempt_streaming(
        &self,
        ctx: &AttemptContext<'_>,
        attempt: u32,
        translator: &mut StreamTranslator,
        tx: &mpsc::Sender<StreamMessage>,
    ) -> AppResult<()> {
        let handle = tokio::select! {
            handle = ctx.acquire(&self.pool, attempt) => handle?,
            _ = tx.closed() => {
                ctx.cancel.cancel();
                return Err(ctx.abort_error());
            }
        };
        let (update_tx, mut rx) = mpsc::channel(UPDATE_BUFFER);
        handle.set_update_sink(Some(update_tx));

        let result = {
            let prompt = handle.prompt(ctx.prompt);
            tokio::pin!(prompt);
            loop {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => break Err(ctx.abort_error()),
                    _ = handle.revoked() => break Err(revoked_error()),
                    _ = tx.closed() => {
                        ctx.cancel.cancel();
                        break Err(ctx.abort_error());
                    }
                    Some(update) = rx.recv() => {
                        if !forward(translator, update, tx).await {
                            ctx.cancel.cancel();
                            break Err(ctx.abort_error());
                        }
                    }
                    result = &mut prompt => break result.map_err(AppError::from),
                }
            }
        };
        handle.set_update_sink(None);

        let mut result = settle_prompt(result);
        if result.is_ok() {
            while let Ok(update) = rx.try_recv() {
                if !forward(translator, update, tx).await {
                    ctx.cancel.cancel();
                    result = Err(ctx.abort_error());
                    break;
                }
            }
        }
        if let Ok(text) = &result
            && !translator.content_started()
            && !text.is_empty()
            && !forward(translator, SessionUpdate::agent_text(text.clone()), tx).await
        {
            ctx.cancel.cancel();
            result = Err(ctx.abort_error());
        }

        self.return_handle(ctx, handle, result.as_ref().err()).await;
        result.map(|_| ())
    }

    /// Release a healthy handle, discard one implicated in a fault or abort
    async fn return_handle(
        &self,
        ctx: &AttemptContext<'_>,
        handle: PooledHandle,
        error: Option<&AppError>,
    ) {
        match error {
            Some(e) if e.requires_eviction() || ctx.cancel.is_cancelled() => {
                self.pool.discard(handle, e.kind().as_str()).await;
            }
            _ => self.pool.release(handle).await,
        }
    }
}

/// Borrowed per-request state shared by every attempt
struct AttemptContext<'a> {
    request_id: RequestId,
    model: &'a ModelConfig,
    prompt: &'a str,
    workspace: Option<&'a PathBuf>,
    cancel: &'a CancellationToken,
    deadline: &'a Deadline,
    timeout: Duration,
}

impl AttemptContext<'_> {
    /// Dispatching: check out a handle, giving up if the request is cancelled
    async fn acquire(&self, pool: &ClientPool, attempt: u32) -> AppResult<PooledHandle> {
        tracing::debug!(
            request_id = %self.request_id,
            model = %self.model.id(),
            attempt = attempt,
            "Acquiring upstream handle"
        );
        tokio::select! {
            _ = self.cancel.cancelled() => Err(self.abort_error()),
            handle = pool.acquire(self.model, self.workspace.map(PathBuf::as_path)) => handle,
        }
    }

    fn abort_error(&self) -> AppError {
        if self.deadline.expired() {
            AppError::aborted(format!(
                "request timed out after {} seconds",
                self.timeout.as_secs()
            ))
        } else {
            AppError::aborted("request aborted: client disconnected")
        }
    }

    /// Any failure observed after cancellation is reported as the abort
    fn settle_error(&self, err: AppError) -> AppError {
        if self.cancel.is_cancelled() && !err.requires_eviction() {
            self.abort_error()
        } else {
            err
        }
    }
}

/// Failure reported when the pool takes a handle back mid-prompt
fn revoked_error() -> AppError {
    AppError::Upstream {
        kind: ErrorKind::SessionFault,
        message: "client pool is shutting down".to_string(),
    }
}

/// Fold the secondary error channel (error JSON returned as text) into the
/// result
fn settle_prompt(result: AppResult<String>) -> AppResult<String> {
    let text = result?;
    match UpstreamFailure::from_payload(&text) {
        Some(failure) => Err(AppError::from(failure)),
        None => Ok(text),
    }
}

/// Translate one update and send its chunks; false if the caller is gone
async fn forward(
    translator: &mut StreamTranslator,
    update: SessionUpdate,
    tx: &mpsc::Sender<StreamMessage>,
) -> bool {
    for chunk in translator.on_update(update) {
        if tx.send(StreamMessage::Chunk(chunk)).await.is_err() {
            return false;
        }
    }
    true
}
