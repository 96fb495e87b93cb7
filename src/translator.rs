//! Session update translation
//!
//! [`StreamTranslator`] turns the ordered session updates of one prompt into
//! OpenAI streaming chunks. [`ResponseCollector`] collapses the same updates
//! into the final text of a non-streaming response.
//!
//! Reasoning that arrives before any answer text is buffered and flushed as
//! a single reasoning delta right before the first content delta. Reasoning
//! that arrives after content has started is forwarded immediately.

use crate::agent::{ContentBlock, SessionUpdate};
use crate::handlers::openai::types::{ChatCompletionChunk, Delta};
use std::collections::HashMap;

/// Per-response streaming state
#[derive(Debug)]
pub struct StreamTranslator {
    id: String,
    model: String,
    created: i64,
    pending_reasoning: Vec<String>,
    content_started: bool,
    role_sent: bool,
    tool_indices: HashMap<String, u32>,
    emitted: usize,
    finished: bool,
}

impl StreamTranslator {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            pending_reasoning: Vec::new(),
            content_started: false,
            role_sent: false,
            tool_indices: HashMap::new(),
            emitted: 0,
            finished: false,
        }
    }

    /// Identifier carried by every chunk of this response
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether any content delta has been produced
    pub fn content_started(&self) -> bool {
        self.content_started
    }

    /// Number of chunks produced so far
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Index assigned to a tool call id, if it has been seen
    pub fn tool_index(&self, tool_call_id: &str) -> Option<u32> {
        self.tool_indices.get(tool_call_id).copied()
    }

    /// Translate one update into zero or more chunks, in order
    pub fn on_update(&mut self, update: SessionUpdate) -> Vec<ChatCompletionChunk> {
        if self.finished {
            tracing::debug!(kind = update.kind(), "Update after stream finished, ignoring");
            return Vec::new();
        }

        match update {
            SessionUpdate::AgentMessageChunk { content } => match text_of(&content) {
                Some(text) => {
                    let mut chunks = Vec::with_capacity(2);
                    if let Some(reasoning) = self.take_reasoning() {
                        chunks.push(self.chunk(Delta::reasoning(reasoning)));
                    }
                    self.content_started = true;
                    chunks.push(self.chunk(Delta::content(text)));
                    chunks
                }
                None => Vec::new(),
            },
            SessionUpdate::AgentThoughtChunk { content } => match text_of(&content) {
                Some(text) if self.content_started => vec![self.chunk(Delta::reasoning(text))],
                Some(text) => {
                    self.pending_reasoning.push(text.to_string());
                    Vec::new()
                }
                None => Vec::new(),
            },
            SessionUpdate::ToolCall {
                tool_call_id,
                title,
                status,
            } => {
                let index = self.index_for(&tool_call_id);
                tracing::debug!(
                    tool_call_id = %tool_call_id,
                    index = index,
                    title = title.as_deref().unwrap_or(""),
                    status = status.as_deref().unwrap_or(""),
                    "Upstream tool call started"
                );
                Vec::new()
            }
            SessionUpdate::ToolCallUpdate {
                tool_call_id,
                status,
            } => {
                let index = self.index_for(&tool_call_id);
                tracing::debug!(
                    tool_call_id = %tool_call_id,
                    index = index,
                    status = status.as_deref().unwrap_or(""),
                    "Upstream tool call updated"
                );
                Vec::new()
            }
            other => {
                tracing::debug!(kind = other.kind(), "Session update not forwarded");
                Vec::new()
            }
        }
    }

    /// Drop per-attempt state before the prompt is replayed
    ///
    /// Only valid while nothing has been emitted; the response id is kept.
    pub fn reset(&mut self) {
        debug_assert_eq!(self.emitted, 0, "reset after output was emitted");
        self.pending_reasoning.clear();
        self.content_started = false;
        self.role_sent = false;
        self.tool_indices.clear();
    }

    /// Flush buffered reasoning and emit the terminal `stop` chunk
    ///
    /// Idempotent: a second call produces nothing.
    pub fn finish(&mut self) -> Vec<ChatCompletionChunk> {
        if self.finished {
            return Vec::new();
        }
        let mut chunks = Vec::with_capacity(2);
        if let Some(reasoning) = self.take_reasoning() {
            chunks.push(self.chunk(Delta::reasoning(reasoning)));
        }
        chunks.push(ChatCompletionChunk::finish(&self.id, &self.model, self.created));
        self.emitted += 1;
        self.finished = true;
        chunks
    }

    fn take_reasoning(&mut self) -> Option<String> {
        if self.pending_reasoning.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending_reasoning).concat())
    }

    fn chunk(&mut self, mut delta: Delta) -> ChatCompletionChunk {
        if !self.role_sent {
            delta.role = Some("assistant".to_string());
            self.role_sent = true;
        }
        self.emitted += 1;
        ChatCompletionChunk::delta(&self.id, &self.model, self.created, delta)
    }

    fn index_for(&mut self, tool_call_id: &str) -> u32 {
        let next = self.tool_indices.len() as u32;
        *self
            .tool_indices
            .entry(tool_call_id.to_string())
            .or_insert(next)
    }
}

/// Non-empty text payload of a content block
fn text_of(content: &ContentBlock) -> Option<&str> {
    match content.as_text() {
        Some(text) if !text.is_empty() => Some(text),
        Some(_) => None,
        None => {
            tracing::debug!("Non-text content block skipped");
            None
        }
    }
}

/// Accumulates agent text for a non-streaming response
#[derive(Debug, Default)]
pub struct ResponseCollector {
    text: String,
    chunks: usize,
}

impl ResponseCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep agent text; drop everything else
    pub fn on_update(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::AgentMessageChunk { content } => {
                if let Some(text) = content.as_text() {
                    self.text.push_str(text);
                    self.chunks += 1;
                }
            }
            other => {
                tracing::debug!(kind = other.kind(), "Session update not collected");
            }
        }
    }

    /// Whether any agent text chunk was received
    pub fn received_text(&self) -> bool {
        self.chunks > 0
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> StreamTranslator {
        StreamTranslator::new("chatcmpl-test", "sonnet", 1_700_000_000)
    }

    fn feed(translator: &mut StreamTranslator, updates: Vec<SessionUpdate>) -> Vec<ChatCompletionChunk> {
        updates
            .into_iter()
            .flat_map(|u| translator.on_update(u))
            .collect()
    }

    fn delta(chunk: &ChatCompletionChunk) -> &Delta {
        chunk.first_delta().unwrap()
    }

    #[test]
    fn test_reasoning_buffered_until_content() {
        let mut t = translator();
        let chunks = feed(
            &mut t,
            vec![
                SessionUpdate::agent_thought("a"),
                SessionUpdate::agent_thought("b"),
                SessionUpdate::agent_text("c"),
                SessionUpdate::agent_thought("d"),
            ],
        );

        assert_eq!(chunks.len(), 3);
        assert_eq!(delta(&chunks[0]).reasoning_content.as_deref(), Some("ab"));
        assert_eq!(delta(&chunks[0]).content, None);
        assert_eq!(delta(&chunks[1]).content.as_deref(), Some("c"));
        assert_eq!(delta(&chunks[2]).reasoning_content.as_deref(), Some("d"));
    }

    #[test]
    fn test_first_chunk_carries_role_only_once() {
        let mut t = translator();
        let chunks = feed(
            &mut t,
            vec![SessionUpdate::agent_text("Hel"), SessionUpdate::agent_text("lo")],
        );
        assert_eq!(delta(&chunks[0]).role.as_deref(), Some("assistant"));
        assert_eq!(delta(&chunks[1]).role, None);
    }

    #[test]
    fn test_finish_flushes_pending_reasoning() {
        let mut t = translator();
        assert!(t.on_update(SessionUpdate::agent_thought("thinking")).is_empty());

        let chunks = t.finish();
        assert_eq!(chunks.len(), 2);
        assert_eq!(delta(&chunks[0]).reasoning_content.as_deref(), Some("thinking"));
        assert!(chunks[1].is_finish());
        assert!(t.finish().is_empty());
    }

    #[test]
    fn test_all_chunks_share_id() {
        let mut t = translator();
        let mut chunks = feed(
            &mut t,
            vec![SessionUpdate::agent_thought("x"), SessionUpdate::agent_text("y")],
        );
        chunks.extend(t.finish());
        assert!(chunks.iter().all(|c| c.id == "chatcmpl-test"));
        assert_eq!(t.emitted(), chunks.len());
    }

    #[test]
    fn test_tool_and_metadata_events_not_forwarded() {
        let mut t = translator();
        let chunks = feed(
            &mut t,
            vec![
                SessionUpdate::ToolCall {
                    tool_call_id: "call_a".to_string(),
                    title: Some("Read".to_string()),
                    status: Some("pending".to_string()),
                },
                SessionUpdate::ToolCallUpdate {
                    tool_call_id: "call_a".to_string(),
                    status: Some("completed".to_string()),
                },
                SessionUpdate::ToolCall {
                    tool_call_id: "call_b".to_string(),
                    title: None,
                    status: None,
                },
                SessionUpdate::Plan { entries: vec![] },
                SessionUpdate::CurrentModeUpdate {
                    current_mode_id: "code".to_string(),
                },
                SessionUpdate::UserMessageChunk {
                    content: ContentBlock::text("echo"),
                },
                SessionUpdate::Unknown,
            ],
        );
        assert!(chunks.is_empty());
        assert_eq!(t.tool_index("call_a"), Some(0));
        assert_eq!(t.tool_index("call_b"), Some(1));
        assert!(!t.content_started());
    }

    #[test]
    fn test_reset_drops_buffered_reasoning_and_tool_indices() {
        let mut t = translator();
        feed(
            &mut t,
            vec![
                SessionUpdate::agent_thought("stale"),
                SessionUpdate::ToolCall {
                    tool_call_id: "call_a".to_string(),
                    title: None,
                    status: None,
                },
            ],
        );
        assert_eq!(t.emitted(), 0);

        t.reset();
        assert_eq!(t.tool_index("call_a"), None);
        let chunks = feed(
            &mut t,
            vec![SessionUpdate::agent_thought("fresh"), SessionUpdate::agent_text("c")],
        );
        assert_eq!(delta(&chunks[0]).reasoning_content.as_deref(), Some("fresh"));
        assert_eq!(delta(&chunks[0]).role.as_deref(), Some("assistant"));
        assert_eq!(chunks[0].id, "chatcmpl-test");
    }

    #[test]
    fn test_updates_after_finish_ignored() {
        let mut t = translator();
        t.finish();
        assert!(t.on_update(SessionUpdate::agent_text("late")).is_empty());
    }

    #[test]
    fn test_collector_keeps_only_agent_text() {
        let mut collector = ResponseCollector::new();
        collector.on_update(SessionUpdate::agent_thought("hmm"));
        collector.on_update(SessionUpdate::agent_text("Hello"));
        collector.on_update(SessionUpdate::UserMessageChunk {
            content: ContentBlock::text("echo"),
        });
        collector.on_update(SessionUpdate::agent_text(", world"));

        assert!(collector.received_text());
        assert_eq!(collector.into_text(), "Hello, world");
    }

    #[test]
    fn test_collector_empty_by_default() {
        let collector = ResponseCollector::new();
        assert!(!collector.received_text());
        assert_eq!(collector.text(), "");
    }
}
