//! Upstream agent collaborator boundary
//!
//! The gateway never talks to an agent directly. It goes through two traits:
//! - [`AgentConnector`] creates a handle bound to one model and workspace
//! - [`AgentHandle`] runs prompts and pushes [`SessionUpdate`] events into a sink
//!
//! [`acp::AcpProcessConnector`] is the production implementation, speaking ACP
//! JSON-RPC to a child process over stdio.

pub mod acp;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Sender half of the per-prompt update channel
pub type UpdateSink = mpsc::Sender<SessionUpdate>;

/// Options supplied when creating a new upstream handle
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Upstream model identifier
    pub model: String,
    /// Access token from the credential store
    pub api_key: String,
    /// Tenant endpoint URL from the credential store
    pub api_url: String,
    /// Workspace root the session should operate in, if any
    pub workspace_root: Option<PathBuf>,
}

/// Creates upstream agent handles
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Create and connect a new handle
    async fn create(&self, options: CreateOptions) -> Result<Box<dyn AgentHandle>, UpstreamFailure>;
}

/// A live upstream agent session
///
/// Handles are never used by two requests at the same time; the pool enforces
/// exclusive checkout.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    /// Run one prompt to completion and return the final text
    ///
    /// The returned string may itself be a JSON error envelope; callers must
    /// check it with [`UpstreamFailure::from_payload`].
    async fn prompt(&self, text: &str) -> Result<String, UpstreamFailure>;

    /// Install (`Some`) or remove (`None`) the session update sink
    fn set_update_sink(&self, sink: Option<UpdateSink>);

    /// Tear down the session
    async fn close(&self);
}

/// A raw failure reported by the upstream collaborator
///
/// This is the input of the error classifier: free-form message text plus an
/// optional numeric status and an optional error name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFailure {
    pub message: String,
    pub status: Option<u16>,
    pub name: Option<String>,
}

/// Error name used for locally triggered aborts
pub const ABORT_ERROR_NAME: &str = "AbortError";

impl UpstreamFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            name: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// A failure representing a caller-initiated abort or deadline
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(message).with_name(ABORT_ERROR_NAME)
    }

    /// Detect an error encoded inside an otherwise successful prompt result
    ///
    /// Returns `Some` when `payload` is a JSON object carrying an `error` field.
    /// Both `{"error": "text"}` and `{"error": {"message": ..., "status": ...}}`
    /// shapes are recognised.
    pub fn from_payload(payload: &str) -> Option<Self> {
        let trimmed = payload.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        let value: Value = serde_json::from_str(trimmed).ok()?;
        let error = value.get("error")?;

        let failure = match error {
            Value::String(message) => Self::new(message.clone()),
            Value::Object(fields) => {
                let message = fields
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                let status = ["status", "statusCode", "code"]
                    .iter()
                    .filter_map(|key| fields.get(*key))
                    .find_map(Value::as_u64)
                    .and_then(|code| u16::try_from(code).ok());
                let name = fields
                    .get("name")
                    .or_else(|| fields.get("type"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Self {
                    message,
                    status,
                    name,
                }
            }
            Value::Null => return None,
            other => Self::new(other.to_string()),
        };
        Some(failure)
    }
}

impl std::fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {})", self.message, status),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for UpstreamFailure {}

/// A content block inside a message or thought chunk
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Unsupported,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Text payload, if this is a text block
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Unsupported => None,
        }
    }
}

/// One ACP `session/update` event
///
/// Decoded from the `update` object of the notification, discriminated by its
/// `sessionUpdate` field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    UserMessageChunk {
        content: ContentBlock,
    },
    AgentMessageChunk {
        content: ContentBlock,
    },
    AgentThoughtChunk {
        content: ContentBlock,
    },
    ToolCall {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        status: Option<String>,
    },
    ToolCallUpdate {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(default)]
        status: Option<String>,
    },
    Plan {
        #[serde(default)]
        entries: Vec<Value>,
    },
    AvailableCommandsUpdate {
        #[serde(default, rename = "availableCommands")]
        available_commands: Vec<Value>,
    },
    CurrentModeUpdate {
        #[serde(rename = "currentModeId")]
        current_mode_id: String,
    },
    #[serde(other)]
    Unknown,
}

impl SessionUpdate {
    pub fn agent_text(text: impl Into<String>) -> Self {
        Self::AgentMessageChunk {
            content: ContentBlock::text(text),
        }
    }

    pub fn agent_thought(text: impl Into<String>) -> Self {
        Self::AgentThoughtChunk {
            content: ContentBlock::text(text),
        }
    }

    /// Decode an update, mapping anything malformed to [`SessionUpdate::Unknown`]
    pub fn from_value(update: &Value) -> Self {
        match Self::deserialize(update) {
            Ok(update) => update,
            Err(e) => {
                let kind = update
                    .get("sessionUpdate")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("");
                tracing::debug!(
                    error = %e,
                    kind,
                    "Malformed session update, treating as unknown"
                );
                Self::Unknown
            }
        }
    }

    /// Short label used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserMessageChunk { .. } => "user_message_chunk",
            Self::AgentMessageChunk { .. } => "agent_message_chunk",
            Self::AgentThoughtChunk { .. } => "agent_thought_chunk",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolCallUpdate { .. } => "tool_call_update",
            Self::Plan { .. } => "plan",
            Self::AvailableCommandsUpdate { .. } => "available_commands_update",
            Self::CurrentModeUpdate { .. } => "current_mode_update",
            Self::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decodes_agent_message_chunk() {
        let update = SessionUpdate::from_value(&json!({
            "sessionUpdate": "agent_message_chunk",
            "content": {"type": "text", "text": "hi"}
        }));
        assert_eq!(update, SessionUpdate::agent_text("hi"));
    }

    #[test]
    fn test_decodes_tool_call_with_camel_case_id() {
        let update = SessionUpdate::from_value(&json!({
            "sessionUpdate": "tool_call",
            "toolCallId": "call_1",
            "title": "Read file",
            "status": "pending"
        }));
        assert!(matches!(
            update,
            SessionUpdate::ToolCall { ref tool_call_id, .. } if tool_call_id == "call_1"
        ));
    }

    #[test]
    fn test_unknown_kind_decodes_to_unknown() {
        let update = SessionUpdate::from_value(&json!({"sessionUpdate": "brand_new_kind"}));
        assert_eq!(update, SessionUpdate::Unknown);
    }

    #[test]
    fn test_malformed_known_kind_decodes_to_unknown() {
        let update = SessionUpdate::from_value(&json!({"sessionUpdate": "agent_message_chunk"}));
        assert_eq!(update, SessionUpdate::Unknown);
    }

    #[test]
    fn test_non_text_content_block() {
        let update = SessionUpdate::from_value(&json!({
            "sessionUpdate": "agent_message_chunk",
            "content": {"type": "image", "data": "..."}
        }));
        match update {
            SessionUpdate::AgentMessageChunk { content } => assert_eq!(content.as_text(), None),
            other => panic!("unexpected update {:?}", other),
        }
    }

    #[test]
    fn test_payload_error_object() {
        let failure =
            UpstreamFailure::from_payload(r#"{"error": {"message": "rate limit hit", "status": 429}}"#)
                .expect("should detect error payload");
        assert_eq!(failure.message, "rate limit hit");
        assert_eq!(failure.status, Some(429));
    }

    #[test]
    fn test_payload_error_string() {
        let failure = UpstreamFailure::from_payload(r#"  {"error": "session expired"}"#)
            .expect("should detect error payload");
        assert_eq!(failure.message, "session expired");
        assert_eq!(failure.status, None);
    }

    #[test]
    fn test_payload_plain_text_is_not_error() {
        assert!(UpstreamFailure::from_payload("The error was in line 3").is_none());
        assert!(UpstreamFailure::from_payload(r#"{"result": "ok"}"#).is_none());
        assert!(UpstreamFailure::from_payload(r#"{"error": null}"#).is_none());
        assert!(UpstreamFailure::from_payload("{not json").is_none());
    }

    #[test]
    fn test_aborted_failure_is_named() {
        let failure = UpstreamFailure::aborted("client went away");
        assert_eq!(failure.name.as_deref(), Some(ABORT_ERROR_NAME));
    }
}
