//! OpenAI-compatible request and response types
//!
//! These types follow the OpenAI Chat Completions API. Requests are validated
//! from a raw JSON value so every rejection can name the offending parameter.

use crate::config::ModelConfig;
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// OpenAI API Object Type Constants
// =============================================================================

/// Object type for non-streaming chat completion responses
pub const OBJECT_CHAT_COMPLETION: &str = "chat.completion";
/// Object type for streaming chat completion chunks
pub const OBJECT_CHAT_COMPLETION_CHUNK: &str = "chat.completion.chunk";
/// Object type for list responses (e.g., model list)
pub const OBJECT_LIST: &str = "list";
/// Object type for individual model entries
pub const OBJECT_MODEL: &str = "model";
/// Owner reported for catalog models
pub const MODEL_OWNER: &str = "acp-gateway";

// =============================================================================
// Message Types
// =============================================================================

/// Message role in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
    Function,
}

impl MessageRole {
    fn parse(role: &str) -> Option<Self> {
        match role {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            "function" => Some(Self::Function),
            _ => None,
        }
    }

    /// Label used when rendering a transcript
    pub fn label(self) -> &'static str {
        match self {
            Self::System => "System",
            Self::User => "User",
            Self::Assistant => "Assistant",
            Self::Tool => "Tool",
            Self::Function => "Function",
        }
    }

    /// Roles whose content may be null or empty
    fn allows_empty_content(self) -> bool {
        matches!(self, Self::Assistant | Self::Tool | Self::Function)
    }
}

/// A single message in the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    role: MessageRole,
    content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn role(&self) -> MessageRole {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Content length in characters (Unicode-aware)
    pub fn content_length(&self) -> usize {
        self.content.chars().count()
    }

    fn from_value(index: usize, value: &Value) -> AppResult<Self> {
        let fields = value.as_object().ok_or_else(|| {
            AppError::invalid_param(
                format!("messages[{}] must be an object", index),
                format!("messages[{}]", index),
            )
        })?;

        let role_param = format!("messages[{}].role", index);
        let role = match fields.get("role") {
            Some(Value::String(role)) => MessageRole::parse(role).ok_or_else(|| {
                AppError::invalid_param(
                    format!(
                        "messages[{}].role '{}' is not one of system, user, assistant, tool, function",
                        index, role
                    ),
                    role_param.clone(),
                )
            })?,
            Some(_) => {
                return Err(AppError::invalid_param(
                    format!("messages[{}].role must be a string", index),
                    role_param,
                ));
            }
            None => {
                return Err(AppError::invalid_param(
                    format!("messages[{}].role is required", index),
                    role_param,
                ));
            }
        };

        let content_param = format!("messages[{}].content", index);
        let content = match fields.get("content") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(parts)) => text_from_parts(index, parts)?,
            None | Some(Value::Null) if role.allows_empty_content() => String::new(),
            None | Some(Value::Null) => {
                return Err(AppError::invalid_param(
                    format!("messages[{}].content is required for {} messages", index, role.label().to_lowercase()),
                    content_param,
                ));
            }
            Some(_) => {
                return Err(AppError::invalid_param(
                    format!("messages[{}].content must be a string or an array of text parts", index),
                    content_param,
                ));
            }
        };

        if content.trim().is_empty() && !role.allows_empty_content() {
            return Err(AppError::invalid_param(
                format!("messages[{}].content cannot be empty for {} messages", index, role.label().to_lowercase()),
                content_param,
            ));
        }

        Ok(Self { role, content })
    }
}

/// Join `[{type: "text", text}]` parts; any other part type is rejected
fn text_from_parts(index: usize, parts: &[Value]) -> AppResult<String> {
    let param = format!("messages[{}].content", index);
    let mut texts = Vec::with_capacity(parts.len());
    for part in parts {
        let kind = part.get("type").and_then(Value::as_str);
        match (kind, part.get("text").and_then(Value::as_str)) {
            (Some("text"), Some(text)) => texts.push(text),
            (Some("text"), None) => {
                return Err(AppError::invalid_param(
                    format!("messages[{}].content text part is missing 'text'", index),
                    param,
                ));
            }
            (Some(other), _) => {
                return Err(AppError::invalid_param(
                    format!(
                        "messages[{}].content part type '{}' is not supported; only text is accepted",
                        index, other
                    ),
                    param,
                ));
            }
            (None, _) => {
                return Err(AppError::invalid_param(
                    format!("messages[{}].content parts must carry a 'type'", index),
                    param,
                ));
            }
        }
    }
    Ok(texts.join("\n"))
}

// =============================================================================
// Chat Completion Request
// =============================================================================

/// OpenAI-compatible chat completion request
///
/// Only `model`, `messages` and `stream` are interpreted; other OpenAI fields
/// are accepted and ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatCompletionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<ChatMessage>,
    stream: bool,
}

impl ChatCompletionRequest {
    pub fn new(model: Option<String>, messages: Vec<ChatMessage>, stream: bool) -> Self {
        Self {
            model,
            messages,
            stream,
        }
    }

    /// Validate a raw JSON body
    ///
    /// # Errors
    /// Returns a validation error naming the offending parameter when the
    /// body is not an object, `messages` is missing, empty or malformed, a
    /// message has an unknown role or non-text content, or `model`/`stream`
    /// have the wrong type.
    pub fn from_value(body: &Value) -> AppResult<Self> {
        let fields = body
            .as_object()
            .ok_or_else(|| AppError::validation("request body must be a JSON object"))?;

        let model = match fields.get("model") {
            None | Some(Value::Null) => None,
            Some(Value::String(model)) if model.trim().is_empty() => None,
            Some(Value::String(model)) => Some(model.clone()),
            Some(_) => return Err(AppError::invalid_param("model must be a string", "model")),
        };

        let stream = match fields.get("stream") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(stream)) => *stream,
            Some(_) => return Err(AppError::invalid_param("stream must be a boolean", "stream")),
        };

        let messages = match fields.get("messages") {
            Some(Value::Array(messages)) if messages.is_empty() => {
                return Err(AppError::invalid_param(
                    "messages must contain at least one message",
                    "messages",
                ));
            }
            Some(Value::Array(messages)) => messages
                .iter()
                .enumerate()
                .map(|(index, message)| ChatMessage::from_value(index, message))
                .collect::<AppResult<Vec<_>>>()?,
            Some(_) => return Err(AppError::invalid_param("messages must be an array", "messages")),
            None => return Err(AppError::invalid_param("messages is required", "messages")),
        };

        Ok(Self {
            model,
            messages,
            stream,
        })
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn stream(&self) -> bool {
        self.stream
    }

    /// Render the conversation as one prompt
    ///
    /// A lone user message is forwarded verbatim. Anything else becomes
    /// `"<Role>: <content>"` blocks separated by blank lines.
    pub fn to_prompt_string(&self) -> String {
        if let [only] = self.messages.as_slice()
            && only.role == MessageRole::User
        {
            return only.content.clone();
        }

        self.messages
            .iter()
            .filter(|m| !m.content.is_empty())
            .map(|m| format!("{}: {}", m.role.label(), m.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Content of system messages, in order
    pub fn system_contents(&self) -> impl Iterator<Item = &str> {
        self.messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(ChatMessage::content)
    }
}

// =============================================================================
// Chat Completion Response (Non-Streaming)
// =============================================================================

/// Finish reason for a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
}

/// Usage statistics for a chat completion response.
///
/// Fields are private so `total_tokens` always equals
/// `prompt_tokens + completion_tokens`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl Usage {
    #[inline]
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Estimate usage from character counts at ~4 chars/token.
    pub fn estimate(prompt_chars: usize, completion_chars: usize) -> Self {
        let to_tokens = |chars: usize| u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX);
        Self::new(to_tokens(prompt_chars), to_tokens(completion_chars))
    }

    #[inline]
    pub fn prompt_tokens(&self) -> u32 {
        self.prompt_tokens
    }

    #[inline]
    pub fn completion_tokens(&self) -> u32 {
        self.completion_tokens
    }

    #[inline]
    pub fn total_tokens(&self) -> u32 {
        self.total_tokens
    }
}

/// Assistant message in response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: MessageRole,
    pub content: String,
}

impl AssistantMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// A single choice in the response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: FinishReason,
}

/// OpenAI-compatible chat completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl ChatCompletion {
    pub fn new(id: String, content: String, model: String, prompt_chars: usize, created: i64) -> Self {
        let completion_chars = content.chars().count();
        Self {
            id,
            object: OBJECT_CHAT_COMPLETION.to_string(),
            created,
            model,
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage::new(content),
                finish_reason: FinishReason::Stop,
            }],
            usage: Usage::estimate(prompt_chars, completion_chars),
        }
    }
}

/// Fresh completion identifier shared by every chunk of one response
pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

/// Current Unix timestamp; 0 if the system clock is before the epoch
pub fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_else(|e| {
            tracing::warn!(
                error = %e,
                "System clock appears to be before UNIX epoch - using 0 as timestamp"
            );
            0
        })
}

// =============================================================================
// Chat Completion Chunk (Streaming)
// =============================================================================

/// Delta content in a streaming chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl Delta {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            reasoning_content: Some(text.into()),
            ..Self::default()
        }
    }
}

/// A single choice in a streaming chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<FinishReason>,
}

/// OpenAI-compatible streaming chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    /// Chunk carrying one delta
    pub fn delta(id: &str, model: &str, created: i64, delta: Delta) -> Self {
        Self {
            id: id.to_string(),
            object: OBJECT_CHAT_COMPLETION_CHUNK.to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: None,
            }],
        }
    }

    /// Terminal chunk with an empty delta and `finish_reason: "stop"`
    pub fn finish(id: &str, model: &str, created: i64) -> Self {
        Self {
            id: id.to_string(),
            object: OBJECT_CHAT_COMPLETION_CHUNK.to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta::default(),
                finish_reason: Some(FinishReason::Stop),
            }],
        }
    }

    /// The single choice's delta
    pub fn first_delta(&self) -> Option<&Delta> {
        self.choices.first().map(|c| &c.delta)
    }

    pub fn is_finish(&self) -> bool {
        self.choices
            .first()
            .is_some_and(|c| c.finish_reason == Some(FinishReason::Stop))
    }
}

// =============================================================================
// Models List Response
// =============================================================================

/// A model object for the models endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelObject {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    pub name: String,
    pub context_length: u64,
    pub max_output_tokens: u64,
}

impl From<&ModelConfig> for ModelObject {
    fn from(model: &ModelConfig) -> Self {
        Self {
            id: model.id().to_string(),
            object: OBJECT_MODEL.to_string(),
            created: 0,
            owned_by: MODEL_OWNER.to_string(),
            name: model.display_name().to_string(),
            context_length: model.context_tokens(),
            max_output_tokens: model.max_output_tokens(),
        }
    }
}

/// Response for GET /v1/models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsListResponse {
    pub object: String,
    pub data: Vec<ModelObject>,
}

impl ModelsListResponse {
    pub fn new(models: Vec<ModelObject>) -> Self {
        Self {
            object: OBJECT_LIST.to_string(),
            data: models,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
