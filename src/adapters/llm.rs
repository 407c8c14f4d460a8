//! Model-adapter contract: streaming-free request/response with usage
//! accounting and HTTP-style error classification.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Aggregate token usage for one request or one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

impl TokenUsage {
    /// Input plus output tokens; the number budgets are tracked against.
    pub fn total(&self) -> u64 {
        self.input + self.output
    }

    /// Accumulate another usage record.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
    }
}

/// One block of a structured system prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemBlock {
    pub text: String,
    #[serde(default)]
    pub cacheable: bool,
}

/// System prompt: plain text or cache-aware blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

impl SystemPrompt {
    /// Flatten to plain text for adapters without block support.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }
}

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// One model request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Name of the sub-agent issuing the request ("coding-agent", ...).
    /// Adapters may use it for model routing; mocks script against it.
    pub agent: String,
    pub system: SystemPrompt,
    pub messages: Vec<Message>,
    /// Tool names the agent may call.
    pub tools: Vec<String>,
    pub model: String,
    pub timeout_ms: u64,
}

/// One model response.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// HTTP-style error classification surfaced by adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmErrorKind {
    Auth,
    RateLimit,
    ContextOverflow,
    Server,
    Transient,
    BadRequest,
    Unknown,
}

impl LlmErrorKind {
    /// Kinds that map to a transient retry.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimit | Self::Server | Self::Transient)
    }
}

/// Adapter error with classification.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Context overflow asks the caller to compact and retry once.
    pub fn is_context_overflow(&self) -> bool {
        self.kind == LlmErrorKind::ContextOverflow
    }

    /// Authentication failures abort the whole turn.
    pub fn is_fatal(&self) -> bool {
        self.kind == LlmErrorKind::Auth
    }
}

/// Provider-neutral model adapter.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    async fn request(
        &self,
        request: LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, LlmError>;
}
