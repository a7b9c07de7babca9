//! Completion API plumbing: rate limiting, connection health, SSE
//! decoding, and the request executor.

pub mod executor;
pub mod health;
pub mod rate;
pub mod sse;

pub use executor::CompletionExecutor;
pub use health::{ConnectionHealth, ConnectionStatus};
pub use rate::RateController;

use crate::MessageId;
use crate::config::LlmConfig;

/// Role tag for one prompt block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptRole {
    System,
    User,
}

/// One ordered block of the prompt context.
#[derive(Debug, Clone)]
pub struct PromptBlock {
    pub role: PromptRole,
    pub text: String,
}

impl PromptBlock {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: PromptRole::System,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            text: text.into(),
        }
    }
}

/// An image reference riding along in the user content.
#[derive(Debug, Clone)]
pub struct ImagePart {
    pub url: String,
    pub detail: String,
}

impl ImagePart {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            detail: "auto".to_string(),
        }
    }
}

/// A tool the model may call. `parameters` is a JSON-schema object.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Immutable description of one completion request.
///
/// The token budget is checked against the whole block list before
/// submission; an over-budget job is rejected outright, never trimmed
/// mid-request.
#[derive(Debug, Clone)]
pub struct RequestJob {
    /// The triggering message id; doubles as the dispatch task id.
    pub job_id: MessageId,
    pub blocks: Vec<PromptBlock>,
    pub images: Vec<ImagePart>,
    pub tools: Vec<ToolDefinition>,
    pub model: String,
    pub max_completion_tokens: u32,
    pub temperature: f32,
}

impl RequestJob {
    pub fn new(job_id: MessageId, blocks: Vec<PromptBlock>, config: &LlmConfig) -> Self {
        Self {
            job_id,
            blocks,
            images: Vec::new(),
            tools: Vec::new(),
            model: config.model.clone(),
            max_completion_tokens: config.max_completion_tokens,
            temperature: config.temperature,
        }
    }

    pub fn with_images(mut self, images: Vec<ImagePart>) -> Self {
        self.images = images;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// All prompt text, for token estimation.
    pub fn text_sections(&self) -> impl Iterator<Item = &str> {
        self.blocks.iter().map(|block| block.text.as_str())
    }
}

/// A tool call the model asked for in a non-streaming completion.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Full result of the non-streaming completion variant.
#[derive(Debug, Clone, Default)]
pub struct ToolCompletion {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}
