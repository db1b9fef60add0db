//! Model client seam: one chat turn with a tool manifest attached.

pub mod manifest;
pub mod ollama;

pub use manifest::{ToolInvocation, tool_manifest};
pub use ollama::OllamaClient;

use crate::error::LlmError;

use serde_json::Value;

/// What the model answered for one prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    /// Plain text answer, `None` when the model produced no text.
    pub content: Option<String>,
    /// First tool the model asked to run, if any.
    pub tool_call: Option<ToolInvocation>,
}

impl ModelReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_call: None,
        }
    }

    pub fn tool(invocation: ToolInvocation) -> Self {
        Self {
            content: None,
            tool_call: Some(invocation),
        }
    }
}

/// A chat endpoint that can be offered function tools.
#[async_trait::async_trait]
pub trait ModelClient: Send + Sync {
    /// Send `prompt` as a single user message together with `tools`.
    async fn chat(&self, prompt: &str, tools: &[Value]) -> Result<ModelReply, LlmError>;
}
