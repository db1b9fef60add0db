//! Prompt to model to worker, one linear pass per prompt.

use crate::Result;
use crate::llm::{ModelClient, tool_manifest};
use crate::worker::WorkerRegistry;

use std::sync::Arc;

/// Returned when the model answers with neither text nor a tool call.
pub const NO_RESPONSE: &str = "No response";

/// Glues the model client to the worker registry. Holds no per-prompt
/// state, so one instance serves every request.
#[derive(Clone)]
pub struct Bridge {
    registry: Arc<WorkerRegistry>,
    model: Arc<dyn ModelClient>,
}

impl Bridge {
    pub fn new(registry: Arc<WorkerRegistry>, model: Arc<dyn ModelClient>) -> Self {
        Self { registry, model }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Ask the model about `prompt`, offering every registered worker as a
    /// tool. A tool call is dispatched and its result returned serialized as
    /// JSON; otherwise the model's text comes back as-is.
    pub async fn handle_prompt(&self, prompt: &str) -> Result<String> {
        let tools = tool_manifest(&self.registry.worker_names());
        let reply = self.model.chat(prompt, &tools).await?;

        if let Some(invocation) = reply.tool_call {
            tracing::info!(
                worker = %invocation.worker,
                method = %invocation.method,
                "model requested a tool call"
            );
            let result = self
                .registry
                .call_tool(&invocation.worker, &invocation.method, &invocation.args)
                .await?;
            return Ok(result.to_string());
        }

        Ok(reply.content.unwrap_or_else(|| NO_RESPONSE.to_owned()))
    }
}
