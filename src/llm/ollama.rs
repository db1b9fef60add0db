//! Ollama-style `/api/chat` client.

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::{ModelClient, ModelReply, ToolInvocation};

use serde_json::{Value, json};

/// Talks to a local chat endpoint over HTTP. One request per prompt, no
/// conversation history.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http_client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|error| LlmError::Request(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            http_client,
            base_url: normalize_base_url(&config.base_url),
            model: config.model.clone(),
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }
}

#[async_trait::async_trait]
impl ModelClient for OllamaClient {
    async fn chat(&self, prompt: &str, tools: &[Value]) -> Result<ModelReply, LlmError> {
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "tools": tools,
            "stream": false,
        });

        tracing::debug!(model = %self.model, tools = tools.len(), "sending chat request");

        let response = self
            .http_client
            .post(self.endpoint())
            .json(&body)
            .send()
            .await
            .map_err(|error| LlmError::Request(error.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|error| LlmError::Request(format!("failed to read response body: {error}")))?;

        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "chat endpoint returned an error status");
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        parse_chat_body(&text)
    }
}

fn normalize_base_url(configured: &str) -> String {
    let mut base_url = configured.trim().trim_end_matches('/').to_string();

    if base_url.ends_with("/api") {
        base_url.truncate(base_url.len() - "/api".len());
    } else if base_url.ends_with("/v1") {
        base_url.truncate(base_url.len() - "/v1".len());
    }

    base_url
}

/// Decode a chat response body.
///
/// Servers that ignore `stream: false` answer with one JSON object per line;
/// the text pieces are concatenated and the first tool call wins.
pub(crate) fn parse_chat_body(body: &str) -> Result<ModelReply, LlmError> {
    let chunks = match serde_json::from_str::<Value>(body) {
        Ok(whole) => vec![whole],
        Err(_) => body
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_str::<Value>(line).map_err(|error| {
                    LlmError::InvalidResponse(format!("{error}: {}", truncate(line)))
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
    };

    if chunks.is_empty() {
        return Err(LlmError::InvalidResponse("empty response body".into()));
    }

    let mut content = String::new();
    let mut tool_call = None;

    for chunk in &chunks {
        if let Some(error) = chunk.get("error") {
            let message = error.as_str().map_or_else(|| error.to_string(), str::to_owned);
            return Err(LlmError::Request(message));
        }

        let message = &chunk["message"];
        if let Some(text) = message["content"].as_str() {
            content.push_str(text);
        }

        if tool_call.is_none()
            && let Some(function) = message["tool_calls"]
                .as_array()
                .and_then(|calls| calls.first())
                .map(|call| &call["function"])
        {
            tool_call = Some(ToolInvocation::from_function(function)?);
        }
    }

    Ok(ModelReply {
        content: (!content.is_empty()).then_some(content),
        tool_call,
    })
}

fn truncate(line: &str) -> &str {
    const LIMIT: usize = 200;
    match line.char_indices().nth(LIMIT) {
        Some((index, _)) => &line[..index],
        None => line,
    }
}
