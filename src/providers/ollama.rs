//! Local Ollama adapter.
//!
//! Talks to the Ollama HTTP API (`/api/chat`). Availability is probed live
//! against `/api/tags`; local inference is free, so no credential handling.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{ChatInvocation, ChatOutcome, ProviderAdapter};
use crate::error::ProviderError;
use crate::request::{ChatMessage, ProviderSpecificOpts, TokenUsage, ToolCallRequest};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct OllamaAdapter {
    base_url: String,
    client: Client,
    default_model: String,
}

impl OllamaAdapter {
    pub fn new(base_url: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
            default_model: default_model.into(),
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn id(&self) -> &str {
        "ollama"
    }

    async fn chat(&self, invocation: ChatInvocation) -> Result<ChatOutcome, ProviderError> {
        let model = invocation
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let tools: Vec<OllamaTool> = invocation
            .tools
            .iter()
            .map(|t| OllamaTool {
                tool_type: "function".to_string(),
                function: OllamaFunctionDef {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect();

        let (keep_alive, num_ctx) = match &invocation.provider_opts {
            Some(ProviderSpecificOpts::Ollama {
                keep_alive,
                num_ctx,
            }) => (keep_alive.clone(), *num_ctx),
            _ => (None, None),
        };

        let request = OllamaChatRequest {
            model: model.clone(),
            messages: invocation.messages.clone(),
            stream: false,
            options: OllamaOptions {
                temperature: invocation.sampling.temperature,
                top_p: invocation.sampling.top_p,
                num_predict: invocation.sampling.max_tokens,
                num_ctx,
            },
            keep_alive,
            tools: if tools.is_empty() { None } else { Some(tools) },
        };

        tracing::debug!(model = %model, "Sending request to Ollama");

        let response = self
            .client
            .post(self.chat_url())
            .timeout(invocation.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::timeout(invocation.timeout)
                } else {
                    ProviderError::transport(format!("ollama request failed: {}", e))
                }
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), &body, None));
        }

        let parsed: OllamaChatResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::parse(format!("ollama response: {}", e)))?;

        let tool_calls: Vec<ToolCallRequest> = parsed
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(i, tc)| ToolCallRequest {
                id: format!("ollama-call-{}", i),
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        Ok(ChatOutcome {
            content: parsed.message.content,
            model: parsed.model.unwrap_or(model),
            usage: TokenUsage::new(
                parsed.prompt_eval_count.unwrap_or(0),
                parsed.eval_count.unwrap_or(0),
            ),
            used_native_tools: !tool_calls.is_empty(),
            tool_calls,
            metadata: None,
        })
    }

    async fn is_available(&self, _user_id: Option<&str>) -> bool {
        self.probe().await.is_ok()
    }

    fn supports_probe(&self) -> bool {
        true
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        let response = self
            .client
            .get(self.tags_url())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderError::transport(format!("ollama unreachable: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::transport(format!(
                "ollama ping returned HTTP {}",
                response.status().as_u16()
            )))
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OllamaTool>>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u32>,
}

#[derive(Debug, Serialize)]
struct OllamaTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OllamaFunctionDef,
}

#[derive(Debug, Serialize)]
struct OllamaFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Option<Vec<OllamaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OllamaFunctionCall {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_stripped() {
        let adapter = OllamaAdapter::new("http://127.0.0.1:11434/", "qwen3:8b");
        assert_eq!(adapter.chat_url(), "http://127.0.0.1:11434/api/chat");
        assert_eq!(adapter.tags_url(), "http://127.0.0.1:11434/api/tags");
    }

    #[test]
    fn test_response_parsing() {
        let raw = r#"{
            "model": "qwen3:8b",
            "message": {"role": "assistant", "content": "hello there"},
            "prompt_eval_count": 12,
            "eval_count": 7
        }"#;
        let parsed: OllamaChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.message.content, "hello there");
        assert_eq!(parsed.prompt_eval_count, Some(12));
    }

    #[test]
    fn test_tool_call_parsing() {
        let raw = r#"{
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{"function": {"name": "search", "arguments": {"q": "rust"}}}]
            }
        }"#;
        let parsed: OllamaChatResponse = serde_json::from_str(raw).unwrap();
        let calls = parsed.message.tool_calls.unwrap();
        assert_eq!(calls[0].function.name, "search");
    }
}
