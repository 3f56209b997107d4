//! OpenRouter gateway adapter.
//!
//! Per-user API keys come from the settings store, with an optional
//! process-wide fallback key. Rate-limit responses carry the parsed
//! Retry-After duration on the error so the executor can log it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{ChatInvocation, ChatOutcome, ProviderAdapter};
use crate::error::ProviderError;
use crate::request::{ChatMessage, ProviderSpecificOpts, TokenUsage, ToolCallRequest};
use crate::settings::SettingsStore;

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

pub struct OpenRouterAdapter {
    client: Client,
    settings: Arc<dyn SettingsStore>,
    /// Process-wide fallback key used when the user has none on file
    fallback_api_key: Option<String>,
    default_model: String,
}

impl OpenRouterAdapter {
    pub fn new(settings: Arc<dyn SettingsStore>, fallback_api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            settings,
            fallback_api_key,
            default_model: "meta-llama/llama-3.3-8b-instruct:free".to_string(),
        }
    }

    async fn api_key_for(&self, user_id: &str) -> Option<String> {
        if let Some(stored) = self.settings.provider_settings(user_id, "openrouter").await {
            if stored.is_active {
                if let Some(key) = stored.api_key {
                    return Some(key);
                }
            }
        }
        self.fallback_api_key.clone()
    }

    /// Parse a Retry-After header if present (seconds form only).
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok().map(Duration::from_secs))
    }
}

#[async_trait]
impl ProviderAdapter for OpenRouterAdapter {
    fn id(&self) -> &str {
        "openrouter"
    }

    async fn chat(&self, invocation: ChatInvocation) -> Result<ChatOutcome, ProviderError> {
        let api_key = self
            .api_key_for(&invocation.user_id)
            .await
            .ok_or_else(|| ProviderError::auth("no OpenRouter API key on file"))?;

        let model = invocation
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let tools: Vec<WireTool> = invocation
            .tools
            .iter()
            .map(|t| WireTool {
                tool_type: "function".to_string(),
                function: WireFunctionDef {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect();

        let (transforms, route) = match &invocation.provider_opts {
            Some(ProviderSpecificOpts::Openrouter { transforms, route }) => {
                (transforms.clone(), route.clone())
            }
            _ => (Vec::new(), None),
        };

        let request = WireRequest {
            model: model.clone(),
            messages: invocation.messages.clone(),
            tools: if tools.is_empty() { None } else { Some(tools) },
            tool_choice: if invocation.tools.is_empty() {
                None
            } else {
                Some("auto".to_string())
            },
            temperature: invocation.sampling.temperature,
            top_p: invocation.sampling.top_p,
            max_tokens: invocation.sampling.max_tokens,
            transforms: if transforms.is_empty() {
                None
            } else {
                Some(transforms)
            },
            route,
        };

        tracing::debug!(model = %model, "Sending request to OpenRouter");

        let response = self
            .client
            .post(OPENROUTER_API_URL)
            .timeout(invocation.timeout)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::timeout(invocation.timeout)
                } else if e.is_connect() {
                    ProviderError::transport(format!("connection failed: {}", e))
                } else {
                    ProviderError::transport(format!("request failed: {}", e))
                }
            })?;

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(ProviderError::from_status(
                status.as_u16(),
                &body,
                retry_after,
            ));
        }

        let parsed: WireResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::parse(format!("openrouter response: {}", e)))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::parse("no choices in response"))?;

        let tool_calls: Vec<ToolCallRequest> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCallRequest {
                id: tc.id,
                name: tc.function.name,
                arguments: serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(serde_json::Value::Null),
            })
            .collect();

        Ok(ChatOutcome {
            content: choice.message.content.unwrap_or_default(),
            model: parsed.model.unwrap_or(model),
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
                .unwrap_or_default(),
            used_native_tools: !tool_calls.is_empty(),
            tool_calls,
            metadata: None,
        })
    }

    /// Available when the user has a key on file (or a fallback key exists).
    /// No network round-trip: this is called on every chain resolution.
    async fn is_available(&self, user_id: Option<&str>) -> bool {
        match user_id {
            Some(user) => self.api_key_for(user).await.is_some(),
            None => self.fallback_api_key.is_some(),
        }
    }

    /// A paid API gateway counts as healthy when credentials exist; burning
    /// tokens on a probe completion would cost money. With per-user keys
    /// only there is nothing meaningful to probe at process level, so the
    /// probe loop skips this adapter rather than poisoning its health.
    fn supports_probe(&self) -> bool {
        self.fallback_api_key.is_some()
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        if self.fallback_api_key.is_some() {
            Ok(())
        } else {
            Err(ProviderError::auth("no OpenRouter credentials configured"))
        }
    }
}

/// OpenRouter request wire format (OpenAI-compatible).
#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transforms: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    route: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: WireFunctionDef,
}

#[derive(Debug, Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunctionCall,
}

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}
