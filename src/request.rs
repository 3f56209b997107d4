//! Request and result types for the routing engine.
//!
//! A `RouteRequest` carries either a bare task string or a full message
//! history, plus the optional overrides (`force_provider`, `force_tier`) and
//! the trigger context used for out-of-band reply delivery.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::classifier::{Classification, Tier};

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Sampling parameters forwarded to providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Sampling temperature (0 = deterministic)
    pub temperature: Option<f64>,
    /// Top-p nucleus sampling
    pub top_p: Option<f64>,
    /// Maximum output tokens to generate
    pub max_tokens: Option<u64>,
}

/// Where the originating conversation lives, for out-of-band replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerContext {
    pub account_id: String,
    pub external_id: String,
    pub platform: String,
}

/// Provider-specific parameter bundles, tagged by provider family instead
/// of travelling as untyped maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "kebab-case")]
pub enum ProviderSpecificOpts {
    Ollama {
        /// How long the model stays loaded after the call (e.g. "5m")
        #[serde(default)]
        keep_alive: Option<String>,
        /// Context window override
        #[serde(default)]
        num_ctx: Option<u32>,
    },
    Openrouter {
        /// Prompt transforms (e.g. "middle-out" truncation)
        #[serde(default)]
        transforms: Vec<String>,
        /// Routing preference passed through to the gateway
        #[serde(default)]
        route: Option<String>,
    },
    Cli {
        /// Workspace override for this invocation
        #[serde(default)]
        workspace: Option<std::path::PathBuf>,
    },
}

/// Tool definition forwarded to providers for native function calling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool's parameters
    pub parameters: Value,
}

/// A native tool call returned by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Token usage from one provider call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// One request through the router. Immutable for the duration of a single
/// `process` call.
#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    /// Bare task text (used when `messages` is empty)
    pub task: Option<String>,
    /// Full conversation history
    pub messages: Vec<ChatMessage>,
    pub user_id: String,
    pub agent_id: Option<String>,
    pub conversation_id: Option<String>,
    /// Skip chain resolution and use exactly this provider
    pub force_provider: Option<String>,
    /// Skip classification and use exactly this tier
    pub force_tier: Option<Tier>,
    /// Tool definitions for native function calling
    pub tools: Vec<ToolSpec>,
    pub sampling: SamplingParams,
    /// Typed provider-specific parameters, applied when the serving
    /// provider's family matches
    pub provider_opts: Option<ProviderSpecificOpts>,
    /// Whether the caller is an agentic loop expecting tool calls back
    pub agentic: bool,
    /// Originating conversation, for out-of-band reply delivery
    pub trigger_context: Option<TriggerContext>,
}

impl RouteRequest {
    pub fn from_task(user_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            task: Some(task.into()),
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// The text to classify: the bare task if present, otherwise the
    /// concatenated user messages.
    pub fn text(&self) -> String {
        if let Some(task) = &self.task {
            return task.clone();
        }
        self.messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The messages to send to a provider, synthesising a single user message
    /// from `task` when no history was given.
    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        if !self.messages.is_empty() {
            return self.messages.clone();
        }
        match &self.task {
            Some(task) => vec![ChatMessage::user(task.clone())],
            None => Vec::new(),
        }
    }
}

/// Outcome of a successful `process` call.
#[derive(Debug, Clone)]
pub struct RouteResult {
    pub request_id: Uuid,
    pub content: String,
    pub model: String,
    pub provider: String,
    pub usage: TokenUsage,
    pub classification: Classification,
    pub duration: Duration,
    /// Providers tried, in order, including the one that succeeded
    pub attempted_providers: Vec<String>,
    /// Native tool calls returned by the provider, if any
    pub tool_calls: Vec<ToolCallRequest>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_prefers_task() {
        let mut req = RouteRequest::from_task("u1", "hi");
        req.messages.push(ChatMessage::user("ignored"));
        assert_eq!(req.text(), "hi");
    }

    #[test]
    fn test_text_joins_user_messages() {
        let req = RouteRequest {
            user_id: "u1".to_string(),
            messages: vec![
                ChatMessage::system("be nice"),
                ChatMessage::user("first"),
                ChatMessage::assistant("sure"),
                ChatMessage::user("second"),
            ],
            ..Default::default()
        };
        assert_eq!(req.text(), "first\nsecond");
    }

    #[test]
    fn test_chat_messages_synthesised_from_task() {
        let req = RouteRequest::from_task("u1", "do the thing");
        let messages = req.chat_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "do the thing");
    }

    #[test]
    fn test_usage_total_saturates() {
        let usage = TokenUsage::new(u64::MAX, 1);
        assert_eq!(usage.total(), u64::MAX);
    }

    #[test]
    fn test_provider_opts_parse_by_tag() {
        let opts: ProviderSpecificOpts =
            serde_json::from_str(r#"{"provider": "ollama", "keep_alive": "5m"}"#).unwrap();
        assert!(matches!(
            opts,
            ProviderSpecificOpts::Ollama { ref keep_alive, .. } if keep_alive.as_deref() == Some("5m")
        ));

        let opts: ProviderSpecificOpts =
            serde_json::from_str(r#"{"provider": "openrouter", "transforms": ["middle-out"]}"#)
                .unwrap();
        assert!(matches!(
            opts,
            ProviderSpecificOpts::Openrouter { ref transforms, .. } if transforms.len() == 1
        ));
    }
}
