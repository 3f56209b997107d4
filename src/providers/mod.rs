//! Provider adapters.
//!
//! Adapters wrap the heterogeneous backend fleet (local Ollama, the
//! OpenRouter gateway, paid CLI tools, user-registered custom endpoints)
//! behind two capability traits. There is no adapter hierarchy; the
//! registry holds trait objects and normalises legacy aliases.

pub mod cli;
pub mod custom;
pub mod ollama;
pub mod openrouter;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ProviderError;
use crate::request::{
    ChatMessage, ProviderSpecificOpts, SamplingParams, TokenUsage, ToolCallRequest, ToolSpec,
};

/// Invocation passed to a provider adapter.
#[derive(Debug, Clone)]
pub struct ChatInvocation {
    pub user_id: String,
    /// Model to use; `None` lets the provider auto-select
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub sampling: SamplingParams,
    /// Typed provider-specific parameters; adapters apply what matches
    /// their family and ignore the rest
    pub provider_opts: Option<ProviderSpecificOpts>,
    /// Deadline inherited from the caller
    pub timeout: Duration,
}

/// Response from one adapter call.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    /// Whether the provider returned native tool calls
    pub used_native_tools: bool,
    pub tool_calls: Vec<ToolCallRequest>,
    pub metadata: Option<Value>,
}

/// Result of one CLI run.
#[derive(Debug, Clone)]
pub struct CliExecution {
    pub content: String,
    pub output_files: Vec<PathBuf>,
    pub workspace: PathBuf,
    pub duration: Duration,
}

/// Options for one CLI run.
#[derive(Debug, Clone)]
pub struct CliExecOptions {
    pub workspace: PathBuf,
    pub model: Option<String>,
    pub timeout: Duration,
}

/// Capability every provider implements.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable provider identifier (e.g. "ollama", "cli-claude").
    fn id(&self) -> &str;

    /// Run a chat completion.
    async fn chat(&self, invocation: ChatInvocation) -> Result<ChatOutcome, ProviderError>;

    /// Fast availability signal. Must never fail and never block for long.
    async fn is_available(&self, user_id: Option<&str>) -> bool;

    /// Whether this adapter supports active probing.
    fn supports_probe(&self) -> bool {
        false
    }

    /// Lightweight availability check for the periodic probe loop.
    async fn probe(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Additional capability of CLI-backed providers.
#[async_trait]
pub trait CliAdapter: ProviderAdapter {
    /// Whether the underlying CLI reports an authenticated session.
    async fn is_authenticated(&self) -> bool;

    /// Run a one-shot prompt in a workspace and collect produced files.
    async fn execute(
        &self,
        prompt: &str,
        opts: &CliExecOptions,
    ) -> Result<CliExecution, ProviderError>;
}

/// Normalise legacy aliases kept for backwards compatibility.
pub fn resolve_alias(provider: &str) -> &str {
    match provider {
        "openrouter-free" | "openrouter-paid" => {
            tracing::debug!(alias = %provider, "Resolved legacy provider alias to openrouter");
            "openrouter"
        }
        other => other,
    }
}

/// Registry of provider adapters, built once at startup.
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    cli_adapters: HashMap<String, Arc<dyn CliAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    /// Register a CLI adapter under both capability maps.
    pub fn register_cli<A: CliAdapter + 'static>(&mut self, adapter: Arc<A>) {
        let id = adapter.id().to_string();
        self.adapters.insert(id.clone(), adapter.clone());
        self.cli_adapters.insert(id, adapter);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(resolve_alias(provider)).cloned()
    }

    pub fn get_cli(&self, provider: &str) -> Option<Arc<dyn CliAdapter>> {
        self.cli_adapters.get(resolve_alias(provider)).cloned()
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.adapters.contains_key(resolve_alias(provider))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Adapters that support active probing, for the health probe loop.
    pub fn probeable(&self) -> Vec<Arc<dyn ProviderAdapter>> {
        self.adapters
            .values()
            .filter(|a| a.supports_probe())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable adapter used across the crate's unit tests.

    use super::*;
    use crate::request::TokenUsage;
    use std::sync::Mutex;

    /// Adapter whose responses are driven by a queue of canned results.
    pub struct ScriptedAdapter {
        id: String,
        script: Mutex<Vec<Result<ChatOutcome, ProviderError>>>,
        available: bool,
        pub calls: Mutex<u32>,
    }

    impl ScriptedAdapter {
        pub fn new(id: &str, script: Vec<Result<ChatOutcome, ProviderError>>) -> Self {
            Self {
                id: id.to_string(),
                script: Mutex::new(script),
                available: true,
                calls: Mutex::new(0),
            }
        }

        pub fn unavailable(mut self) -> Self {
            self.available = false;
            self
        }

        pub fn ok_outcome(content: &str, model: &str) -> ChatOutcome {
            ChatOutcome {
                content: content.to_string(),
                model: model.to_string(),
                usage: TokenUsage::new(10, 20),
                used_native_tools: false,
                tool_calls: Vec::new(),
                metadata: None,
            }
        }

        pub fn call_count(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn id(&self) -> &str {
            &self.id
        }

        async fn chat(&self, _invocation: ChatInvocation) -> Result<ChatOutcome, ProviderError> {
            *self.calls.lock().unwrap() += 1;
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Err(ProviderError::transport("script exhausted"));
            }
            script.remove(0)
        }

        async fn is_available(&self, _user_id: Option<&str>) -> bool {
            self.available
        }
    }
}
