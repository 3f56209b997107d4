//! Per-user routing settings consumed by the core.
//!
//! The relational store behind these traits is an external collaborator; the
//! core only reads typed views of it. Chain and model-list JSON is parsed
//! into typed structures here, at load time, never propagated as untyped
//! maps.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::classifier::Tier;

/// Per-tier provider preference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierRouting {
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// One entry of a user-defined failover chain. Stored either as a bare
/// provider name or as a full `{provider, model}` object; bare names are
/// upgraded to entries with no model (provider auto-selects).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChainEntrySpec {
    Name(String),
    Full {
        provider: String,
        #[serde(default)]
        model: Option<String>,
    },
}

impl ChainEntrySpec {
    pub fn provider(&self) -> &str {
        match self {
            ChainEntrySpec::Name(name) => name,
            ChainEntrySpec::Full { provider, .. } => provider,
        }
    }

    pub fn model(&self) -> Option<&str> {
        match self {
            ChainEntrySpec::Name(_) => None,
            ChainEntrySpec::Full { model, .. } => model.as_deref(),
        }
    }
}

/// One entry of a user-configured classifier chain. The `{"type": "local"}`
/// sentinel means "run keyword classification at this position".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClassifierChainEntrySpec {
    Sentinel {
        #[serde(rename = "type")]
        entry_type: String,
    },
    Provider {
        provider: String,
        #[serde(default)]
        model: Option<String>,
    },
}

impl ClassifierChainEntrySpec {
    pub fn is_local_sentinel(&self) -> bool {
        matches!(self, ClassifierChainEntrySpec::Sentinel { entry_type } if entry_type == "local")
    }
}

/// A user's task-routing preferences.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRoutingSettings {
    /// Preferred provider/model per tier
    #[serde(default)]
    pub tiers: HashMap<Tier, TierRouting>,
    /// Full custom failover chain per tier; overrides catalog defaults
    #[serde(default)]
    pub custom_failover_chains: HashMap<Tier, Vec<ChainEntrySpec>>,
    /// Whether the AI classifier stage runs for this user
    #[serde(default)]
    pub ai_classifier_enabled: bool,
    /// Classifier provider chain, possibly containing the local sentinel
    #[serde(default)]
    pub classifier_chain: Vec<ClassifierChainEntrySpec>,
}

/// Stored connection settings for a provider, per user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Stored settings for one CLI tool, per user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliSettings {
    #[serde(default)]
    pub preferred_model: Option<String>,
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

/// Read-only view of per-user settings. Implementations must be fast; the
/// classifier caches chain configs so this is not hit on every message.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn task_routing(&self, user_id: &str) -> Option<TaskRoutingSettings>;
    async fn provider_settings(&self, user_id: &str, provider: &str) -> Option<ProviderSettings>;
    async fn cli_settings(&self, user_id: &str, cli_type: &str) -> Option<CliSettings>;
}

pub type SharedSettingsStore = Arc<dyn SettingsStore>;

/// In-memory settings store, used in tests and as a default when no database
/// is configured.
#[derive(Default)]
pub struct MemorySettingsStore {
    routing: RwLock<HashMap<String, TaskRoutingSettings>>,
    providers: RwLock<HashMap<(String, String), ProviderSettings>>,
    cli: RwLock<HashMap<(String, String), CliSettings>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_task_routing(&self, user_id: &str, settings: TaskRoutingSettings) {
        self.routing
            .write()
            .await
            .insert(user_id.to_string(), settings);
    }

    pub async fn set_provider_settings(
        &self,
        user_id: &str,
        provider: &str,
        settings: ProviderSettings,
    ) {
        self.providers
            .write()
            .await
            .insert((user_id.to_string(), provider.to_string()), settings);
    }

    pub async fn set_cli_settings(&self, user_id: &str, cli_type: &str, settings: CliSettings) {
        self.cli
            .write()
            .await
            .insert((user_id.to_string(), cli_type.to_string()), settings);
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn task_routing(&self, user_id: &str) -> Option<TaskRoutingSettings> {
        self.routing.read().await.get(user_id).cloned()
    }

    async fn provider_settings(&self, user_id: &str, provider: &str) -> Option<ProviderSettings> {
        self.providers
            .read()
            .await
            .get(&(user_id.to_string(), provider.to_string()))
            .cloned()
    }

    async fn cli_settings(&self, user_id: &str, cli_type: &str) -> Option<CliSettings> {
        self.cli
            .read()
            .await
            .get(&(user_id.to_string(), cli_type.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_entry_bare_name_upgrades() {
        let parsed: Vec<ChainEntrySpec> =
            serde_json::from_str(r#"["ollama", {"provider": "openrouter", "model": "meta-llama/llama-3.3-8b:free"}]"#)
                .unwrap();
        assert_eq!(parsed[0].provider(), "ollama");
        assert_eq!(parsed[0].model(), None);
        assert_eq!(parsed[1].provider(), "openrouter");
        assert_eq!(parsed[1].model(), Some("meta-llama/llama-3.3-8b:free"));
    }

    #[test]
    fn test_classifier_sentinel_parses() {
        let parsed: Vec<ClassifierChainEntrySpec> = serde_json::from_str(
            r#"[{"type": "local"}, {"provider": "openrouter", "model": "x/y:free"}]"#,
        )
        .unwrap();
        assert!(parsed[0].is_local_sentinel());
        assert!(!parsed[1].is_local_sentinel());
    }

    #[test]
    fn test_task_routing_json_is_typed_at_load() {
        let raw = r#"{
            "tiers": {"trivial": {"provider": "ollama", "model": "qwen3:4b"}},
            "custom_failover_chains": {"complex": ["openrouter", "ollama"]},
            "ai_classifier_enabled": true,
            "classifier_chain": [{"provider": "openrouter", "model": "m/free"}]
        }"#;
        let settings: TaskRoutingSettings = serde_json::from_str(raw).unwrap();
        assert!(settings.ai_classifier_enabled);
        assert_eq!(
            settings.tiers[&Tier::Trivial].provider.as_deref(),
            Some("ollama")
        );
        assert_eq!(settings.custom_failover_chains[&Tier::Complex].len(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemorySettingsStore::new();
        assert!(store.task_routing("u1").await.is_none());
        store
            .set_task_routing("u1", TaskRoutingSettings::default())
            .await;
        assert!(store.task_routing("u1").await.is_some());

        store
            .set_provider_settings(
                "u1",
                "openrouter",
                ProviderSettings {
                    api_key: Some("sk-test".to_string()),
                    ..Default::default()
                },
            )
            .await;
        let loaded = store.provider_settings("u1", "openrouter").await.unwrap();
        assert_eq!(loaded.api_key.as_deref(), Some("sk-test"));
    }
}
