//! Provider chain resolution.
//!
//! Merges user Task-Routing preferences, admin overrides and the catalog's
//! default chains into an ordered, deduplicated list of provider entries,
//! then filters each candidate through an availability check that returns a
//! reason string either way and never fails.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::catalog::{ChainFilters, ProviderCatalog};
use crate::classifier::Tier;
use crate::health::{HealthStatus, HealthTracker};
use crate::providers::custom::{validate_custom, CustomProviderStore};
use crate::providers::{resolve_alias, ProviderRegistry};
use crate::settings::SettingsStore;

/// One entry of a resolved chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEntry {
    pub provider: String,
    /// `None` lets the provider auto-select a model
    pub model: Option<String>,
    pub is_primary: bool,
}

/// Availability verdict with a human-readable reason in both directions.
#[derive(Debug, Clone)]
pub struct Availability {
    pub available: bool,
    pub reason: String,
}

impl Availability {
    fn yes(reason: impl Into<String>) -> Self {
        Self {
            available: true,
            reason: reason.into(),
        }
    }

    fn no(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: reason.into(),
        }
    }
}

/// Options for one resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Bypass resolution entirely and use exactly this provider
    pub force_provider: Option<String>,
    pub filters: ChainFilters,
}

pub struct ChainResolver {
    catalog: Arc<ProviderCatalog>,
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthTracker>,
    settings: Arc<dyn SettingsStore>,
    custom: Arc<CustomProviderStore>,
    /// Admin-level failover override per tier; replaces catalog defaults but
    /// never the user's primary
    admin_override: RwLock<HashMap<Tier, Vec<ProviderEntry>>>,
    http: reqwest::Client,
}

impl ChainResolver {
    pub fn new(
        catalog: Arc<ProviderCatalog>,
        registry: Arc<ProviderRegistry>,
        health: Arc<HealthTracker>,
        settings: Arc<dyn SettingsStore>,
        custom: Arc<CustomProviderStore>,
    ) -> Self {
        Self {
            catalog,
            registry,
            health,
            settings,
            custom,
            admin_override: RwLock::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    /// Register an admin-level failover override for a tier.
    pub async fn set_admin_override(&self, tier: Tier, entries: Vec<ProviderEntry>) {
        let mut overrides = self.admin_override.write().await;
        tracing::info!(tier = %tier, entries = entries.len(), "Admin failover override registered");
        overrides.insert(tier, entries);
    }

    pub async fn clear_admin_override(&self, tier: Tier) {
        self.admin_override.write().await.remove(&tier);
    }

    /// Resolve the ordered provider chain for a (tier, user) pair.
    pub async fn resolve_chain(
        &self,
        tier: Tier,
        user_id: &str,
        opts: &ResolveOptions,
    ) -> Vec<ProviderEntry> {
        // 1. A forced provider short-circuits everything.
        if let Some(forced) = &opts.force_provider {
            tracing::debug!(provider = %forced, "Chain resolution bypassed by forced provider");
            return vec![ProviderEntry {
                provider: resolve_alias(forced).to_string(),
                model: None,
                is_primary: true,
            }];
        }

        let routing = self.settings.task_routing(user_id).await;

        // 2-3. A custom chain for this tier is the whole base sequence.
        let mut candidates: Vec<(String, Option<String>)> = Vec::new();
        let custom_chain = routing
            .as_ref()
            .and_then(|r| r.custom_failover_chains.get(&tier));

        if let Some(chain) = custom_chain {
            for entry in chain {
                candidates.push((
                    resolve_alias(entry.provider()).to_string(),
                    entry.model().map(|m| m.to_string()),
                ));
            }
        } else {
            // 4. User's tier preference first, then defaults.
            if let Some(preferred) = routing.as_ref().and_then(|r| r.tiers.get(&tier)) {
                if let Some(provider) = &preferred.provider {
                    candidates.push((
                        resolve_alias(provider).to_string(),
                        preferred.model.clone(),
                    ));
                }
            }

            // 5. Admin override replaces the catalog defaults when present.
            let overrides = self.admin_override.read().await;
            if let Some(entries) = overrides.get(&tier) {
                for entry in entries {
                    candidates.push((
                        resolve_alias(&entry.provider).to_string(),
                        entry.model.clone(),
                    ));
                }
            } else {
                for provider in self.catalog.default_chain_for(tier, &opts.filters) {
                    // Fallback entries carry no model so the provider
                    // auto-selects.
                    candidates.push((provider, None));
                }
            }
        }

        // 6. Dedupe by provider, then availability-filter with reasons.
        let mut seen = std::collections::HashSet::new();
        let mut chain = Vec::new();
        for (provider, model) in candidates {
            if !seen.insert(provider.clone()) {
                continue;
            }
            let availability = self.is_available(&provider, user_id).await;
            if !availability.available {
                tracing::debug!(
                    provider = %provider,
                    reason = %availability.reason,
                    "Skipping unavailable chain entry"
                );
                continue;
            }
            chain.push(ProviderEntry {
                provider,
                model,
                is_primary: chain.is_empty(),
            });
        }

        tracing::debug!(
            tier = %tier,
            user = %user_id,
            chain = ?chain.iter().map(|e| e.provider.as_str()).collect::<Vec<_>>(),
            "Resolved provider chain"
        );
        chain
    }

    /// Availability check. Never fails and always carries a reason.
    pub async fn is_available(&self, provider: &str, user_id: &str) -> Availability {
        let provider = resolve_alias(provider);

        // Unhealthy providers are out regardless of type.
        let health = self.health.status_of(provider).await;
        if health.status == HealthStatus::Unhealthy {
            return Availability::no("health status: unhealthy");
        }

        match provider {
            "ollama" => match self.registry.get(provider) {
                Some(adapter) => match adapter.probe().await {
                    Ok(()) => Availability::yes("ollama reachable"),
                    Err(e) => Availability::no(format!("ollama unreachable: {}", e)),
                },
                None => Availability::no("ollama adapter not registered"),
            },
            "openrouter" => match self.registry.get(provider) {
                Some(adapter) => {
                    if adapter.is_available(Some(user_id)).await {
                        Availability::yes("API key on file")
                    } else {
                        Availability::no("no API key on file")
                    }
                }
                None => Availability::no("openrouter adapter not registered"),
            },
            cli if cli.starts_with("cli-") => match self.registry.get_cli(cli) {
                Some(adapter) => {
                    if adapter.is_authenticated().await {
                        Availability::yes("CLI authenticated")
                    } else {
                        Availability::no("CLI not authenticated")
                    }
                }
                None => Availability::no(format!("{} adapter not registered", cli)),
            },
            other => {
                // Any other registered adapter answers for itself; provider
                // IDs are extensible.
                if let Some(adapter) = self.registry.get(other) {
                    return if adapter.is_available(Some(user_id)).await {
                        Availability::yes("adapter reports available")
                    } else {
                        Availability::no("adapter reports unavailable")
                    };
                }
                // User-registered custom providers are validated by type.
                if let Some(custom) = self.custom.find_by_name(user_id, other).await {
                    let (available, reason) = validate_custom(&custom, &self.http).await;
                    if available {
                        Availability::yes(reason)
                    } else {
                        Availability::no(reason)
                    }
                } else {
                    Availability::no(format!("unknown provider: {}", other))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::ScriptedAdapter;
    use crate::settings::{
        ChainEntrySpec, MemorySettingsStore, TaskRoutingSettings, TierRouting,
    };

    async fn resolver_with(
        settings: Arc<MemorySettingsStore>,
        registry: ProviderRegistry,
    ) -> ChainResolver {
        let dir = tempfile::tempdir().unwrap();
        let custom = Arc::new(
            CustomProviderStore::new(dir.path().join("custom.json")).await,
        );
        // Leak the tempdir so the store path stays valid for the test.
        std::mem::forget(dir);
        ChainResolver::new(
            Arc::new(ProviderCatalog::new()),
            Arc::new(registry),
            Arc::new(HealthTracker::new()),
            settings,
            custom,
        )
    }

    fn registry_with_available(ids: &[&str]) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for id in ids {
            registry.register(Arc::new(ScriptedAdapter::new(id, vec![])));
        }
        registry
    }

    #[tokio::test]
    async fn test_force_provider_single_entry() {
        let settings = Arc::new(MemorySettingsStore::new());
        let resolver = resolver_with(settings, registry_with_available(&[])).await;

        let opts = ResolveOptions {
            force_provider: Some("openrouter-paid".to_string()),
            ..Default::default()
        };
        let chain = resolver.resolve_chain(Tier::Simple, "u1", &opts).await;
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].provider, "openrouter");
        assert_eq!(chain[0].model, None);
        assert!(chain[0].is_primary);
    }

    #[tokio::test]
    async fn test_user_primary_comes_first() {
        let settings = Arc::new(MemorySettingsStore::new());
        let mut routing = TaskRoutingSettings::default();
        routing.tiers.insert(
            Tier::Trivial,
            TierRouting {
                provider: Some("openrouter".to_string()),
                model: Some("meta-llama/llama-3.3-8b-instruct:free".to_string()),
            },
        );
        settings.set_task_routing("u1", routing).await;

        let resolver =
            resolver_with(settings, registry_with_available(&["openrouter"])).await;
        let chain = resolver
            .resolve_chain(Tier::Trivial, "u1", &ResolveOptions::default())
            .await;

        assert!(!chain.is_empty());
        assert_eq!(chain[0].provider, "openrouter");
        assert_eq!(
            chain[0].model.as_deref(),
            Some("meta-llama/llama-3.3-8b-instruct:free")
        );
        assert!(chain[0].is_primary);
        // No duplicate openrouter from the catalog defaults.
        let openrouter_count = chain.iter().filter(|e| e.provider == "openrouter").count();
        assert_eq!(openrouter_count, 1);
    }

    #[tokio::test]
    async fn test_chain_has_no_duplicate_providers() {
        let settings = Arc::new(MemorySettingsStore::new());
        let mut routing = TaskRoutingSettings::default();
        routing.custom_failover_chains.insert(
            Tier::Complex,
            vec![
                ChainEntrySpec::Name("openrouter".to_string()),
                ChainEntrySpec::Full {
                    provider: "openrouter-paid".to_string(),
                    model: Some("anthropic/claude-3-opus".to_string()),
                },
            ],
        );
        settings.set_task_routing("u1", routing).await;

        let resolver =
            resolver_with(settings, registry_with_available(&["openrouter"])).await;
        let chain = resolver
            .resolve_chain(Tier::Complex, "u1", &ResolveOptions::default())
            .await;
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].provider, "openrouter");
    }

    #[tokio::test]
    async fn test_custom_chain_replaces_defaults() {
        let settings = Arc::new(MemorySettingsStore::new());
        let mut routing = TaskRoutingSettings::default();
        routing.custom_failover_chains.insert(
            Tier::Moderate,
            vec![ChainEntrySpec::Name("openrouter".to_string())],
        );
        settings.set_task_routing("u1", routing).await;

        let resolver =
            resolver_with(settings, registry_with_available(&["openrouter"])).await;
        let chain = resolver
            .resolve_chain(Tier::Moderate, "u1", &ResolveOptions::default())
            .await;
        // Only the custom chain's entry; catalog defaults not appended.
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].provider, "openrouter");
    }

    #[tokio::test]
    async fn test_unhealthy_provider_filtered_with_reason() {
        let settings = Arc::new(MemorySettingsStore::new());
        let resolver =
            resolver_with(settings, registry_with_available(&["openrouter"])).await;

        for _ in 0..3 {
            resolver
                .health
                .record_failure("openrouter", &crate::error::ProviderError::transport("down"))
                .await;
        }

        let availability = resolver.is_available("openrouter", "u1").await;
        assert!(!availability.available);
        assert_eq!(availability.reason, "health status: unhealthy");
    }

    #[tokio::test]
    async fn test_unknown_provider_reason() {
        let settings = Arc::new(MemorySettingsStore::new());
        let resolver = resolver_with(settings, registry_with_available(&[])).await;
        let availability = resolver.is_available("made-up", "u1").await;
        assert!(!availability.available);
        assert!(availability.reason.contains("unknown provider"));
    }

    #[tokio::test]
    async fn test_admin_override_replaces_defaults_not_primary() {
        let settings = Arc::new(MemorySettingsStore::new());
        let mut routing = TaskRoutingSettings::default();
        routing.tiers.insert(
            Tier::Critical,
            TierRouting {
                provider: Some("openrouter".to_string()),
                model: Some("anthropic/claude-3-opus".to_string()),
            },
        );
        settings.set_task_routing("u1", routing).await;

        // The scripted openrouter adapter reports available; the scripted
        // ollama adapter's default probe succeeds.
        let resolver = resolver_with(
            settings,
            registry_with_available(&["openrouter", "ollama"]),
        )
        .await;

        resolver
            .set_admin_override(
                Tier::Critical,
                vec![ProviderEntry {
                    provider: "ollama".to_string(),
                    model: None,
                    is_primary: false,
                }],
            )
            .await;

        let chain = resolver
            .resolve_chain(Tier::Critical, "u1", &ResolveOptions::default())
            .await;
        let providers: Vec<_> = chain.iter().map(|e| e.provider.as_str()).collect();
        // User primary survives in front, override supplies the fallbacks,
        // catalog defaults (cli-claude, cli-gemini) are gone.
        assert_eq!(providers, vec!["openrouter", "ollama"]);
        assert!(chain[0].is_primary);
        assert!(!chain[1].is_primary);
    }
}
