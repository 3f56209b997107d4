//! Provider catalog: static capability profiles and default chains.
//!
//! Pure configuration. Profiles describe what each provider costs and can
//! do; the per-tier default chains are the fallback sequence used when a
//! user has no custom chain. Exactly one strategy preset is active at any
//! moment.

use std::sync::RwLock;

use serde::Serialize;

use crate::classifier::Tier;

/// How a provider is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    Api,
    Cli,
}

/// What a call costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CostClass {
    Free,
    Variable,
    Paid,
}

/// Rough latency expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyClass {
    Low,
    Medium,
    High,
}

/// Static capability profile of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderProfile {
    pub kind: ProviderKind,
    pub cost: CostClass,
    pub latency: LatencyClass,
    pub capabilities: &'static [&'static str],
    pub max_tokens: u32,
    pub requires_auth: bool,
    pub is_local: bool,
    pub supports_multi_model: bool,
}

/// Look up the profile of a known provider.
pub fn profile_of(provider: &str) -> Option<ProviderProfile> {
    match crate::providers::resolve_alias(provider) {
        "ollama" => Some(ProviderProfile {
            kind: ProviderKind::Local,
            cost: CostClass::Free,
            latency: LatencyClass::Low,
            capabilities: &["chat", "tools"],
            max_tokens: 32_768,
            requires_auth: false,
            is_local: true,
            supports_multi_model: true,
        }),
        "openrouter" => Some(ProviderProfile {
            kind: ProviderKind::Api,
            cost: CostClass::Variable,
            latency: LatencyClass::Medium,
            capabilities: &["chat", "tools", "vision"],
            max_tokens: 128_000,
            requires_auth: true,
            is_local: false,
            supports_multi_model: true,
        }),
        "cli-claude" => Some(ProviderProfile {
            kind: ProviderKind::Cli,
            cost: CostClass::Paid,
            latency: LatencyClass::High,
            capabilities: &["chat", "workspace", "files"],
            max_tokens: 200_000,
            requires_auth: true,
            is_local: false,
            supports_multi_model: false,
        }),
        "cli-gemini" => Some(ProviderProfile {
            kind: ProviderKind::Cli,
            cost: CostClass::Paid,
            latency: LatencyClass::High,
            capabilities: &["chat", "workspace", "files"],
            max_tokens: 1_000_000,
            requires_auth: true,
            is_local: false,
            supports_multi_model: false,
        }),
        "cli-opencode" => Some(ProviderProfile {
            kind: ProviderKind::Cli,
            cost: CostClass::Variable,
            latency: LatencyClass::High,
            capabilities: &["chat", "workspace", "files"],
            max_tokens: 128_000,
            requires_auth: true,
            is_local: false,
            supports_multi_model: true,
        }),
        _ => None,
    }
}

/// Named chain strategies. Exactly one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyPreset {
    Default,
    CostOptimized,
    QualityOptimized,
}

/// Filters applied when selecting a default chain.
#[derive(Debug, Clone, Default)]
pub struct ChainFilters {
    pub exclude_providers: Vec<String>,
    pub require_local: bool,
    pub require_free: bool,
    pub require_cli: bool,
}

fn default_chain(tier: Tier) -> &'static [&'static str] {
    match tier {
        Tier::Trivial => &["ollama", "openrouter"],
        Tier::Simple => &["ollama", "openrouter"],
        Tier::Moderate => &["openrouter", "ollama"],
        Tier::Complex => &["openrouter", "cli-claude", "ollama"],
        Tier::Critical => &["cli-claude", "openrouter", "cli-gemini"],
    }
}

fn cost_optimized_chain(tier: Tier) -> &'static [&'static str] {
    match tier {
        Tier::Trivial => &["ollama"],
        Tier::Simple => &["ollama", "openrouter"],
        Tier::Moderate => &["ollama", "openrouter"],
        Tier::Complex => &["openrouter", "ollama", "cli-opencode"],
        Tier::Critical => &["openrouter", "cli-opencode", "ollama"],
    }
}

fn quality_optimized_chain(tier: Tier) -> &'static [&'static str] {
    match tier {
        Tier::Trivial => &["openrouter", "ollama"],
        Tier::Simple => &["openrouter", "ollama"],
        Tier::Moderate => &["cli-claude", "openrouter"],
        Tier::Complex => &["cli-claude", "cli-gemini", "openrouter"],
        Tier::Critical => &["cli-claude", "cli-gemini", "openrouter"],
    }
}

/// The catalog, holding the active preset.
pub struct ProviderCatalog {
    preset: RwLock<StrategyPreset>,
}

impl Default for ProviderCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderCatalog {
    pub fn new() -> Self {
        Self {
            preset: RwLock::new(StrategyPreset::Default),
        }
    }

    pub fn with_preset(preset: StrategyPreset) -> Self {
        Self {
            preset: RwLock::new(preset),
        }
    }

    pub fn active_preset(&self) -> StrategyPreset {
        *self.preset.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_preset(&self, preset: StrategyPreset) {
        let mut active = self.preset.write().unwrap_or_else(|e| e.into_inner());
        tracing::info!(preset = ?preset, "Switching chain strategy preset");
        *active = preset;
    }

    /// Default chain for a tier under the active preset, after filters.
    pub fn default_chain_for(&self, tier: Tier, filters: &ChainFilters) -> Vec<String> {
        let chain = match self.active_preset() {
            StrategyPreset::Default => default_chain(tier),
            StrategyPreset::CostOptimized => cost_optimized_chain(tier),
            StrategyPreset::QualityOptimized => quality_optimized_chain(tier),
        };

        chain
            .iter()
            .filter(|id| !filters.exclude_providers.iter().any(|ex| ex == *id))
            .filter(|id| {
                let Some(profile) = profile_of(id) else {
                    return false;
                };
                if filters.require_local && !profile.is_local {
                    return false;
                }
                if filters.require_free && profile.cost != CostClass::Free {
                    return false;
                }
                if filters.require_cli && profile.kind != ProviderKind::Cli {
                    return false;
                }
                true
            })
            .map(|id| id.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_exist_for_known_providers() {
        for id in ["ollama", "openrouter", "cli-claude", "cli-gemini", "cli-opencode"] {
            assert!(profile_of(id).is_some(), "missing profile for {id}");
        }
        assert!(profile_of("mystery").is_none());
    }

    #[test]
    fn test_alias_profiles() {
        let profile = profile_of("openrouter-free").unwrap();
        assert_eq!(profile.kind, ProviderKind::Api);
    }

    #[test]
    fn test_ollama_is_free_and_local() {
        let profile = profile_of("ollama").unwrap();
        assert_eq!(profile.cost, CostClass::Free);
        assert!(profile.is_local);
        assert!(!profile.requires_auth);
    }

    #[test]
    fn test_default_chains_nonempty_for_all_tiers() {
        let catalog = ProviderCatalog::new();
        for tier in Tier::ALL {
            let chain = catalog.default_chain_for(tier, &ChainFilters::default());
            assert!(!chain.is_empty(), "empty default chain for {tier}");
        }
    }

    #[test]
    fn test_exclude_filter() {
        let catalog = ProviderCatalog::new();
        let filters = ChainFilters {
            exclude_providers: vec!["openrouter".to_string()],
            ..Default::default()
        };
        let chain = catalog.default_chain_for(Tier::Moderate, &filters);
        assert!(!chain.iter().any(|p| p == "openrouter"));
    }

    #[test]
    fn test_require_local_filter() {
        let catalog = ProviderCatalog::new();
        let filters = ChainFilters {
            require_local: true,
            ..Default::default()
        };
        for tier in Tier::ALL {
            for provider in catalog.default_chain_for(tier, &filters) {
                assert!(profile_of(&provider).unwrap().is_local);
            }
        }
    }

    #[test]
    fn test_require_cli_filter() {
        let catalog = ProviderCatalog::new();
        let filters = ChainFilters {
            require_cli: true,
            ..Default::default()
        };
        let chain = catalog.default_chain_for(Tier::Critical, &filters);
        assert!(chain.iter().all(|p| {
            profile_of(p).map(|pr| pr.kind == ProviderKind::Cli).unwrap_or(false)
        }));
        assert!(!chain.is_empty());
    }

    #[test]
    fn test_preset_switching_changes_chains() {
        let catalog = ProviderCatalog::new();
        let default_chain = catalog.default_chain_for(Tier::Critical, &ChainFilters::default());

        catalog.set_preset(StrategyPreset::CostOptimized);
        assert_eq!(catalog.active_preset(), StrategyPreset::CostOptimized);
        let cost_chain = catalog.default_chain_for(Tier::Critical, &ChainFilters::default());

        assert_ne!(default_chain, cost_chain);
        assert_eq!(cost_chain[0], "openrouter");
    }
}
