//! Task classification.
//!
//! Every request gets a complexity tier from the deterministic keyword stage
//! (`keyword`). Users who opted in additionally get an AI override stage
//! (`ai`) that walks its own provider chain with a short deadline and falls
//! back to the keyword result when the chain is exhausted. An explicit
//! `force_tier` on the request wins over both stages.

pub mod ai;
pub mod cache;
pub mod keyword;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::providers::ProviderRegistry;
use crate::request::RouteRequest;
use crate::settings::SettingsStore;

use ai::AiStage;
use cache::ChainConfigCache;

/// Complexity tier of a request. Determines which provider chain serves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Trivial,
    Simple,
    Moderate,
    Complex,
    Critical,
}

impl Tier {
    pub const ALL: [Tier; 5] = [
        Tier::Trivial,
        Tier::Simple,
        Tier::Moderate,
        Tier::Complex,
        Tier::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Trivial => "trivial",
            Tier::Simple => "simple",
            Tier::Moderate => "moderate",
            Tier::Complex => "complex",
            Tier::Critical => "critical",
        }
    }

    pub fn from_str(raw: &str) -> Option<Tier> {
        match raw.trim().to_lowercase().as_str() {
            "trivial" => Some(Tier::Trivial),
            "simple" => Some(Tier::Simple),
            "moderate" => Some(Tier::Moderate),
            "complex" => Some(Tier::Complex),
            "critical" => Some(Tier::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the final tier was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClassificationSource {
    /// Keyword stage (AI stage disabled or a local sentinel entry won)
    Local,
    /// An AI chain entry produced a valid tier
    Ai,
    /// AI stage was enabled but every chain entry failed
    LocalChainExhausted,
}

/// Result of classifying one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub tier: Tier,
    /// Confidence in [0, 1], nondecreasing in the margin between the top two
    /// tier scores
    pub confidence: f64,
    /// Raw per-tier scores from the keyword stage
    pub scores: HashMap<Tier, f64>,
    pub source: ClassificationSource,
    /// Provider that produced an AI classification, when source is `ai`
    pub classifier_provider: Option<String>,
    pub reasoning: Option<String>,
}

/// Two-stage classifier with a per-user chain config cache.
pub struct Classifier {
    ai: AiStage,
    cache: ChainConfigCache,
    settings: Arc<dyn SettingsStore>,
}

impl Classifier {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ProviderRegistry>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        let cache = ChainConfigCache::new(config.classifier_cache_ttl);
        Self {
            ai: AiStage::new(config, registry),
            cache,
            settings,
        }
    }

    /// Classify a request. Never fails: the keyword stage always yields a
    /// result and the AI stage degrades to it.
    pub async fn classify(&self, req: &RouteRequest) -> Classification {
        let text = req.text();
        let mut classification = keyword::classify_keywords(&text, req.force_tier);

        // The cache also memoizes "AI classification is off for this user",
        // so the settings store is only read on a cache miss.
        let chain_config = match self.cache.get(&req.user_id).await {
            Some(cached) => cached,
            None => {
                let routing = self.settings.task_routing(&req.user_id).await;
                let resolved = self.ai.resolve_chain_config(routing.as_ref()).await;
                self.cache.put(&req.user_id, resolved.clone()).await;
                resolved
            }
        };

        if chain_config.enabled {
            classification = self
                .ai
                .classify(&text, &chain_config, classification)
                .await;
        }

        // An explicit tier from the caller wins over both stages. Upstream
        // callers re-classify fully expanded prompts (tool definitions
        // included), which inflates apparent complexity.
        if let Some(forced) = req.force_tier {
            classification.tier = forced;
            classification.confidence = 1.0;
        }

        classification
    }
}
