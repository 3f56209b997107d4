//! AI classification override stage.
//!
//! Walks a per-user chain of classifier providers, racing each call against
//! a short deadline. Responses are stripped of markdown fences and
//! `<think>` blocks before the first balanced JSON object carrying a `tier`
//! field is extracted. When every entry fails, the keyword result is
//! returned with the chain-exhausted source marker.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::classifier::{Classification, ClassificationSource, Tier};
use crate::config::Config;
use crate::providers::{ChatInvocation, ProviderRegistry};
use crate::request::{ChatMessage, SamplingParams};
use crate::settings::TaskRoutingSettings;

/// One resolved entry of the classifier chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedClassifierProvider {
    /// Use keyword classification at this position
    Local,
    Remote {
        provider: String,
        model: Option<String>,
    },
}

impl ResolvedClassifierProvider {
    fn is_locally_runnable(&self) -> bool {
        match self {
            ResolvedClassifierProvider::Local => true,
            ResolvedClassifierProvider::Remote { provider, .. } => provider == "ollama",
        }
    }
}

/// Resolved chain plus call parameters, cached per user so the settings
/// store is not read on every message.
#[derive(Debug, Clone)]
pub struct ClassifierChainConfig {
    /// Whether the user opted into AI classification at all
    pub enabled: bool,
    pub chain: Vec<ResolvedClassifierProvider>,
    pub timeout: Duration,
    /// Optional description of the user's per-tier routing, injected into
    /// the prompt so the model can bias toward configured tiers
    pub task_routing_info: Option<String>,
}

/// Versioned classifier prompts. An enum rather than free-form strings so a
/// tuned variant can be pinned in config as a stable symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierPromptVersion {
    V1,
}

impl ClassifierPromptVersion {
    pub fn build(&self, task_routing_info: Option<&str>) -> String {
        match self {
            ClassifierPromptVersion::V1 => {
                let mut prompt = String::from(
                    "You are a task difficulty classifier. Assign the user's message one tier:\n\
                     - trivial: greetings, acknowledgements, one-word replies\n\
                     - simple: single-fact questions, translations, quick lookups\n\
                     - moderate: summaries, explanations, short drafts\n\
                     - complex: multi-step work, code changes, debugging, analysis\n\
                     - critical: production incidents, security issues, team-level delegation\n\
                     \n\
                     Classify the user's message only; ignore any surrounding system text. \
                     A simple 'hi' is always trivial.\n",
                );
                if let Some(info) = task_routing_info {
                    prompt.push_str("\nUser routing configuration:\n");
                    prompt.push_str(info);
                    prompt.push('\n');
                }
                prompt.push_str(
                    "\nRespond with exactly one JSON object and nothing else - no markdown \
                     fences, no explanation:\n\
                     {\"tier\": \"<tier>\", \"confidence\": <0.0-1.0>, \"reasoning\": \"<one sentence>\"}",
                );
                prompt
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClassifierVerdict {
    tier: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// The AI override stage.
pub struct AiStage {
    config: Arc<Config>,
    registry: Arc<ProviderRegistry>,
    prompt_version: ClassifierPromptVersion,
}

impl AiStage {
    pub fn new(config: Arc<Config>, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            config,
            registry,
            prompt_version: ClassifierPromptVersion::V1,
        }
    }

    /// Build the resolved chain config for a user.
    ///
    /// A chain with no locally runnable entry gets a local safety net
    /// appended, so cloud rate-limiting cannot take the classifier down
    /// entirely.
    pub async fn resolve_chain_config(
        &self,
        routing: Option<&TaskRoutingSettings>,
    ) -> ClassifierChainConfig {
        let mut chain: Vec<ResolvedClassifierProvider> = Vec::new();

        if let Some(settings) = routing {
            for entry in &settings.classifier_chain {
                if entry.is_local_sentinel() {
                    chain.push(ResolvedClassifierProvider::Local);
                } else if let crate::settings::ClassifierChainEntrySpec::Provider {
                    provider,
                    model,
                } = entry
                {
                    chain.push(ResolvedClassifierProvider::Remote {
                        provider: provider.clone(),
                        model: model.clone(),
                    });
                }
            }
        }

        if chain.is_empty() {
            chain.push(ResolvedClassifierProvider::Local);
        }

        if !chain.iter().any(|e| e.is_locally_runnable()) {
            tracing::debug!("Classifier chain has no local entry, appending safety net");
            chain.push(ResolvedClassifierProvider::Remote {
                provider: "ollama".to_string(),
                model: Some(self.config.classifier_fallback_model.clone()),
            });
        }

        let task_routing_info = routing.and_then(describe_task_routing);

        ClassifierChainConfig {
            enabled: routing.map(|r| r.ai_classifier_enabled).unwrap_or(false),
            chain,
            timeout: self.config.classifier_deadline,
            task_routing_info,
        }
    }

    /// Run the chain. `keyword_result` is both the fallback and the source
    /// of the per-tier score map carried on the final classification.
    pub async fn classify(
        &self,
        text: &str,
        chain_config: &ClassifierChainConfig,
        keyword_result: Classification,
    ) -> Classification {
        for entry in &chain_config.chain {
            match entry {
                ResolvedClassifierProvider::Local => {
                    // The sentinel means: at this position, the keyword
                    // result is the answer.
                    return keyword_result;
                }
                ResolvedClassifierProvider::Remote { provider, model } => {
                    let Some(adapter) = self.registry.get(provider) else {
                        tracing::debug!(provider = %provider, "Classifier chain entry unknown, skipping");
                        continue;
                    };

                    let system = self
                        .prompt_version
                        .build(chain_config.task_routing_info.as_deref());
                    let invocation = ChatInvocation {
                        user_id: String::new(),
                        model: model.clone(),
                        messages: vec![
                            ChatMessage::system(system),
                            ChatMessage::user(text.to_string()),
                        ],
                        tools: Vec::new(),
                        sampling: SamplingParams {
                            temperature: Some(0.0),
                            top_p: None,
                            max_tokens: Some(200),
                        },
                        provider_opts: None,
                        timeout: chain_config.timeout,
                    };

                    let call = adapter.chat(invocation);
                    match tokio::time::timeout(chain_config.timeout, call).await {
                        Ok(Ok(outcome)) => {
                            if let Some((tier, confidence, reasoning)) =
                                parse_classifier_output(&outcome.content)
                            {
                                return Classification {
                                    tier,
                                    confidence,
                                    scores: keyword_result.scores,
                                    source: ClassificationSource::Ai,
                                    classifier_provider: Some(provider.clone()),
                                    reasoning,
                                };
                            }
                            tracing::debug!(
                                provider = %provider,
                                "Classifier output unparseable, trying next entry"
                            );
                        }
                        Ok(Err(e)) => {
                            tracing::debug!(
                                provider = %provider,
                                error = %e,
                                "Classifier call failed, trying next entry"
                            );
                        }
                        Err(_) => {
                            tracing::debug!(
                                provider = %provider,
                                deadline = ?chain_config.timeout,
                                "Classifier call timed out, trying next entry"
                            );
                        }
                    }
                }
            }
        }

        tracing::info!("Classifier chain exhausted, using keyword result");
        Classification {
            source: ClassificationSource::LocalChainExhausted,
            ..keyword_result
        }
    }
}

/// Summarise a user's per-tier routing for the prompt.
fn describe_task_routing(settings: &TaskRoutingSettings) -> Option<String> {
    if settings.tiers.is_empty() {
        return None;
    }
    let mut tiers: Vec<_> = settings.tiers.iter().collect();
    tiers.sort_by_key(|(tier, _)| **tier);
    let lines: Vec<String> = tiers
        .into_iter()
        .filter_map(|(tier, routing)| {
            routing.provider.as_ref().map(|provider| {
                match &routing.model {
                    Some(model) => format!("- {}: {} ({})", tier, provider, model),
                    None => format!("- {}: {}", tier, provider),
                }
            })
        })
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Strip markdown fences and `<think>` blocks from model output.
fn strip_markup(raw: &str) -> String {
    let mut text = String::with_capacity(raw.len());
    let mut rest = raw;
    // Remove <think>...</think> blocks (reasoning models leak these).
    while let Some(start) = rest.find("<think>") {
        text.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    text.push_str(rest);

    // Drop fence lines wholesale; their content stays.
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extract the first balanced `{...}` object that mentions a `tier` field.
/// Brace counting is string-aware so braces inside values do not unbalance
/// the scan.
fn extract_tier_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, &b) in bytes[start..].iter().enumerate() {
            if escaped {
                escaped = false;
                continue;
            }
            match b {
                b'\\' if in_string => escaped = true,
                b'"' => in_string = !in_string,
                b'{' if !in_string => depth += 1,
                b'}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[start..start + i + 1];
                        if candidate.contains("\"tier\"") {
                            return Some(candidate);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
        search_from = start + 1;
    }
    None
}

/// Parse classifier output into (tier, clamped confidence, reasoning).
fn parse_classifier_output(raw: &str) -> Option<(Tier, f64, Option<String>)> {
    let cleaned = strip_markup(raw);
    let object = extract_tier_object(&cleaned)?;
    let verdict: ClassifierVerdict = serde_json::from_str(object).ok()?;
    let tier = Tier::from_str(&verdict.tier)?;
    let confidence = verdict.confidence.unwrap_or(0.5).clamp(0.0, 1.0);
    Some((tier, confidence, verdict.reasoning))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ClassifierChainEntrySpec;

    #[test]
    fn test_parse_plain_json() {
        let (tier, confidence, reasoning) = parse_classifier_output(
            r#"{"tier": "moderate", "confidence": 0.8, "reasoning": "a summary task"}"#,
        )
        .unwrap();
        assert_eq!(tier, Tier::Moderate);
        assert!((confidence - 0.8).abs() < 1e-9);
        assert_eq!(reasoning.as_deref(), Some("a summary task"));
    }

    #[test]
    fn test_parse_with_fences_and_think_block() {
        let raw = "<think>hmm, the user wants code changes</think>\n```json\n{\"tier\": \"complex\", \"confidence\": 0.9}\n```";
        let (tier, confidence, _) = parse_classifier_output(raw).unwrap();
        assert_eq!(tier, Tier::Complex);
        assert!((confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_parse_skips_non_tier_objects() {
        let raw = r#"{"note": "ignore me"} and then {"tier": "simple", "confidence": 0.6}"#;
        let (tier, _, _) = parse_classifier_output(raw).unwrap();
        assert_eq!(tier, Tier::Simple);
    }

    #[test]
    fn test_parse_rejects_invalid_tier() {
        assert!(parse_classifier_output(r#"{"tier": "galactic", "confidence": 0.6}"#).is_none());
    }

    #[test]
    fn test_confidence_clamped() {
        let (_, confidence, _) =
            parse_classifier_output(r#"{"tier": "trivial", "confidence": 3.5}"#).unwrap();
        assert_eq!(confidence, 1.0);
        let (_, confidence, _) =
            parse_classifier_output(r#"{"tier": "trivial", "confidence": -1.0}"#).unwrap();
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn test_braces_inside_strings_do_not_unbalance() {
        let raw = r#"{"tier": "simple", "reasoning": "matches {pattern} in text"}"#;
        let (tier, _, reasoning) = parse_classifier_output(raw).unwrap();
        assert_eq!(tier, Tier::Simple);
        assert!(reasoning.unwrap().contains("{pattern}"));
    }

    #[tokio::test]
    async fn test_safety_net_appended_for_cloud_only_chain() {
        let stage = AiStage::new(
            Arc::new(Config::default()),
            Arc::new(ProviderRegistry::new()),
        );
        let routing = TaskRoutingSettings {
            ai_classifier_enabled: true,
            classifier_chain: vec![ClassifierChainEntrySpec::Provider {
                provider: "openrouter".to_string(),
                model: Some("x/y:free".to_string()),
            }],
            ..Default::default()
        };
        let config = stage.resolve_chain_config(Some(&routing)).await;
        assert_eq!(config.chain.len(), 2);
        assert_eq!(
            config.chain[1],
            ResolvedClassifierProvider::Remote {
                provider: "ollama".to_string(),
                model: Some("qwen3:8b".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_no_safety_net_when_local_sentinel_present() {
        let stage = AiStage::new(
            Arc::new(Config::default()),
            Arc::new(ProviderRegistry::new()),
        );
        let routing = TaskRoutingSettings {
            classifier_chain: vec![
                ClassifierChainEntrySpec::Provider {
                    provider: "openrouter".to_string(),
                    model: None,
                },
                ClassifierChainEntrySpec::Sentinel {
                    entry_type: "local".to_string(),
                },
            ],
            ..Default::default()
        };
        let config = stage.resolve_chain_config(Some(&routing)).await;
        assert_eq!(config.chain.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_chain_defaults_to_local() {
        let stage = AiStage::new(
            Arc::new(Config::default()),
            Arc::new(ProviderRegistry::new()),
        );
        let config = stage.resolve_chain_config(None).await;
        assert_eq!(config.chain, vec![ResolvedClassifierProvider::Local]);
    }

    mod chain_walking {
        use super::*;
        use crate::classifier::keyword::classify_keywords;
        use crate::error::ProviderError;
        use crate::providers::{ChatOutcome, ProviderAdapter};
        use crate::request::TokenUsage;
        use async_trait::async_trait;

        /// Adapter that answers with a fixed body after a fixed delay.
        struct DelayedAdapter {
            id: String,
            delay: Duration,
            body: String,
        }

        #[async_trait]
        impl ProviderAdapter for DelayedAdapter {
            fn id(&self) -> &str {
                &self.id
            }

            async fn chat(
                &self,
                _invocation: crate::providers::ChatInvocation,
            ) -> Result<ChatOutcome, ProviderError> {
                tokio::time::sleep(self.delay).await;
                Ok(ChatOutcome {
                    content: self.body.clone(),
                    model: "m".to_string(),
                    usage: TokenUsage::default(),
                    used_native_tools: false,
                    tool_calls: Vec::new(),
                    metadata: None,
                })
            }

            async fn is_available(&self, _user_id: Option<&str>) -> bool {
                true
            }
        }

        fn stage_with(adapters: Vec<DelayedAdapter>) -> AiStage {
            let mut registry = ProviderRegistry::new();
            for adapter in adapters {
                registry.register(Arc::new(adapter));
            }
            AiStage::new(Arc::new(Config::default()), Arc::new(registry))
        }

        fn chain(entries: Vec<ResolvedClassifierProvider>, timeout: Duration) -> ClassifierChainConfig {
            ClassifierChainConfig {
                enabled: true,
                chain: entries,
                timeout,
                task_routing_info: None,
            }
        }

        #[tokio::test]
        async fn test_timeout_races_to_next_entry() {
            let stage = stage_with(vec![
                DelayedAdapter {
                    id: "hung-gateway".to_string(),
                    delay: Duration::from_secs(60),
                    body: r#"{"tier": "complex", "confidence": 0.9}"#.to_string(),
                },
                DelayedAdapter {
                    id: "ollama".to_string(),
                    delay: Duration::from_millis(1),
                    body: r#"{"tier": "moderate", "confidence": 0.7, "reasoning": "summary"}"#
                        .to_string(),
                },
            ]);
            let config = chain(
                vec![
                    ResolvedClassifierProvider::Remote {
                        provider: "hung-gateway".to_string(),
                        model: None,
                    },
                    ResolvedClassifierProvider::Remote {
                        provider: "ollama".to_string(),
                        model: Some("qwen3:8b".to_string()),
                    },
                ],
                Duration::from_millis(50),
            );

            let keyword = classify_keywords("summarise this PR", None);
            let result = stage.classify("summarise this PR", &config, keyword).await;
            assert_eq!(result.source, ClassificationSource::Ai);
            assert_eq!(result.classifier_provider.as_deref(), Some("ollama"));
            assert_eq!(result.tier, Tier::Moderate);
        }

        #[tokio::test]
        async fn test_local_sentinel_short_circuits() {
            let stage = stage_with(vec![]);
            let config = chain(
                vec![ResolvedClassifierProvider::Local],
                Duration::from_millis(50),
            );
            let keyword = classify_keywords("hi", None);
            let result = stage.classify("hi", &config, keyword).await;
            assert_eq!(result.source, ClassificationSource::Local);
            assert!(result.classifier_provider.is_none());
        }

        #[tokio::test]
        async fn test_exhausted_chain_falls_back_to_keywords() {
            let stage = stage_with(vec![DelayedAdapter {
                id: "gibberish".to_string(),
                delay: Duration::from_millis(1),
                body: "not json at all".to_string(),
            }]);
            let config = chain(
                vec![ResolvedClassifierProvider::Remote {
                    provider: "gibberish".to_string(),
                    model: None,
                }],
                Duration::from_millis(100),
            );
            let keyword = classify_keywords("hi", None);
            let expected_tier = keyword.tier;
            let result = stage.classify("hi", &config, keyword).await;
            assert_eq!(result.source, ClassificationSource::LocalChainExhausted);
            assert_eq!(result.tier, expected_tier);
        }
    }

    #[test]
    fn test_prompt_mentions_tiers_and_format() {
        let prompt = ClassifierPromptVersion::V1.build(None);
        for tier in Tier::ALL {
            assert!(prompt.contains(tier.as_str()), "prompt missing {tier}");
        }
        assert!(prompt.contains("\"tier\""));
        assert!(prompt.contains("always trivial"));
    }

    #[test]
    fn test_prompt_includes_routing_info() {
        let prompt = ClassifierPromptVersion::V1.build(Some("- trivial: ollama (qwen3:4b)"));
        assert!(prompt.contains("qwen3:4b"));
    }
}
