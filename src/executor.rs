//! The failover executor and the process-wide `Router`.
//!
//! `Router::process` runs one request end to end: classify, resolve the
//! chain, then walk it strictly in order. Transient failures consume a
//! shared retry budget; auth/payment failures only advance to the next
//! entry; empty or meta-talk responses are soft failures that cost nothing.
//! Parallel speculative execution is deliberately not performed.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

use regex::Regex;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::catalog::ProviderCatalog;
use crate::chain::{ChainResolver, ResolveOptions};
use crate::classifier::Classifier;
use crate::config::Config;
use crate::cost::estimate_cost;
use crate::delivery::{DeliveryOptions, DeliveryRequest, SharedDeliverySink};
use crate::error::{ProviderError, RouterError};
use crate::health::{FailoverEvent, HealthTracker};
use crate::notify::{NotificationKind, Notifier};
use crate::providers::{ChatInvocation, ChatOutcome, ProviderRegistry};
use crate::request::{RouteRequest, RouteResult};
use crate::usage::{spawn_usage_worker, UsageRecord, UsageSink};

/// Meta-talk markers: a model describing the tool call it would like to make
/// instead of making one.
const META_TALK_MARKERS: &[&str] = &[
    "tool call",
    "json format",
    "function call",
    "i would call",
    "i would use the",
    "the correct format",
    "respond with json",
];

/// Responses shorter than this are accepted as legitimate answers even when
/// they mention tooling. Heuristic cut-off; no empirical basis yet.
const META_TALK_MAX_LEN: usize = 500;

fn action_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#""action"\s*:\s*""#).expect("static regex")
    })
}

/// Whether an agentic-mode response is meta-talk: long, marker-laden text
/// with no action JSON anywhere in it.
fn is_meta_talk(content: &str) -> bool {
    if content.len() <= META_TALK_MAX_LEN {
        return false;
    }
    if action_pattern().is_match(content) {
        return false;
    }
    let lower = content.to_lowercase();
    META_TALK_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Coerce a model name that violates the provider's format rule to `None`
/// (provider auto-selects).
///
/// Ollama models are bare tags (`qwen3:8b`); OpenRouter models are
/// namespaced (`meta-llama/llama-3.3-8b-instruct:free`).
fn validate_model_format(provider: &str, model: Option<String>) -> Option<String> {
    let model = model?;
    let valid = match provider {
        "ollama" => !model.contains('/'),
        "openrouter" => model.contains('/'),
        _ => true,
    };
    if valid {
        Some(model)
    } else {
        tracing::warn!(
            provider = %provider,
            model = %model,
            "Model name violates provider format rule, letting provider auto-select"
        );
        None
    }
}

/// Whether a provider response is a soft failure: nothing usable came back,
/// so move on without charging the retry budget or the provider's health.
fn is_soft_failure(outcome: &ChatOutcome, agentic: bool, more_entries_remain: bool) -> Option<&'static str> {
    let empty = outcome.content.trim().is_empty()
        && !outcome.used_native_tools
        && outcome.tool_calls.is_empty();
    if empty && more_entries_remain {
        return Some("empty content without tool calls");
    }
    if agentic && !outcome.used_native_tools && is_meta_talk(&outcome.content) {
        return Some("meta-talk without tool call");
    }
    None
}

/// The process-wide router. Construct once at startup via `Router::start`,
/// tear down via `Router::shutdown`.
pub struct Router {
    config: Arc<Config>,
    catalog: Arc<ProviderCatalog>,
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthTracker>,
    settings: Arc<dyn crate::settings::SettingsStore>,
    classifier: Classifier,
    resolver: ChainResolver,
    notifier: Notifier,
    delivery: Option<SharedDeliverySink>,
    /// Taken (dropped) on shutdown so the worker can drain and exit
    usage_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<UsageRecord>>>,
    usage_worker: Mutex<Option<JoinHandle<()>>>,
    probe_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Everything the router needs at construction time.
pub struct RouterDeps {
    pub config: Arc<Config>,
    pub catalog: Arc<ProviderCatalog>,
    pub registry: Arc<ProviderRegistry>,
    pub health: Arc<HealthTracker>,
    pub settings: Arc<dyn crate::settings::SettingsStore>,
    pub custom: Arc<crate::providers::custom::CustomProviderStore>,
    pub usage_sink: Arc<dyn UsageSink>,
    pub notifier: Notifier,
    pub delivery: Option<SharedDeliverySink>,
}

impl Router {
    /// Build the router and start its background work (probe loop, usage
    /// writer).
    pub fn start(deps: RouterDeps) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (usage_tx, usage_rx) = mpsc::unbounded_channel();

        let usage_worker = spawn_usage_worker(usage_rx, deps.usage_sink);
        let probe_handle = deps.health.spawn_probe_loop(
            Arc::clone(&deps.registry),
            deps.config.probe_interval,
            shutdown_rx,
        );

        let classifier = Classifier::new(
            Arc::clone(&deps.config),
            Arc::clone(&deps.registry),
            Arc::clone(&deps.settings),
        );
        let resolver = ChainResolver::new(
            Arc::clone(&deps.catalog),
            Arc::clone(&deps.registry),
            Arc::clone(&deps.health),
            Arc::clone(&deps.settings),
            Arc::clone(&deps.custom),
        );

        Arc::new(Self {
            config: deps.config,
            catalog: deps.catalog,
            registry: deps.registry,
            health: deps.health,
            settings: deps.settings,
            classifier,
            resolver,
            notifier: deps.notifier,
            delivery: deps.delivery,
            usage_tx: std::sync::Mutex::new(Some(usage_tx)),
            usage_worker: Mutex::new(Some(usage_worker)),
            probe_handle: Mutex::new(Some(probe_handle)),
            shutdown_tx,
        })
    }

    pub fn catalog(&self) -> &ProviderCatalog {
        &self.catalog
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn resolver(&self) -> &ChainResolver {
        &self.resolver
    }

    /// Process one request with failover.
    pub async fn process(&self, req: &RouteRequest) -> Result<RouteResult, RouterError> {
        let started = Instant::now();
        let request_id = Uuid::new_v4();

        if req.task.is_none() && req.messages.is_empty() {
            return Err(RouterError::InvalidRequest(
                "request carries neither task text nor messages".to_string(),
            ));
        }

        let classification = self.classifier.classify(req).await;
        let tier = classification.tier;
        tracing::info!(
            request_id = %request_id,
            user = %req.user_id,
            tier = %tier,
            source = ?classification.source,
            "Request classified"
        );

        let opts = ResolveOptions {
            force_provider: req.force_provider.clone(),
            ..Default::default()
        };
        let chain = self.resolver.resolve_chain(tier, &req.user_id, &opts).await;
        if chain.is_empty() {
            self.notifier.notify(
                &req.user_id,
                NotificationKind::ChainExhausted,
                None,
                format!("No providers available for {} tasks right now.", tier),
            );
            return Err(RouterError::NoProviders {
                tier: tier.to_string(),
            });
        }

        let chain_length = chain.len() as u32;
        let mut budget = self.config.retry_budget;
        let mut attempted: Vec<String> = Vec::new();
        let mut last_error: Option<ProviderError> = None;

        for (index, entry) in chain.iter().enumerate() {
            let Some(adapter) = self.registry.get(&entry.provider) else {
                tracing::warn!(provider = %entry.provider, "Resolved chain entry has no adapter");
                continue;
            };

            let mut model = validate_model_format(&entry.provider, entry.model.clone());
            // CLI entries without an explicit model pick up the user's
            // stored preference for that tool.
            if model.is_none() && entry.provider.starts_with("cli-") {
                if let Some(cli_cfg) = self
                    .settings
                    .cli_settings(&req.user_id, &entry.provider)
                    .await
                {
                    model = cli_cfg.preferred_model.or(cli_cfg.fallback_model);
                }
            }
            let invocation = ChatInvocation {
                user_id: req.user_id.clone(),
                model,
                messages: req.chat_messages(),
                tools: req.tools.clone(),
                sampling: req.sampling.clone(),
                provider_opts: req.provider_opts.clone(),
                timeout: self.config.provider_deadline,
            };

            attempted.push(entry.provider.clone());
            let attempt_started = Instant::now();

            match adapter.chat(invocation).await {
                Ok(outcome) => {
                    let more_remain = index + 1 < chain.len();
                    if let Some(reason) = is_soft_failure(&outcome, req.agentic, more_remain) {
                        // Soft failure: no health penalty, no budget charge.
                        // One empty response is not a failure signal.
                        tracing::info!(
                            provider = %entry.provider,
                            reason = %reason,
                            "Soft failure, moving to next chain entry"
                        );
                        self.health
                            .record_failover_event(FailoverEvent {
                                timestamp: chrono::Utc::now(),
                                tier,
                                from_provider: entry.provider.clone(),
                                reason: reason.to_string(),
                                to_provider: chain.get(index + 1).map(|e| e.provider.clone()),
                                attempt_number: index as u32 + 1,
                                chain_length,
                            })
                            .await;
                        continue;
                    }

                    let latency_ms = attempt_started.elapsed().as_millis() as u64;
                    self.health.record_success(&entry.provider).await;
                    self.health.record_latency(&entry.provider, latency_ms).await;
                    self.health
                        .record_token_usage(
                            &entry.provider,
                            outcome.usage.prompt_tokens,
                            outcome.usage.completion_tokens,
                        )
                        .await;

                    self.enqueue_usage(req, &entry.provider, &outcome);
                    self.deliver_inline_files(req, &outcome).await;

                    tracing::info!(
                        request_id = %request_id,
                        provider = %entry.provider,
                        model = %outcome.model,
                        latency_ms,
                        attempts = attempted.len(),
                        "Request served"
                    );

                    return Ok(RouteResult {
                        request_id,
                        content: outcome.content,
                        model: outcome.model,
                        provider: entry.provider.clone(),
                        usage: outcome.usage,
                        classification,
                        duration: started.elapsed(),
                        attempted_providers: attempted,
                        tool_calls: outcome.tool_calls,
                    });
                }
                Err(error) => {
                    self.health.record_failure(&entry.provider, &error).await;
                    self.health
                        .record_failover_event(FailoverEvent {
                            timestamp: chrono::Utc::now(),
                            tier,
                            from_provider: entry.provider.clone(),
                            reason: error.kind.to_string(),
                            to_provider: chain.get(index + 1).map(|e| e.provider.clone()),
                            attempt_number: index as u32 + 1,
                            chain_length,
                        })
                        .await;

                    if error.kind.should_notify_user() {
                        let kind = match error.kind {
                            crate::error::FailureKind::Payment => NotificationKind::Payment,
                            _ => NotificationKind::RateLimit,
                        };
                        let mut message = format!("{} reported: {}", entry.provider, error.kind);
                        if let Some(delay) = error.retry_after {
                            message.push_str(&format!(" (retry after {:.0?})", delay));
                        }
                        self.notifier
                            .notify(&req.user_id, kind, Some(&entry.provider), message);
                    }

                    let retryable = error.is_retryable();
                    tracing::warn!(
                        provider = %entry.provider,
                        error = %error,
                        retryable,
                        budget_remaining = budget,
                        "Provider attempt failed"
                    );
                    last_error = Some(error);

                    if retryable {
                        budget = budget.saturating_sub(1);
                        if budget == 0 {
                            tracing::warn!("Retry budget exhausted, stopping chain walk");
                            break;
                        }
                    }
                    // Non-retryable errors fail over without touching the
                    // budget.
                }
            }
        }

        let last = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attemptable providers in chain".to_string());
        self.notifier.notify(
            &req.user_id,
            NotificationKind::ChainExhausted,
            None,
            format!(
                "All providers failed for this request ({}).",
                attempted.join(", ")
            ),
        );
        Err(RouterError::ChainExhausted { attempted, last })
    }

    /// Fire-and-forget usage accounting; never blocks the request path.
    fn enqueue_usage(&self, req: &RouteRequest, provider: &str, outcome: &ChatOutcome) {
        let record = UsageRecord {
            id: Uuid::new_v4(),
            user_id: req.user_id.clone(),
            provider: provider.to_string(),
            model: outcome.model.clone(),
            input_tokens: outcome.usage.prompt_tokens,
            output_tokens: outcome.usage.completion_tokens,
            cost_usd: estimate_cost(
                provider,
                &outcome.model,
                outcome.usage.prompt_tokens,
                outcome.usage.completion_tokens,
            ),
            agent_id: req.agent_id.clone(),
            conversation_id: req.conversation_id.clone(),
            timestamp: chrono::Utc::now(),
        };
        let sent = self
            .usage_tx
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|tx| tx.send(record).is_ok()))
            .unwrap_or(false);
        if !sent {
            tracing::debug!("Usage queue closed, dropping record");
        }
    }

    /// A synchronous CLI run can leave files behind; push them through the
    /// delivery channel when the request carries a trigger context.
    async fn deliver_inline_files(&self, req: &RouteRequest, outcome: &ChatOutcome) {
        let (Some(sink), Some(trigger)) = (&self.delivery, &req.trigger_context) else {
            return;
        };
        let Some(files) = outcome
            .metadata
            .as_ref()
            .and_then(|m| m.get("output_files"))
            .and_then(|f| f.as_array())
        else {
            return;
        };
        for file in files {
            let Some(path) = file.as_str() else { continue };
            let name = std::path::Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.to_string());
            let request = DeliveryRequest {
                account_id: trigger.account_id.clone(),
                recipient: trigger.external_id.clone(),
                platform: trigger.platform.clone(),
                content: String::new(),
                options: DeliveryOptions {
                    media: Some(path.into()),
                    caption: Some(format!("Generated file: {}", name)),
                    mime_type: None,
                },
                source: "router".to_string(),
            };
            if let Err(e) = sink.enqueue(request).await {
                tracing::warn!(error = %e, file = %path, "Inline file delivery failed");
            }
        }
    }

    /// Graceful teardown: stop the probe loop and drain the usage queue.
    /// Background CLI jobs are not killed here; they belong to the user's
    /// workflow, not this process's lifecycle.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.probe_handle.lock().await.take() {
            let _ = handle.await;
        }
        // Dropping the sender closes the queue; the worker drains whatever
        // is already enqueued, then exits.
        if let Ok(mut guard) = self.usage_tx.lock() {
            guard.take();
        }
        if let Some(handle) = self.usage_worker.lock().await.take() {
            let _ = handle.await;
        }
        tracing::info!("Router shut down");
    }
}
