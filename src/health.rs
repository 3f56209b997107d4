//! Provider health tracking.
//!
//! Passive model: every real call outcome updates the per-provider record
//! (degraded at the first consecutive error, unhealthy at the third; any
//! success resets to healthy). Active model: a periodic probe loop runs
//! lightweight availability checks and restores unhealthy providers only on
//! a verified signal. Probe errors never propagate to callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::classifier::Tier;
use crate::error::{FailureKind, ProviderError};
use crate::providers::ProviderRegistry;

/// Consecutive errors at which a provider is marked unhealthy.
const UNHEALTHY_THRESHOLD: u32 = 3;

/// Maximum number of failover events kept in the ring buffer.
const MAX_FAILOVER_EVENTS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Health state for a single provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub last_error_time: Option<chrono::DateTime<chrono::Utc>>,
    /// When the probe loop last checked this provider
    pub last_check: Option<chrono::DateTime<chrono::Utc>>,
    /// Aggregate counters
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_errors: u64,
    pub total_rate_limits: u64,
    pub total_latency_ms: u64,
    pub latency_samples: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_errors: 0,
            last_error: None,
            last_error_time: None,
            last_check: None,
            total_requests: 0,
            total_successes: 0,
            total_errors: 0,
            total_rate_limits: 0,
            total_latency_ms: 0,
            latency_samples: 0,
            total_input_tokens: 0,
            total_output_tokens: 0,
        }
    }
}

impl ProviderHealth {
    pub fn avg_latency_ms(&self) -> Option<f64> {
        if self.latency_samples > 0 {
            Some(self.total_latency_ms as f64 / self.latency_samples as f64)
        } else {
            None
        }
    }
}

/// A single failover event: the executor moved past a failing provider.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub tier: Tier,
    pub from_provider: String,
    pub reason: String,
    /// Provider that ultimately served the request, if any
    pub to_provider: Option<String>,
    /// 1-indexed position of the failed entry in the chain
    pub attempt_number: u32,
    pub chain_length: u32,
}

/// Process-wide health tracker, shared by the executor, the chain resolver
/// and the probe loop. Each record is replaced atomically under the lock;
/// readers observe consistent per-provider snapshots.
pub struct HealthTracker {
    providers: RwLock<HashMap<String, ProviderHealth>>,
    failover_events: RwLock<Vec<FailoverEvent>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            failover_events: RwLock::new(Vec::new()),
        }
    }

    /// Record a successful call: counter reset, status healthy.
    pub async fn record_success(&self, provider: &str) {
        let mut providers = self.providers.write().await;
        let health = providers.entry(provider.to_string()).or_default();
        health.total_requests += 1;
        health.total_successes += 1;
        health.consecutive_errors = 0;
        health.status = HealthStatus::Healthy;
    }

    /// Record a failed call: counter incremented, degraded from the first
    /// error, unhealthy from the third.
    pub async fn record_failure(&self, provider: &str, error: &ProviderError) {
        let mut providers = self.providers.write().await;
        let health = providers.entry(provider.to_string()).or_default();
        health.total_requests += 1;
        match error.kind {
            FailureKind::RateLimit => health.total_rate_limits += 1,
            _ => health.total_errors += 1,
        }
        health.consecutive_errors = health.consecutive_errors.saturating_add(1);
        health.last_error = Some(error.to_string());
        health.last_error_time = Some(chrono::Utc::now());
        health.status = if health.consecutive_errors >= UNHEALTHY_THRESHOLD {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };

        if health.status == HealthStatus::Unhealthy {
            tracing::warn!(
                provider = %provider,
                consecutive_errors = health.consecutive_errors,
                error = %error,
                "Provider marked unhealthy"
            );
        } else {
            tracing::info!(
                provider = %provider,
                consecutive_errors = health.consecutive_errors,
                error = %error,
                "Provider degraded"
            );
        }
    }

    pub async fn record_latency(&self, provider: &str, latency_ms: u64) {
        let mut providers = self.providers.write().await;
        let health = providers.entry(provider.to_string()).or_default();
        health.total_latency_ms += latency_ms;
        health.latency_samples += 1;
    }

    pub async fn record_token_usage(&self, provider: &str, input_tokens: u64, output_tokens: u64) {
        let mut providers = self.providers.write().await;
        let health = providers.entry(provider.to_string()).or_default();
        health.total_input_tokens += input_tokens;
        health.total_output_tokens += output_tokens;
    }

    /// Current health of a provider. Unknown providers get a default record.
    pub async fn status_of(&self, provider: &str) -> ProviderHealth {
        self.providers
            .read()
            .await
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn snapshot_all(&self) -> Vec<(String, ProviderHealth)> {
        let providers = self.providers.read().await;
        let mut list: Vec<_> = providers
            .iter()
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    /// Record a failover event (ring buffer, newest last).
    pub async fn record_failover_event(&self, event: FailoverEvent) {
        let mut events = self.failover_events.write().await;
        events.push(event);
        if events.len() > MAX_FAILOVER_EVENTS {
            let excess = events.len() - MAX_FAILOVER_EVENTS;
            events.drain(..excess);
        }
    }

    pub async fn recent_events(&self, limit: usize) -> Vec<FailoverEvent> {
        let events = self.failover_events.read().await;
        let start = events.len().saturating_sub(limit);
        events[start..].to_vec()
    }

    /// Run one probe pass over every adapter that supports probing. Probes
    /// run concurrently; a slow local instance must not delay the rest.
    ///
    /// A successful probe is a verified availability signal and restores the
    /// provider to healthy, even from unhealthy. A failed probe records a
    /// failure like any other. Errors never leave this method.
    pub async fn run_probes(&self, registry: &ProviderRegistry) {
        let adapters = registry.probeable();
        let probes = adapters.iter().map(|adapter| async move {
            (adapter.id().to_string(), adapter.probe().await)
        });
        let results = futures::future::join_all(probes).await;

        for (provider, result) in results {
            {
                let mut providers = self.providers.write().await;
                let health = providers.entry(provider.clone()).or_default();
                health.last_check = Some(chrono::Utc::now());
            }
            match result {
                Ok(()) => {
                    let mut providers = self.providers.write().await;
                    let health = providers.entry(provider.clone()).or_default();
                    if health.status != HealthStatus::Healthy {
                        tracing::info!(provider = %provider, "Probe succeeded, provider healthy");
                    }
                    health.consecutive_errors = 0;
                    health.status = HealthStatus::Healthy;
                }
                Err(e) => {
                    tracing::debug!(provider = %provider, error = %e, "Probe failed");
                    self.record_failure(&provider, &e).await;
                }
            }
        }
    }

    /// Start the periodic probe loop. Stops when the shutdown signal flips.
    pub fn spawn_probe_loop(
        self: &Arc<Self>,
        registry: Arc<ProviderRegistry>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            // Small startup jitter so a fleet of routers does not probe in
            // lockstep.
            let jitter = Duration::from_millis(rand::random::<u64>() % 1000);
            tokio::time::sleep(jitter).await;

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tracker.run_probes(&registry).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!("Probe loop stopping");
                            return;
                        }
                    }
                }
            }
        })
    }
}
