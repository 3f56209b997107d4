//! Configuration management for the router.
//!
//! Configuration can be set via environment variables:
//! - `OLLAMA_BASE_URL` - Optional. Base URL of the local Ollama instance. Defaults to `http://127.0.0.1:11434`.
//! - `OPENROUTER_API_KEY` - Optional. Process-wide fallback OpenRouter key (per-user keys come from storage).
//! - `ROUTER_DB_PATH` - Optional. Path of the sqlite settings/usage database. Defaults to `switchboard.db`.
//! - `ROUTER_WORKSPACE_ROOT` - Optional. Root directory for CLI workspaces. Defaults to the current directory.
//! - `ROUTER_PROBE_INTERVAL_SECS` - Optional. Health probe interval. Defaults to `60`.
//! - `ROUTER_RETRY_BUDGET` - Optional. Shared retry budget per request. Defaults to `3`.
//! - `ROUTER_PROVIDER_DEADLINE_SECS` - Optional. Per-provider call deadline. Defaults to `120`.
//! - `ROUTER_CLASSIFIER_DEADLINE_SECS` - Optional. AI classifier call deadline. Defaults to `15`.
//! - `ROUTER_CLASSIFIER_CACHE_TTL_SECS` - Optional. Classifier chain cache TTL. Defaults to `30`.
//! - `ROUTER_CLASSIFIER_FALLBACK_MODEL` - Optional. Local model appended as classifier safety net. Defaults to `qwen3:8b`.
//! - `ROUTER_SYNC_TOOL_THRESHOLD_SECS` - Optional. Tool timeouts above this run in the background. Defaults to `210`.
//! - `ROUTER_STALE_THRESHOLD_SECS` - Optional. Background jobs without progress beyond this are terminated. Defaults to `300`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the local Ollama instance
    pub ollama_base_url: String,

    /// Process-wide fallback OpenRouter API key
    pub openrouter_api_key: Option<String>,

    /// Path of the sqlite settings/usage database
    pub db_path: PathBuf,

    /// Root directory for CLI workspaces
    pub workspace_root: PathBuf,

    /// Interval between active health probes
    pub probe_interval: Duration,

    /// Shared retry budget per request (consumed by transient failures only)
    pub retry_budget: u32,

    /// Deadline for a single provider call
    pub provider_deadline: Duration,

    /// Deadline for a single AI-classifier call
    pub classifier_deadline: Duration,

    /// TTL of the per-user classifier chain cache
    pub classifier_cache_ttl: Duration,

    /// Local model appended to classifier chains as a safety net
    pub classifier_fallback_model: String,

    /// Tool invocations declaring a timeout above this are diverted to the
    /// background CLI path
    pub sync_tool_threshold: Duration,

    /// Background jobs making no progress for this long are force-terminated
    pub stale_threshold: Duration,
}

fn env_secs(name: &str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let ollama_base_url = std::env::var("OLLAMA_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string());

        let openrouter_api_key = std::env::var("OPENROUTER_API_KEY").ok();

        let db_path = std::env::var("ROUTER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("switchboard.db"));

        let workspace_root = std::env::var("ROUTER_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
            });

        let retry_budget = match std::env::var("ROUTER_RETRY_BUDGET") {
            Ok(raw) => raw.parse::<u32>().map_err(|e| {
                ConfigError::InvalidValue("ROUTER_RETRY_BUDGET".to_string(), e.to_string())
            })?,
            Err(_) => 3,
        };

        let classifier_fallback_model = std::env::var("ROUTER_CLASSIFIER_FALLBACK_MODEL")
            .unwrap_or_else(|_| "qwen3:8b".to_string());

        Ok(Self {
            ollama_base_url,
            openrouter_api_key,
            db_path,
            workspace_root,
            probe_interval: env_secs("ROUTER_PROBE_INTERVAL_SECS", 60)?,
            retry_budget,
            provider_deadline: env_secs("ROUTER_PROVIDER_DEADLINE_SECS", 120)?,
            classifier_deadline: env_secs("ROUTER_CLASSIFIER_DEADLINE_SECS", 15)?,
            classifier_cache_ttl: env_secs("ROUTER_CLASSIFIER_CACHE_TTL_SECS", 30)?,
            classifier_fallback_model,
            sync_tool_threshold: env_secs("ROUTER_SYNC_TOOL_THRESHOLD_SECS", 210)?,
            stale_threshold: env_secs("ROUTER_STALE_THRESHOLD_SECS", 300)?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ollama_base_url: "http://127.0.0.1:11434".to_string(),
            openrouter_api_key: None,
            db_path: PathBuf::from("switchboard.db"),
            workspace_root: PathBuf::from("."),
            probe_interval: Duration::from_secs(60),
            retry_budget: 3,
            provider_deadline: Duration::from_secs(120),
            classifier_deadline: Duration::from_secs(15),
            classifier_cache_ttl: Duration::from_secs(30),
            classifier_fallback_model: "qwen3:8b".to_string(),
            sync_tool_threshold: Duration::from_secs(210),
            stale_threshold: Duration::from_secs(300),
        }
    }
}
