//! One-shot router runner.
//!
//! Wires the router from environment configuration, processes a single task
//! from the command line and prints the result. The long-lived embedding
//! (message ingestion, conversation history) lives in the application
//! layer; this binary exists for smoke tests and operations.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use switchboard::catalog::ProviderCatalog;
use switchboard::config::Config;
use switchboard::executor::{Router, RouterDeps};
use switchboard::health::HealthTracker;
use switchboard::notify::Notifier;
use switchboard::providers::cli::CliProcessAdapter;
use switchboard::providers::custom::CustomProviderStore;
use switchboard::providers::ollama::OllamaAdapter;
use switchboard::providers::openrouter::OpenRouterAdapter;
use switchboard::providers::ProviderRegistry;
use switchboard::request::RouteRequest;
use switchboard::store::SqliteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env().context("loading configuration")?);

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("usage: switchboard <task text> [user-id]");
        std::process::exit(2);
    }
    let task = args[0].clone();
    let user_id = args.get(1).cloned().unwrap_or_else(|| "local".to_string());

    let store = SqliteStore::open(&config.db_path).context("opening settings database")?;
    let custom = Arc::new(
        CustomProviderStore::new(config.workspace_root.join("custom-providers.json")).await,
    );

    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(OllamaAdapter::new(
        config.ollama_base_url.clone(),
        config.classifier_fallback_model.clone(),
    )));
    registry.register(Arc::new(OpenRouterAdapter::new(
        store.clone(),
        config.openrouter_api_key.clone(),
    )));
    registry.register_cli(Arc::new(CliProcessAdapter::claude(
        config.workspace_root.clone(),
    )));
    registry.register_cli(Arc::new(CliProcessAdapter::gemini(
        config.workspace_root.clone(),
    )));
    registry.register_cli(Arc::new(CliProcessAdapter::opencode(
        config.workspace_root.clone(),
    )));

    let (notifier, mut notifications) = Notifier::new();
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            eprintln!("[notice] {}", notification.message);
        }
    });

    let router = Router::start(RouterDeps {
        config,
        catalog: Arc::new(ProviderCatalog::new()),
        registry: Arc::new(registry),
        health: Arc::new(HealthTracker::new()),
        settings: store.clone(),
        custom,
        usage_sink: store,
        notifier,
        delivery: None,
    });

    let request = RouteRequest::from_task(user_id, task);
    match router.process(&request).await {
        Ok(result) => {
            println!("{}", result.content);
            eprintln!(
                "[{} via {} / {} in {:.1?}; tried: {}]",
                result.classification.tier,
                result.provider,
                result.model,
                result.duration,
                result.attempted_providers.join(", "),
            );
        }
        Err(e) => {
            eprintln!("routing failed: {}", e);
            router.shutdown().await;
            std::process::exit(1);
        }
    }

    router.shutdown().await;
    Ok(())
}
