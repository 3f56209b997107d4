//! SQLite-backed settings and usage store.
//!
//! One concrete implementation of the storage traits the core consumes.
//! Settings rows hold JSON blobs that are parsed into typed structures at
//! load time; the usage table is append-only from the core's point of view.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::settings::{CliSettings, ProviderSettings, SettingsStore, TaskRoutingSettings};
use crate::usage::{UsageRecord, UsageSink};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS task_routing (
    user_id TEXT PRIMARY KEY NOT NULL,
    settings_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS provider_settings (
    user_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    settings_json TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, provider)
);

CREATE TABLE IF NOT EXISTS cli_settings (
    user_id TEXT NOT NULL,
    cli_type TEXT NOT NULL,
    settings_json TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, cli_type)
);

CREATE TABLE IF NOT EXISTS usage_records (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    input_tokens INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    cost_usd REAL NOT NULL,
    agent_id TEXT,
    conversation_id TEXT,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_usage_user ON usage_records(user_id, timestamp);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> anyhow::Result<Arc<Self>> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    pub fn open_in_memory() -> anyhow::Result<Arc<Self>> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    /// Upsert a user's task-routing settings (used by the application layer
    /// and by tests; the core itself only reads).
    pub async fn put_task_routing(
        &self,
        user_id: &str,
        settings: &TaskRoutingSettings,
    ) -> anyhow::Result<()> {
        let json = serde_json::to_string(settings)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO task_routing (user_id, settings_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET settings_json = ?2, updated_at = ?3",
            params![user_id, json, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn put_provider_settings(
        &self,
        user_id: &str,
        provider: &str,
        settings: &ProviderSettings,
    ) -> anyhow::Result<()> {
        let json = serde_json::to_string(settings)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO provider_settings (user_id, provider, settings_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, provider) DO UPDATE SET settings_json = ?3, updated_at = ?4",
            params![user_id, provider, json, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn put_cli_settings(
        &self,
        user_id: &str,
        cli_type: &str,
        settings: &CliSettings,
    ) -> anyhow::Result<()> {
        let json = serde_json::to_string(settings)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO cli_settings (user_id, cli_type, settings_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, cli_type) DO UPDATE SET settings_json = ?3, updated_at = ?4",
            params![user_id, cli_type, json, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Total recorded spend for a user, for diagnostics.
    pub async fn total_cost_for_user(&self, user_id: &str) -> anyhow::Result<f64> {
        let conn = self.conn.lock().await;
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM usage_records WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    fn parse_json_row<T: serde::de::DeserializeOwned>(raw: Option<String>, what: &str) -> Option<T> {
        let raw = raw?;
        match serde_json::from_str(&raw) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!(error = %e, what, "Corrupt settings JSON in database");
                None
            }
        }
    }
}

#[async_trait]
impl SettingsStore for SqliteStore {
    async fn task_routing(&self, user_id: &str) -> Option<TaskRoutingSettings> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                "SELECT settings_json FROM task_routing WHERE user_id = ?1",
                params![user_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "task_routing query failed");
                None
            });
        Self::parse_json_row(raw, "task_routing")
    }

    async fn provider_settings(&self, user_id: &str, provider: &str) -> Option<ProviderSettings> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                "SELECT settings_json FROM provider_settings WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "provider_settings query failed");
                None
            });
        Self::parse_json_row(raw, "provider_settings")
    }

    async fn cli_settings(&self, user_id: &str, cli_type: &str) -> Option<CliSettings> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                "SELECT settings_json FROM cli_settings WHERE user_id = ?1 AND cli_type = ?2",
                params![user_id, cli_type],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "cli_settings query failed");
                None
            });
        Self::parse_json_row(raw, "cli_settings")
    }
}

#[async_trait]
impl UsageSink for SqliteStore {
    async fn record(&self, record: UsageRecord) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO usage_records
             (id, user_id, provider, model, input_tokens, output_tokens, cost_usd,
              agent_id, conversation_id, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id.to_string(),
                record.user_id,
                record.provider,
                record.model,
                record.input_tokens as i64,
                record.output_tokens as i64,
                record.cost_usd,
                record.agent_id,
                record.conversation_id,
                record.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Tier;
    use crate::settings::TierRouting;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_task_routing_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.task_routing("u1").await.is_none());

        let mut settings = TaskRoutingSettings::default();
        settings.ai_classifier_enabled = true;
        settings.tiers.insert(
            Tier::Trivial,
            TierRouting {
                provider: Some("ollama".to_string()),
                model: Some("qwen3:4b".to_string()),
            },
        );
        store.put_task_routing("u1", &settings).await.unwrap();

        let loaded = store.task_routing("u1").await.unwrap();
        assert!(loaded.ai_classifier_enabled);
        assert_eq!(
            loaded.tiers[&Tier::Trivial].model.as_deref(),
            Some("qwen3:4b")
        );
    }

    #[tokio::test]
    async fn test_provider_settings_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let settings = ProviderSettings {
            api_key: Some("sk-or-xyz".to_string()),
            base_url: None,
            models: vec!["meta-llama/llama-3.3-8b-instruct:free".to_string()],
            config: None,
            is_active: true,
        };
        store
            .put_provider_settings("u1", "openrouter", &settings)
            .await
            .unwrap();
        let loaded = store.provider_settings("u1", "openrouter").await.unwrap();
        assert_eq!(loaded.api_key.as_deref(), Some("sk-or-xyz"));
        assert_eq!(loaded.models.len(), 1);
    }

    #[tokio::test]
    async fn test_usage_insert_and_sum() {
        let store = SqliteStore::open_in_memory().unwrap();
        for cost in [0.25, 0.5] {
            store
                .record(UsageRecord {
                    id: Uuid::new_v4(),
                    user_id: "u1".to_string(),
                    provider: "openrouter".to_string(),
                    model: "gpt-4o-mini".to_string(),
                    input_tokens: 10,
                    output_tokens: 5,
                    cost_usd: cost,
                    agent_id: None,
                    conversation_id: None,
                    timestamp: chrono::Utc::now(),
                })
                .await
                .unwrap();
        }
        let total = store.total_cost_for_user("u1").await.unwrap();
        assert!((total - 0.75).abs() < 1e-9);
        assert_eq!(store.total_cost_for_user("u2").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_cli_settings_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let settings = CliSettings {
            preferred_model: Some("claude-sonnet-4".to_string()),
            fallback_model: None,
            timeout_seconds: Some(1200),
            max_tokens: None,
            temperature: Some(0.2),
        };
        store
            .put_cli_settings("u1", "cli-claude", &settings)
            .await
            .unwrap();
        let loaded = store.cli_settings("u1", "cli-claude").await.unwrap();
        assert_eq!(loaded.timeout_seconds, Some(1200));
    }
}
