//! Usage accounting.
//!
//! The executor enqueues one record per successful call; a background worker
//! drains the queue into the storage layer so the request path never blocks
//! on accounting. Write failures are logged at debug and dropped - usage is
//! best-effort bookkeeping, not billing ground truth.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// One recorded provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub agent_id: Option<String>,
    pub conversation_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Write-only sink the worker drains into.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: UsageRecord) -> anyhow::Result<()>;
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryUsageSink {
    records: tokio::sync::Mutex<Vec<UsageRecord>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl UsageSink for MemoryUsageSink {
    async fn record(&self, record: UsageRecord) -> anyhow::Result<()> {
        self.records.lock().await.push(record);
        Ok(())
    }
}

/// Start the background usage writer. The worker exits after draining the
/// queue once every sender is dropped, which is how teardown flushes
/// pending records.
pub fn spawn_usage_worker(
    mut rx: mpsc::UnboundedReceiver<UsageRecord>,
    sink: Arc<dyn UsageSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            if let Err(e) = sink.record(record).await {
                tracing::debug!(error = %e, "Failed to persist usage record");
            }
        }
        tracing::debug!("Usage worker drained and stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(user: &str) -> UsageRecord {
        UsageRecord {
            id: Uuid::new_v4(),
            user_id: user.to_string(),
            provider: "openrouter".to_string(),
            model: "gpt-4o-mini".to_string(),
            input_tokens: 100,
            output_tokens: 50,
            cost_usd: 0.000045,
            agent_id: None,
            conversation_id: Some("c1".to_string()),
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_worker_drains_queue_on_sender_drop() {
        let sink = Arc::new(MemoryUsageSink::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_usage_worker(rx, sink.clone());

        tx.send(sample("u1")).unwrap();
        tx.send(sample("u2")).unwrap();
        drop(tx);

        handle.await.unwrap();
        let records = sink.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].user_id, "u1");
    }
}
