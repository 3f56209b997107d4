//! Out-of-band delivery channel contract.
//!
//! Background CLI jobs (and the rare synchronous CLI run that produced
//! files) hand their results to a delivery sink owned by the application
//! layer. The sink has no back-reference to jobs; the dependency points one
//! way only.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Attachment options for one delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryOptions {
    /// File to attach, by path
    pub media: Option<PathBuf>,
    pub caption: Option<String>,
    pub mime_type: Option<String>,
}

/// One message to push to a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub account_id: String,
    pub recipient: String,
    pub platform: String,
    pub content: String,
    #[serde(default)]
    pub options: DeliveryOptions,
    /// Subsystem that produced this delivery (for audit logs)
    pub source: String,
}

/// Receipt returned by the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub delivery_id: Uuid,
    pub sent: bool,
    pub queued: bool,
}

/// Delivery queue owned by the application layer.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn enqueue(&self, request: DeliveryRequest) -> anyhow::Result<DeliveryReceipt>;
}

pub type SharedDeliverySink = Arc<dyn DeliverySink>;

/// Recording sink for tests: accepts everything and remembers it.
#[derive(Default)]
pub struct MemoryDeliverySink {
    deliveries: tokio::sync::Mutex<Vec<DeliveryRequest>>,
}

impl MemoryDeliverySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn deliveries(&self) -> Vec<DeliveryRequest> {
        self.deliveries.lock().await.clone()
    }
}

#[async_trait]
impl DeliverySink for MemoryDeliverySink {
    async fn enqueue(&self, request: DeliveryRequest) -> anyhow::Result<DeliveryReceipt> {
        self.deliveries.lock().await.push(request);
        Ok(DeliveryReceipt {
            delivery_id: Uuid::new_v4(),
            sent: false,
            queued: true,
        })
    }
}
