//! Short-TTL cache of resolved classifier chain configs.
//!
//! Keyed by user, single writer, many readers. A racing stale read costs at
//! most one extra settings lookup, which is acceptable.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::ai::ClassifierChainConfig;

pub struct ChainConfigCache {
    entries: RwLock<HashMap<String, (Instant, ClassifierChainConfig)>>,
    ttl: Duration,
}

impl ChainConfigCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn get(&self, user_id: &str) -> Option<ClassifierChainConfig> {
        let entries = self.entries.read().await;
        let (stored_at, config) = entries.get(user_id)?;
        if stored_at.elapsed() < self.ttl {
            tracing::debug!(user = %user_id, "Classifier chain config cache hit");
            Some(config.clone())
        } else {
            None
        }
    }

    pub async fn put(&self, user_id: &str, config: ClassifierChainConfig) {
        let mut entries = self.entries.write().await;
        // Opportunistic purge keeps the map bounded by active users.
        let ttl = self.ttl;
        entries.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
        entries.insert(user_id.to_string(), (Instant::now(), config));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ai::ResolvedClassifierProvider;

    fn sample_config() -> ClassifierChainConfig {
        ClassifierChainConfig {
            enabled: true,
            chain: vec![ResolvedClassifierProvider::Local],
            timeout: Duration::from_secs(15),
            task_routing_info: None,
        }
    }

    #[tokio::test]
    async fn test_hit_within_ttl() {
        let cache = ChainConfigCache::new(Duration::from_secs(30));
        cache.put("u1", sample_config()).await;
        assert!(cache.get("u1").await.is_some());
        assert!(cache.get("u2").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_misses() {
        let cache = ChainConfigCache::new(Duration::from_millis(0));
        cache.put("u1", sample_config()).await;
        assert!(cache.get("u1").await.is_none());
    }

    #[tokio::test]
    async fn test_put_replaces() {
        let cache = ChainConfigCache::new(Duration::from_secs(30));
        cache.put("u1", sample_config()).await;
        let mut updated = sample_config();
        updated.timeout = Duration::from_secs(5);
        cache.put("u1", updated).await;
        let loaded = cache.get("u1").await.unwrap();
        assert_eq!(loaded.timeout, Duration::from_secs(5));
    }
}
