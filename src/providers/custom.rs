//! User-registered custom providers.
//!
//! Users can register additional endpoints of four known shapes (an Ollama
//! base URL, an OpenRouter-compatible key, a Google key, or a local-agent
//! socket). Registrations persist to disk as JSON with atomic replacement.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Known custom provider shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CustomProviderKind {
    Ollama,
    Openrouter,
    Google,
    LocalAgent,
}

impl CustomProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Openrouter => "openrouter",
            Self::Google => "google",
            Self::LocalAgent => "local-agent",
        }
    }
}

/// One user-registered provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomProvider {
    pub id: Uuid,
    pub user_id: String,
    /// Human-readable name (e.g. "Home lab Ollama")
    pub name: String,
    pub kind: CustomProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

fn default_enabled() -> bool {
    true
}

impl CustomProvider {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, kind: CustomProviderKind) -> Self {
        let name = name.into();
        let now = chrono::Utc::now();
        Self {
            id: stable_custom_uuid(&name),
            user_id: user_id.into(),
            name,
            kind,
            base_url: None,
            api_key: None,
            models: Vec::new(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_credentials(&self) -> bool {
        match self.kind {
            CustomProviderKind::Ollama | CustomProviderKind::LocalAgent => self.base_url.is_some(),
            CustomProviderKind::Openrouter | CustomProviderKind::Google => self.api_key.is_some(),
        }
    }
}

/// Derive a deterministic UUID from a custom provider name.
///
/// SHA-256 over a fixed namespace plus the name, truncated to 16 bytes with
/// the version/variant bits set. Usage records then attribute consistently
/// across restarts even though registrations live in a JSON file.
pub fn stable_custom_uuid(name: &str) -> Uuid {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b"switchboard:custom-provider:");
    hasher.update(name.as_bytes());
    let hash = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Uuid::from_bytes(bytes)
}

/// Validate a custom provider registration by its type.
///
/// Never fails; returns availability plus a human-readable reason either way.
pub async fn validate_custom(
    provider: &CustomProvider,
    client: &reqwest::Client,
) -> (bool, String) {
    if !provider.enabled {
        return (false, "provider is disabled".to_string());
    }
    match provider.kind {
        CustomProviderKind::Ollama => {
            let Some(base) = provider.base_url.as_deref() else {
                return (false, "no base URL configured".to_string());
            };
            let url = format!("{}/api/tags", base.trim_end_matches('/'));
            match client
                .get(&url)
                .timeout(Duration::from_secs(3))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    (true, "ollama base reachable".to_string())
                }
                Ok(resp) => (
                    false,
                    format!("ollama base returned HTTP {}", resp.status().as_u16()),
                ),
                Err(e) => (false, format!("ollama base unreachable: {}", e)),
            }
        }
        CustomProviderKind::Openrouter => {
            if provider.api_key.is_some() {
                (true, "OpenRouter key present".to_string())
            } else {
                (false, "no OpenRouter API key".to_string())
            }
        }
        CustomProviderKind::Google => {
            if provider.api_key.is_some() {
                (true, "Google key present".to_string())
            } else {
                (false, "no Google API key".to_string())
            }
        }
        CustomProviderKind::LocalAgent => {
            let Some(base) = provider.base_url.as_deref() else {
                return (false, "no agent address configured".to_string());
            };
            match agent_socket_addr(base) {
                Some(addr) => {
                    match tokio::time::timeout(
                        Duration::from_secs(2),
                        tokio::net::TcpStream::connect(addr),
                    )
                    .await
                    {
                        Ok(Ok(_)) => (true, "local agent socket online".to_string()),
                        Ok(Err(e)) => (false, format!("local agent offline: {}", e)),
                        Err(_) => (false, "local agent connect timed out".to_string()),
                    }
                }
                None => (false, format!("invalid agent address: {}", base)),
            }
        }
    }
}

/// Parse a ws://host:port or http://host:port agent address into a socket
/// address for a plain TCP liveness check.
fn agent_socket_addr(raw: &str) -> Option<SocketAddr> {
    let parsed = url::Url::parse(raw).ok()?;
    let host = parsed.host_str()?;
    let port = parsed.port_or_known_default().or(match parsed.scheme() {
        "ws" => Some(80),
        "wss" => Some(443),
        _ => None,
    })?;
    // Literal addresses only; DNS resolution would block here.
    format!("{}:{}", host, port).parse().ok()
}

/// In-memory store for custom providers, persisted to disk as JSON.
#[derive(Debug, Clone)]
pub struct CustomProviderStore {
    providers: Arc<RwLock<HashMap<Uuid, CustomProvider>>>,
    storage_path: PathBuf,
}

impl CustomProviderStore {
    pub async fn new(storage_path: PathBuf) -> Self {
        let store = Self {
            providers: Arc::new(RwLock::new(HashMap::new())),
            storage_path,
        };

        match store.load_from_disk() {
            Ok(loaded) => {
                let mut providers = store.providers.write().await;
                *providers = loaded;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // No file yet - created on first write.
            }
            Err(e) => {
                tracing::error!(
                    path = %store.storage_path.display(),
                    error = %e,
                    "Failed to load custom providers; starting empty"
                );
            }
        }

        store
    }

    fn load_from_disk(&self) -> Result<HashMap<Uuid, CustomProvider>, std::io::Error> {
        let contents = std::fs::read_to_string(&self.storage_path)?;
        let providers: Vec<CustomProvider> = serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(providers.into_iter().map(|p| (p.id, p)).collect())
    }

    /// Serialize to disk atomically (temp file, then rename). Called while
    /// the caller still holds the write lock to avoid racing writers.
    fn save_to_disk(&self, providers: &HashMap<Uuid, CustomProvider>) -> Result<(), std::io::Error> {
        if let Some(parent) = self.storage_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let list: Vec<&CustomProvider> = providers.values().collect();
        let contents = serde_json::to_string_pretty(&list)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp_path = self.storage_path.with_extension("tmp");
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, &self.storage_path)?;
        Ok(())
    }

    pub async fn list_for_user(&self, user_id: &str) -> Vec<CustomProvider> {
        let providers = self.providers.read().await;
        let mut list: Vec<_> = providers
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub async fn get(&self, id: Uuid) -> Option<CustomProvider> {
        self.providers.read().await.get(&id).cloned()
    }

    /// Find a provider by its registered name, scoped to a user.
    pub async fn find_by_name(&self, user_id: &str, name: &str) -> Option<CustomProvider> {
        let providers = self.providers.read().await;
        providers
            .values()
            .find(|p| p.user_id == user_id && p.name == name)
            .cloned()
    }

    pub async fn upsert(&self, mut provider: CustomProvider) -> Uuid {
        provider.updated_at = chrono::Utc::now();
        let id = provider.id;
        let mut providers = self.providers.write().await;
        providers.insert(id, provider);
        if let Err(e) = self.save_to_disk(&providers) {
            tracing::error!(error = %e, "Failed to save custom providers to disk");
        }
        id
    }

    pub async fn delete(&self, id: Uuid) -> bool {
        let mut providers = self.providers.write().await;
        let existed = providers.remove(&id).is_some();
        if existed {
            if let Err(e) = self.save_to_disk(&providers) {
                tracing::error!(error = %e, "Failed to save custom providers to disk");
            }
        }
        existed
    }
}

pub type SharedCustomProviderStore = Arc<CustomProviderStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_uuid_deterministic_and_distinct() {
        let a1 = stable_custom_uuid("home-ollama");
        let a2 = stable_custom_uuid("home-ollama");
        let b = stable_custom_uuid("work-ollama");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(a1.get_version_num(), 4);
    }

    #[test]
    fn test_credentials_by_kind() {
        let mut p = CustomProvider::new("u1", "lab", CustomProviderKind::Ollama);
        assert!(!p.has_credentials());
        p.base_url = Some("http://10.0.0.5:11434".to_string());
        assert!(p.has_credentials());

        let mut g = CustomProvider::new("u1", "gem", CustomProviderKind::Google);
        assert!(!g.has_credentials());
        g.api_key = Some("key".to_string());
        assert!(g.has_credentials());
    }

    #[test]
    fn test_agent_socket_addr_parses_literal() {
        assert_eq!(
            agent_socket_addr("ws://127.0.0.1:9090"),
            Some("127.0.0.1:9090".parse().unwrap())
        );
        assert!(agent_socket_addr("not a url").is_none());
    }

    #[tokio::test]
    async fn test_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.json");
        let store = CustomProviderStore::new(path.clone()).await;

        let mut provider = CustomProvider::new("u1", "lab", CustomProviderKind::Ollama);
        provider.base_url = Some("http://10.0.0.5:11434".to_string());
        let id = store.upsert(provider).await;

        // Reload from the same path and verify persistence.
        let reloaded = CustomProviderStore::new(path).await;
        let loaded = reloaded.get(id).await.unwrap();
        assert_eq!(loaded.name, "lab");
        assert_eq!(loaded.kind, CustomProviderKind::Ollama);
    }

    #[tokio::test]
    async fn test_validate_disabled_provider() {
        let mut p = CustomProvider::new("u1", "lab", CustomProviderKind::Openrouter);
        p.api_key = Some("k".to_string());
        p.enabled = false;
        let (available, reason) = validate_custom(&p, &reqwest::Client::new()).await;
        assert!(!available);
        assert!(reason.contains("disabled"));
    }

    #[tokio::test]
    async fn test_validate_key_presence() {
        let mut p = CustomProvider::new("u1", "gw", CustomProviderKind::Openrouter);
        let client = reqwest::Client::new();
        let (available, _) = validate_custom(&p, &client).await;
        assert!(!available);
        p.api_key = Some("sk".to_string());
        let (available, reason) = validate_custom(&p, &client).await;
        assert!(available);
        assert!(reason.contains("key present"));
    }
}
