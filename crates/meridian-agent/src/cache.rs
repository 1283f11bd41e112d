//! Last-known-good configuration
//!
//! The most recent configuration pulled from the Coordinator is kept on
//! disk so a restarted hub can keep serving while the Coordinator is out
//! of reach.

use crate::error::{AgentError, AgentResult};
use meridian_proto::ConfigResponse;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ConfigCache {
    path: Option<PathBuf>,
}

impl ConfigCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// A cache that remembers nothing across restarts
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Unreadable or corrupt caches count as empty
    pub async fn load(&self) -> Option<ConfigResponse> {
        let path = self.path.as_ref()?;
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read config cache");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt config cache");
                None
            }
        }
    }

    /// Replace the cached configuration atomically
    pub async fn store(&self, config: &ConfigResponse) -> AgentResult<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(config)
            .map_err(|e| AgentError::InvalidConfig(format!("encode config cache: {}", e)))?;

        let tmp = path.with_extension("tmp");
        write_private(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), version = config.tls_version, "Stored config cache");
        Ok(())
    }
}

/// The cache holds a private key; keep it owner-only
async fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config(version: i64) -> ConfigResponse {
        ConfigResponse {
            domain: "hub.example.com".to_string(),
            tls_version: version,
            tls_cert_pem: "cert".to_string(),
            tls_key_pem: "key".to_string(),
            tls_not_after: Utc::now(),
            service_namespace: "/waypoint".to_string(),
        }
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConfigCache::new(dir.path().join("config.json"));
        assert!(cache.load().await.is_none());

        cache.store(&config(1)).await.unwrap();
        cache.store(&config(2)).await.unwrap();
        assert_eq!(cache.load().await.unwrap().tls_version, 2);
    }

    #[tokio::test]
    async fn test_corrupt_cache_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(ConfigCache::new(path).load().await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_cache() {
        let cache = ConfigCache::disabled();
        cache.store(&config(1)).await.unwrap();
        assert!(cache.load().await.is_none());
    }
}
