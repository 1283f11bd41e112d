//! Versioned secrets store
//!
//! Each path holds an append-only list of versions. Writers never replace a
//! version in place, so a reader holding version N keeps a consistent value
//! while a renewal publishes N+1.

use crate::clock::SharedClock;
use crate::entities::secret;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Attempts at appending a version before reporting a conflict
const WRITE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretVersion {
    pub path: String,
    pub version: i64,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Latest version at `path`
    async fn read(&self, path: &str) -> StoreResult<Option<SecretVersion>>;

    async fn read_version(&self, path: &str, version: i64) -> StoreResult<Option<SecretVersion>>;

    /// Append a new version and return it
    async fn write(&self, path: &str, data: &[u8]) -> StoreResult<SecretVersion>;

    /// Create version 1 unless the path already exists; returns the latest version
    async fn write_if_absent(&self, path: &str, data: &[u8]) -> StoreResult<SecretVersion>;
}

/// Secrets kept in the `secrets` table
pub struct DbSecretStore {
    db: DatabaseConnection,
    clock: SharedClock,
}

impl DbSecretStore {
    pub fn new(db: DatabaseConnection, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    fn decode(model: secret::Model) -> StoreResult<SecretVersion> {
        let data = BASE64
            .decode(model.value.as_bytes())
            .map_err(|e| StoreError::Corrupt {
                what: format!("secret {}@{}", model.path, model.version),
                reason: e.to_string(),
            })?;
        Ok(SecretVersion {
            path: model.path,
            version: model.version,
            data,
            created_at: model.created_at,
        })
    }

    /// Insert `version` unless it exists; true when this call created it
    async fn insert_version(&self, path: &str, version: i64, data: &[u8]) -> StoreResult<bool> {
        let row = secret::ActiveModel {
            path: Set(path.to_string()),
            version: Set(version),
            value: Set(BASE64.encode(data)),
            created_at: Set(self.clock.now()),
        };

        let inserted = secret::Entity::insert(row)
            .on_conflict(
                OnConflict::columns([secret::Column::Path, secret::Column::Version])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        Ok(inserted == 1)
    }
}

#[async_trait]
impl SecretStore for DbSecretStore {
    async fn read(&self, path: &str) -> StoreResult<Option<SecretVersion>> {
        secret::Entity::find()
            .filter(secret::Column::Path.eq(path))
            .order_by_desc(secret::Column::Version)
            .one(&self.db)
            .await?
            .map(Self::decode)
            .transpose()
    }

    async fn read_version(&self, path: &str, version: i64) -> StoreResult<Option<SecretVersion>> {
        secret::Entity::find_by_id((path.to_string(), version))
            .one(&self.db)
            .await?
            .map(Self::decode)
            .transpose()
    }

    async fn write(&self, path: &str, data: &[u8]) -> StoreResult<SecretVersion> {
        for _ in 0..WRITE_ATTEMPTS {
            let next = self.read(path).await?.map_or(1, |v| v.version + 1);
            if self.insert_version(path, next, data).await? {
                debug!(path = %path, version = next, "Wrote secret version");
                return self
                    .read_version(path, next)
                    .await?
                    .ok_or_else(|| StoreError::Conflict(path.to_string()));
            }
        }
        Err(StoreError::Conflict(path.to_string()))
    }

    async fn write_if_absent(&self, path: &str, data: &[u8]) -> StoreResult<SecretVersion> {
        if self.insert_version(path, 1, data).await? {
            debug!(path = %path, "Created secret");
        }
        self.read(path).await?.ok_or_else(|| StoreError::Corrupt {
            what: format!("secret {}", path),
            reason: "missing after create".to_string(),
        })
    }
}

/// In-process secrets store for tests and development
pub struct MemorySecretStore {
    clock: SharedClock,
    entries: Mutex<HashMap<String, Vec<SecretVersion>>>,
}

impl MemorySecretStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn read(&self, path: &str) -> StoreResult<Option<SecretVersion>> {
        let entries = self.entries.lock().await;
        Ok(entries.get(path).and_then(|v| v.last()).cloned())
    }

    async fn read_version(&self, path: &str, version: i64) -> StoreResult<Option<SecretVersion>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(path)
            .and_then(|v| v.iter().find(|s| s.version == version))
            .cloned())
    }

    async fn write(&self, path: &str, data: &[u8]) -> StoreResult<SecretVersion> {
        let mut entries = self.entries.lock().await;
        let versions = entries.entry(path.to_string()).or_default();
        let secret = SecretVersion {
            path: path.to_string(),
            version: versions.last().map_or(1, |v| v.version + 1),
            data: data.to_vec(),
            created_at: self.clock.now(),
        };
        versions.push(secret.clone());
        Ok(secret)
    }

    async fn write_if_absent(&self, path: &str, data: &[u8]) -> StoreResult<SecretVersion> {
        let mut entries = self.entries.lock().await;
        let versions = entries.entry(path.to_string()).or_default();
        if let Some(existing) = versions.last() {
            return Ok(existing.clone());
        }
        let secret = SecretVersion {
            path: path.to_string(),
            version: 1,
            data: data.to_vec(),
            created_at: self.clock.now(),
        };
        versions.push(secret.clone());
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;

    #[tokio::test]
    async fn test_memory_versions_are_append_only() {
        let store = MemorySecretStore::new(system_clock());
        assert!(store.read("a").await.unwrap().is_none());

        let v1 = store.write("a", b"one").await.unwrap();
        let v2 = store.write("a", b"two").await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        assert_eq!(store.read("a").await.unwrap().unwrap().data, b"two");
        assert_eq!(store.read_version("a", 1).await.unwrap().unwrap().data, b"one");
    }

    #[tokio::test]
    async fn test_memory_write_if_absent_keeps_first_value() {
        let store = MemorySecretStore::new(system_clock());
        let first = store.write_if_absent("key", b"first").await.unwrap();
        let second = store.write_if_absent("key", b"second").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second.data, b"first");
    }
}
