//! Backing records of issued tokens

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meridian_proto::{Account, Capability, StableId};
use meridian_store::entities::capability_token;
use meridian_store::{StoreError, StoreResult};
use sea_orm::{ActiveValue::Set, DatabaseConnection, EntityTrait};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub jti: String,
    pub account: Account,
    pub capabilities: Vec<Capability>,
    pub key_id: String,
    pub issued_at: DateTime<Utc>,
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert(&self, record: &TokenRecord) -> StoreResult<()>;

    async fn get(&self, jti: &str) -> StoreResult<Option<TokenRecord>>;

    /// True when a record was removed
    async fn delete(&self, jti: &str) -> StoreResult<bool>;
}

/// Records in the `capability_tokens` table
pub struct DbTokenStore {
    db: DatabaseConnection,
}

impl DbTokenStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn decode(model: capability_token::Model) -> StoreResult<TokenRecord> {
        let corrupt = |reason: String| StoreError::Corrupt {
            what: format!("capability token {}", model.jti),
            reason,
        };

        let account_id: StableId = model
            .account_id
            .parse()
            .map_err(|e: meridian_proto::ParseIdError| corrupt(e.to_string()))?;
        let capabilities = model
            .capabilities
            .split(',')
            .filter(|c| !c.is_empty())
            .map(|c| c.parse::<Capability>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(TokenRecord {
            jti: model.jti,
            account: Account::new(account_id, model.namespace),
            capabilities,
            key_id: model.key_id,
            issued_at: model.issued_at,
        })
    }
}

fn join_capabilities(caps: &[Capability]) -> String {
    caps.iter()
        .map(Capability::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl TokenStore for DbTokenStore {
    async fn insert(&self, record: &TokenRecord) -> StoreResult<()> {
        let row = capability_token::ActiveModel {
            jti: Set(record.jti.clone()),
            account_id: Set(record.account.account_id.to_string()),
            namespace: Set(record.account.namespace.clone()),
            capabilities: Set(join_capabilities(&record.capabilities)),
            key_id: Set(record.key_id.clone()),
            issued_at: Set(record.issued_at),
        };
        capability_token::Entity::insert(row)
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    async fn get(&self, jti: &str) -> StoreResult<Option<TokenRecord>> {
        capability_token::Entity::find_by_id(jti.to_string())
            .one(&self.db)
            .await?
            .map(Self::decode)
            .transpose()
    }

    async fn delete(&self, jti: &str) -> StoreResult<bool> {
        let deleted = capability_token::Entity::delete_by_id(jti.to_string())
            .exec(&self.db)
            .await?;
        Ok(deleted.rows_affected > 0)
    }
}

/// In-process token records
#[derive(Default)]
pub struct MemoryTokenStore {
    records: RwLock<HashMap<String, TokenRecord>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn insert(&self, record: &TokenRecord) -> StoreResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.jti) {
            return Err(StoreError::Conflict(record.jti.clone()));
        }
        records.insert(record.jti.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, jti: &str) -> StoreResult<Option<TokenRecord>> {
        Ok(self.records.read().await.get(jti).cloned())
    }

    async fn delete(&self, jti: &str) -> StoreResult<bool> {
        Ok(self.records.write().await.remove(jti).is_some())
    }
}
