//! Distributed leases
//!
//! A lease is a time-bounded exclusive claim on a named resource. Acquisition
//! is a conditional write: it succeeds only when the name is free or the
//! previous holder's lease has expired, so a crashed holder never needs a
//! manual unlock.

use crate::clock::SharedClock;
use crate::entities::lease;
use crate::error::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub name: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
    pub generation: i64,
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Claim `name` for `holder` until `expires_at`; returns the new generation
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<i64>>;

    /// Extend a lease still held by `holder`
    async fn renew(
        &self,
        name: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Drop a lease held by `holder`; releasing a lease held by someone else is a no-op
    async fn release(&self, name: &str, holder: &str) -> StoreResult<bool>;

    /// Unexpired holder of `name`
    async fn current(&self, name: &str, now: DateTime<Utc>) -> StoreResult<Option<LeaseRecord>>;
}

/// Leases in the `leases` table
pub struct DbLeaseStore {
    db: DatabaseConnection,
}

impl DbLeaseStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LeaseStore for DbLeaseStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<i64>> {
        let row = lease::ActiveModel {
            name: Set(name.to_string()),
            holder: Set(holder.to_string()),
            expires_at: Set(expires_at),
            generation: Set(1),
        };
        let inserted = lease::Entity::insert(row)
            .on_conflict(
                OnConflict::column(lease::Column::Name)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        if inserted == 1 {
            return Ok(Some(1));
        }

        // Take over an expired lease
        let updated = lease::Entity::update_many()
            .col_expr(lease::Column::Holder, Expr::value(holder))
            .col_expr(lease::Column::ExpiresAt, Expr::value(expires_at))
            .col_expr(
                lease::Column::Generation,
                Expr::col(lease::Column::Generation).add(1),
            )
            .filter(lease::Column::Name.eq(name))
            .filter(
                Condition::any()
                    .add(lease::Column::ExpiresAt.lte(now))
                    .add(lease::Column::Holder.eq(holder)),
            )
            .exec(&self.db)
            .await?;
        if updated.rows_affected == 0 {
            return Ok(None);
        }

        let generation = lease::Entity::find_by_id(name.to_string())
            .one(&self.db)
            .await?
            .filter(|l| l.holder == holder)
            .map(|l| l.generation);
        Ok(generation)
    }

    async fn renew(
        &self,
        name: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let updated = lease::Entity::update_many()
            .col_expr(lease::Column::ExpiresAt, Expr::value(expires_at))
            .filter(lease::Column::Name.eq(name))
            .filter(lease::Column::Holder.eq(holder))
            .filter(lease::Column::ExpiresAt.gt(now))
            .exec(&self.db)
            .await?;
        Ok(updated.rows_affected == 1)
    }

    async fn release(&self, name: &str, holder: &str) -> StoreResult<bool> {
        let deleted = lease::Entity::delete_many()
            .filter(lease::Column::Name.eq(name))
            .filter(lease::Column::Holder.eq(holder))
            .exec(&self.db)
            .await?;
        Ok(deleted.rows_affected == 1)
    }

    async fn current(&self, name: &str, now: DateTime<Utc>) -> StoreResult<Option<LeaseRecord>> {
        Ok(lease::Entity::find_by_id(name.to_string())
            .one(&self.db)
            .await?
            .filter(|l| l.expires_at > now)
            .map(|l| LeaseRecord {
                name: l.name,
                holder: l.holder,
                expires_at: l.expires_at,
                generation: l.generation,
            }))
    }
}

/// In-process lease table
#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, LeaseRecord>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<i64>> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(name) {
            Some(existing) if existing.expires_at > now && existing.holder != holder => Ok(None),
            Some(existing) => {
                existing.holder = holder.to_string();
                existing.expires_at = expires_at;
                existing.generation += 1;
                Ok(Some(existing.generation))
            }
            None => {
                leases.insert(
                    name.to_string(),
                    LeaseRecord {
                        name: name.to_string(),
                        holder: holder.to_string(),
                        expires_at,
                        generation: 1,
                    },
                );
                Ok(Some(1))
            }
        }
    }

    async fn renew(
        &self,
        name: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(name) {
            Some(l) if l.holder == holder && l.expires_at > now => {
                l.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, holder: &str) -> StoreResult<bool> {
        let mut leases = self.leases.lock().await;
        if leases.get(name).is_some_and(|l| l.holder == holder) {
            leases.remove(name);
            return Ok(true);
        }
        Ok(false)
    }

    async fn current(&self, name: &str, now: DateTime<Utc>) -> StoreResult<Option<LeaseRecord>> {
        let leases = self.leases.lock().await;
        Ok(leases.get(name).filter(|l| l.expires_at > now).cloned())
    }
}

/// Result of a lease acquisition attempt
#[derive(Debug)]
pub enum LeaseOutcome {
    Acquired(LeaseGuard),
    /// Someone else holds an unexpired lease
    Contended,
}

impl LeaseOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LeaseOutcome::Acquired(_))
    }
}

/// Lease store bound to a clock
#[derive(Clone)]
pub struct Leases {
    store: Arc<dyn LeaseStore>,
    clock: SharedClock,
}

impl Leases {
    pub fn new(store: Arc<dyn LeaseStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub async fn try_acquire(&self, name: &str, ttl: Duration) -> StoreResult<LeaseOutcome> {
        let holder = uuid::Uuid::new_v4().to_string();
        let now = self.clock.now();
        let expires_at = now + to_chrono(ttl);

        match self.store.try_acquire(name, &holder, expires_at, now).await? {
            Some(generation) => {
                debug!(lease = %name, generation, "Lease acquired");
                Ok(LeaseOutcome::Acquired(LeaseGuard {
                    leases: self.clone(),
                    name: name.to_string(),
                    holder,
                    generation,
                    released: false,
                }))
            }
            None => Ok(LeaseOutcome::Contended),
        }
    }

    /// Whether anyone currently holds `name`
    pub async fn is_held(&self, name: &str) -> StoreResult<bool> {
        Ok(self.store.current(name, self.clock.now()).await?.is_some())
    }
}

/// Held lease; released on `release()` or, failing that, when dropped
#[derive(Debug)]
pub struct LeaseGuard {
    leases: Leases,
    name: String,
    holder: String,
    generation: i64,
    released: bool,
}

impl std::fmt::Debug for Leases {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leases").finish_non_exhaustive()
    }
}

impl LeaseGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// Extend the lease; false once it has already lapsed
    pub async fn renew(&self, ttl: Duration) -> StoreResult<bool> {
        let now = self.leases.clock.now();
        self.leases
            .store
            .renew(&self.name, &self.holder, now + to_chrono(ttl), now)
            .await
    }

    pub async fn release(mut self) -> StoreResult<()> {
        self.released = true;
        self.leases.store.release(&self.name, &self.holder).await?;
        debug!(lease = %self.name, "Lease released");
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = self.leases.store.clone();
        let name = std::mem::take(&mut self.name);
        let holder = std::mem::take(&mut self.holder);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.release(&name, &holder).await {
                        warn!(lease = %name, "Failed to release dropped lease: {}", e);
                    }
                });
            }
            Err(_) => warn!(lease = %name, "Lease dropped outside a runtime; it will expire"),
        }
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;

    fn leases() -> Leases {
        Leases::new(Arc::new(MemoryLeaseStore::new()), Arc::new(TokioClock::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_holder() {
        let leases = leases();
        let first = leases
            .try_acquire("renew-cert:example.com", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(first.is_acquired());

        let second = leases
            .try_acquire("renew-cert:example.com", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!second.is_acquired());
        assert!(leases.is_held("renew-cert:example.com").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_can_be_taken_over() {
        let leases = leases();
        let first = leases.try_acquire("job", Duration::from_secs(30)).await.unwrap();
        let LeaseOutcome::Acquired(first) = first else {
            panic!("expected acquisition");
        };

        tokio::time::advance(Duration::from_secs(31)).await;

        let second = leases.try_acquire("job", Duration::from_secs(30)).await.unwrap();
        let LeaseOutcome::Acquired(second) = second else {
            panic!("expected takeover after expiry");
        };
        assert_eq!(second.generation(), first.generation() + 1);

        // The stale guard can neither renew nor release the new holder's lease
        assert!(!first.renew(Duration::from_secs(30)).await.unwrap());
        first.release().await.unwrap();
        assert!(leases.is_held("job").await.unwrap());
        second.release().await.unwrap();
        assert!(!leases.is_held("job").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let leases = leases();
        {
            let outcome = leases.try_acquire("x", Duration::from_secs(60)).await.unwrap();
            assert!(outcome.is_acquired());
        }
        // Let the spawned release run
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(leases.try_acquire("x", Duration::from_secs(60)).await.unwrap().is_acquired());
    }
}
