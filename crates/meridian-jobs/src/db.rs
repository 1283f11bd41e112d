//! Job table in the relational store

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobState, NewJob, Periodic};
use crate::registry::PeriodicRegistration;
use crate::store::JobStore;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use meridian_store::entities::job;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait,
    ActiveValue::{NotSet, Set},
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    TransactionTrait,
};
use std::time::Duration;
use tracing::debug;

/// Candidates fetched per claim attempt; losing a race on one moves to the next
const CLAIM_BATCH: u64 = 8;

pub struct DbJobStore {
    db: DatabaseConnection,
}

impl DbJobStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn decode(model: job::Model) -> JobResult<Job> {
        let id = model.id as i64;
        let payload = BASE64
            .decode(model.payload.as_bytes())
            .map_err(|e| JobError::Corrupt {
                id,
                reason: e.to_string(),
            })?;
        let state = JobState::parse(&model.state).ok_or_else(|| JobError::Corrupt {
            id,
            reason: format!("unknown state {}", model.state),
        })?;
        let periodic = match (model.periodic_name, model.interval_secs) {
            (Some(name), Some(secs)) => Some(Periodic {
                name,
                interval: Duration::from_secs(secs.max(1) as u64),
            }),
            _ => None,
        };

        Ok(Job {
            id,
            queue: model.queue,
            job_type: model.job_type,
            payload,
            run_at: model.run_at,
            scheduled_at: model.scheduled_at,
            periodic,
            attempts: model.attempts.max(0) as u32,
            state,
            claimed_by: model.claimed_by,
            lease_expires_at: model.lease_expires_at,
            last_error: model.last_error,
            created_at: model.created_at,
        })
    }

    fn db_id(job: &Job) -> JobResult<i32> {
        i32::try_from(job.id).map_err(|_| JobError::Corrupt {
            id: job.id,
            reason: "id out of range".to_string(),
        })
    }

    /// Filter matching the row only while `job`'s claim is still held
    fn held(job: &Job) -> JobResult<Condition> {
        let claim = job.claimed_by.clone().ok_or(JobError::LostClaim(job.id))?;
        Ok(Condition::all()
            .add(job::Column::Id.eq(Self::db_id(job)?))
            .add(job::Column::State.eq(JobState::Ready.as_str()))
            .add(job::Column::ClaimedBy.eq(claim)))
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::zero())
}

#[async_trait]
impl JobStore for DbJobStore {
    async fn enqueue(&self, new_job: NewJob, now: DateTime<Utc>) -> JobResult<i64> {
        let run_at = new_job.run_at.unwrap_or(now);
        let row = job::ActiveModel {
            id: NotSet,
            queue: Set(new_job.queue),
            job_type: Set(new_job.job_type),
            payload: Set(BASE64.encode(&new_job.payload)),
            run_at: Set(run_at),
            scheduled_at: Set(run_at),
            periodic_name: Set(None),
            interval_secs: Set(None),
            attempts: Set(0),
            state: Set(JobState::Ready.as_str().to_string()),
            claimed_by: Set(None),
            lease_expires_at: Set(None),
            last_error: Set(None),
            created_at: Set(now),
        };
        let inserted = row.insert(&self.db).await?;
        Ok(inserted.id as i64)
    }

    async fn upsert_periodic(
        &self,
        registration: &PeriodicRegistration,
        now: DateTime<Utc>,
    ) -> JobResult<()> {
        let interval_secs = registration.interval.as_secs().max(1) as i64;
        let first = now + to_chrono(registration.initial_delay);
        let row = job::ActiveModel {
            id: NotSet,
            queue: Set(registration.queue.clone()),
            job_type: Set(registration.job_type.clone()),
            payload: Set(String::new()),
            run_at: Set(first),
            scheduled_at: Set(first),
            periodic_name: Set(Some(registration.name.clone())),
            interval_secs: Set(Some(interval_secs)),
            attempts: Set(0),
            state: Set(JobState::Ready.as_str().to_string()),
            claimed_by: Set(None),
            lease_expires_at: Set(None),
            last_error: Set(None),
            created_at: Set(now),
        };

        let inserted = job::Entity::insert(row)
            .on_conflict(
                OnConflict::column(job::Column::PeriodicName)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        if inserted == 0 {
            job::Entity::update_many()
                .col_expr(job::Column::JobType, Expr::value(registration.job_type.clone()))
                .col_expr(job::Column::Queue, Expr::value(registration.queue.clone()))
                .col_expr(job::Column::IntervalSecs, Expr::value(interval_secs))
                .filter(job::Column::PeriodicName.eq(registration.name.clone()))
                .exec(&self.db)
                .await?;
        } else {
            debug!(name = %registration.name, "Scheduled periodic job");
        }
        Ok(())
    }

    async fn claim_next(
        &self,
        queues: &[String],
        claim_token: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> JobResult<Option<Job>> {
        let claimable = || {
            Condition::all()
                .add(job::Column::State.eq(JobState::Ready.as_str()))
                .add(job::Column::RunAt.lte(now))
                .add(
                    Condition::any()
                        .add(job::Column::ClaimedBy.is_null())
                        .add(job::Column::LeaseExpiresAt.lte(now)),
                )
        };

        let candidates = job::Entity::find()
            .filter(job::Column::Queue.is_in(queues.iter().cloned()))
            .filter(claimable())
            .order_by_asc(job::Column::RunAt)
            .order_by_asc(job::Column::Id)
            .limit(CLAIM_BATCH)
            .all(&self.db)
            .await?;

        let lease_expires_at = now + to_chrono(lease);
        for candidate in candidates {
            let claimed = job::Entity::update_many()
                .col_expr(job::Column::ClaimedBy, Expr::value(claim_token))
                .col_expr(job::Column::LeaseExpiresAt, Expr::value(lease_expires_at))
                .col_expr(job::Column::Attempts, Expr::col(job::Column::Attempts).add(1))
                .filter(job::Column::Id.eq(candidate.id))
                .filter(job::Column::Attempts.eq(candidate.attempts))
                .filter(claimable())
                .exec(&self.db)
                .await?;

            if claimed.rows_affected == 1 {
                let mut model = candidate;
                model.claimed_by = Some(claim_token.to_string());
                model.lease_expires_at = Some(lease_expires_at);
                model.attempts += 1;
                return Self::decode(model).map(Some);
            }
        }
        Ok(None)
    }

    async fn complete(&self, job: &Job, next_run: Option<DateTime<Utc>>) -> JobResult<()> {
        let held = Self::held(job)?;
        let affected = match (&job.periodic, next_run) {
            (Some(_), Some(next)) => {
                job::Entity::update_many()
                    .col_expr(job::Column::RunAt, Expr::value(next))
                    .col_expr(job::Column::ScheduledAt, Expr::value(next))
                    .col_expr(job::Column::Attempts, Expr::value(0))
                    .col_expr(job::Column::ClaimedBy, Expr::value(Option::<String>::None))
                    .col_expr(
                        job::Column::LeaseExpiresAt,
                        Expr::value(Option::<DateTime<Utc>>::None),
                    )
                    .col_expr(job::Column::LastError, Expr::value(Option::<String>::None))
                    .filter(held)
                    .exec(&self.db)
                    .await?
                    .rows_affected
            }
            _ => {
                job::Entity::delete_many()
                    .filter(held)
                    .exec(&self.db)
                    .await?
                    .rows_affected
            }
        };

        if affected == 0 {
            return Err(JobError::LostClaim(job.id));
        }
        Ok(())
    }

    async fn retry(&self, job: &Job, run_at: DateTime<Utc>, error: &str) -> JobResult<()> {
        let updated = job::Entity::update_many()
            .col_expr(job::Column::RunAt, Expr::value(run_at))
            .col_expr(job::Column::ClaimedBy, Expr::value(Option::<String>::None))
            .col_expr(
                job::Column::LeaseExpiresAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(job::Column::LastError, Expr::value(error))
            .filter(Self::held(job)?)
            .exec(&self.db)
            .await?;

        if updated.rows_affected == 0 {
            return Err(JobError::LostClaim(job.id));
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        job: &Job,
        error: &str,
        next_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> JobResult<()> {
        let held = Self::held(job)?;

        if let (Some(_), Some(next)) = (&job.periodic, next_run) {
            let txn = self.db.begin().await?;
            let updated = job::Entity::update_many()
                .col_expr(job::Column::RunAt, Expr::value(next))
                .col_expr(job::Column::ScheduledAt, Expr::value(next))
                .col_expr(job::Column::Attempts, Expr::value(0))
                .col_expr(job::Column::ClaimedBy, Expr::value(Option::<String>::None))
                .col_expr(
                    job::Column::LeaseExpiresAt,
                    Expr::value(Option::<DateTime<Utc>>::None),
                )
                .col_expr(job::Column::LastError, Expr::value(error))
                .filter(held)
                .exec(&txn)
                .await?;
            if updated.rows_affected == 0 {
                txn.rollback().await?;
                return Err(JobError::LostClaim(job.id));
            }

            // Keep the failed occurrence visible to operators
            let dead = job::ActiveModel {
                id: NotSet,
                queue: Set(job.queue.clone()),
                job_type: Set(job.job_type.clone()),
                payload: Set(BASE64.encode(&job.payload)),
                run_at: Set(job.run_at),
                scheduled_at: Set(job.scheduled_at),
                periodic_name: Set(None),
                interval_secs: Set(None),
                attempts: Set(job.attempts as i32),
                state: Set(JobState::Dead.as_str().to_string()),
                claimed_by: Set(None),
                lease_expires_at: Set(None),
                last_error: Set(Some(error.to_string())),
                created_at: Set(now),
            };
            dead.insert(&txn).await?;
            txn.commit().await?;
            return Ok(());
        }

        let updated = job::Entity::update_many()
            .col_expr(job::Column::State, Expr::value(JobState::Dead.as_str()))
            .col_expr(job::Column::ClaimedBy, Expr::value(Option::<String>::None))
            .col_expr(
                job::Column::LeaseExpiresAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(job::Column::LastError, Expr::value(error))
            .filter(held)
            .exec(&self.db)
            .await?;
        if updated.rows_affected == 0 {
            return Err(JobError::LostClaim(job.id));
        }
        Ok(())
    }

    async fn dead_letters(&self, limit: u64) -> JobResult<Vec<Job>> {
        job::Entity::find()
            .filter(job::Column::State.eq(JobState::Dead.as_str()))
            .order_by_asc(job::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?
            .into_iter()
            .map(Self::decode)
            .collect()
    }

    async fn pending(&self) -> JobResult<Vec<Job>> {
        job::Entity::find()
            .filter(job::Column::State.eq(JobState::Ready.as_str()))
            .order_by_asc(job::Column::RunAt)
            .order_by_asc(job::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(Self::decode)
            .collect()
    }
}
