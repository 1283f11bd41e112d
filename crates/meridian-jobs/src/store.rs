//! Job storage

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobState, NewJob, Periodic};
use crate::registry::PeriodicRegistration;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use meridian_store::SharedClock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Job table operations. Every call takes `now` explicitly.
///
/// Claiming is a conditional update: it succeeds only for a ready job that
/// is unclaimed or whose lease has expired. Completion, retry and
/// dead-lettering only apply while the caller still holds the claim and
/// fail with [`JobError::LostClaim`] otherwise.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> JobResult<i64>;

    /// Ensure exactly one pending row exists for a periodic job.
    ///
    /// A new row runs at `now + initial_delay`; an existing row keeps its
    /// schedule and picks up the registered type, queue and interval.
    async fn upsert_periodic(
        &self,
        registration: &PeriodicRegistration,
        now: DateTime<Utc>,
    ) -> JobResult<()>;

    /// Claim the earliest ready job (`run_at`, then insertion order) on any of `queues`
    async fn claim_next(
        &self,
        queues: &[String],
        claim_token: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> JobResult<Option<Job>>;

    /// Delete a one-shot job, or move a periodic job to `next_run`
    async fn complete(&self, job: &Job, next_run: Option<DateTime<Utc>>) -> JobResult<()>;

    /// Release the claim and make the job ready again at `run_at`
    async fn retry(&self, job: &Job, run_at: DateTime<Utc>, error: &str) -> JobResult<()>;

    /// Mark a one-shot job dead. For a periodic job, record the failed
    /// occurrence as a dead row and reschedule the periodic row at `next_run`.
    async fn dead_letter(
        &self,
        job: &Job,
        error: &str,
        next_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> JobResult<()>;

    async fn dead_letters(&self, limit: u64) -> JobResult<Vec<Job>>;

    /// Ready jobs, claimed or not
    async fn pending(&self) -> JobResult<Vec<Job>>;
}

/// Enqueue helper bound to a clock
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    clock: SharedClock,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub async fn enqueue(
        &self,
        queue: &str,
        job_type: &str,
        payload: Vec<u8>,
    ) -> JobResult<i64> {
        self.store
            .enqueue(NewJob::new(queue, job_type, payload), self.clock.now())
            .await
    }
}

/// In-process job table
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<MemoryJobs>,
}

#[derive(Default)]
struct MemoryJobs {
    next_id: i64,
    jobs: BTreeMap<i64, Job>,
}

impl MemoryJobs {
    fn insert(&mut self, mut job: Job) -> i64 {
        self.next_id += 1;
        job.id = self.next_id;
        self.jobs.insert(job.id, job);
        self.next_id
    }

    fn held_mut(&mut self, job: &Job) -> JobResult<&mut Job> {
        self.jobs
            .get_mut(&job.id)
            .filter(|j| j.state == JobState::Ready && j.claimed_by == job.claimed_by)
            .ok_or(JobError::LostClaim(job.id))
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::zero())
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> JobResult<i64> {
        let mut inner = self.inner.lock().await;
        let run_at = job.run_at.unwrap_or(now);
        Ok(inner.insert(Job {
            id: 0,
            queue: job.queue,
            job_type: job.job_type,
            payload: job.payload,
            run_at,
            scheduled_at: run_at,
            periodic: None,
            attempts: 0,
            state: JobState::Ready,
            claimed_by: None,
            lease_expires_at: None,
            last_error: None,
            created_at: now,
        }))
    }

    async fn upsert_periodic(
        &self,
        registration: &PeriodicRegistration,
        now: DateTime<Utc>,
    ) -> JobResult<()> {
        let mut inner = self.inner.lock().await;
        let existing = inner.jobs.values_mut().find(|j| {
            j.periodic
                .as_ref()
                .is_some_and(|p| p.name == registration.name)
        });

        match existing {
            Some(job) => {
                job.job_type = registration.job_type.clone();
                job.queue = registration.queue.clone();
                job.periodic = Some(Periodic {
                    name: registration.name.clone(),
                    interval: registration.interval,
                });
            }
            None => {
                let first = now + to_chrono(registration.initial_delay);
                inner.insert(Job {
                    id: 0,
                    queue: registration.queue.clone(),
                    job_type: registration.job_type.clone(),
                    payload: Vec::new(),
                    run_at: first,
                    scheduled_at: first,
                    periodic: Some(Periodic {
                        name: registration.name.clone(),
                        interval: registration.interval,
                    }),
                    attempts: 0,
                    state: JobState::Ready,
                    claimed_by: None,
                    lease_expires_at: None,
                    last_error: None,
                    created_at: now,
                });
            }
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
        let mut inner = self.inner.lock().await;
        let candidate = inner
            .jobs
            .values_mut()
            .filter(|j| {
                j.state == JobState::Ready
                    && j.run_at <= now
                    && queues.contains(&j.queue)
                    && (j.claimed_by.is_none() || j.lease_expires_at.is_some_and(|exp| exp <= now))
            })
            .min_by_key(|j| (j.run_at, j.id));

        Ok(candidate.map(|job| {
            job.claimed_by = Some(claim_token.to_string());
            job.lease_expires_at = Some(now + to_chrono(lease));
            job.attempts += 1;
            job.clone()
        }))
    }

    async fn complete(&self, job: &Job, next_run: Option<DateTime<Utc>>) -> JobResult<()> {
        let mut inner = self.inner.lock().await;
        let held = inner.held_mut(job)?;
        match (held.periodic.is_some(), next_run) {
            (true, Some(next)) => {
                held.run_at = next;
                held.scheduled_at = next;
                held.attempts = 0;
                held.claimed_by = None;
                held.lease_expires_at = None;
                held.last_error = None;
            }
            _ => {
                inner.jobs.remove(&job.id);
            }
        }
        Ok(())
    }

    async fn retry(&self, job: &Job, run_at: DateTime<Utc>, error: &str) -> JobResult<()> {
        let mut inner = self.inner.lock().await;
        let held = inner.held_mut(job)?;
        held.run_at = run_at;
        held.claimed_by = None;
        held.lease_expires_at = None;
        held.last_error = Some(error.to_string());
        Ok(())
    }

    async fn dead_letter(
        &self,
        job: &Job,
        error: &str,
        next_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> JobResult<()> {
        let mut inner = self.inner.lock().await;
        let held = inner.held_mut(job)?;

        match (held.periodic.is_some(), next_run) {
            (true, Some(next)) => {
                let mut dead = held.clone();
                dead.periodic = None;
                dead.state = JobState::Dead;
                dead.claimed_by = None;
                dead.lease_expires_at = None;
                dead.last_error = Some(error.to_string());
                dead.created_at = now;

                held.run_at = next;
                held.scheduled_at = next;
                held.attempts = 0;
                held.claimed_by = None;
                held.lease_expires_at = None;
                held.last_error = Some(error.to_string());

                inner.insert(dead);
            }
            _ => {
                held.state = JobState::Dead;
                held.claimed_by = None;
                held.lease_expires_at = None;
                held.last_error = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn dead_letters(&self, limit: u64) -> JobResult<Vec<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Dead)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn pending(&self) -> JobResult<Vec<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Ready)
            .cloned()
            .collect())
    }
}
