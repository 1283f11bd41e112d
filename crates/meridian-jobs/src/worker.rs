//! Worker loop

use crate::error::JobError;
use crate::job::{next_occurrence, Job};
use crate::registry::HandlerRegistry;
use crate::store::JobStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use meridian_store::SharedClock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queues: Vec<String>,
    /// Sleep between claim attempts when no job is ready
    pub poll_interval: Duration,
    /// Claim lease; also the handler timeout
    pub lease_duration: Duration,
    /// Attempts before a job is dead-lettered
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub worker_id: String,
    /// Claim loops run concurrently by this worker
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "worker".to_string());
        Self {
            queues: vec!["default".to_string()],
            poll_interval: Duration::from_secs(1),
            lease_duration: Duration::from_secs(300),
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(3600),
            worker_id: format!("{}-{}", host, std::process::id()),
            concurrency: 1,
        }
    }
}

impl WorkerConfig {
    /// Delay before retry number `attempts` (1-based): base * 2^(attempts-1), capped
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub lost_claims: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    pub succeeded: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub lost_claims: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            lost_claims: self.lost_claims.load(Ordering::Relaxed),
        }
    }
}

pub struct Worker {
    config: WorkerConfig,
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn JobStore>,
    clock: SharedClock,
    stats: Arc<WorkerStats>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        registry: Arc<HandlerRegistry>,
        store: Arc<dyn JobStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            clock,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Schedule registered periodic jobs, then claim and run jobs until
    /// `cancel` fires. A running handler is allowed to finish.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), JobError> {
        let now = self.clock.now();
        for registration in self.registry.periodic_jobs() {
            self.store.upsert_periodic(registration, now).await?;
        }

        info!(
            worker_id = %self.config.worker_id,
            queues = ?self.config.queues,
            concurrency = self.config.concurrency,
            "Job worker started"
        );

        let loops = (0..self.config.concurrency.max(1)).map(|slot| self.claim_loop(slot, &cancel));
        futures::future::join_all(loops).await;

        info!(worker_id = %self.config.worker_id, "Job worker stopped");
        Ok(())
    }

    async fn claim_loop(&self, slot: usize, cancel: &CancellationToken) {
        while !cancel.is_cancelled() {
            let found = match self.run_once(slot).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(worker_id = %self.config.worker_id, "Job claim failed: {}", e);
                    false
                }
            };

            if !found {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
    }

    /// Claim and execute at most one job; true when a job was found
    pub async fn run_once(&self, slot: usize) -> Result<bool, JobError> {
        let claim_token = format!(
            "{}/{}/{}",
            self.config.worker_id,
            slot,
            uuid::Uuid::new_v4().simple()
        );
        let Some(job) = self
            .store
            .claim_next(
                &self.config.queues,
                &claim_token,
                self.config.lease_duration,
                self.clock.now(),
            )
            .await?
        else {
            return Ok(false);
        };

        debug!(
            job_id = job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "Claimed job"
        );

        let outcome = self.execute(&job).await;
        let result = match outcome {
            Ok(()) => self.on_success(&job).await,
            Err(message) => self.on_failure(&job, message).await,
        };

        match result {
            Err(JobError::LostClaim(id)) => {
                self.stats.lost_claims.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = id, "Job lease expired before the result was recorded");
                Ok(true)
            }
            other => other.map(|_| true),
        }
    }

    async fn execute(&self, job: &Job) -> Result<(), String> {
        let Some(handler) = self.registry.handler(&job.job_type) else {
            return Err(format!("no handler registered for {}", job.job_type));
        };

        match tokio::time::timeout(self.config.lease_duration, handler(job.payload.clone())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!(
                "handler timed out after {}s",
                self.config.lease_duration.as_secs()
            )),
        }
    }

    fn next_run(&self, job: &Job, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        job.periodic
            .as_ref()
            .map(|p| next_occurrence(job.scheduled_at, p.interval, now))
    }

    async fn on_success(&self, job: &Job) -> Result<(), JobError> {
        let now = self.clock.now();
        let next_run = self.next_run(job, now);
        self.store.complete(job, next_run).await?;
        self.stats.succeeded.fetch_add(1, Ordering::Relaxed);

        match next_run {
            Some(next) => debug!(
                job_id = job.id,
                job_type = %job.job_type,
                next_run = %next,
                "Periodic job completed"
            ),
            None => debug!(job_id = job.id, job_type = %job.job_type, "Job completed"),
        }
        Ok(())
    }

    async fn on_failure(&self, job: &Job, message: String) -> Result<(), JobError> {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();

        if job.attempts >= self.config.max_attempts {
            let failure = JobError::HandlerFailure {
                job_type: job.job_type.clone(),
                attempts: job.attempts,
                message: message.clone(),
            };
            let next_run = self.next_run(job, now);
            self.store.dead_letter(job, &message, next_run, now).await?;
            self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
            error!(job_id = job.id, "Job dead-lettered: {}", failure);
            return Ok(());
        }

        let delay = self.config.backoff(job.attempts);
        let run_at =
            now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
        self.store.retry(job, run_at, &message).await?;
        warn!(
            job_id = job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            retry_in_secs = delay.as_secs(),
            "Job failed: {}",
            message
        );
        Ok(())
    }
}
