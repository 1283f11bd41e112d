//! Job scheduler
//!
//! A [`HandlerRegistry`] maps job types to handlers and lists periodic jobs.
//! A [`Worker`] claims ready jobs from a [`JobStore`] with a conditional
//! update and a lease, runs the handler, then deletes the job or schedules
//! its next occurrence. Execution is at-least-once: a worker that dies while
//! holding a job leaves it claimable once the lease lapses, so handlers must
//! be idempotent.

pub mod db;
pub mod error;
pub mod job;
pub mod registry;
pub mod store;
pub mod worker;

pub use db::DbJobStore;
pub use error::{JobError, JobResult};
pub use job::{next_occurrence, Job, JobState, NewJob, Periodic};
pub use registry::{Handler, HandlerRegistry, PeriodicRegistration};
pub use store::{JobQueue, JobStore, MemoryJobStore};
pub use worker::{Worker, WorkerConfig, WorkerStats, WorkerStatsSnapshot};
