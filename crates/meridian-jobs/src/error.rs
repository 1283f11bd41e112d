//! Scheduler errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corrupt job {id}: {reason}")]
    Corrupt { id: i64, reason: String },

    /// The claim expired and another worker took the job over
    #[error("lost claim on job {0}")]
    LostClaim(i64),

    #[error("job {job_type} failed after {attempts} attempt(s): {message}")]
    HandlerFailure {
        job_type: String,
        attempts: u32,
        message: String,
    },
}

pub type JobResult<T> = Result<T, JobError>;
