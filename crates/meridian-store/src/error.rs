//! Store errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("corrupt record {what}: {reason}")]
    Corrupt { what: String, reason: String },

    #[error("concurrent write conflict on {0}")]
    Conflict(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
