//! Scheduled jobs, both one-shot and periodic

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    /// Insertion order; breaks ties between jobs with equal `run_at`
    #[sea_orm(primary_key)]
    pub id: i32,

    pub queue: String,

    pub job_type: String,

    /// Base64-encoded payload
    #[sea_orm(column_type = "Text")]
    pub payload: String,

    pub run_at: ChronoDateTimeUtc,

    /// Grid slot of the current occurrence; `run_at` minus any retry delay
    pub scheduled_at: ChronoDateTimeUtc,

    /// Set for the single pending row of a periodic job
    #[sea_orm(unique)]
    pub periodic_name: Option<String>,

    pub interval_secs: Option<i64>,

    pub attempts: i32,

    /// `ready` or `dead`
    pub state: String,

    pub claimed_by: Option<String>,

    pub lease_expires_at: Option<ChronoDateTimeUtc>,

    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
