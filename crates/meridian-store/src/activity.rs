//! Activity log writes and retention

use crate::entities::activity_log;
use crate::error::StoreResult;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveValue::{NotSet, Set},
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};

pub async fn record_activity(
    db: &DatabaseConnection,
    at: DateTime<Utc>,
    kind: &str,
    subject: Option<&str>,
    detail: &str,
) -> StoreResult<()> {
    let row = activity_log::ActiveModel {
        id: NotSet,
        kind: Set(kind.to_string()),
        subject: Set(subject.map(str::to_string)),
        detail: Set(detail.to_string()),
        created_at: Set(at),
    };
    activity_log::Entity::insert(row)
        .exec_without_returning(db)
        .await?;
    Ok(())
}

/// Delete entries created before `cutoff`; returns the number removed
pub async fn purge_activity_before(
    db: &DatabaseConnection,
    cutoff: DateTime<Utc>,
) -> StoreResult<u64> {
    let deleted = activity_log::Entity::delete_many()
        .filter(activity_log::Column::CreatedAt.lt(cutoff))
        .exec(db)
        .await?;
    Ok(deleted.rows_affected)
}
