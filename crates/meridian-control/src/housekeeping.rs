//! Coordinator housekeeping jobs

use meridian_jobs::{HandlerRegistry, JobResult};
use meridian_store::{purge_activity_before, Clock, SharedClock};
use sea_orm::DatabaseConnection;
use std::time::Duration;
use tracing::info;

pub const CLEANUP_ACTIVITY_JOB: &str = "cleanup-activity-log";

/// Register `cleanup-activity-log`: hourly from start, removing activity
/// entries older than `retention`.
pub fn register_activity_cleanup(
    registry: &mut HandlerRegistry,
    db: DatabaseConnection,
    clock: SharedClock,
    retention: Duration,
    queue: &str,
) -> JobResult<()> {
    registry.register_handler(CLEANUP_ACTIVITY_JOB, move |_payload: Vec<u8>| {
        let db = db.clone();
        let clock = clock.clone();
        async move {
            let retention = chrono::Duration::from_std(retention)?;
            let cutoff = clock.now() - retention;
            let removed = purge_activity_before(&db, cutoff).await?;
            if removed > 0 {
                info!(removed, cutoff = %cutoff, "Purged activity log");
            }
            Ok::<_, anyhow::Error>(())
        }
    });

    registry.register_periodic_job(
        CLEANUP_ACTIVITY_JOB,
        queue,
        CLEANUP_ACTIVITY_JOB,
        Duration::ZERO,
        Duration::from_secs(3600),
    )
}
