//! Persistence for the Meridian control plane
//!
//! Relational metadata lives behind sea-orm and works with:
//! - **PostgreSQL** (production coordinators, shared by all replicas)
//! - **SQLite** (single-node deployments: `"sqlite://./meridian.db?mode=rwc"`)
//! - **SQLite in-memory** (tests and `meridian dev`: `"sqlite::memory:"`)
//!
//! The secrets store and lease table are exposed as traits with a database
//! implementation and an in-memory one.

pub mod activity;
pub mod clock;
pub mod entities;
pub mod error;
pub mod lease;
pub mod migrator;
pub mod secrets;

pub use activity::{purge_activity_before, record_activity};
pub use clock::{system_clock, Clock, SharedClock, SystemClock, TokioClock};
pub use error::{StoreError, StoreResult};
pub use lease::{
    DbLeaseStore, LeaseGuard, LeaseOutcome, LeaseRecord, LeaseStore, Leases, MemoryLeaseStore,
};
pub use secrets::{DbSecretStore, MemorySecretStore, SecretStore, SecretVersion};

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr};
use std::time::Duration;
use tracing::info;

/// Open a database connection
///
/// An in-memory SQLite database exists per connection, so the pool is pinned
/// to a single connection for `sqlite::memory:`.
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut opts = ConnectOptions::new(database_url.to_string());
    opts.sqlx_logging(false);
    if database_url.starts_with("sqlite::memory:") {
        opts.max_connections(1)
            .min_connections(1)
            .idle_timeout(Duration::from_secs(365 * 24 * 3600))
            .max_lifetime(Duration::from_secs(365 * 24 * 3600));
    }

    let db = Database::connect(opts).await?;

    let backend = db.get_database_backend();
    info!("Connected to database backend: {:?}", backend);

    Ok(db)
}

/// Run migrations
pub async fn migrate(db: &DatabaseConnection) -> Result<(), DbErr> {
    use sea_orm_migration::MigratorTrait;

    info!("Running database migrations...");
    migrator::Migrator::up(db, None).await?;
    info!("Database migrations completed");

    Ok(())
}
