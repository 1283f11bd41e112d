//! Initial schema: tokens, hubs, jobs, leases, secrets and the activity log

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CapabilityTokens::Table)
                    .if_not_exists()
                    .col(string_len(CapabilityTokens::Jti, 64).primary_key())
                    .col(string_len(CapabilityTokens::AccountId, 32).not_null())
                    .col(string_len(CapabilityTokens::Namespace, 255).not_null())
                    .col(string_len(CapabilityTokens::Capabilities, 255).not_null())
                    .col(string_len(CapabilityTokens::KeyId, 32).not_null())
                    .col(timestamp_with_time_zone(CapabilityTokens::IssuedAt).not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_capability_tokens_account")
                    .table(CapabilityTokens::Table)
                    .col(CapabilityTokens::AccountId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Hubs::Table)
                    .if_not_exists()
                    .col(string_len(Hubs::StableId, 32).primary_key())
                    .col(string_len(Hubs::Name, 255).not_null())
                    .col(string_len(Hubs::AccountId, 32).not_null())
                    .col(text(Hubs::Labels).not_null())
                    .col(text(Hubs::Locations).not_null())
                    .col(boolean(Hubs::Connected).not_null().default(false))
                    .col(timestamp_with_time_zone(Hubs::RegisteredAt).not_null())
                    .col(timestamp_with_time_zone(Hubs::LastSeen).not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(
                        integer(Jobs::Id)
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(string_len(Jobs::Queue, 64).not_null())
                    .col(string_len(Jobs::JobType, 128).not_null())
                    .col(text(Jobs::Payload).not_null())
                    .col(timestamp_with_time_zone(Jobs::RunAt).not_null())
                    .col(timestamp_with_time_zone(Jobs::ScheduledAt).not_null())
                    .col(string_len_null(Jobs::PeriodicName, 128).unique_key())
                    .col(big_integer_null(Jobs::IntervalSecs))
                    .col(integer(Jobs::Attempts).not_null().default(0))
                    .col(string_len(Jobs::State, 16).not_null().default("ready"))
                    .col(string_len_null(Jobs::ClaimedBy, 128))
                    .col(timestamp_with_time_zone_null(Jobs::LeaseExpiresAt))
                    .col(text_null(Jobs::LastError))
                    .col(timestamp_with_time_zone(Jobs::CreatedAt).not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Leases::Table)
                    .if_not_exists()
                    .col(string_len(Leases::Name, 255).primary_key())
                    .col(string_len(Leases::Holder, 128).not_null())
                    .col(timestamp_with_time_zone(Leases::ExpiresAt).not_null())
                    .col(big_integer(Leases::Generation).not_null().default(1))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Secrets::Table)
                    .if_not_exists()
                    .col(string_len(Secrets::Path, 255).not_null())
                    .col(big_integer(Secrets::Version).not_null())
                    .col(text(Secrets::Value).not_null())
                    .col(timestamp_with_time_zone(Secrets::CreatedAt).not_null())
                    .primary_key(Index::create().col(Secrets::Path).col(Secrets::Version))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ActivityLog::Table)
                    .if_not_exists()
                    .col(
                        integer(ActivityLog::Id)
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(string_len(ActivityLog::Kind, 64).not_null())
                    .col(string_len_null(ActivityLog::Subject, 255))
                    .col(text(ActivityLog::Detail).not_null())
                    .col(timestamp_with_time_zone(ActivityLog::CreatedAt).not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_activity_log_created_at")
                    .table(ActivityLog::Table)
                    .col(ActivityLog::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ActivityLog::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Secrets::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Leases::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Jobs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Hubs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(CapabilityTokens::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CapabilityTokens {
    #[sea_orm(iden = "capability_tokens")]
    Table,
    Jti,
    AccountId,
    Namespace,
    Capabilities,
    KeyId,
    IssuedAt,
}

#[derive(DeriveIden)]
enum Hubs {
    #[sea_orm(iden = "hubs")]
    Table,
    StableId,
    Name,
    AccountId,
    Labels,
    Locations,
    Connected,
    RegisteredAt,
    LastSeen,
}

#[derive(DeriveIden)]
pub(super) enum Jobs {
    #[sea_orm(iden = "jobs")]
    Table,
    Id,
    Queue,
    JobType,
    Payload,
    RunAt,
    ScheduledAt,
    PeriodicName,
    IntervalSecs,
    Attempts,
    State,
    ClaimedBy,
    LeaseExpiresAt,
    LastError,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Leases {
    #[sea_orm(iden = "leases")]
    Table,
    Name,
    Holder,
    ExpiresAt,
    Generation,
}

#[derive(DeriveIden)]
enum Secrets {
    #[sea_orm(iden = "secrets")]
    Table,
    Path,
    Version,
    Value,
    CreatedAt,
}

#[derive(DeriveIden)]
enum ActivityLog {
    #[sea_orm(iden = "activity_log")]
    Table,
    Id,
    Kind,
    Subject,
    Detail,
    CreatedAt,
}
