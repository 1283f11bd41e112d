//! Registered hubs

use crate::error::{ControlError, ControlResult};
use chrono::{DateTime, Utc};
use meridian_proto::{HubInfo, HubRegisterRequest, LabelSet, Location, StableId};
use meridian_store::entities::hub;
use meridian_store::StoreError;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder,
};
use tracing::debug;

/// Hub rows keyed by stable id
#[derive(Clone)]
pub struct HubRegistry {
    db: DatabaseConnection,
}

impl HubRegistry {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Record or refresh a hub on behalf of `owner`, the registering
    /// token's account.
    ///
    /// The first registration binds the stable id to its owner. Registering
    /// it again replaces name, labels and locations and keeps the first
    /// registration time; a different owner gets `PermissionDenied`.
    pub async fn register(
        &self,
        request: &HubRegisterRequest,
        owner: StableId,
        now: DateTime<Utc>,
    ) -> ControlResult<HubInfo> {
        let labels = encode_json(&request.labels)?;
        let locations = encode_json(&request.locations)?;
        let row = hub::ActiveModel {
            stable_id: Set(request.stable_id.to_string()),
            name: Set(request.name.clone()),
            account_id: Set(owner.to_string()),
            labels: Set(labels.clone()),
            locations: Set(locations.clone()),
            connected: Set(true),
            registered_at: Set(now),
            last_seen: Set(now),
        };

        let inserted = hub::Entity::insert(row)
            .on_conflict(
                OnConflict::column(hub::Column::StableId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        if inserted == 0 {
            let updated = hub::Entity::update_many()
                .col_expr(hub::Column::Name, Expr::value(request.name.clone()))
                .col_expr(hub::Column::Labels, Expr::value(labels))
                .col_expr(hub::Column::Locations, Expr::value(locations))
                .col_expr(hub::Column::Connected, Expr::value(true))
                .col_expr(hub::Column::LastSeen, Expr::value(now))
                .filter(hub::Column::StableId.eq(request.stable_id.to_string()))
                .filter(hub::Column::AccountId.eq(owner.to_string()))
                .exec(&self.db)
                .await?;
            if updated.rows_affected == 0 {
                return Err(not_owner(request.stable_id));
            }
        }

        debug!(
            hub_id = %request.stable_id,
            locations = request.locations.len(),
            "Hub registered"
        );

        Ok(HubInfo {
            stable_id: request.stable_id,
            name: request.name.clone(),
            labels: request.labels.clone(),
            locations: request.locations.clone(),
            connected: true,
            last_seen: now,
        })
    }

    /// Mark a hub disconnected; returns false for an unknown id
    pub async fn disconnect(
        &self,
        stable_id: StableId,
        owner: StableId,
        now: DateTime<Utc>,
    ) -> ControlResult<bool> {
        let updated = hub::Entity::update_many()
            .col_expr(hub::Column::Connected, Expr::value(false))
            .col_expr(hub::Column::LastSeen, Expr::value(now))
            .filter(hub::Column::StableId.eq(stable_id.to_string()))
            .filter(hub::Column::AccountId.eq(owner.to_string()))
            .exec(&self.db)
            .await?;
        if updated.rows_affected > 0 {
            return Ok(true);
        }

        match hub::Entity::find_by_id(stable_id.to_string())
            .one(&self.db)
            .await?
        {
            Some(_) => Err(not_owner(stable_id)),
            None => Ok(false),
        }
    }

    pub async fn get(&self, stable_id: StableId) -> ControlResult<Option<HubInfo>> {
        hub::Entity::find_by_id(stable_id.to_string())
            .one(&self.db)
            .await?
            .map(hub_info)
            .transpose()
    }

    /// All hubs, oldest stable id first
    pub async fn list(&self) -> ControlResult<Vec<HubInfo>> {
        hub::Entity::find()
            .order_by_asc(hub::Column::StableId)
            .all(&self.db)
            .await?
            .into_iter()
            .map(hub_info)
            .collect()
    }

    pub async fn count(&self) -> ControlResult<u64> {
        Ok(hub::Entity::find().count(&self.db).await?)
    }

    pub async fn connected_count(&self) -> ControlResult<u64> {
        Ok(hub::Entity::find()
            .filter(hub::Column::Connected.eq(true))
            .count(&self.db)
            .await?)
    }
}

fn not_owner(stable_id: StableId) -> ControlError {
    ControlError::PermissionDenied(format!(
        "hub {} is registered to another account",
        stable_id
    ))
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
        what: "hub".to_string(),
        reason: e.to_string(),
    })
}

fn hub_info(row: hub::Model) -> ControlResult<HubInfo> {
    let corrupt = |reason: String| StoreError::Corrupt {
        what: format!("hub {}", row.stable_id),
        reason,
    };
    let stable_id: StableId = row.stable_id.parse().map_err(|e| corrupt(format!("{}", e)))?;
    let labels: LabelSet = serde_json::from_str(&row.labels).map_err(|e| corrupt(e.to_string()))?;
    let locations: Vec<Location> =
        serde_json::from_str(&row.locations).map_err(|e| corrupt(e.to_string()))?;

    Ok(HubInfo {
        stable_id,
        name: row.name,
        labels,
        locations,
        connected: row.connected,
        last_seen: row.last_seen,
    })
}
