//! Registered hubs and their advertised locations

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "hubs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub stable_id: String,

    pub name: String,

    /// Account of the token that first registered this stable id
    pub account_id: String,

    /// JSON-encoded label set
    #[sea_orm(column_type = "Text")]
    pub labels: String,

    /// JSON-encoded location list
    #[sea_orm(column_type = "Text")]
    pub locations: String,

    pub connected: bool,

    pub registered_at: ChronoDateTimeUtc,

    pub last_seen: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
