//! Named leases (distributed lock table)

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "leases")]
pub struct Model {
    /// Resource name, e.g. `renew-cert:example.com`
    #[sea_orm(primary_key, auto_increment = false)]
    pub name: String,

    pub holder: String,

    pub expires_at: ChronoDateTimeUtc,

    /// Bumped on every acquisition
    pub generation: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
