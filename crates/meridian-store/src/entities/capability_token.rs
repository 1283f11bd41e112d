//! Backing record of an issued capability token

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "capability_tokens")]
pub struct Model {
    /// Token id (the `jti` claim)
    #[sea_orm(primary_key, auto_increment = false)]
    pub jti: String,

    pub account_id: String,

    pub namespace: String,

    /// Capability names in issuance order, comma separated
    pub capabilities: String,

    /// Signing key id used for this token
    pub key_id: String,

    pub issued_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
