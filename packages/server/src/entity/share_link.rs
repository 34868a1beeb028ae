use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "share_link")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Opaque bearer capability.
    #[sea_orm(unique)]
    pub token: String,

    #[sea_orm(indexed)]
    pub file_id: i32,
    pub created_by: i32,

    pub expires_at: Option<DateTimeUtc>,
    pub max_downloads: Option<i32>,
    pub remaining_downloads: Option<i32>,
    #[sea_orm(default_value = 0)]
    pub download_count: i32,

    pub created_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
