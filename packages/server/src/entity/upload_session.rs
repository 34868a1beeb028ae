use sea_orm::entity::prelude::*;
use sea_orm::prelude::StringLen;
use serde::{Deserialize, Serialize};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, utoipa::ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[sea_orm(string_value = "open")]
    Open,
    #[sea_orm(string_value = "finalized")]
    Finalized,
    #[sea_orm(string_value = "aborted")]
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Open)
    }
}

/// A resumable chunked upload. Chunk bytes live in the spool file under the
/// upload directory; this row tracks which chunks have landed.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "upload_session")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    #[sea_orm(indexed)]
    pub owner_id: i32,

    pub file_name: String,
    pub parent_id: Option<i32>,
    pub category_id: Option<i32>,
    #[sea_orm(column_type = "Text", nullable)]
    pub relative_path: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,

    pub total_size: i64,
    pub chunk_size: i64,
    pub chunk_count: i32,
    pub expected_hash: Option<String>,

    /// `[{index, offset, length, sha256}]`, ordered by index.
    #[sea_orm(column_type = "Json")]
    pub received_chunks: Json,
    pub bytes_received: i64,

    #[sea_orm(indexed)]
    pub state: SessionState,
    pub file_id: Option<i32>,

    pub created_at: DateTimeUtc,
    #[sea_orm(indexed)]
    pub updated_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
