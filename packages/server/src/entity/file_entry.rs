use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A node in the virtual namespace: either a folder or a file pointing at a blob.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "file_entry")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub name: String,
    /// Name as supplied by the uploader, before any clash suffix.
    pub original_name: String,

    /// `None` for entries at the root.
    #[sea_orm(indexed)]
    pub parent_id: Option<i32>,
    /// Materialized `/a/b/name`, recomputed on move and rename.
    #[sea_orm(column_type = "Text")]
    pub virtual_path: String,

    #[sea_orm(indexed)]
    pub owner_id: i32,
    #[sea_orm(indexed)]
    pub category_id: Option<i32>,

    /// Blob reference. `None` for folders.
    #[sea_orm(indexed)]
    pub content_hash: Option<String>,
    pub size: i64,
    pub mime_type: Option<String>,

    #[sea_orm(default_value = false)]
    pub is_directory: bool,

    #[sea_orm(default_value = false, indexed)]
    pub is_deleted: bool,
    pub deleted_at: Option<DateTimeUtc>,
    pub deleted_by: Option<i32>,
    /// Groups the subtree removed by one soft delete so restore can bring it back together.
    #[sea_orm(indexed)]
    pub trash_batch: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,
    /// Comma separated.
    #[sea_orm(column_type = "Text", nullable)]
    pub tags: Option<String>,

    #[sea_orm(default_value = 0)]
    pub download_count: i32,

    #[sea_orm(indexed)]
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

impl Model {
    pub fn is_file(&self) -> bool {
        !self.is_directory
    }
}

impl ActiveModelBehavior for ActiveModel {}
