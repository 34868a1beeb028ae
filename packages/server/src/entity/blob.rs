use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Catalog row for a physical blob in the content store.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "blob")]
pub struct Model {
    /// SHA-256 content hash, lowercase hex.
    #[sea_orm(primary_key, auto_increment = false)]
    pub content_hash: String,

    /// Size of the blob in bytes.
    pub size: i64,

    /// Number of file entries (live or in the trash) pointing at this blob.
    pub ref_count: i64,

    pub created_at: DateTimeUtc,

    /// Last reference change or ingest touch. The GC grace window starts here.
    pub updated_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
