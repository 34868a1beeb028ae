use sea_orm::entity::prelude::*;
use sea_orm::prelude::StringLen;
use serde::{Deserialize, Serialize};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, utoipa::ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "expired")]
    Expired,
}

impl ExportStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExportStatus::Completed | ExportStatus::Failed | ExportStatus::Expired
        )
    }
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, utoipa::ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
pub enum ArchiveFormat {
    #[default]
    #[sea_orm(string_value = "zip")]
    #[serde(rename = "zip")]
    Zip,
    #[sea_orm(string_value = "tar")]
    #[serde(rename = "tar")]
    Tar,
    #[sea_orm(string_value = "tar.gz")]
    #[serde(rename = "tar.gz", alias = "tgz")]
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "application/zip",
            ArchiveFormat::Tar => "application/x-tar",
            ArchiveFormat::TarGz => "application/gzip",
        }
    }
}

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "export_job")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub job_id: String,

    #[sea_orm(indexed)]
    pub owner_id: i32,

    /// Serialized export filter.
    #[sea_orm(column_type = "Json")]
    pub filter: Json,
    pub format: ArchiveFormat,

    pub status: ExportStatus,
    /// 0..=100, never decreases.
    pub progress: i32,
    pub processed_files: i64,
    pub total_files: i64,
    pub processed_size: i64,
    pub total_size: i64,

    pub archive_name: String,
    /// Spool path of the finished archive.
    #[sea_orm(column_type = "Text", nullable)]
    pub archive_path: Option<String>,
    pub archive_size: Option<i64>,
    #[sea_orm(column_type = "Text", nullable)]
    pub error: Option<String>,

    pub expires_at: Option<DateTimeUtc>,
    pub started_at: Option<DateTimeUtc>,
    pub completed_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
