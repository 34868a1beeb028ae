use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::export_job::{self, ArchiveFormat, ExportStatus};
use crate::export::ExportFilter;

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ExportRequest {
    #[serde(flatten)]
    pub filter: ExportFilter,
    #[serde(default)]
    pub format: ArchiveFormat,
    /// Label used for the archive name. Default: `export`.
    pub name: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ExportJobResponse {
    pub job_id: String,
    pub status: ExportStatus,
    pub format: ArchiveFormat,
    #[schema(value_type = Object)]
    pub filter: serde_json::Value,
    /// 0-100.
    pub progress: i32,
    pub processed_files: i64,
    pub total_files: i64,
    pub processed_size: i64,
    pub total_size: i64,
    pub archive_name: String,
    pub archive_size: Option<i64>,
    pub error: Option<String>,
    /// Download path once the job has completed.
    pub download_url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<export_job::Model> for ExportJobResponse {
    fn from(m: export_job::Model) -> Self {
        let download_url = (m.status == ExportStatus::Completed)
            .then(|| format!("/api/export/download/{}", m.job_id));
        Self {
            job_id: m.job_id,
            status: m.status,
            format: m.format,
            filter: m.filter,
            progress: m.progress,
            processed_files: m.processed_files,
            total_files: m.total_files,
            processed_size: m.processed_size,
            total_size: m.total_size,
            archive_name: m.archive_name,
            archive_size: m.archive_size,
            error: m.error,
            download_url,
            expires_at: m.expires_at,
            started_at: m.started_at,
            completed_at: m.completed_at,
            created_at: m.created_at,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct QuickExportQuery {
    /// `this-month`, `last-sabbath` or `all-photos`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Archive format. Default: `zip`.
    #[serde(default)]
    #[param(value_type = Option<String>)]
    pub format: ArchiveFormat,
}
