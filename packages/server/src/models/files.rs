use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{file_entry, share_link};
use crate::ingest::IngestOutcome;

pub use super::shared::Pagination;
use super::shared::double_option;

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct FileResponse {
    pub id: i32,
    pub name: String,
    pub original_name: String,
    pub parent_id: Option<i32>,
    #[schema(example = "/Sabbath/2024-05-04/IMG_0001.jpg")]
    pub virtual_path: String,
    pub owner_id: i32,
    pub category_id: Option<i32>,
    /// SHA-256 of the content, `None` for folders.
    pub content_hash: Option<String>,
    pub size: i64,
    pub mime_type: Option<String>,
    pub is_directory: bool,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub tags: Option<String>,
    pub download_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<file_entry::Model> for FileResponse {
    fn from(m: file_entry::Model) -> Self {
        Self {
            id: m.id,
            name: m.name,
            original_name: m.original_name,
            parent_id: m.parent_id,
            virtual_path: m.virtual_path,
            owner_id: m.owner_id,
            category_id: m.category_id,
            content_hash: m.content_hash,
            size: m.size,
            mime_type: m.mime_type,
            is_directory: m.is_directory,
            is_deleted: m.is_deleted,
            deleted_at: m.deleted_at,
            description: m.description,
            tags: m.tags,
            download_count: m.download_count,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct FileListQuery {
    /// Folder to list. The root when absent.
    pub parent_id: Option<i32>,
    pub category_id: Option<i32>,
    /// Media type prefix, e.g. `image/`.
    pub mime_type: Option<String>,
    /// Case-insensitive substring of the name. Searches the whole tree unless `parent_id` is set.
    pub search: Option<String>,
    /// `name` (default), `created_at` or `size`.
    pub sort_by: Option<String>,
    /// `asc` (default) or `desc`.
    pub sort_order: Option<String>,
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}

#[derive(Debug, Deserialize, Default, utoipa::ToSchema)]
pub struct UpdateFileRequest {
    /// New display name; renames the entry.
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<String>)]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<String>)]
    pub tags: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<i32>)]
    pub category_id: Option<Option<i32>>,
}

#[derive(Debug, Default, Deserialize, utoipa::IntoParams)]
pub struct DeleteQuery {
    /// Skip the trash (administrators only).
    #[serde(default)]
    pub permanent: bool,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct UploadResponse {
    pub file: FileResponse,
    /// The content was already stored, no new bytes were written.
    pub deduplicated: bool,
    /// An identical file with the same name already exists in the folder.
    pub skipped: bool,
}

impl From<IngestOutcome> for UploadResponse {
    fn from(o: IngestOutcome) -> Self {
        Self {
            file: o.entry.into(),
            deduplicated: o.deduplicated,
            skipped: o.skipped,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct BatchFailure {
    pub file_name: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Default, Serialize, utoipa::ToSchema)]
pub struct BatchUploadResponse {
    pub uploaded: Vec<UploadResponse>,
    pub skipped: Vec<UploadResponse>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct DeleteResponse {
    pub id: i32,
    pub permanent: bool,
    /// Entries affected, the subtree of a folder included.
    pub entries: u64,
    /// Blob references released by a permanent delete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references_released: Option<u64>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct PurgeResponse {
    pub entries_removed: u64,
    pub references_released: u64,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct RestoreResponse {
    pub file: FileResponse,
    pub restored: u64,
    /// The former parent was gone; the entry was placed in the recovery folder.
    pub recovered: bool,
}

#[derive(Debug, Default, Deserialize, utoipa::ToSchema)]
pub struct ShareRequest {
    /// Link lifetime. Never expires when absent.
    pub expires_in_hours: Option<i64>,
    /// Download budget. Unlimited when absent.
    pub max_downloads: Option<i32>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ShareResponse {
    pub token: String,
    /// Public download path.
    #[schema(example = "/api/share/3f1c0d9a6b2e4c7d8e9f0a1b2c3d4e5f")]
    pub url: String,
    pub file_id: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_downloads: Option<i32>,
    pub remaining_downloads: Option<i32>,
}

impl From<share_link::Model> for ShareResponse {
    fn from(m: share_link::Model) -> Self {
        Self {
            url: format!("/api/share/{}", m.token),
            token: m.token,
            file_id: m.file_id,
            expires_at: m.expires_at,
            max_downloads: m.max_downloads,
            remaining_downloads: m.remaining_downloads,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct TrashQuery {
    /// List the trashed children of this folder instead of the top level.
    pub parent_id: Option<i32>,
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}
