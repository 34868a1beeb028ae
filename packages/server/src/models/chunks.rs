use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::upload_session::SessionState;

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ChunkInitRequest {
    pub file_name: String,
    pub total_size: u64,
    pub chunk_count: u32,
    /// Defaults to `ceil(total_size / chunk_count)`.
    pub chunk_size: Option<u64>,
    pub parent_id: Option<i32>,
    pub category_id: Option<i32>,
    /// Folders below `parent_id` such as `Album/Day 1`; missing ones are created at finalize.
    pub relative_path: Option<String>,
    pub description: Option<String>,
    /// SHA-256 the assembled file must hash to.
    pub expected_hash: Option<String>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SessionRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ChunkInitResponse {
    pub session_id: String,
    pub chunk_size: i64,
    pub chunk_count: i32,
    /// The session is aborted if idle past this point.
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SessionStatus {
    pub session_id: String,
    pub file_name: String,
    pub state: SessionState,
    pub total_size: i64,
    pub chunk_size: i64,
    pub chunk_count: i32,
    pub received_indices: Vec<i32>,
    pub missing_indices: Vec<i32>,
    pub bytes_received: i64,
    /// Percent of bytes received, 0-100.
    pub progress: f64,
    pub expected_hash: Option<String>,
    /// Entry created by a successful finalize.
    pub file_id: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ChunkReceipt {
    pub index: i32,
    /// The chunk had already been received with the same bytes.
    pub duplicate: bool,
    pub status: SessionStatus,
}
