use serde::Deserialize;

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateFolderRequest {
    pub name: String,
    /// Created at the root when absent.
    pub parent_id: Option<i32>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct MoveRequest {
    /// Destination folder; `null` moves the entry to the root.
    pub parent_id: Option<i32>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct RenameRequest {
    pub name: String,
}
