use serde::{Deserialize, Serialize};

use super::auth::{RegistrationResponse, UserResponse};
use crate::entity::registration_request::RegistrationStatus;
use crate::entity::user::{UserRole, UserStatus};

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct UserListQuery {
    pub status: Option<UserStatus>,
    pub role: Option<UserRole>,
    /// Case-insensitive substring of name or email.
    pub search: Option<String>,
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct UpdateUserStatusRequest {
    pub status: UserStatus,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct UpdateUserRoleRequest {
    pub role: UserRole,
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct RegistrationListQuery {
    /// Default: `pending`.
    pub status: Option<RegistrationStatus>,
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}

#[derive(Debug, Default, Deserialize, utoipa::ToSchema)]
pub struct RejectRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct RebuildPathsResponse {
    /// Rows whose `virtual_path` was corrected.
    pub updated: u64,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ApprovalResponse {
    pub registration: RegistrationResponse,
    /// The account created for the applicant.
    pub user: UserResponse,
}
