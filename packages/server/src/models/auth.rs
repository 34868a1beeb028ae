use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::registration_request::{self, RegistrationStatus};
use crate::entity::user::{self, UserRole, UserStatus};
use crate::error::AppError;
use crate::extractors::auth::{ActorRole, AuthUser};

/// What the gateway-identified caller may do next.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct AuthStatusResponse {
    /// Email asserted by the gateway, if any.
    #[schema(example = "deacon@church.org")]
    pub email: Option<String>,
    /// An account exists for the email.
    pub registered: bool,
    /// The account may use the archive.
    pub approved: bool,
    /// No account and no pending request: the caller should register.
    pub needs_registration: bool,
    /// A registration request is waiting for an administrator.
    pub pending_approval: bool,
    /// Reason of the last rejection, if the latest request was rejected.
    pub rejection_reason: Option<String>,
    pub user: Option<UserResponse>,
}

/// Request body for `POST /auth/register`. The email comes from the gateway header.
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct RegisterRequest {
    #[schema(example = "Grace Kim")]
    pub name: String,
    pub phone: Option<String>,
    /// Why the caller wants access.
    pub reason: Option<String>,
}

pub fn validate_register_request(payload: &RegisterRequest) -> Result<(), AppError> {
    let name = payload.name.trim();
    if name.is_empty() || name.chars().count() > 100 {
        return Err(AppError::Validation("Name must be 1-100 characters".into()));
    }
    if let Some(phone) = payload.phone.as_deref()
        && phone.chars().count() > 32
    {
        return Err(AppError::Validation(
            "Phone must be at most 32 characters".into(),
        ));
    }
    if let Some(reason) = payload.reason.as_deref()
        && reason.chars().count() > 1000
    {
        return Err(AppError::Validation(
            "Reason must be at most 1000 characters".into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct RegistrationResponse {
    pub id: i32,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub reason: Option<String>,
    pub status: RegistrationStatus,
    pub rejection_reason: Option<String>,
    /// Earlier rejection reasons, oldest first.
    pub rejection_history: Vec<String>,
    pub processed_by: Option<i32>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<registration_request::Model> for RegistrationResponse {
    fn from(m: registration_request::Model) -> Self {
        Self {
            id: m.id,
            email: m.email,
            name: m.name,
            phone: m.phone,
            reason: m.reason,
            status: m.status,
            rejection_reason: m.rejection_reason,
            rejection_history: m
                .rejection_history
                .as_deref()
                .map(|h| h.lines().map(str::to_string).collect())
                .unwrap_or_default(),
            processed_by: m.processed_by,
            processed_at: m.processed_at,
            created_at: m.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct UserResponse {
    pub id: i32,
    pub email: String,
    pub name: String,
    pub role: UserRole,
    pub status: UserStatus,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<user::Model> for UserResponse {
    fn from(m: user::Model) -> Self {
        Self {
            id: m.id,
            email: m.email,
            name: m.name,
            role: m.role,
            status: m.status,
            last_login_at: m.last_login_at,
            created_at: m.created_at,
        }
    }
}

/// Current caller.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct MeResponse {
    /// `0` for service callers.
    pub id: i32,
    pub email: String,
    pub name: String,
    pub role: ActorRole,
}

impl From<AuthUser> for MeResponse {
    fn from(u: AuthUser) -> Self {
        Self {
            id: u.user_id,
            email: u.email,
            name: u.name,
            role: u.role,
        }
    }
}

/// Access/refresh pair for the legacy token login.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct TokenResponse {
    #[schema(example = "eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9...")]
    pub access_token: String,
    pub refresh_token: String,
    #[schema(example = "Bearer")]
    pub token_type: &'static str,
    /// Access token lifetime in seconds.
    #[schema(example = 86400)]
    pub expires_in: i64,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct RefreshRequest {
    pub refresh_token: String,
}
