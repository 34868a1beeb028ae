use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header, request::Parts},
};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::Serialize;

use crate::entity::registration_request::{self, RegistrationStatus};
use crate::entity::user::{self, UserRole, UserStatus};
use crate::error::AppError;
use crate::state::AppState;
use crate::utils::jwt::{self, TokenKind};

/// Identity header injected by the access gateway.
pub const GATEWAY_EMAIL_HEADER: &str = "cf-access-authenticated-user-email";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    Admin,
    User,
    /// Internal caller authenticated with a static service token.
    Service,
}

/// Authenticated caller.
///
/// Resolved, in order, from the development bypass, a bearer token (static service
/// token or JWT), or the gateway email header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: i32,
    pub email: String,
    pub name: String,
    pub role: ActorRole,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == ActorRole::Admin
    }

    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::InsufficientPermissions)
        }
    }

    /// Mutations on a shared entry are limited to its owner and administrators.
    pub fn require_owner_or_admin(&self, owner_id: i32) -> Result<(), AppError> {
        if self.is_admin() || self.user_id == owner_id {
            Ok(())
        } else {
            Err(AppError::InsufficientPermissions)
        }
    }

    fn service() -> Self {
        AuthUser {
            user_id: 0,
            email: "service@internal".into(),
            name: "Internal Service".into(),
            role: ActorRole::Service,
        }
    }

    fn from_user(user: user::Model) -> Self {
        AuthUser {
            user_id: user.id,
            email: user.email,
            name: user.name,
            role: match user.role {
                UserRole::Admin => ActorRole::Admin,
                UserRole::User => ActorRole::User,
            },
        }
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth = &state.config.auth;

        if auth.dev.enabled && auth.dev.bypass_auth {
            let email = auth
                .dev
                .auto_login_email
                .as_deref()
                .or(state.config.admin.root_email.as_deref())
                .ok_or(AppError::Unauthorized)?;
            return load_active_user(&state.db, email).await.map(AuthUser::from_user);
        }

        if let Some(token) = bearer_token(&parts.headers) {
            if auth
                .service_tokens
                .iter()
                .any(|known| constant_time_eq(known.as_bytes(), token.as_bytes()))
            {
                return Ok(AuthUser::service());
            }

            let claims = jwt::verify(&auth.jwt_secret, token, TokenKind::Access)
                .map_err(|_| AppError::TokenInvalid)?;
            let user = user::Entity::find_by_id(claims.uid)
                .one(&state.db)
                .await?
                .ok_or(AppError::TokenInvalid)?;
            check_status(&user)?;
            return Ok(AuthUser::from_user(user));
        }

        if auth.gateway_enabled {
            let email = gateway_email(&parts.headers).ok_or(AppError::GatewayHeaderMissing)?;
            return load_active_user(&state.db, &email)
                .await
                .map(AuthUser::from_user);
        }

        Err(AppError::Unauthorized)
    }
}

/// Normalised email asserted by the gateway, if present.
pub fn gateway_email(headers: &HeaderMap) -> Option<String> {
    headers
        .get(GATEWAY_EMAIL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Look up a user by email and require an approved account.
pub async fn load_active_user(
    db: &DatabaseConnection,
    email: &str,
) -> Result<user::Model, AppError> {
    let email = email.trim().to_ascii_lowercase();
    let user = user::Entity::find()
        .filter(user::Column::Email.eq(&email))
        .one(db)
        .await?;

    let Some(user) = user else {
        let pending = registration_request::Entity::find()
            .filter(registration_request::Column::Email.eq(&email))
            .filter(registration_request::Column::Status.eq(RegistrationStatus::Pending))
            .one(db)
            .await?;
        return Err(if pending.is_some() {
            AppError::UserNotApproved
        } else {
            AppError::UserNotRegistered
        });
    };

    check_status(&user)?;
    Ok(user)
}

fn check_status(user: &user::Model) -> Result<(), AppError> {
    match user.status {
        UserStatus::Approved => Ok(()),
        UserStatus::Pending => Err(AppError::UserNotApproved),
        UserStatus::Rejected | UserStatus::Suspended => Err(AppError::UserSuspended),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
