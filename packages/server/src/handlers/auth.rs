use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use chrono::Utc;
use sea_orm::*;
use tracing::{info, instrument};

use crate::entity::registration_request::{self, RegistrationStatus};
use crate::entity::user::{self, UserStatus};
use crate::error::{AppError, ErrorBody};
use crate::extractors::auth::{AuthUser, gateway_email, load_active_user};
use crate::extractors::json::AppJson;
use crate::models::auth::{
    AuthStatusResponse, MeResponse, RefreshRequest, RegisterRequest, RegistrationResponse,
    TokenResponse, UserResponse, validate_register_request,
};
use crate::models::shared::ApiResponse;
use crate::state::AppState;
use crate::utils::jwt::{self, TokenKind};

/// Email of a caller that may not have an account yet.
fn caller_email(state: &AppState, headers: &HeaderMap) -> Result<String, AppError> {
    let auth = &state.config.auth;
    if auth.dev.enabled && auth.dev.bypass_auth {
        return auth
            .dev
            .auto_login_email
            .as_deref()
            .or(state.config.admin.root_email.as_deref())
            .map(|e| e.trim().to_ascii_lowercase())
            .ok_or(AppError::Unauthorized);
    }
    if !auth.gateway_enabled {
        return Err(AppError::Unauthorized);
    }
    gateway_email(headers).ok_or(AppError::GatewayHeaderMissing)
}

async fn latest_registration(
    db: &DatabaseConnection,
    email: &str,
) -> Result<Option<registration_request::Model>, DbErr> {
    registration_request::Entity::find()
        .filter(registration_request::Column::Email.eq(email))
        .order_by_desc(registration_request::Column::CreatedAt)
        .one(db)
        .await
}

#[utoipa::path(
    get,
    path = "/status",
    tag = "Auth",
    operation_id = "authStatus",
    summary = "Registration state of the caller",
    description = "Tells a gateway-identified caller whether they have an account, need to \
        register, or are waiting for approval. Never fails for unknown callers.",
    responses(
        (status = 200, description = "Caller state", body = ApiResponse<AuthStatusResponse>),
        (status = 401, description = "No identity (CF_ACCESS_HEADER_MISSING, UNAUTHORIZED)", body = ErrorBody),
    ),
)]
#[instrument(skip(state, headers))]
pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<AuthStatusResponse>>, AppError> {
    let email = caller_email(&state, &headers)?;

    let user = user::Entity::find()
        .filter(user::Column::Email.eq(&email))
        .one(&state.db)
        .await?;
    let registration = latest_registration(&state.db, &email).await?;

    let pending_approval = matches!(user.as_ref().map(|u| u.status), Some(UserStatus::Pending))
        || registration
            .as_ref()
            .is_some_and(|r| r.status == RegistrationStatus::Pending);
    let rejection_reason = registration
        .as_ref()
        .filter(|r| r.status == RegistrationStatus::Rejected)
        .and_then(|r| r.rejection_reason.clone());

    Ok(Json(ApiResponse::ok(AuthStatusResponse {
        email: Some(email),
        registered: user.is_some(),
        approved: user
            .as_ref()
            .is_some_and(|u| u.status == UserStatus::Approved),
        needs_registration: user.is_none() && !pending_approval,
        pending_approval,
        rejection_reason,
        user: user.map(UserResponse::from),
    })))
}

#[utoipa::path(
    post,
    path = "/register",
    tag = "Auth",
    operation_id = "register",
    summary = "Request access",
    description = "Records a registration request for the gateway-identified email. A rejected \
        request can be filed again; the previous reason is kept in its history.",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Request recorded", body = ApiResponse<RegistrationResponse>),
        (status = 400, description = "Validation error (VALIDATION_FAILED)", body = ErrorBody),
        (status = 401, description = "No identity (CF_ACCESS_HEADER_MISSING)", body = ErrorBody),
        (status = 409, description = "Already registered (USER_EXISTS, REGISTRATION_EXISTS)", body = ErrorBody),
    ),
)]
#[instrument(skip(state, headers, payload))]
pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(payload): AppJson<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    validate_register_request(&payload)?;
    let email = caller_email(&state, &headers)?;

    let existing_user = user::Entity::find()
        .filter(user::Column::Email.eq(&email))
        .one(&state.db)
        .await?;
    if existing_user.is_some() {
        return Err(AppError::UserExists);
    }

    let now = Utc::now();
    let name = payload.name.trim().to_string();
    let saved = match latest_registration(&state.db, &email).await? {
        Some(r) if r.status == RegistrationStatus::Rejected => {
            let history = match (r.rejection_history.clone(), r.rejection_reason.clone()) {
                (Some(h), Some(reason)) => Some(format!("{h}\n{reason}")),
                (None, Some(reason)) => Some(reason),
                (h, None) => h,
            };
            let mut active: registration_request::ActiveModel = r.into();
            active.name = Set(name);
            active.phone = Set(payload.phone);
            active.reason = Set(payload.reason);
            active.status = Set(RegistrationStatus::Pending);
            active.rejection_history = Set(history);
            active.rejection_reason = Set(None);
            active.processed_by = Set(None);
            active.processed_at = Set(None);
            active.created_at = Set(now);
            active.update(&state.db).await?
        }
        Some(_) => return Err(AppError::RegistrationExists),
        None => registration_request::ActiveModel {
            email: Set(email.clone()),
            name: Set(name),
            phone: Set(payload.phone),
            reason: Set(payload.reason),
            status: Set(RegistrationStatus::Pending),
            created_at: Set(now),
            ..Default::default()
        }
        .insert(&state.db)
        .await
        .map_err(|e| match e.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => AppError::RegistrationExists,
            _ => AppError::from(e),
        })?,
    };

    info!(email = %saved.email, "Registration requested");
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::with_message(
            RegistrationResponse::from(saved),
            "Registration submitted, waiting for approval",
        )),
    ))
}

#[utoipa::path(
    get,
    path = "/me",
    tag = "Auth",
    operation_id = "me",
    summary = "Current caller",
    responses(
        (status = 200, description = "Caller identity", body = ApiResponse<MeResponse>),
        (status = 401, description = "Unauthorized (CF_ACCESS_HEADER_MISSING, USER_NOT_REGISTERED, TOKEN_INVALID)", body = ErrorBody),
        (status = 403, description = "Not approved (USER_NOT_APPROVED, USER_SUSPENDED)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(auth_user), fields(user_id = auth_user.user_id))]
pub async fn me(auth_user: AuthUser) -> Json<ApiResponse<MeResponse>> {
    Json(ApiResponse::ok(MeResponse::from(auth_user)))
}

fn issue_tokens(state: &AppState, user: &user::Model) -> Result<TokenResponse, AppError> {
    let auth = &state.config.auth;
    let sign = |kind, hours| {
        jwt::sign(&auth.jwt_secret, user.id, &user.email, kind, hours)
            .map_err(|e| AppError::Internal(format!("JWT sign error: {e}")))
    };
    Ok(TokenResponse {
        access_token: sign(TokenKind::Access, auth.token_expiry_hours)?,
        refresh_token: sign(TokenKind::Refresh, auth.refresh_expiry_hours)?,
        token_type: "Bearer",
        expires_in: auth.token_expiry_hours * 3600,
    })
}

#[utoipa::path(
    post,
    path = "/token",
    tag = "Auth",
    operation_id = "issueToken",
    summary = "Issue a bearer token pair",
    description = "Exchanges the gateway identity for an access/refresh JWT pair, for clients \
        that cannot go through the gateway on every request.",
    responses(
        (status = 200, description = "Token pair", body = ApiResponse<TokenResponse>),
        (status = 401, description = "Unauthorized (CF_ACCESS_HEADER_MISSING, USER_NOT_REGISTERED)", body = ErrorBody),
        (status = 403, description = "Not approved (USER_NOT_APPROVED, USER_SUSPENDED, INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
    ),
    security(("gateway" = [])),
)]
#[instrument(skip(state, auth_user), fields(user_id = auth_user.user_id))]
pub async fn token(
    auth_user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<TokenResponse>>, AppError> {
    let user = user::Entity::find_by_id(auth_user.user_id)
        .one(&state.db)
        .await?
        .ok_or(AppError::InsufficientPermissions)?;

    let tokens = issue_tokens(&state, &user)?;

    let mut active: user::ActiveModel = user.into();
    active.last_login_at = Set(Some(Utc::now()));
    active.update(&state.db).await?;

    Ok(Json(ApiResponse::ok(tokens)))
}

#[utoipa::path(
    post,
    path = "/refresh",
    tag = "Auth",
    operation_id = "refreshToken",
    summary = "Refresh a bearer token pair",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New token pair", body = ApiResponse<TokenResponse>),
        (status = 401, description = "Invalid refresh token (TOKEN_INVALID)", body = ErrorBody),
        (status = 403, description = "Account no longer approved (USER_NOT_APPROVED, USER_SUSPENDED)", body = ErrorBody),
    ),
)]
#[instrument(skip(state, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    AppJson(payload): AppJson<RefreshRequest>,
) -> Result<Json<ApiResponse<TokenResponse>>, AppError> {
    let claims = jwt::verify(
        &state.config.auth.jwt_secret,
        payload.refresh_token.trim(),
        TokenKind::Refresh,
    )
    .map_err(|_| AppError::TokenInvalid)?;

    let user = load_active_user(&state.db, &claims.sub).await?;
    if user.id != claims.uid {
        return Err(AppError::TokenInvalid);
    }

    Ok(Json(ApiResponse::ok(issue_tokens(&state, &user)?)))
}
