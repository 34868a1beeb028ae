use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use chrono::Utc;
use sea_orm::sea_query::{Expr, ExprTrait, Func, LikeExpr};
use sea_orm::*;
use tracing::{info, instrument};

use crate::entity::registration_request::{self, RegistrationStatus};
use crate::entity::user::{self, UserRole, UserStatus};
use crate::error::{AppError, ErrorBody};
use crate::extractors::auth::AuthUser;
use crate::extractors::json::{AppJson, AppQuery};
use crate::gc::{self, GcReport};
use crate::models::admin::*;
use crate::models::auth::{RegistrationResponse, UserResponse};
use crate::models::shared::{ApiResponse, Pagination, clamp_page, escape_like};
use crate::namespace;
use crate::state::AppState;

async fn find_user<C: ConnectionTrait>(db: &C, id: i32) -> Result<user::Model, AppError> {
    user::Entity::find_by_id(id)
        .one(db)
        .await?
        .ok_or(AppError::UserNotFound)
}

async fn find_pending_registration<C: ConnectionTrait>(
    db: &C,
    id: i32,
) -> Result<registration_request::Model, AppError> {
    let registration = registration_request::Entity::find_by_id(id)
        .one(db)
        .await?
        .ok_or(AppError::RegistrationNotFound)?;
    if registration.status != RegistrationStatus::Pending {
        return Err(AppError::Validation(
            "Only pending registrations can be reviewed".into(),
        ));
    }
    Ok(registration)
}

#[utoipa::path(
    get,
    path = "/users",
    tag = "Admin",
    operation_id = "listUsers",
    summary = "List users",
    params(UserListQuery),
    responses(
        (status = 200, description = "One page of users", body = ApiResponse<Vec<UserResponse>>),
        (status = 403, description = "Not an administrator (INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, query), fields(user_id = auth_user.user_id))]
pub async fn list_users(
    auth_user: AuthUser,
    State(state): State<AppState>,
    AppQuery(query): AppQuery<UserListQuery>,
) -> Result<Json<ApiResponse<Vec<UserResponse>>>, AppError> {
    auth_user.require_admin()?;
    let (page, per_page) = clamp_page(query.page, query.per_page);

    let mut select = user::Entity::find();
    if let Some(status) = query.status {
        select = select.filter(user::Column::Status.eq(status));
    }
    if let Some(role) = query.role {
        select = select.filter(user::Column::Role.eq(role));
    }
    if let Some(term) = query.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let pattern = format!("%{}%", escape_like(term).to_lowercase());
        select = select.filter(
            Condition::any()
                .add(
                    Expr::expr(Func::lower(Expr::col(user::Column::Name)))
                        .like(LikeExpr::new(pattern.clone()).escape('\\')),
                )
                .add(
                    Expr::expr(Func::lower(Expr::col(user::Column::Email)))
                        .like(LikeExpr::new(pattern).escape('\\')),
                ),
        );
    }

    let paginator = select
        .order_by_desc(user::Column::CreatedAt)
        .order_by_asc(user::Column::Id)
        .paginate(&state.db, per_page);
    let total = paginator.num_items().await?;
    let users = paginator.fetch_page(page - 1).await?;

    Ok(Json(ApiResponse::paginated(
        users.into_iter().map(UserResponse::from).collect(),
        Pagination::new(page, per_page, total),
    )))
}

#[utoipa::path(
    put,
    path = "/users/{id}/status",
    tag = "Admin",
    operation_id = "updateUserStatus",
    summary = "Approve, reject or suspend a user",
    params(("id" = i32, Path, description = "User ID")),
    request_body = UpdateUserStatusRequest,
    responses(
        (status = 200, description = "Updated user", body = ApiResponse<UserResponse>),
        (status = 400, description = "Own account (VALIDATION_FAILED)", body = ErrorBody),
        (status = 403, description = "Not an administrator (INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
        (status = 404, description = "Unknown user (USER_NOT_FOUND)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, payload), fields(user_id = auth_user.user_id, target_user = id))]
pub async fn update_user_status(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i32>,
    AppJson(payload): AppJson<UpdateUserStatusRequest>,
) -> Result<Json<ApiResponse<UserResponse>>, AppError> {
    auth_user.require_admin()?;
    if id == auth_user.user_id && payload.status != UserStatus::Approved {
        return Err(AppError::Validation(
            "Administrators cannot lock themselves out".into(),
        ));
    }

    let existing = find_user(&state.db, id).await?;
    let mut active: user::ActiveModel = existing.into();
    active.status = Set(payload.status);
    active.updated_at = Set(Utc::now());
    let updated = active.update(&state.db).await?;

    info!(target_user = id, status = ?payload.status, "Changed user status");
    Ok(Json(ApiResponse::ok(updated.into())))
}

#[utoipa::path(
    put,
    path = "/users/{id}/role",
    tag = "Admin",
    operation_id = "updateUserRole",
    summary = "Change a user's role",
    params(("id" = i32, Path, description = "User ID")),
    request_body = UpdateUserRoleRequest,
    responses(
        (status = 200, description = "Updated user", body = ApiResponse<UserResponse>),
        (status = 400, description = "Own account (VALIDATION_FAILED)", body = ErrorBody),
        (status = 403, description = "Not an administrator (INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
        (status = 404, description = "Unknown user (USER_NOT_FOUND)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, payload), fields(user_id = auth_user.user_id, target_user = id))]
pub async fn update_user_role(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i32>,
    AppJson(payload): AppJson<UpdateUserRoleRequest>,
) -> Result<Json<ApiResponse<UserResponse>>, AppError> {
    auth_user.require_admin()?;
    if id == auth_user.user_id && payload.role != UserRole::Admin {
        return Err(AppError::Validation(
            "Administrators cannot demote themselves".into(),
        ));
    }

    let existing = find_user(&state.db, id).await?;
    let mut active: user::ActiveModel = existing.into();
    active.role = Set(payload.role);
    active.updated_at = Set(Utc::now());
    let updated = active.update(&state.db).await?;

    info!(target_user = id, role = ?payload.role, "Changed user role");
    Ok(Json(ApiResponse::ok(updated.into())))
}

#[utoipa::path(
    get,
    path = "/registrations",
    tag = "Admin",
    operation_id = "listRegistrations",
    summary = "List registration requests",
    params(RegistrationListQuery),
    responses(
        (status = 200, description = "One page of requests", body = ApiResponse<Vec<RegistrationResponse>>),
        (status = 403, description = "Not an administrator (INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, query), fields(user_id = auth_user.user_id))]
pub async fn list_registrations(
    auth_user: AuthUser,
    State(state): State<AppState>,
    AppQuery(query): AppQuery<RegistrationListQuery>,
) -> Result<Json<ApiResponse<Vec<RegistrationResponse>>>, AppError> {
    auth_user.require_admin()?;
    let (page, per_page) = clamp_page(query.page, query.per_page);
    let status = query.status.unwrap_or(RegistrationStatus::Pending);

    let paginator = registration_request::Entity::find()
        .filter(registration_request::Column::Status.eq(status))
        .order_by_asc(registration_request::Column::CreatedAt)
        .paginate(&state.db, per_page);
    let total = paginator.num_items().await?;
    let requests = paginator.fetch_page(page - 1).await?;

    Ok(Json(ApiResponse::paginated(
        requests
            .into_iter()
            .map(RegistrationResponse::from)
            .collect(),
        Pagination::new(page, per_page, total),
    )))
}

#[utoipa::path(
    put,
    path = "/registrations/{id}/approve",
    tag = "Admin",
    operation_id = "approveRegistration",
    summary = "Approve a registration",
    description = "Creates an approved account for the applicant. The configured root email \
        is created as an administrator.",
    params(("id" = i32, Path, description = "Registration ID")),
    responses(
        (status = 200, description = "Approved", body = ApiResponse<ApprovalResponse>),
        (status = 400, description = "Not pending (VALIDATION_FAILED)", body = ErrorBody),
        (status = 403, description = "Not an administrator (INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
        (status = 404, description = "Unknown request (REGISTRATION_NOT_FOUND)", body = ErrorBody),
        (status = 409, description = "Account exists (USER_EXISTS)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user), fields(user_id = auth_user.user_id, registration_id = id))]
pub async fn approve_registration(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<Json<ApiResponse<ApprovalResponse>>, AppError> {
    auth_user.require_admin()?;

    let txn = state.db.begin().await?;
    let registration = find_pending_registration(&txn, id).await?;

    let exists = user::Entity::find()
        .filter(user::Column::Email.eq(&registration.email))
        .count(&txn)
        .await?;
    if exists > 0 {
        return Err(AppError::UserExists);
    }

    let is_root = state
        .config
        .admin
        .root_email
        .as_deref()
        .is_some_and(|root| root.trim().eq_ignore_ascii_case(&registration.email));
    let now = Utc::now();
    let created = user::ActiveModel {
        email: Set(registration.email.clone()),
        name: Set(registration.name.clone()),
        role: Set(if is_root { UserRole::Admin } else { UserRole::User }),
        status: Set(UserStatus::Approved),
        last_login_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(&txn)
    .await?;

    let mut active: registration_request::ActiveModel = registration.into();
    active.status = Set(RegistrationStatus::Approved);
    active.processed_by = Set(Some(auth_user.user_id));
    active.processed_at = Set(Some(now));
    let registration = active.update(&txn).await?;
    txn.commit().await?;

    info!(email = %created.email, new_user = created.id, "Approved registration");
    Ok(Json(ApiResponse::with_message(
        ApprovalResponse {
            registration: registration.into(),
            user: created.into(),
        },
        "Registration approved",
    )))
}

#[utoipa::path(
    put,
    path = "/registrations/{id}/reject",
    tag = "Admin",
    operation_id = "rejectRegistration",
    summary = "Reject a registration",
    description = "The optional reason is shown to the applicant, who may register again.",
    params(("id" = i32, Path, description = "Registration ID")),
    request_body(content = RejectRequest, description = "Optional reason"),
    responses(
        (status = 200, description = "Rejected", body = ApiResponse<RegistrationResponse>),
        (status = 400, description = "Not pending (VALIDATION_FAILED)", body = ErrorBody),
        (status = 403, description = "Not an administrator (INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
        (status = 404, description = "Unknown request (REGISTRATION_NOT_FOUND)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, body), fields(user_id = auth_user.user_id, registration_id = id))]
pub async fn reject_registration(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i32>,
    body: Bytes,
) -> Result<Json<ApiResponse<RegistrationResponse>>, AppError> {
    auth_user.require_admin()?;
    let payload: RejectRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RejectRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::InvalidRequest(e.to_string()))?
    };
    let reason = payload
        .reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());

    let registration = find_pending_registration(&state.db, id).await?;
    let mut active: registration_request::ActiveModel = registration.into();
    active.status = Set(RegistrationStatus::Rejected);
    active.rejection_reason = Set(reason);
    active.processed_by = Set(Some(auth_user.user_id));
    active.processed_at = Set(Some(Utc::now()));
    let registration = active.update(&state.db).await?;

    info!(email = %registration.email, "Rejected registration");
    Ok(Json(ApiResponse::ok(registration.into())))
}

#[utoipa::path(
    post,
    path = "/maintenance/gc",
    tag = "Admin",
    operation_id = "runGc",
    summary = "Run a garbage collection pass",
    description = "Reclaims content no longer referenced by any entry, past the grace window.",
    responses(
        (status = 200, description = "Pass report", body = ApiResponse<GcReport>),
        (status = 403, description = "Not an administrator (INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user), fields(user_id = auth_user.user_id))]
pub async fn run_gc(
    auth_user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<GcReport>>, AppError> {
    auth_user.require_admin()?;
    let report = gc::run_pass(&state).await?;
    Ok(Json(ApiResponse::ok(report)))
}

#[utoipa::path(
    post,
    path = "/maintenance/rebuild-paths",
    tag = "Admin",
    operation_id = "rebuildPaths",
    summary = "Recompute every virtual path",
    description = "Walks the tree from the root and corrects stored paths that drifted.",
    responses(
        (status = 200, description = "Rows corrected", body = ApiResponse<RebuildPathsResponse>),
        (status = 403, description = "Not an administrator (INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user), fields(user_id = auth_user.user_id))]
pub async fn rebuild_paths(
    auth_user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<RebuildPathsResponse>>, AppError> {
    auth_user.require_admin()?;
    let updated = namespace::rebuild_virtual_paths(&state.db).await?;
    Ok(Json(ApiResponse::ok(RebuildPathsResponse { updated })))
}
