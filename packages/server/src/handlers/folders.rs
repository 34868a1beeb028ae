use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::instrument;

use crate::error::{AppError, ErrorBody};
use crate::extractors::auth::AuthUser;
use crate::extractors::json::AppJson;
use crate::models::files::FileResponse;
use crate::models::folders::{CreateFolderRequest, MoveRequest, RenameRequest};
use crate::models::shared::ApiResponse;
use crate::namespace;
use crate::state::AppState;

#[utoipa::path(
    post,
    path = "",
    tag = "Folders",
    operation_id = "createFolder",
    summary = "Create a folder",
    request_body = CreateFolderRequest,
    responses(
        (status = 201, description = "Folder created", body = ApiResponse<FileResponse>),
        (status = 400, description = "Bad name (VALIDATION_FAILED)", body = ErrorBody),
        (status = 404, description = "Parent missing (FILE_NOT_FOUND)", body = ErrorBody),
        (status = 409, description = "Name taken (NAME_CONFLICT)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, payload), fields(user_id = auth_user.user_id))]
pub async fn create_folder(
    auth_user: AuthUser,
    State(state): State<AppState>,
    AppJson(payload): AppJson<CreateFolderRequest>,
) -> Result<impl IntoResponse, AppError> {
    let folder = namespace::create_folder(
        &state.db,
        payload.parent_id,
        &payload.name,
        auth_user.user_id,
    )
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(FileResponse::from(folder))),
    ))
}

#[utoipa::path(
    put,
    path = "/{id}/move",
    tag = "Folders",
    operation_id = "moveEntry",
    summary = "Move an entry",
    description = "Moves a folder (with its subtree) or a file under another folder, or to the \
        root with `parent_id: null`. Paths of the whole subtree are rewritten.",
    params(("id" = i32, Path, description = "Entry ID")),
    request_body = MoveRequest,
    responses(
        (status = 200, description = "Moved entry", body = ApiResponse<FileResponse>),
        (status = 400, description = "Move into itself (INVALID_PATH, VALIDATION_FAILED)", body = ErrorBody),
        (status = 403, description = "Not the owner (INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
        (status = 404, description = "Not found (FILE_NOT_FOUND)", body = ErrorBody),
        (status = 409, description = "Name taken at destination (NAME_CONFLICT)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, payload), fields(user_id = auth_user.user_id))]
pub async fn move_entry(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i32>,
    AppJson(payload): AppJson<MoveRequest>,
) -> Result<Json<ApiResponse<FileResponse>>, AppError> {
    let entry = namespace::move_entry(&state.db, &auth_user, id, payload.parent_id).await?;
    Ok(Json(ApiResponse::ok(entry.into())))
}

#[utoipa::path(
    put,
    path = "/{id}/rename",
    tag = "Folders",
    operation_id = "renameEntry",
    summary = "Rename an entry",
    params(("id" = i32, Path, description = "Entry ID")),
    request_body = RenameRequest,
    responses(
        (status = 200, description = "Renamed entry", body = ApiResponse<FileResponse>),
        (status = 400, description = "Bad name (VALIDATION_FAILED)", body = ErrorBody),
        (status = 403, description = "Not the owner (INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
        (status = 404, description = "Not found (FILE_NOT_FOUND)", body = ErrorBody),
        (status = 409, description = "Name taken (NAME_CONFLICT)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, payload), fields(user_id = auth_user.user_id))]
pub async fn rename_entry(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i32>,
    AppJson(payload): AppJson<RenameRequest>,
) -> Result<Json<ApiResponse<FileResponse>>, AppError> {
    let entry = namespace::rename(&state.db, &auth_user, id, &payload.name).await?;
    Ok(Json(ApiResponse::ok(entry.into())))
}
