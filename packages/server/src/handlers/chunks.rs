use axum::Json;
use axum::body::Bytes;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::instrument;

use crate::chunks;
use crate::error::{AppError, ErrorBody};
use crate::extractors::auth::AuthUser;
use crate::extractors::json::AppJson;
use crate::models::chunks::{
    ChunkInitRequest, ChunkInitResponse, ChunkReceipt, SessionRequest, SessionStatus,
};
use crate::models::files::UploadResponse;
use crate::models::shared::ApiResponse;
use crate::state::AppState;

#[utoipa::path(
    post,
    path = "/chunk-init",
    tag = "Chunked Upload",
    operation_id = "chunkInit",
    summary = "Open a resumable upload",
    description = "Declares the file and its chunk layout. Chunks may then be sent in any \
        order, in parallel, and re-sent after a failure.",
    request_body = ChunkInitRequest,
    responses(
        (status = 201, description = "Session opened", body = ApiResponse<ChunkInitResponse>),
        (status = 400, description = "Bad layout or name (VALIDATION_FAILED, INVALID_FILE_TYPE)", body = ErrorBody),
        (status = 404, description = "Parent or category missing (FILE_NOT_FOUND, CATEGORY_NOT_FOUND)", body = ErrorBody),
        (status = 413, description = "Too large (FILE_SIZE_EXCEEDED)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, payload), fields(user_id = auth_user.user_id))]
pub async fn chunk_init(
    auth_user: AuthUser,
    State(state): State<AppState>,
    AppJson(payload): AppJson<ChunkInitRequest>,
) -> Result<impl IntoResponse, AppError> {
    let session = chunks::init(&state, &auth_user, payload).await?;
    let ttl = i64::try_from(state.config.upload.session_ttl_secs).unwrap_or(i64::MAX);

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(ChunkInitResponse {
            expires_at: session.updated_at + chrono::Duration::seconds(ttl),
            session_id: session.id,
            chunk_size: session.chunk_size,
            chunk_count: session.chunk_count,
        })),
    ))
}

#[utoipa::path(
    post,
    path = "/chunk-upload",
    tag = "Chunked Upload",
    operation_id = "chunkUpload",
    summary = "Send one chunk",
    description = "Multipart fields: `session_id`, `index` (0-based), the bytes in `chunk`, and \
        an optional `chunk_hash` (SHA-256). Re-sending identical bytes is accepted; different \
        bytes for a received index are a conflict.",
    request_body(content_type = "multipart/form-data", description = "Chunk bytes and position"),
    responses(
        (status = 200, description = "Chunk stored", body = ApiResponse<ChunkReceipt>),
        (status = 400, description = "Wrong length (VALIDATION_FAILED)", body = ErrorBody),
        (status = 404, description = "Unknown session (UPLOAD_SESSION_NOT_FOUND)", body = ErrorBody),
        (status = 409, description = "Conflict (CHUNK_CONFLICT, UPLOAD_SESSION_CLOSED)", body = ErrorBody),
        (status = 422, description = "Chunk hash mismatch (DIGEST_MISMATCH)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, multipart), fields(user_id = auth_user.user_id))]
pub async fn chunk_upload(
    auth_user: AuthUser,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse<ChunkReceipt>>, AppError> {
    let mut session_id: Option<String> = None;
    let mut index: Option<i32> = None;
    let mut chunk_hash: Option<String> = None;
    let mut data: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidRequest(format!("Multipart error: {}", e.body_text())))?
    {
        let name = field.name().map(str::to_string);
        let read_error =
            |e: axum::extract::multipart::MultipartError| AppError::InvalidRequest(e.body_text());
        match name.as_deref() {
            Some("session_id") => session_id = Some(field.text().await.map_err(read_error)?),
            Some("index") => {
                let raw = field.text().await.map_err(read_error)?;
                index = Some(raw.trim().parse().map_err(|_| {
                    AppError::Validation("index must be a non-negative integer".into())
                })?);
            }
            Some("chunk_hash") => {
                let raw = field.text().await.map_err(read_error)?;
                chunk_hash = Some(raw.trim().to_string()).filter(|h| !h.is_empty());
            }
            Some("chunk") | Some("file") | Some("data") => {
                data = Some(field.bytes().await.map_err(read_error)?)
            }
            _ => {}
        }
    }

    let session_id = session_id.ok_or(AppError::MissingParameter("session_id"))?;
    let index = index.ok_or(AppError::MissingParameter("index"))?;
    let data = data.ok_or(AppError::MissingParameter("chunk"))?;

    let receipt = chunks::put_chunk(
        &state,
        &auth_user,
        session_id.trim(),
        index,
        &data,
        chunk_hash.as_deref(),
    )
    .await?;
    Ok(Json(ApiResponse::ok(receipt)))
}

#[utoipa::path(
    post,
    path = "/chunk-finalize",
    tag = "Chunked Upload",
    operation_id = "chunkFinalize",
    summary = "Assemble an upload",
    description = "Checks every chunk arrived, verifies the declared digest and binds the file \
        into the tree. On a digest mismatch the received chunks are discarded so they can be \
        sent again.",
    request_body = SessionRequest,
    responses(
        (status = 201, description = "File stored", body = ApiResponse<UploadResponse>),
        (status = 404, description = "Unknown session (UPLOAD_SESSION_NOT_FOUND)", body = ErrorBody),
        (status = 409, description = "Not ready (INCOMPLETE_UPLOAD, UPLOAD_SESSION_CLOSED)", body = ErrorBody),
        (status = 422, description = "Integrity failure (DIGEST_MISMATCH)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, payload), fields(user_id = auth_user.user_id))]
pub async fn chunk_finalize(
    auth_user: AuthUser,
    State(state): State<AppState>,
    AppJson(payload): AppJson<SessionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = chunks::finalize(&state, &auth_user, payload.session_id.trim()).await?;
    let status = if outcome.skipped {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(ApiResponse::ok(UploadResponse::from(outcome)))))
}

#[utoipa::path(
    get,
    path = "/chunk-status/{session_id}",
    tag = "Chunked Upload",
    operation_id = "chunkStatus",
    summary = "Progress of an upload",
    params(("session_id" = String, Path, description = "Upload session ID")),
    responses(
        (status = 200, description = "Session state", body = ApiResponse<SessionStatus>),
        (status = 404, description = "Unknown session (UPLOAD_SESSION_NOT_FOUND)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user), fields(user_id = auth_user.user_id))]
pub async fn chunk_status(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ApiResponse<SessionStatus>>, AppError> {
    let status = chunks::status(&state, &auth_user, &session_id).await?;
    Ok(Json(ApiResponse::ok(status)))
}

#[utoipa::path(
    post,
    path = "/chunk-abort",
    tag = "Chunked Upload",
    operation_id = "chunkAbort",
    summary = "Abandon an upload",
    request_body = SessionRequest,
    responses(
        (status = 200, description = "Session aborted", body = ApiResponse<SessionStatus>),
        (status = 404, description = "Unknown session (UPLOAD_SESSION_NOT_FOUND)", body = ErrorBody),
        (status = 409, description = "Already closed (UPLOAD_SESSION_CLOSED)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, payload), fields(user_id = auth_user.user_id))]
pub async fn chunk_abort(
    auth_user: AuthUser,
    State(state): State<AppState>,
    AppJson(payload): AppJson<SessionRequest>,
) -> Result<Json<ApiResponse<SessionStatus>>, AppError> {
    let status = chunks::abort(&state, &auth_user, payload.session_id.trim()).await?;
    Ok(Json(ApiResponse::with_message(status, "Upload aborted")))
}
