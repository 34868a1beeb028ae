use std::io;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::multipart::Field;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use common::storage::{BoxReader, ContentHash, IngestLimits, StagedBlob, StorageError};
use rand::Rng;
use sea_orm::sea_query::{Expr, ExprTrait};
use sea_orm::*;
use tokio::sync::mpsc;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{info, instrument, warn};

use crate::entity::{category, file_entry, share_link};
use crate::error::{AppError, ErrorBody};
use crate::extractors::auth::AuthUser;
use crate::extractors::json::{AppJson, AppQuery};
use crate::ingest::{self, IngestRequest, UploadTarget, check_upload_name};
use crate::models::files::*;
use crate::models::shared::{ApiResponse, Pagination, clamp_page};
use crate::namespace::{self, ListFilter, SortKey, trash};
use crate::state::AppState;
use crate::utils::filename::content_disposition;

/// Multipart framing allowance on top of the file size limit.
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;
/// Upper bound on one batch request.
const MAX_BATCH_FILES: usize = 100;

pub fn upload_body_limit(max_file_size: u64) -> DefaultBodyLimit {
    DefaultBodyLimit::max(usize::try_from(max_file_size + MULTIPART_OVERHEAD).unwrap_or(usize::MAX))
}

pub fn batch_body_limit(max_file_size: u64) -> DefaultBodyLimit {
    let total = max_file_size.saturating_mul(MAX_BATCH_FILES as u64) + MULTIPART_OVERHEAD;
    DefaultBodyLimit::max(usize::try_from(total).unwrap_or(usize::MAX))
}

/// Stream a multipart field into the blob store's staging area.
///
/// Returns the multipart error separately from storage errors so a broken request
/// is reported as such rather than as a storage failure.
pub(crate) async fn stage_field(
    state: &AppState,
    mut field: Field<'_>,
    limits: IngestLimits,
) -> Result<StagedBlob, AppError> {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(8);
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    let reader: BoxReader = Box::new(StreamReader::new(Box::pin(stream)));

    let pump = async move {
        loop {
            match field.chunk().await {
                Ok(Some(bytes)) => {
                    if tx.send(Ok(bytes)).await.is_err() {
                        // The stager stopped reading, it reports why.
                        return None;
                    }
                }
                Ok(None) => return None,
                Err(e) => {
                    let message = e.body_text();
                    let _ = tx.send(Err(io::Error::other(message.clone()))).await;
                    return Some(message);
                }
            }
        }
    };

    let (staged, multipart_error) = tokio::join!(state.blob_store.stage(reader, limits), pump);
    if let Some(message) = multipart_error {
        return Err(AppError::InvalidRequest(format!("Multipart error: {message}")));
    }
    Ok(staged?)
}

async fn text_field(field: Field<'_>) -> Result<String, AppError> {
    let name = field.name().unwrap_or_default().to_string();
    field
        .text()
        .await
        .map_err(|e| AppError::InvalidRequest(format!("Failed to read '{name}': {}", e.body_text())))
}

fn optional_id(name: &str, value: &str) -> Result<Option<i32>, AppError> {
    let value = value.trim();
    if value.is_empty() || value == "null" {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| AppError::Validation(format!("{name} must be an integer")))
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Apply a metadata field to the upload target. Returns `false` for unknown fields.
async fn read_target_field(target: &mut UploadTarget, field: Field<'_>) -> Result<bool, AppError> {
    let name = field.name().map(str::to_string);
    match name.as_deref() {
        Some("parent_id") => target.parent_id = optional_id("parent_id", &text_field(field).await?)?,
        Some("category_id") => {
            target.category_id = optional_id("category_id", &text_field(field).await?)?
        }
        Some("relative_path") => target.relative_path = non_empty(text_field(field).await?),
        Some("description") => target.description = non_empty(text_field(field).await?),
        Some("tags") => target.tags = non_empty(text_field(field).await?),
        _ => return Ok(false),
    }
    Ok(true)
}

#[utoipa::path(
    post,
    path = "/upload",
    tag = "Files",
    operation_id = "uploadFile",
    summary = "Upload a file",
    description = "Streams the `file` multipart field into the content store and binds it into \
        the tree. Optional fields: `parent_id`, `relative_path` (missing folders are created), \
        `category_id`, `description`, `tags`. Content already stored is not written again \
        (`deduplicated`); an identical file with the same name in the folder is not added twice \
        (`skipped`).",
    request_body(content_type = "multipart/form-data", description = "File and placement"),
    responses(
        (status = 201, description = "File stored", body = ApiResponse<UploadResponse>),
        (status = 200, description = "Identical file already present", body = ApiResponse<UploadResponse>),
        (status = 400, description = "Bad request (VALIDATION_FAILED, INVALID_FILE_TYPE, INVALID_PATH)", body = ErrorBody),
        (status = 404, description = "Parent or category missing (FILE_NOT_FOUND, CATEGORY_NOT_FOUND)", body = ErrorBody),
        (status = 413, description = "Too large (FILE_SIZE_EXCEEDED)", body = ErrorBody),
        (status = 500, description = "Storage failure (STORAGE_ERROR)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, multipart), fields(user_id = auth_user.user_id))]
pub async fn upload(
    auth_user: AuthUser,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut target = UploadTarget::default();
    let mut file: Option<(String, StagedBlob)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidRequest(format!("Multipart error: {}", e.body_text())))?
    {
        if field.name() == Some("file") {
            if file.is_some() {
                return Err(AppError::Validation(
                    "Only one file per request, use batch-upload for several".into(),
                ));
            }
            let raw_name = field
                .file_name()
                .map(str::to_string)
                .ok_or_else(|| AppError::Validation("File field must have a filename".into()))?;
            let name = check_upload_name(&state.config.storage, &raw_name)?;
            target.mime_type = field
                .content_type()
                .filter(|ct| *ct != "application/octet-stream")
                .map(str::to_string);
            let staged = stage_field(&state, field, IngestLimits::default()).await?;
            file = Some((name, staged));
        } else {
            read_target_field(&mut target, field).await?;
        }
    }

    let (file_name, staged) = file.ok_or(AppError::MissingParameter("file"))?;
    let outcome = ingest::commit_staged(
        &state,
        staged,
        IngestRequest {
            file_name,
            owner_id: auth_user.user_id,
            target,
        },
    )
    .await?;

    let status = if outcome.skipped {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(ApiResponse::ok(UploadResponse::from(outcome)))))
}

/// A browser folder upload sends `dir/sub/name.jpg` as the file name.
fn split_relative(raw: &str) -> (Option<String>, String) {
    let raw = raw.replace('\\', "/");
    match raw.rsplit_once('/') {
        Some((dirs, name)) if !dirs.trim_matches('/').is_empty() => {
            (Some(dirs.to_string()), name.to_string())
        }
        Some((_, name)) => (None, name.to_string()),
        None => (None, raw),
    }
}

#[utoipa::path(
    post,
    path = "/batch-upload",
    tag = "Files",
    operation_id = "batchUpload",
    summary = "Upload several files",
    description = "Accepts repeated `files` fields sharing the placement fields of a single \
        upload. A file name containing `/` is placed under that relative folder path. Each \
        file succeeds or fails on its own.",
    request_body(content_type = "multipart/form-data", description = "Files and shared placement"),
    responses(
        (status = 200, description = "Per-file results", body = ApiResponse<BatchUploadResponse>),
        (status = 400, description = "Malformed request (INVALID_REQUEST, VALIDATION_FAILED)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, multipart), fields(user_id = auth_user.user_id))]
pub async fn batch_upload(
    auth_user: AuthUser,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse<BatchUploadResponse>>, AppError> {
    let mut shared = UploadTarget::default();
    let mut staged_files: Vec<(String, Option<String>, Option<String>, StagedBlob)> = Vec::new();
    let mut response = BatchUploadResponse::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidRequest(format!("Multipart error: {}", e.body_text())))?
    {
        if !matches!(field.name(), Some("files") | Some("file")) {
            read_target_field(&mut shared, field).await?;
            continue;
        }
        if staged_files.len() + response.failed.len() >= MAX_BATCH_FILES {
            return Err(AppError::Validation(format!(
                "At most {MAX_BATCH_FILES} files per batch"
            )));
        }

        let raw_name = field.file_name().unwrap_or_default().to_string();
        let (relative, name) = split_relative(&raw_name);
        let mime = field
            .content_type()
            .filter(|ct| *ct != "application/octet-stream")
            .map(str::to_string);

        let staged = match check_upload_name(&state.config.storage, &name) {
            Ok(_) => stage_field(&state, field, IngestLimits::default()).await,
            Err(e) => Err(e),
        };
        match staged {
            Ok(staged) => staged_files.push((name, relative, mime, staged)),
            Err(e @ AppError::InvalidRequest(_)) => return Err(e),
            Err(e) => response.failed.push(BatchFailure {
                file_name: raw_name,
                code: e.code().to_string(),
                message: e.to_string(),
            }),
        }
    }

    if staged_files.is_empty() && response.failed.is_empty() {
        return Err(AppError::MissingParameter("files"));
    }

    for (name, relative, mime, staged) in staged_files {
        let mut target = shared.clone();
        target.mime_type = mime;
        if let Some(relative) = relative {
            target.relative_path = Some(match shared.relative_path.as_deref() {
                Some(base) => format!("{base}/{relative}"),
                None => relative,
            });
        }

        let label = match target.relative_path.as_deref() {
            Some(rel) => format!("{rel}/{name}"),
            None => name.clone(),
        };
        let request = IngestRequest {
            file_name: name,
            owner_id: auth_user.user_id,
            target,
        };
        match ingest::commit_staged(&state, staged, request).await {
            Ok(outcome) if outcome.skipped => response.skipped.push(outcome.into()),
            Ok(outcome) => response.uploaded.push(outcome.into()),
            Err(e) => {
                warn!(file = %label, error = %e, "Batch entry failed");
                response.failed.push(BatchFailure {
                    file_name: label,
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    info!(
        uploaded = response.uploaded.len(),
        skipped = response.skipped.len(),
        failed = response.failed.len(),
        "Batch upload finished"
    );
    Ok(Json(ApiResponse::ok(response)))
}

fn parse_order(value: Option<&str>) -> Result<Order, AppError> {
    match value.unwrap_or("asc") {
        "asc" => Ok(Order::Asc),
        "desc" => Ok(Order::Desc),
        _ => Err(AppError::Validation("sort_order must be asc or desc".into())),
    }
}

#[utoipa::path(
    get,
    path = "",
    tag = "Files",
    operation_id = "listFiles",
    summary = "List entries",
    description = "Lists live entries of a folder (the root by default), folders first. A \
        `search` or `category_id` without `parent_id` searches the whole tree.",
    params(FileListQuery),
    responses(
        (status = 200, description = "One page of entries", body = ApiResponse<Vec<FileResponse>>),
        (status = 400, description = "Bad filter (VALIDATION_FAILED)", body = ErrorBody),
        (status = 404, description = "Folder missing (FILE_NOT_FOUND)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, _auth_user, query))]
pub async fn list_files(
    _auth_user: AuthUser,
    State(state): State<AppState>,
    AppQuery(query): AppQuery<FileListQuery>,
) -> Result<Json<ApiResponse<Vec<FileResponse>>>, AppError> {
    let (page, per_page) = clamp_page(query.page, query.per_page);
    let filter = ListFilter {
        parent_id: query.parent_id,
        category_id: query.category_id,
        mime_prefix: query.mime_type,
        search: query.search,
        sort: SortKey::parse(query.sort_by.as_deref())?,
        order: parse_order(query.sort_order.as_deref())?,
    };

    let (entries, total) = namespace::list_entries(&state.db, &filter, page, per_page).await?;
    let data = entries.into_iter().map(FileResponse::from).collect();
    Ok(Json(ApiResponse::paginated(
        data,
        Pagination::new(page, per_page, total),
    )))
}

#[utoipa::path(
    get,
    path = "/{id}",
    tag = "Files",
    operation_id = "getFile",
    summary = "Get an entry",
    params(("id" = i32, Path, description = "Entry ID")),
    responses(
        (status = 200, description = "Entry", body = ApiResponse<FileResponse>),
        (status = 404, description = "Not found (FILE_NOT_FOUND)", body = ErrorBody),
        (status = 410, description = "In the trash (FILE_DELETED)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, _auth_user))]
pub async fn get_file(
    _auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<Json<ApiResponse<FileResponse>>, AppError> {
    let entry = namespace::find_live(&state.db, id).await?;
    Ok(Json(ApiResponse::ok(entry.into())))
}

#[utoipa::path(
    put,
    path = "/{id}",
    tag = "Files",
    operation_id = "updateFile",
    summary = "Update entry metadata",
    description = "Updates description, tags and category. A new `name` renames the entry. \
        Absent fields are unchanged, `null` clears them.",
    params(("id" = i32, Path, description = "Entry ID")),
    request_body = UpdateFileRequest,
    responses(
        (status = 200, description = "Updated entry", body = ApiResponse<FileResponse>),
        (status = 403, description = "Not the owner (INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
        (status = 404, description = "Missing entry or category (FILE_NOT_FOUND, CATEGORY_NOT_FOUND)", body = ErrorBody),
        (status = 409, description = "Name taken (NAME_CONFLICT)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, payload), fields(user_id = auth_user.user_id))]
pub async fn update_file(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i32>,
    AppJson(payload): AppJson<UpdateFileRequest>,
) -> Result<Json<ApiResponse<FileResponse>>, AppError> {
    let entry = namespace::find_live(&state.db, id).await?;
    auth_user.require_owner_or_admin(entry.owner_id)?;

    if let Some(Some(category_id)) = payload.category_id {
        category::Entity::find_by_id(category_id)
            .one(&state.db)
            .await?
            .ok_or(AppError::CategoryNotFound)?;
    }

    let mut entry = match payload.name.as_deref() {
        Some(name) => namespace::rename(&state.db, &auth_user, id, name).await?,
        None => entry,
    };

    if payload.description.is_some() || payload.tags.is_some() || payload.category_id.is_some() {
        let mut active: file_entry::ActiveModel = entry.into();
        if let Some(description) = payload.description {
            active.description = Set(description.and_then(non_empty));
        }
        if let Some(tags) = payload.tags {
            active.tags = Set(tags.and_then(non_empty));
        }
        if let Some(category_id) = payload.category_id {
            active.category_id = Set(category_id);
        }
        active.updated_at = Set(Utc::now());
        entry = active.update(&state.db).await?;
    }

    Ok(Json(ApiResponse::ok(entry.into())))
}

#[utoipa::path(
    delete,
    path = "/{id}",
    tag = "Files",
    operation_id = "deleteFile",
    summary = "Move an entry to the trash",
    description = "Soft-deletes the entry and, for a folder, its whole subtree. With \
        `permanent=true` (administrators only) the entry is removed for good instead.",
    params(("id" = i32, Path, description = "Entry ID"), DeleteQuery),
    responses(
        (status = 200, description = "Deleted", body = ApiResponse<DeleteResponse>),
        (status = 403, description = "Not allowed (INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
        (status = 404, description = "Not found (FILE_NOT_FOUND)", body = ErrorBody),
        (status = 410, description = "Already in the trash (FILE_DELETED)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user), fields(user_id = auth_user.user_id))]
pub async fn delete_file(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i32>,
    AppQuery(query): AppQuery<DeleteQuery>,
) -> Result<Json<ApiResponse<DeleteResponse>>, AppError> {
    if query.permanent {
        auth_user.require_admin()?;
        let summary = trash::permanent_delete(&state.db, id, false).await?;
        state.gc_trigger.notify_one();
        return Ok(Json(ApiResponse::ok(DeleteResponse {
            id,
            permanent: true,
            entries: summary.entries_removed,
            references_released: Some(summary.references_released),
        })));
    }

    let entries = trash::soft_delete(&state.db, &auth_user, id).await?;
    Ok(Json(ApiResponse::with_message(
        DeleteResponse {
            id,
            permanent: false,
            entries,
            references_released: None,
        },
        "Moved to trash",
    )))
}

#[utoipa::path(
    delete,
    path = "/{id}/permanent",
    tag = "Files",
    operation_id = "purgeFile",
    summary = "Permanently delete a trashed entry",
    description = "Removes a trashed entry and its trashed subtree and releases their content \
        references. Unreferenced content is reclaimed by the garbage collector. Administrators only.",
    params(("id" = i32, Path, description = "Entry ID")),
    responses(
        (status = 200, description = "Removed", body = ApiResponse<DeleteResponse>),
        (status = 400, description = "Entry is not in the trash (VALIDATION_FAILED)", body = ErrorBody),
        (status = 403, description = "Not an administrator (INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
        (status = 404, description = "Not found (FILE_NOT_FOUND)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user), fields(user_id = auth_user.user_id))]
pub async fn purge_file(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<Json<ApiResponse<DeleteResponse>>, AppError> {
    auth_user.require_admin()?;
    let summary = trash::permanent_delete(&state.db, id, true).await?;
    state.gc_trigger.notify_one();

    Ok(Json(ApiResponse::ok(DeleteResponse {
        id,
        permanent: true,
        entries: summary.entries_removed,
        references_released: Some(summary.references_released),
    })))
}

#[utoipa::path(
    post,
    path = "/{id}/restore",
    tag = "Files",
    operation_id = "restoreFile",
    summary = "Restore an entry from the trash",
    description = "Brings back the entry with everything deleted together with it. If the \
        former parent is gone, the entry is placed in the recovery folder.",
    params(("id" = i32, Path, description = "Entry ID")),
    responses(
        (status = 200, description = "Restored", body = ApiResponse<RestoreResponse>),
        (status = 400, description = "Not in the trash (VALIDATION_FAILED)", body = ErrorBody),
        (status = 403, description = "Not the owner (INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
        (status = 404, description = "Not found (FILE_NOT_FOUND)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user), fields(user_id = auth_user.user_id))]
pub async fn restore_file(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<Json<ApiResponse<RestoreResponse>>, AppError> {
    let outcome = trash::restore(
        &state.db,
        &auth_user,
        id,
        &state.config.namespace.recovery_folder,
    )
    .await?;

    Ok(Json(ApiResponse::ok(RestoreResponse {
        file: outcome.entry.into(),
        restored: outcome.restored,
        recovered: outcome.recovered,
    })))
}

/// A live file with content, as served for download.
pub(crate) async fn servable(db: &DatabaseConnection, id: i32) -> Result<(file_entry::Model, ContentHash), AppError> {
    let entry = file_entry::Entity::find_by_id(id)
        .one(db)
        .await?
        .ok_or(AppError::FileNotFound)?;
    if entry.is_deleted {
        return Err(AppError::FileDeleted);
    }
    if entry.is_directory {
        return Err(AppError::Validation("Folders cannot be downloaded".into()));
    }
    let hex = entry.content_hash.as_deref().ok_or(AppError::FileNotFound)?;
    let hash = ContentHash::from_hex(hex)?;
    Ok((entry, hash))
}

/// Stream a file. Attachments count as downloads; `If-None-Match` hits do not.
pub(crate) async fn serve_content(
    state: &AppState,
    entry: &file_entry::Model,
    hash: &ContentHash,
    headers: &HeaderMap,
    disposition: &str,
) -> Result<Response, AppError> {
    let etag = hash.etag();
    if let Some(if_none_match) = headers.get(header::IF_NONE_MATCH)
        && let Ok(value) = if_none_match.to_str()
        && value.split(',').any(|v| {
            let v = v.trim();
            v == etag || v == "*" || v.strip_prefix("W/") == Some(etag.as_str())
        })
    {
        return Ok((StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response());
    }

    let reader = state.blob_store.open(hash).await.map_err(|e| match e {
        StorageError::NotFound(_) => {
            warn!(file_id = entry.id, content_hash = %hash, "Entry points at missing content");
            AppError::FileNotFound
        }
        other => AppError::from(other),
    })?;

    if disposition == "attachment" {
        file_entry::Entity::update_many()
            .col_expr(
                file_entry::Column::DownloadCount,
                Expr::col(file_entry::Column::DownloadCount).add(1),
            )
            .filter(file_entry::Column::Id.eq(entry.id))
            .exec(&state.db)
            .await?;
    }

    let content_type = entry
        .mime_type
        .as_deref()
        .unwrap_or("application/octet-stream");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, entry.size.to_string())
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition(disposition, &entry.name),
        )
        .header(header::ETAG, &etag)
        .header(header::CACHE_CONTROL, "private, max-age=3600")
        .body(Body::from_stream(ReaderStream::new(reader)))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {e}")))
}

#[utoipa::path(
    get,
    path = "/{id}/download",
    tag = "Files",
    operation_id = "downloadFile",
    summary = "Download a file",
    description = "Streams the content as an attachment and counts the download. Supports \
        `If-None-Match` against the content digest ETag.",
    params(("id" = i32, Path, description = "Entry ID")),
    responses(
        (status = 200, description = "File content"),
        (status = 304, description = "Not Modified (ETag match)"),
        (status = 400, description = "Entry is a folder (VALIDATION_FAILED)", body = ErrorBody),
        (status = 404, description = "Not found (FILE_NOT_FOUND)", body = ErrorBody),
        (status = 410, description = "In the trash (FILE_DELETED)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, _auth_user, headers))]
pub async fn download_file(
    _auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i32>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let (entry, hash) = servable(&state.db, id).await?;
    serve_content(&state, &entry, &hash, &headers, "attachment").await
}

#[utoipa::path(
    get,
    path = "/{id}/preview",
    tag = "Files",
    operation_id = "previewFile",
    summary = "Preview a file inline",
    params(("id" = i32, Path, description = "Entry ID")),
    responses(
        (status = 200, description = "File content"),
        (status = 304, description = "Not Modified (ETag match)"),
        (status = 400, description = "Entry is a folder (VALIDATION_FAILED)", body = ErrorBody),
        (status = 404, description = "Not found (FILE_NOT_FOUND)", body = ErrorBody),
        (status = 410, description = "In the trash (FILE_DELETED)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, _auth_user, headers))]
pub async fn preview_file(
    _auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i32>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let (entry, hash) = servable(&state.db, id).await?;
    serve_content(&state, &entry, &hash, &headers, "inline").await
}

fn share_token() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    hex::encode(bytes)
}

#[utoipa::path(
    post,
    path = "/{id}/share",
    tag = "Files",
    operation_id = "shareFile",
    summary = "Create a public share link",
    description = "Returns an opaque token for `GET /api/share/{token}`, optionally limited in \
        time and number of downloads.",
    params(("id" = i32, Path, description = "Entry ID")),
    request_body = ShareRequest,
    responses(
        (status = 201, description = "Share link", body = ApiResponse<ShareResponse>),
        (status = 400, description = "Bad limits or a folder (VALIDATION_FAILED)", body = ErrorBody),
        (status = 403, description = "Not the owner (INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
        (status = 404, description = "Not found (FILE_NOT_FOUND)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, body), fields(user_id = auth_user.user_id))]
pub async fn share_file(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i32>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let payload: ShareRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ShareRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::InvalidRequest(e.to_string()))?
    };
    let (entry, _) = servable(&state.db, id).await?;
    auth_user.require_owner_or_admin(entry.owner_id)?;

    if let Some(hours) = payload.expires_in_hours
        && !(1..=24 * 365).contains(&hours)
    {
        return Err(AppError::Validation(
            "expires_in_hours must be between 1 and 8760".into(),
        ));
    }
    if let Some(max) = payload.max_downloads
        && max < 1
    {
        return Err(AppError::Validation("max_downloads must be positive".into()));
    }

    let now = Utc::now();
    let link = share_link::ActiveModel {
        token: Set(share_token()),
        file_id: Set(entry.id),
        created_by: Set(auth_user.user_id),
        expires_at: Set(payload
            .expires_in_hours
            .map(|h| now + chrono::Duration::hours(h))),
        max_downloads: Set(payload.max_downloads),
        remaining_downloads: Set(payload.max_downloads),
        download_count: Set(0),
        created_at: Set(now),
        ..Default::default()
    }
    .insert(&state.db)
    .await?;

    info!(file_id = entry.id, "Created share link");
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(ShareResponse::from(link))),
    ))
}
