use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tokio_util::io::ReaderStream;
use tracing::instrument;

use crate::error::{AppError, ErrorBody};
use crate::export::jobs;
use crate::export::quick::{self, QuickExport};
use crate::extractors::auth::AuthUser;
use crate::extractors::json::{AppJson, AppQuery};
use crate::models::export::{ExportJobResponse, ExportRequest, QuickExportQuery};
use crate::models::shared::{ApiResponse, PageQuery, Pagination};
use crate::state::AppState;
use crate::utils::filename::content_disposition;

#[utoipa::path(
    post,
    path = "/stream",
    tag = "Export",
    operation_id = "createExport",
    summary = "Queue an export job",
    description = "Selects the caller's live files by category, creation date, type class and \
        folder, and builds the archive in the background. Poll `/export/status/{job_id}`.",
    request_body = ExportRequest,
    responses(
        (status = 202, description = "Job queued", body = ApiResponse<ExportJobResponse>),
        (status = 400, description = "Bad filter (VALIDATION_FAILED)", body = ErrorBody),
        (status = 404, description = "Folder missing (FILE_NOT_FOUND)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, payload), fields(user_id = auth_user.user_id))]
pub async fn create_export(
    auth_user: AuthUser,
    State(state): State<AppState>,
    AppJson(payload): AppJson<ExportRequest>,
) -> Result<impl IntoResponse, AppError> {
    let job = jobs::create_job(&state, &auth_user, payload).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::with_message(
            ExportJobResponse::from(job),
            "Export queued",
        )),
    ))
}

#[utoipa::path(
    get,
    path = "/quick",
    tag = "Export",
    operation_id = "quickExport",
    summary = "Stream a predefined export",
    description = "Writes the archive straight onto the response without a job. `this-month` \
        covers the caller's files created this month, `last-sabbath` the most recent files of \
        the configured Sabbath category, `all-photos` every image.",
    params(QuickExportQuery),
    responses(
        (status = 200, description = "Archive bytes"),
        (status = 400, description = "Unknown type or no Sabbath category configured (VALIDATION_FAILED)", body = ErrorBody),
        (status = 404, description = "Sabbath category missing (CATEGORY_NOT_FOUND)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, query), fields(user_id = auth_user.user_id))]
pub async fn quick_export(
    auth_user: AuthUser,
    State(state): State<AppState>,
    AppQuery(query): AppQuery<QuickExportQuery>,
) -> Result<Response, AppError> {
    let kind: QuickExport = query.kind.parse()?;
    quick::stream(&state, auth_user.user_id, kind, query.format).await
}

#[utoipa::path(
    get,
    path = "/status/{job_id}",
    tag = "Export",
    operation_id = "exportStatus",
    summary = "Export job progress",
    params(("job_id" = String, Path, description = "Export job ID")),
    responses(
        (status = 200, description = "Job state", body = ApiResponse<ExportJobResponse>),
        (status = 404, description = "Unknown job (JOB_NOT_FOUND)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user), fields(user_id = auth_user.user_id))]
pub async fn export_status(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<ApiResponse<ExportJobResponse>>, AppError> {
    let job = jobs::find_job(&state.db, &auth_user, &job_id).await?;
    Ok(Json(ApiResponse::ok(job.into())))
}

#[utoipa::path(
    get,
    path = "/download/{job_id}",
    tag = "Export",
    operation_id = "downloadExport",
    summary = "Download a finished export",
    params(("job_id" = String, Path, description = "Export job ID")),
    responses(
        (status = 200, description = "Archive bytes"),
        (status = 404, description = "Unknown job or archive gone (JOB_NOT_FOUND, FILE_NOT_FOUND)", body = ErrorBody),
        (status = 409, description = "Still running or failed (JOB_NOT_COMPLETED)", body = ErrorBody),
        (status = 410, description = "Past its retention (DOWNLOAD_EXPIRED)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user), fields(user_id = auth_user.user_id))]
pub async fn download_export(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, AppError> {
    let (job, path) = jobs::download(&state, &auth_user, &job_id).await?;
    let file = tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => AppError::FileNotFound,
        _ => AppError::Storage(format!("failed to open {}: {e}", path.display())),
    })?;
    let length = file
        .metadata()
        .await
        .map_err(|e| AppError::Storage(e.to_string()))?
        .len();

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, job.format.content_type())
        .header(header::CONTENT_LENGTH, length.to_string())
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition("attachment", &job.archive_name),
        )
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {e}")))
}

#[utoipa::path(
    get,
    path = "/history",
    tag = "Export",
    operation_id = "exportHistory",
    summary = "The caller's export jobs",
    description = "Newest first.",
    params(PageQuery),
    responses(
        (status = 200, description = "One page of jobs", body = ApiResponse<Vec<ExportJobResponse>>),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, query), fields(user_id = auth_user.user_id))]
pub async fn export_history(
    auth_user: AuthUser,
    State(state): State<AppState>,
    AppQuery(query): AppQuery<PageQuery>,
) -> Result<Json<ApiResponse<Vec<ExportJobResponse>>>, AppError> {
    let (page, per_page) = query.resolve();
    let (jobs, total) = jobs::history(&state.db, &auth_user, page, per_page).await?;
    Ok(Json(ApiResponse::paginated(
        jobs.into_iter().map(ExportJobResponse::from).collect(),
        Pagination::new(page, per_page, total),
    )))
}

#[utoipa::path(
    post,
    path = "/cancel/{job_id}",
    tag = "Export",
    operation_id = "cancelExport",
    summary = "Cancel an export job",
    description = "A pending job fails immediately; a running one stops at its next file and \
        its partial archive is removed.",
    params(("job_id" = String, Path, description = "Export job ID")),
    responses(
        (status = 200, description = "Job after cancellation", body = ApiResponse<ExportJobResponse>),
        (status = 400, description = "Already finished (VALIDATION_FAILED)", body = ErrorBody),
        (status = 404, description = "Unknown job (JOB_NOT_FOUND)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user), fields(user_id = auth_user.user_id))]
pub async fn cancel_export(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<ApiResponse<ExportJobResponse>>, AppError> {
    let job = jobs::cancel_job(&state, &auth_user, &job_id).await?;
    Ok(Json(ApiResponse::with_message(job.into(), "Export cancelled")))
}
