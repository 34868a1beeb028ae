use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::Utc;
use sea_orm::sea_query::{Expr, ExprTrait};
use sea_orm::*;
use tracing::{info, instrument};

use crate::entity::share_link;
use crate::error::{AppError, ErrorBody};
use crate::handlers::files::{serve_content, servable};
use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/{token}",
    tag = "Share",
    operation_id = "downloadShared",
    summary = "Download through a share link",
    description = "Public. Streams the shared file as an attachment and consumes one download \
        from the link's budget.",
    params(("token" = String, Path, description = "Share token")),
    responses(
        (status = 200, description = "File content"),
        (status = 404, description = "Unknown link or file (SHARE_NOT_FOUND, FILE_NOT_FOUND)", body = ErrorBody),
        (status = 410, description = "Expired, exhausted or deleted (SHARE_EXPIRED, FILE_DELETED)", body = ErrorBody),
    ),
)]
#[instrument(skip(state, token, headers))]
pub async fn download_shared(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let link = share_link::Entity::find()
        .filter(share_link::Column::Token.eq(token.trim()))
        .one(&state.db)
        .await?
        .ok_or(AppError::ShareNotFound)?;

    let now = Utc::now();
    if link.expires_at.is_some_and(|at| at <= now) || link.remaining_downloads == Some(0) {
        return Err(AppError::ShareExpired);
    }

    let (entry, hash) = servable(&state.db, link.file_id).await?;

    // Concurrent downloads race on the budget; only rows that still have one are consumed.
    let consumed = share_link::Entity::update_many()
        .col_expr(
            share_link::Column::RemainingDownloads,
            Expr::col(share_link::Column::RemainingDownloads).sub(1),
        )
        .col_expr(
            share_link::Column::DownloadCount,
            Expr::col(share_link::Column::DownloadCount).add(1),
        )
        .filter(share_link::Column::Id.eq(link.id))
        .filter(
            Condition::any()
                .add(share_link::Column::RemainingDownloads.is_null())
                .add(share_link::Column::RemainingDownloads.gt(0)),
        )
        .exec(&state.db)
        .await?;
    if consumed.rows_affected == 0 {
        return Err(AppError::ShareExpired);
    }

    info!(share_id = link.id, file_id = entry.id, "Shared download");
    serve_content(&state, &entry, &hash, &headers, "attachment").await
}
