use axum::Json;
use axum::extract::State;
use tracing::instrument;

use crate::error::{AppError, ErrorBody};
use crate::extractors::auth::AuthUser;
use crate::extractors::json::AppQuery;
use crate::models::files::{FileResponse, PurgeResponse, TrashQuery};
use crate::models::shared::{ApiResponse, Pagination, clamp_page};
use crate::namespace::trash;
use crate::state::AppState;

#[utoipa::path(
    get,
    path = "",
    tag = "Trash",
    operation_id = "listTrash",
    summary = "List the trash",
    description = "Top-level deleted entries, or the deleted children of `parent_id`. Folders \
        first, then by name. Non-administrators see only their own entries.",
    params(TrashQuery),
    responses(
        (status = 200, description = "One page of trashed entries", body = ApiResponse<Vec<FileResponse>>),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, query), fields(user_id = auth_user.user_id))]
pub async fn list_trash(
    auth_user: AuthUser,
    State(state): State<AppState>,
    AppQuery(query): AppQuery<TrashQuery>,
) -> Result<Json<ApiResponse<Vec<FileResponse>>>, AppError> {
    let (page, per_page) = clamp_page(query.page, query.per_page);
    let owner = (!auth_user.is_admin()).then_some(auth_user.user_id);

    let (entries, total) =
        trash::list_trash(&state.db, query.parent_id, owner, page, per_page).await?;
    Ok(Json(ApiResponse::paginated(
        entries.into_iter().map(FileResponse::from).collect(),
        Pagination::new(page, per_page, total),
    )))
}

#[utoipa::path(
    post,
    path = "/empty",
    tag = "Trash",
    operation_id = "emptyTrash",
    summary = "Empty the trash",
    description = "Permanently deletes every trashed entry and releases their content \
        references. Administrators only.",
    responses(
        (status = 200, description = "Trash emptied", body = ApiResponse<PurgeResponse>),
        (status = 403, description = "Not an administrator (INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user), fields(user_id = auth_user.user_id))]
pub async fn empty_trash(
    auth_user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<PurgeResponse>>, AppError> {
    auth_user.require_admin()?;
    let summary = trash::empty_trash(&state.db).await?;
    if summary.references_released > 0 {
        state.gc_trigger.notify_one();
    }

    Ok(Json(ApiResponse::with_message(
        PurgeResponse {
            entries_removed: summary.entries_removed,
            references_released: summary.references_released,
        },
        "Trash emptied",
    )))
}
