use axum::Json;
use axum::extract::State;
use sea_orm::sea_query::Expr;
use sea_orm::*;
use tracing::instrument;

use crate::entity::{blob, file_entry};
use crate::error::AppError;
use crate::extractors::auth::AuthUser;
use crate::models::shared::ApiResponse;
use crate::models::storage::StorageStats;
use crate::state::AppState;

/// `(rows, summed size)` of a query, both zero for an empty set.
async fn count_and_bytes<E, C>(db: &C, select: Select<E>) -> Result<(u64, u64), DbErr>
where
    E: EntityTrait,
    C: ConnectionTrait,
{
    let row: Option<(i64, i64)> = select
        .select_only()
        .column_as(Expr::cust("COUNT(*)"), "rows")
        .column_as(Expr::cust("CAST(COALESCE(SUM(\"size\"), 0) AS BIGINT)"), "bytes")
        .into_tuple()
        .one(db)
        .await?;
    let (rows, bytes) = row.unwrap_or_default();
    Ok((Ord::max(rows, 0) as u64, Ord::max(bytes, 0) as u64))
}

pub async fn collect_stats<C: ConnectionTrait>(db: &C) -> Result<StorageStats, DbErr> {
    let files = file_entry::Entity::find().filter(file_entry::Column::IsDirectory.eq(false));

    let (total_files, total_size) = count_and_bytes(
        db,
        files.clone().filter(file_entry::Column::IsDeleted.eq(false)),
    )
    .await?;
    let (trash_files, trash_bytes) =
        count_and_bytes(db, files.filter(file_entry::Column::IsDeleted.eq(true))).await?;
    let total_folders = file_entry::Entity::find()
        .filter(file_entry::Column::IsDirectory.eq(true))
        .filter(file_entry::Column::IsDeleted.eq(false))
        .count(db)
        .await?;
    let (blob_count, physical_size) = count_and_bytes(db, blob::Entity::find()).await?;

    Ok(StorageStats {
        total_files,
        total_size,
        total_folders,
        trash_files,
        trash_bytes,
        blob_count,
        physical_size,
        ..Default::default()
    }
    .derive())
}

#[utoipa::path(
    get,
    path = "/stats",
    tag = "Storage",
    operation_id = "storageStats",
    summary = "Archive usage",
    description = "Logical bytes as users see them against physical bytes stored once per \
        distinct content, with the resulting deduplication savings.",
    responses(
        (status = 200, description = "Usage counters", body = ApiResponse<StorageStats>),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, _auth_user))]
pub async fn storage_stats(
    _auth_user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<StorageStats>>, AppError> {
    let stats = collect_stats(&state.db).await?;
    Ok(Json(ApiResponse::ok(stats)))
}
