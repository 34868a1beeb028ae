use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::*;
use tracing::{info, instrument};

use crate::entity::{category, file_entry};
use crate::error::{AppError, ErrorBody};
use crate::extractors::auth::AuthUser;
use crate::extractors::json::{AppJson, AppQuery};
use crate::models::category::*;
use crate::models::files::FileResponse;
use crate::models::shared::{ApiResponse, PageQuery, Pagination};
use crate::state::AppState;

async fn find_category<C: ConnectionTrait>(db: &C, id: i32) -> Result<category::Model, AppError> {
    category::Entity::find_by_id(id)
        .one(db)
        .await?
        .ok_or(AppError::CategoryNotFound)
}

fn live_files() -> Select<file_entry::Entity> {
    file_entry::Entity::find()
        .filter(file_entry::Column::IsDeleted.eq(false))
        .filter(file_entry::Column::IsDirectory.eq(false))
}

async fn file_count<C: ConnectionTrait>(db: &C, id: i32) -> Result<u64, DbErr> {
    live_files()
        .filter(file_entry::Column::CategoryId.eq(id))
        .count(db)
        .await
}

/// Fail with `CATEGORY_EXISTS` when another category already uses `name`.
async fn ensure_name_free<C: ConnectionTrait>(
    db: &C,
    name: &str,
    except: Option<i32>,
) -> Result<(), AppError> {
    let mut query = category::Entity::find().filter(category::Column::Name.eq(name));
    if let Some(id) = except {
        query = query.filter(category::Column::Id.ne(id));
    }
    if query.count(db).await? > 0 {
        return Err(AppError::CategoryExists);
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "",
    tag = "Categories",
    operation_id = "listCategories",
    summary = "List categories",
    description = "Ordered by `sort_order`, then name. Each entry carries its live file count.",
    params(CategoryListQuery),
    responses(
        (status = 200, description = "Categories", body = ApiResponse<Vec<CategoryResponse>>),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, _auth_user, query))]
pub async fn list_categories(
    _auth_user: AuthUser,
    State(state): State<AppState>,
    AppQuery(query): AppQuery<CategoryListQuery>,
) -> Result<Json<ApiResponse<Vec<CategoryResponse>>>, AppError> {
    let mut select = category::Entity::find();
    if !query.include_inactive {
        select = select.filter(category::Column::IsActive.eq(true));
    }
    let categories = select
        .order_by_asc(category::Column::SortOrder)
        .order_by_asc(category::Column::Name)
        .all(&state.db)
        .await?;

    let counts: HashMap<i32, i64> = live_files()
        .select_only()
        .column(file_entry::Column::CategoryId)
        .column_as(file_entry::Column::Id.count(), "file_count")
        .filter(file_entry::Column::CategoryId.is_not_null())
        .group_by(file_entry::Column::CategoryId)
        .into_tuple::<(Option<i32>, i64)>()
        .all(&state.db)
        .await?
        .into_iter()
        .filter_map(|(id, count)| id.map(|id| (id, count)))
        .collect();

    let data = categories
        .into_iter()
        .map(|c| {
            let count = Ord::max(counts.get(&c.id).copied().unwrap_or(0), 0) as u64;
            CategoryResponse::new(c, count)
        })
        .collect();
    Ok(Json(ApiResponse::ok(data)))
}

#[utoipa::path(
    get,
    path = "/{id}",
    tag = "Categories",
    operation_id = "getCategory",
    summary = "Get a category",
    params(("id" = i32, Path, description = "Category ID")),
    responses(
        (status = 200, description = "Category", body = ApiResponse<CategoryResponse>),
        (status = 404, description = "Not found (CATEGORY_NOT_FOUND)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, _auth_user))]
pub async fn get_category(
    _auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<Json<ApiResponse<CategoryResponse>>, AppError> {
    let model = find_category(&state.db, id).await?;
    let count = file_count(&state.db, id).await?;
    Ok(Json(ApiResponse::ok(CategoryResponse::new(model, count))))
}

#[utoipa::path(
    post,
    path = "",
    tag = "Categories",
    operation_id = "createCategory",
    summary = "Create a category",
    request_body = CreateCategoryRequest,
    responses(
        (status = 201, description = "Category created", body = ApiResponse<CategoryResponse>),
        (status = 400, description = "Validation error (VALIDATION_FAILED)", body = ErrorBody),
        (status = 409, description = "Name taken (CATEGORY_EXISTS)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, payload), fields(user_id = auth_user.user_id))]
pub async fn create_category(
    auth_user: AuthUser,
    State(state): State<AppState>,
    AppJson(payload): AppJson<CreateCategoryRequest>,
) -> Result<impl IntoResponse, AppError> {
    let name = validate_category_name(&payload.name)?;
    if let Some(color) = &payload.color {
        validate_color(color)?;
    }
    ensure_name_free(&state.db, &name, None).await?;

    let now = Utc::now();
    let model = category::ActiveModel {
        name: Set(name),
        description: Set(payload.description),
        color: Set(payload.color),
        icon: Set(payload.icon),
        sort_order: Set(payload.sort_order),
        is_active: Set(true),
        created_by: Set(auth_user.user_id),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(&state.db)
    .await?;

    info!(category_id = model.id, name = %model.name, "Created category");
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(CategoryResponse::new(model, 0))),
    ))
}

#[utoipa::path(
    put,
    path = "/{id}",
    tag = "Categories",
    operation_id = "updateCategory",
    summary = "Update a category",
    description = "Creator or administrator only. Absent fields are unchanged.",
    params(("id" = i32, Path, description = "Category ID")),
    request_body = UpdateCategoryRequest,
    responses(
        (status = 200, description = "Updated category", body = ApiResponse<CategoryResponse>),
        (status = 400, description = "Validation error (VALIDATION_FAILED)", body = ErrorBody),
        (status = 403, description = "Not the creator (INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
        (status = 404, description = "Not found (CATEGORY_NOT_FOUND)", body = ErrorBody),
        (status = 409, description = "Name taken (CATEGORY_EXISTS)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user, payload), fields(user_id = auth_user.user_id))]
pub async fn update_category(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i32>,
    AppJson(payload): AppJson<UpdateCategoryRequest>,
) -> Result<Json<ApiResponse<CategoryResponse>>, AppError> {
    let existing = find_category(&state.db, id).await?;
    auth_user.require_owner_or_admin(existing.created_by)?;

    let mut active: category::ActiveModel = existing.into();
    if let Some(name) = payload.name {
        let name = validate_category_name(&name)?;
        ensure_name_free(&state.db, &name, Some(id)).await?;
        active.name = Set(name);
    }
    if let Some(description) = payload.description {
        active.description = Set(description);
    }
    if let Some(color) = payload.color {
        if let Some(c) = &color {
            validate_color(c)?;
        }
        active.color = Set(color);
    }
    if let Some(icon) = payload.icon {
        active.icon = Set(icon);
    }
    if let Some(sort_order) = payload.sort_order {
        active.sort_order = Set(sort_order);
    }
    if let Some(is_active) = payload.is_active {
        active.is_active = Set(is_active);
    }
    active.updated_at = Set(Utc::now());
    let model = active.update(&state.db).await?;

    let count = file_count(&state.db, id).await?;
    Ok(Json(ApiResponse::ok(CategoryResponse::new(model, count))))
}

#[utoipa::path(
    delete,
    path = "/{id}",
    tag = "Categories",
    operation_id = "deleteCategory",
    summary = "Delete a category",
    description = "Creator or administrator only. Refused while live files reference the \
        category; trashed files lose the reference.",
    params(("id" = i32, Path, description = "Category ID")),
    responses(
        (status = 204, description = "Category deleted"),
        (status = 403, description = "Not the creator (INSUFFICIENT_PERMISSIONS)", body = ErrorBody),
        (status = 404, description = "Not found (CATEGORY_NOT_FOUND)", body = ErrorBody),
        (status = 409, description = "Still referenced (CATEGORY_IN_USE)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, auth_user), fields(user_id = auth_user.user_id))]
pub async fn delete_category(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<StatusCode, AppError> {
    let txn = state.db.begin().await?;
    let existing = find_category(&txn, id).await?;
    auth_user.require_owner_or_admin(existing.created_by)?;

    if file_count(&txn, id).await? > 0 {
        return Err(AppError::CategoryInUse);
    }

    file_entry::Entity::update_many()
        .col_expr(
            file_entry::Column::CategoryId,
            Expr::value(Option::<i32>::None),
        )
        .filter(file_entry::Column::CategoryId.eq(id))
        .exec(&txn)
        .await?;
    category::Entity::delete_by_id(id).exec(&txn).await?;
    txn.commit().await?;

    info!(category_id = id, "Deleted category");
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/{id}/files",
    tag = "Categories",
    operation_id = "listCategoryFiles",
    summary = "Files in a category",
    description = "Live files tagged with the category anywhere in the tree, newest first.",
    params(("id" = i32, Path, description = "Category ID"), PageQuery),
    responses(
        (status = 200, description = "One page of files", body = ApiResponse<Vec<FileResponse>>),
        (status = 404, description = "Not found (CATEGORY_NOT_FOUND)", body = ErrorBody),
    ),
    security(("gateway" = []), ("jwt" = [])),
)]
#[instrument(skip(state, _auth_user, query))]
pub async fn list_category_files(
    _auth_user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i32>,
    AppQuery(query): AppQuery<PageQuery>,
) -> Result<Json<ApiResponse<Vec<FileResponse>>>, AppError> {
    find_category(&state.db, id).await?;
    let (page, per_page) = query.resolve();

    let select = live_files()
        .filter(file_entry::Column::CategoryId.eq(id))
        .order_by_desc(file_entry::Column::CreatedAt)
        .order_by_desc(file_entry::Column::Id);
    let total = select.clone().count(&state.db).await?;
    let files = select
        .offset((page - 1) * per_page)
        .limit(per_page)
        .all(&state.db)
        .await?;

    Ok(Json(ApiResponse::paginated(
        files.into_iter().map(FileResponse::from).collect(),
        Pagination::new(page, per_page, total),
    )))
}
