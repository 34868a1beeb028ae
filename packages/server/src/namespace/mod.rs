//! The user-facing folder tree over `file_entry` rows.
//!
//! `virtual_path` is materialized on every row and rewritten for a whole subtree
//! inside the transaction that renames or moves its root.

pub mod path;
pub mod trash;

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use sea_orm::sea_query::{Expr, ExprTrait, Func, LikeExpr};
use sea_orm::*;

use crate::database::is_unique_violation;
use crate::entity::file_entry;
use crate::error::AppError;
use crate::extractors::auth::AuthUser;
use crate::models::shared::escape_like;
use crate::utils::filename::{first_free_name, validate_entry_name};

pub use trash::{PurgeSummary, RestoreOutcome};

/// Maximum ids per `IN (...)` list.
const ID_BATCH: usize = 500;

/// Hard stop when walking up parent links of a corrupted tree.
const MAX_DEPTH: usize = 4096;

/// Row of the entry `id`, which must exist and not be in the trash.
pub async fn find_live<C: ConnectionTrait>(db: &C, id: i32) -> Result<file_entry::Model, AppError> {
    let entry = file_entry::Entity::find_by_id(id)
        .one(db)
        .await?
        .ok_or(AppError::FileNotFound)?;
    if entry.is_deleted {
        return Err(AppError::FileDeleted);
    }
    Ok(entry)
}

/// Live folder `id`.
pub async fn find_folder<C: ConnectionTrait>(db: &C, id: i32) -> Result<file_entry::Model, AppError> {
    let entry = find_live(db, id).await?;
    if !entry.is_directory {
        return Err(AppError::Validation(format!("Entry {id} is not a folder")));
    }
    Ok(entry)
}

/// `virtual_path` of the folder new children of `parent_id` go into (`None` for the root).
pub async fn parent_path<C: ConnectionTrait>(
    db: &C,
    parent_id: Option<i32>,
) -> Result<Option<String>, AppError> {
    match parent_id {
        Some(id) => Ok(Some(find_folder(db, id).await?.virtual_path)),
        None => Ok(None),
    }
}

fn parent_condition(parent_id: Option<i32>) -> Condition {
    match parent_id {
        Some(id) => Condition::all().add(file_entry::Column::ParentId.eq(id)),
        None => Condition::all().add(file_entry::Column::ParentId.is_null()),
    }
}

/// Live sibling called `name` under `parent_id`.
pub async fn find_child<C: ConnectionTrait>(
    db: &C,
    parent_id: Option<i32>,
    name: &str,
) -> Result<Option<file_entry::Model>, DbErr> {
    file_entry::Entity::find()
        .filter(parent_condition(parent_id))
        .filter(file_entry::Column::Name.eq(name))
        .filter(file_entry::Column::IsDeleted.eq(false))
        .one(db)
        .await
}

/// `name`, or `name (n)` when a live sibling already uses it.
pub async fn unique_child_name<C: ConnectionTrait>(
    db: &C,
    parent_id: Option<i32>,
    name: &str,
) -> Result<String, DbErr> {
    let siblings: HashSet<String> = file_entry::Entity::find()
        .select_only()
        .column(file_entry::Column::Name)
        .filter(parent_condition(parent_id))
        .filter(file_entry::Column::IsDeleted.eq(false))
        .into_tuple::<String>()
        .all(db)
        .await?
        .into_iter()
        .collect();

    Ok(first_free_name(name, |candidate| siblings.contains(candidate)))
}

/// Turn a live-name index collision into the conflict a pre-check would have reported.
pub(crate) fn name_taken(err: DbErr, name: &str) -> AppError {
    if is_unique_violation(&err) {
        AppError::NameConflict(format!("'{name}' already exists in this folder"))
    } else {
        AppError::Database(err)
    }
}

fn checked_name(name: &str) -> Result<String, AppError> {
    validate_entry_name(name)
        .map(str::to_string)
        .map_err(|e| AppError::Validation(e.message().into()))
}

/// Look up a live entry by its virtual path.
pub async fn resolve<C: ConnectionTrait>(db: &C, raw_path: &str) -> Result<file_entry::Model, AppError> {
    let normalized = path::normalize(raw_path)?;
    if normalized == "/" {
        return Err(AppError::InvalidPath("The root is not an entry".into()));
    }

    file_entry::Entity::find()
        .filter(file_entry::Column::VirtualPath.eq(&normalized))
        .filter(file_entry::Column::IsDeleted.eq(false))
        .one(db)
        .await?
        .ok_or(AppError::FileNotFound)
}

fn folder_model(
    name: String,
    parent_id: Option<i32>,
    virtual_path: String,
    owner_id: i32,
) -> file_entry::ActiveModel {
    let now = Utc::now();
    file_entry::ActiveModel {
        original_name: Set(name.clone()),
        name: Set(name),
        parent_id: Set(parent_id),
        virtual_path: Set(virtual_path),
        owner_id: Set(owner_id),
        category_id: Set(None),
        content_hash: Set(None),
        size: Set(0),
        mime_type: Set(None),
        is_directory: Set(true),
        is_deleted: Set(false),
        deleted_at: Set(None),
        deleted_by: Set(None),
        trash_batch: Set(None),
        description: Set(None),
        tags: Set(None),
        download_count: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
}

/// Create a folder. Duplicate names under the same parent are rejected.
pub async fn create_folder(
    db: &DatabaseConnection,
    parent_id: Option<i32>,
    name: &str,
    owner_id: i32,
) -> Result<file_entry::Model, AppError> {
    let name = checked_name(name)?;

    let txn = db.begin().await?;
    let parent = parent_path(&txn, parent_id).await?;
    if find_child(&txn, parent_id, &name).await?.is_some() {
        return Err(AppError::NameConflict(format!(
            "'{name}' already exists in this folder"
        )));
    }

    let folder = folder_model(
        name.clone(),
        parent_id,
        path::child_path(parent.as_deref(), &name),
        owner_id,
    )
    .insert(&txn)
    .await
    .map_err(|e| name_taken(e, &name))?;
    txn.commit().await.map_err(|e| name_taken(e, &name))?;

    Ok(folder)
}

/// Walk `folders` below `parent_id`, creating any that are missing.
///
/// Returns the id of the innermost folder.
pub async fn ensure_folder_path<C: ConnectionTrait>(
    db: &C,
    parent_id: Option<i32>,
    folders: &[String],
    owner_id: i32,
) -> Result<Option<i32>, AppError> {
    let mut current = parent_id;
    let mut current_path = parent_path(db, parent_id).await?;

    for raw in folders {
        let name = checked_name(raw)?;
        match find_child(db, current, &name).await? {
            Some(existing) if existing.is_directory => {
                current = Some(existing.id);
                current_path = Some(existing.virtual_path);
            }
            Some(_) => {
                return Err(AppError::NameConflict(format!(
                    "A file named '{name}' is in the way of the folder path"
                )));
            }
            None => {
                let virtual_path = path::child_path(current_path.as_deref(), &name);
                let folder = match folder_model(name.clone(), current, virtual_path, owner_id)
                    .insert(db)
                    .await
                {
                    Ok(folder) => folder,
                    // A concurrent upload created the same folder first.
                    Err(e) if is_unique_violation(&e) => match find_child(db, current, &name).await? {
                        Some(existing) if existing.is_directory => existing,
                        _ => return Err(name_taken(e, &name)),
                    },
                    Err(e) => return Err(e.into()),
                };
                current = Some(folder.id);
                current_path = Some(folder.virtual_path);
            }
        }
    }

    Ok(current)
}

/// Rename an entry and rewrite the paths of its subtree.
pub async fn rename(
    db: &DatabaseConnection,
    actor: &AuthUser,
    id: i32,
    new_name: &str,
) -> Result<file_entry::Model, AppError> {
    let name = checked_name(new_name)?;

    let txn = db.begin().await?;
    let entry = find_live(&txn, id).await?;
    actor.require_owner_or_admin(entry.owner_id)?;

    if entry.name == name {
        txn.rollback().await?;
        return Ok(entry);
    }
    if find_child(&txn, entry.parent_id, &name).await?.is_some() {
        return Err(AppError::NameConflict(format!(
            "'{name}' already exists in this folder"
        )));
    }

    let parent = parent_path(&txn, entry.parent_id).await?;
    let new_path = path::child_path(parent.as_deref(), &name);

    let mut active: file_entry::ActiveModel = entry.into();
    active.name = Set(name.clone());
    active.virtual_path = Set(new_path.clone());
    active.updated_at = Set(Utc::now());
    let updated = active.update(&txn).await.map_err(|e| name_taken(e, &name))?;

    rewrite_subtree_paths(&txn, updated.id, &new_path).await?;
    txn.commit().await?;

    Ok(updated)
}

/// Move an entry under `new_parent` (`None` = root).
pub async fn move_entry(
    db: &DatabaseConnection,
    actor: &AuthUser,
    id: i32,
    new_parent: Option<i32>,
) -> Result<file_entry::Model, AppError> {
    let txn = db.begin().await?;
    let entry = find_live(&txn, id).await?;
    actor.require_owner_or_admin(entry.owner_id)?;

    if entry.parent_id == new_parent {
        txn.rollback().await?;
        return Ok(entry);
    }

    let parent = parent_path(&txn, new_parent).await?;
    if let Some(target) = new_parent {
        ensure_not_within(&txn, target, id).await?;
    }
    if find_child(&txn, new_parent, &entry.name).await?.is_some() {
        return Err(AppError::NameConflict(format!(
            "'{}' already exists in the target folder",
            entry.name
        )));
    }

    let new_path = path::child_path(parent.as_deref(), &entry.name);
    let name = entry.name.clone();

    let mut active: file_entry::ActiveModel = entry.into();
    active.parent_id = Set(new_parent);
    active.virtual_path = Set(new_path.clone());
    active.updated_at = Set(Utc::now());
    let updated = active.update(&txn).await.map_err(|e| name_taken(e, &name))?;

    rewrite_subtree_paths(&txn, updated.id, &new_path).await?;
    txn.commit().await?;

    Ok(updated)
}

/// Fail when `target` is `id` itself or one of its descendants.
async fn ensure_not_within<C: ConnectionTrait>(db: &C, target: i32, id: i32) -> Result<(), AppError> {
    let mut current = Some(target);
    let mut steps = 0;

    while let Some(node) = current {
        if node == id {
            return Err(AppError::Validation(
                "Cannot move a folder into itself or one of its subfolders".into(),
            ));
        }
        steps += 1;
        if steps > MAX_DEPTH {
            return Err(AppError::Internal(format!(
                "parent chain of entry {target} does not terminate"
            )));
        }
        current = file_entry::Entity::find_by_id(node)
            .select_only()
            .column(file_entry::Column::ParentId)
            .into_tuple::<Option<i32>>()
            .one(db)
            .await?
            .flatten();
    }

    Ok(())
}

/// Recompute `virtual_path` for every descendant of `root_id`, level by level.
///
/// Trashed descendants are rewritten too so a later restore finds consistent paths.
pub async fn rewrite_subtree_paths<C: ConnectionTrait>(
    db: &C,
    root_id: i32,
    root_path: &str,
) -> Result<u64, DbErr> {
    let mut frontier: HashMap<i32, String> = HashMap::from([(root_id, root_path.to_string())]);
    let mut rewritten = 0;

    while !frontier.is_empty() {
        let parent_ids: Vec<i32> = frontier.keys().copied().collect();
        let mut next = HashMap::new();

        for batch in parent_ids.chunks(ID_BATCH) {
            let children: Vec<(i32, Option<i32>, String, String, bool)> = file_entry::Entity::find()
                .select_only()
                .column(file_entry::Column::Id)
                .column(file_entry::Column::ParentId)
                .column(file_entry::Column::Name)
                .column(file_entry::Column::VirtualPath)
                .column(file_entry::Column::IsDirectory)
                .filter(file_entry::Column::ParentId.is_in(batch.iter().copied()))
                .into_tuple()
                .all(db)
                .await?;

            for (id, parent_id, name, current_path, is_directory) in children {
                let Some(parent_path) = parent_id.and_then(|p| frontier.get(&p)) else {
                    continue;
                };
                let expected = path::child_path(Some(parent_path), &name);
                if expected != current_path {
                    file_entry::Entity::update_many()
                        .col_expr(file_entry::Column::VirtualPath, Expr::value(expected.clone()))
                        .filter(file_entry::Column::Id.eq(id))
                        .exec(db)
                        .await?;
                    rewritten += 1;
                }
                if is_directory {
                    next.insert(id, expected);
                }
            }
        }

        frontier = next;
    }

    Ok(rewritten)
}

/// Ids of all descendants of `roots` (roots excluded) whose rows match `scope`.
pub async fn collect_descendants<C: ConnectionTrait>(
    db: &C,
    roots: &[i32],
    scope: Condition,
) -> Result<Vec<i32>, DbErr> {
    let mut seen: HashSet<i32> = roots.iter().copied().collect();
    let mut frontier: Vec<i32> = roots.to_vec();
    let mut found = Vec::new();

    while !frontier.is_empty() {
        let mut next = Vec::new();
        for batch in frontier.chunks(ID_BATCH) {
            let children: Vec<i32> = file_entry::Entity::find()
                .select_only()
                .column(file_entry::Column::Id)
                .filter(file_entry::Column::ParentId.is_in(batch.iter().copied()))
                .filter(scope.clone())
                .into_tuple()
                .all(db)
                .await?;
            for child in children {
                if seen.insert(child) {
                    found.push(child);
                    next.push(child);
                }
            }
        }
        frontier = next;
    }

    Ok(found)
}

/// Rebuild every `virtual_path` from the parent links.
///
/// Entries whose parent no longer exists are treated as roots. Returns the number of
/// rows whose stored path changed.
pub async fn rebuild_virtual_paths(db: &DatabaseConnection) -> Result<u64, AppError> {
    let txn = db.begin().await?;

    let rows: Vec<(i32, Option<i32>, String, String)> = file_entry::Entity::find()
        .select_only()
        .column(file_entry::Column::Id)
        .column(file_entry::Column::ParentId)
        .column(file_entry::Column::Name)
        .column(file_entry::Column::VirtualPath)
        .into_tuple()
        .all(&txn)
        .await?;

    let known: HashSet<i32> = rows.iter().map(|(id, ..)| *id).collect();
    let mut children: HashMap<Option<i32>, Vec<usize>> = HashMap::new();
    for (idx, (_, parent_id, ..)) in rows.iter().enumerate() {
        let parent = parent_id.filter(|p| known.contains(p));
        children.entry(parent).or_default().push(idx);
    }

    let mut queue: Vec<(usize, String)> = children
        .get(&None)
        .into_iter()
        .flatten()
        .map(|&idx| (idx, path::child_path(None, &rows[idx].2)))
        .collect();
    let mut updated = 0;

    while let Some((idx, computed)) = queue.pop() {
        let (id, _, _, stored) = &rows[idx];
        if *stored != computed {
            file_entry::Entity::update_many()
                .col_expr(file_entry::Column::VirtualPath, Expr::value(computed.clone()))
                .filter(file_entry::Column::Id.eq(*id))
                .exec(&txn)
                .await?;
            updated += 1;
        }
        for &child in children.get(&Some(*id)).into_iter().flatten() {
            queue.push((child, path::child_path(Some(&computed), &rows[child].2)));
        }
    }

    txn.commit().await?;
    Ok(updated)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Name,
    CreatedAt,
    Size,
}

impl SortKey {
    pub fn parse(value: Option<&str>) -> Result<Self, AppError> {
        match value.unwrap_or("name") {
            "name" => Ok(SortKey::Name),
            "created_at" => Ok(SortKey::CreatedAt),
            "size" => Ok(SortKey::Size),
            _ => Err(AppError::Validation(
                "sort_by must be one of: name, created_at, size".into(),
            )),
        }
    }

    fn column(&self) -> file_entry::Column {
        match self {
            SortKey::Name => file_entry::Column::Name,
            SortKey::CreatedAt => file_entry::Column::CreatedAt,
            SortKey::Size => file_entry::Column::Size,
        }
    }
}

/// Filters for a folder listing.
#[derive(Debug, Clone)]
pub struct ListFilter {
    pub parent_id: Option<i32>,
    pub category_id: Option<i32>,
    pub mime_prefix: Option<String>,
    pub search: Option<String>,
    pub sort: SortKey,
    pub order: Order,
}

impl ListFilter {
    /// A search or category filter without an explicit parent spans the whole tree.
    fn scoped_to_parent(&self) -> bool {
        self.parent_id.is_some() || (self.search.is_none() && self.category_id.is_none())
    }
}

/// One page of live entries, folders first.
pub async fn list_entries(
    db: &DatabaseConnection,
    filter: &ListFilter,
    page: u64,
    per_page: u64,
) -> Result<(Vec<file_entry::Model>, u64), AppError> {
    if let Some(parent) = filter.parent_id {
        find_folder(db, parent).await?;
    }

    let mut select = file_entry::Entity::find().filter(file_entry::Column::IsDeleted.eq(false));

    if filter.scoped_to_parent() {
        select = select.filter(parent_condition(filter.parent_id));
    }
    if let Some(category_id) = filter.category_id {
        select = select.filter(file_entry::Column::CategoryId.eq(category_id));
    }
    if let Some(prefix) = filter.mime_prefix.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        select = select.filter(
            Expr::col(file_entry::Column::MimeType)
                .like(LikeExpr::new(format!("{}%", escape_like(prefix))).escape('\\')),
        );
    }
    if let Some(term) = filter.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let term = escape_like(term);
        select = select.filter(
            Expr::expr(Func::lower(Expr::col(file_entry::Column::Name)))
                .like(LikeExpr::new(format!("%{}%", term.to_lowercase())).escape('\\')),
        );
    }

    let total = select.clone().paginate(db, per_page).num_items().await?;

    let entries = select
        .order_by_desc(file_entry::Column::IsDirectory)
        .order_by(filter.sort.column(), filter.order.clone())
        .order_by_asc(file_entry::Column::Id)
        .offset(Some((page - 1) * per_page))
        .limit(Some(per_page))
        .all(db)
        .await?;

    Ok((entries, total))
}
