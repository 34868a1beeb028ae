//! Soft delete, restore and permanent deletion.
//!
//! A soft delete keeps blob references intact; only a permanent delete releases them.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, ExprTrait, Query};
use sea_orm::*;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::{
    ID_BATCH, collect_descendants, find_child, name_taken, path, rewrite_subtree_paths,
    unique_child_name,
};
use crate::entity::{blob, file_entry, share_link};
use crate::error::AppError;
use crate::extractors::auth::AuthUser;
use crate::utils::filename::with_suffix;

/// Outcome of a permanent delete.
#[derive(Debug, Default, Clone, Serialize, utoipa::ToSchema)]
pub struct PurgeSummary {
    /// Rows removed, folders included.
    pub entries_removed: u64,
    /// Blob references released.
    pub references_released: u64,
}

#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub entry: file_entry::Model,
    /// Rows brought back, the restored entry included.
    pub restored: u64,
    /// The original parent was gone and the entry went to the recovery folder.
    pub recovered: bool,
}

/// Move an entry and its live subtree to the trash as one batch.
pub async fn soft_delete(
    db: &DatabaseConnection,
    actor: &AuthUser,
    id: i32,
) -> Result<u64, AppError> {
    let txn = db.begin().await?;
    let entry = super::find_live(&txn, id).await?;
    actor.require_owner_or_admin(entry.owner_id)?;

    let mut ids = vec![entry.id];
    if entry.is_directory {
        ids.extend(
            collect_descendants(
                &txn,
                &[entry.id],
                Condition::all().add(file_entry::Column::IsDeleted.eq(false)),
            )
            .await?,
        );
    }

    let batch = Uuid::new_v4().to_string();
    let now = Utc::now();
    for chunk in ids.chunks(ID_BATCH) {
        file_entry::Entity::update_many()
            .col_expr(file_entry::Column::IsDeleted, Expr::value(true))
            .col_expr(file_entry::Column::DeletedAt, Expr::value(now))
            .col_expr(file_entry::Column::DeletedBy, Expr::value(actor.user_id))
            .col_expr(file_entry::Column::TrashBatch, Expr::value(batch.clone()))
            .col_expr(file_entry::Column::UpdatedAt, Expr::value(now))
            .filter(file_entry::Column::Id.is_in(chunk.iter().copied()))
            .exec(&txn)
            .await?;
    }

    txn.commit().await?;
    info!(file_id = id, entries = ids.len(), batch = %batch, "Moved to trash");
    Ok(ids.len() as u64)
}

/// Bring an entry back from the trash, together with the rows deleted alongside it.
///
/// If the former parent is gone or still in the trash, the entry is attached to the
/// root-level recovery folder instead.
pub async fn restore(
    db: &DatabaseConnection,
    actor: &AuthUser,
    id: i32,
    recovery_folder: &str,
) -> Result<RestoreOutcome, AppError> {
    let txn = db.begin().await?;
    let entry = file_entry::Entity::find_by_id(id)
        .one(&txn)
        .await?
        .ok_or(AppError::FileNotFound)?;
    if !entry.is_deleted {
        return Err(AppError::Validation("Entry is not in the trash".into()));
    }
    actor.require_owner_or_admin(entry.owner_id)?;

    let live_parent = match entry.parent_id {
        Some(parent_id) => file_entry::Entity::find_by_id(parent_id)
            .one(&txn)
            .await?
            .filter(|p| p.is_directory && !p.is_deleted),
        None => None,
    };

    let (target_id, target_path, recovered) = match (entry.parent_id, live_parent) {
        (None, _) => (None, None, false),
        (Some(_), Some(parent)) => (Some(parent.id), Some(parent.virtual_path), false),
        (Some(_), None) => {
            let folder = recovery_folder_for(&txn, recovery_folder, entry.owner_id).await?;
            (Some(folder.id), Some(folder.virtual_path), true)
        }
    };

    let name = unique_child_name(&txn, target_id, &entry.name).await?;
    let new_path = path::child_path(target_path.as_deref(), &name);

    let batch_members = match entry.trash_batch.as_deref() {
        Some(batch) => {
            collect_descendants(
                &txn,
                &[entry.id],
                Condition::all().add(file_entry::Column::TrashBatch.eq(batch)),
            )
            .await?
        }
        None => Vec::new(),
    };

    let now = Utc::now();
    let mut active: file_entry::ActiveModel = entry.into();
    active.parent_id = Set(target_id);
    active.name = Set(name.clone());
    active.virtual_path = Set(new_path.clone());
    active.is_deleted = Set(false);
    active.deleted_at = Set(None);
    active.deleted_by = Set(None);
    active.trash_batch = Set(None);
    active.updated_at = Set(now);
    let restored_entry = active.update(&txn).await.map_err(|e| name_taken(e, &name))?;

    for chunk in batch_members.chunks(ID_BATCH) {
        file_entry::Entity::update_many()
            .col_expr(file_entry::Column::IsDeleted, Expr::value(false))
            .col_expr(file_entry::Column::DeletedAt, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(file_entry::Column::DeletedBy, Expr::value(Option::<i32>::None))
            .col_expr(file_entry::Column::TrashBatch, Expr::value(Option::<String>::None))
            .col_expr(file_entry::Column::UpdatedAt, Expr::value(now))
            .filter(file_entry::Column::Id.is_in(chunk.iter().copied()))
            .exec(&txn)
            .await?;
    }

    rewrite_subtree_paths(&txn, restored_entry.id, &new_path).await?;
    txn.commit().await?;

    info!(
        file_id = id,
        restored = batch_members.len() + 1,
        recovered,
        "Restored from trash"
    );

    Ok(RestoreOutcome {
        entry: restored_entry,
        restored: batch_members.len() as u64 + 1,
        recovered,
    })
}

/// The owner's root-level recovery folder: `name`, or the first `name (n)` that is
/// free or already the owner's folder. Entries of other kinds in the way are skipped.
async fn recovery_folder_for<C: ConnectionTrait>(
    db: &C,
    name: &str,
    owner_id: i32,
) -> Result<file_entry::Model, AppError> {
    let mut n = 0;
    loop {
        let candidate = if n == 0 {
            name.to_string()
        } else {
            with_suffix(name, n)
        };
        match find_child(db, None, &candidate).await? {
            Some(folder) if folder.is_directory && folder.owner_id == owner_id => return Ok(folder),
            Some(_) => n += 1,
            None => {
                let folder = super::ensure_folder_path(db, None, &[candidate], owner_id).await?;
                let id = folder.ok_or_else(|| AppError::Internal("recovery folder missing".into()))?;
                return super::find_folder(db, id).await;
            }
        }
    }
}

/// Delete an entry and its whole subtree for good, releasing blob references.
///
/// With `require_trashed`, the entry must already be in the trash.
pub async fn permanent_delete(
    db: &DatabaseConnection,
    id: i32,
    require_trashed: bool,
) -> Result<PurgeSummary, AppError> {
    let txn = db.begin().await?;
    let entry = file_entry::Entity::find_by_id(id)
        .one(&txn)
        .await?
        .ok_or(AppError::FileNotFound)?;
    if require_trashed && !entry.is_deleted {
        return Err(AppError::Validation(
            "Entry must be moved to the trash before it can be deleted permanently".into(),
        ));
    }

    let summary = purge_subtrees(&txn, &[entry.id]).await?;
    txn.commit().await?;

    info!(
        file_id = id,
        entries = summary.entries_removed,
        references = summary.references_released,
        "Permanently deleted"
    );
    Ok(summary)
}

/// Permanently delete everything currently in the trash.
pub async fn empty_trash(db: &DatabaseConnection) -> Result<PurgeSummary, AppError> {
    let txn = db.begin().await?;

    let trashed: Vec<i32> = file_entry::Entity::find()
        .select_only()
        .column(file_entry::Column::Id)
        .filter(file_entry::Column::IsDeleted.eq(true))
        .into_tuple()
        .all(&txn)
        .await?;

    let summary = purge_subtrees(&txn, &trashed).await?;
    txn.commit().await?;

    info!(
        entries = summary.entries_removed,
        references = summary.references_released,
        "Emptied trash"
    );
    Ok(summary)
}

/// Remove `roots` and all their descendants, decrementing blob counts per digest.
async fn purge_subtrees<C: ConnectionTrait>(db: &C, roots: &[i32]) -> Result<PurgeSummary, DbErr> {
    if roots.is_empty() {
        return Ok(PurgeSummary::default());
    }

    let mut ids: Vec<i32> = roots.to_vec();
    ids.extend(collect_descendants(db, roots, Condition::all()).await?);
    let ids: Vec<i32> = ids.into_iter().collect::<HashSet<_>>().into_iter().collect();

    let mut released: BTreeMap<String, i64> = BTreeMap::new();
    for chunk in ids.chunks(ID_BATCH) {
        let hashes: Vec<Option<String>> = file_entry::Entity::find()
            .select_only()
            .column(file_entry::Column::ContentHash)
            .filter(file_entry::Column::Id.is_in(chunk.iter().copied()))
            .filter(file_entry::Column::IsDirectory.eq(false))
            .into_tuple()
            .all(db)
            .await?;
        for hash in hashes.into_iter().flatten() {
            *released.entry(hash).or_default() += 1;
        }
    }

    let mut removed = 0;
    for chunk in ids.chunks(ID_BATCH) {
        share_link::Entity::delete_many()
            .filter(share_link::Column::FileId.is_in(chunk.iter().copied()))
            .exec(db)
            .await?;
        removed += file_entry::Entity::delete_many()
            .filter(file_entry::Column::Id.is_in(chunk.iter().copied()))
            .exec(db)
            .await?
            .rows_affected;
    }

    let now = Utc::now();
    let mut references = 0;
    for (hash, count) in released {
        blob::Entity::update_many()
            .col_expr(
                blob::Column::RefCount,
                Expr::col(blob::Column::RefCount).sub(count),
            )
            .col_expr(blob::Column::UpdatedAt, Expr::value(now))
            .filter(blob::Column::ContentHash.eq(hash))
            .exec(db)
            .await?;
        references += count as u64;
    }

    Ok(PurgeSummary {
        entries_removed: removed,
        references_released: references,
    })
}

/// Trash listing: top-level trashed entries, or the trashed children of `parent_id`.
///
/// `owner_id` limits the listing to one user's entries.
pub async fn list_trash(
    db: &DatabaseConnection,
    parent_id: Option<i32>,
    owner_id: Option<i32>,
    page: u64,
    per_page: u64,
) -> Result<(Vec<file_entry::Model>, u64), AppError> {
    let mut select = file_entry::Entity::find().filter(file_entry::Column::IsDeleted.eq(true));

    select = match parent_id {
        Some(parent) => select.filter(file_entry::Column::ParentId.eq(parent)),
        None => {
            let trashed_ids = Query::select()
                .column(file_entry::Column::Id)
                .from(file_entry::Entity)
                .and_where(Expr::col(file_entry::Column::IsDeleted).eq(true))
                .to_owned();
            select.filter(
                Condition::any()
                    .add(file_entry::Column::ParentId.is_null())
                    .add(file_entry::Column::ParentId.not_in_subquery(trashed_ids)),
            )
        }
    };

    if let Some(owner) = owner_id {
        select = select.filter(file_entry::Column::OwnerId.eq(owner));
    }

    let total = select.clone().paginate(db, per_page).num_items().await?;
    let entries = select
        .order_by_desc(file_entry::Column::IsDirectory)
        .order_by_asc(file_entry::Column::Name)
        .order_by_asc(file_entry::Column::Id)
        .offset(Some((page - 1) * per_page))
        .limit(Some(per_page))
        .all(db)
        .await?;

    Ok((entries, total))
}
