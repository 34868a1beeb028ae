//! Binds uploaded content to new file entries, storing each digest once.
//!
//! Order of operations, so a concurrent GC pass can never reclaim a blob that is
//! about to gain a reference:
//!
//! 1. stage the bytes (digest and length become known);
//! 2. register the blob row (refcount 0 when new) and touch `updated_at`;
//! 3. publish the staged file to its content-addressed path;
//! 4. in one transaction, pick a free sibling name, upsert the blob refcount and
//!    insert the entry. A unique index on live names catches concurrent picks, and
//!    the transaction is retried with the next free name.
//!
//! A failure after step 2 leaves a zero-reference row that the GC reclaims.

use chrono::Utc;
use common::media;
use common::storage::{BoxReader, IngestLimits, StagedBlob, StorageError};
use sea_orm::sea_query::{Expr, ExprTrait, OnConflict};
use sea_orm::*;
use tracing::{debug, error, info};

use crate::config::StorageConfig;
use crate::database::{is_unique_violation, with_retry};
use crate::entity::{blob, category, file_entry};
use crate::error::AppError;
use crate::namespace::{self, path};
use crate::state::AppState;
use crate::utils::filename::{is_system_file, validate_entry_name};

/// Attempts at binding an entry when concurrent uploads keep taking the chosen name.
const NAME_ATTEMPTS: usize = 16;

/// Where and how an uploaded file should appear in the tree.
#[derive(Debug, Clone, Default)]
pub struct UploadTarget {
    pub parent_id: Option<i32>,
    /// Folders below `parent_id` such as `Album/Day 1`; missing ones are created.
    pub relative_path: Option<String>,
    pub category_id: Option<i32>,
    pub description: Option<String>,
    pub tags: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub file_name: String,
    pub owner_id: i32,
    pub target: UploadTarget,
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub entry: file_entry::Model,
    /// The content was already stored.
    pub deduplicated: bool,
    /// An identical file with the same name already exists in the folder.
    pub skipped: bool,
}

/// Apply the upload naming and extension policy. Returns the trimmed name.
pub fn check_upload_name(storage: &StorageConfig, raw_name: &str) -> Result<String, AppError> {
    let name = validate_entry_name(raw_name)
        .map_err(|e| AppError::Validation(e.message().into()))?;

    if is_system_file(name) {
        return Err(AppError::InvalidFileType(format!(
            "System files are not accepted: {name}"
        )));
    }

    let ext = media::extension(name).ok_or_else(|| {
        AppError::InvalidFileType(format!("'{name}' has no file extension"))
    })?;
    if storage.blocked_extensions.iter().any(|b| b.eq_ignore_ascii_case(&ext)) {
        return Err(AppError::InvalidFileType(format!(
            "Files of type .{ext} are not allowed"
        )));
    }
    if !storage.allowed_extensions.is_empty()
        && !storage.allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext))
    {
        return Err(AppError::InvalidFileType(format!(
            "Files of type .{ext} are not supported"
        )));
    }

    Ok(name.to_string())
}

/// Stage `reader` and bind it as a new entry.
pub async fn ingest_reader(
    state: &AppState,
    reader: BoxReader,
    request: IngestRequest,
    limits: IngestLimits,
) -> Result<IngestOutcome, AppError> {
    check_upload_name(&state.config.storage, &request.file_name)?;
    let staged = state.blob_store.stage(reader, limits).await?;
    commit_staged(state, staged, request).await
}

/// Bind already staged content as a new entry.
pub async fn commit_staged(
    state: &AppState,
    staged: StagedBlob,
    request: IngestRequest,
) -> Result<IngestOutcome, AppError> {
    let db = &state.db;
    let name = check_upload_name(&state.config.storage, &request.file_name)?;
    let target = request.target;

    let parent_id = match target.relative_path.as_deref() {
        Some(rel) if !rel.trim().is_empty() => {
            let folders = path::relative_folders(rel)?;
            namespace::ensure_folder_path(db, target.parent_id, &folders, request.owner_id).await?
        }
        _ => {
            namespace::parent_path(db, target.parent_id).await?;
            target.parent_id
        }
    };
    let parent_path = namespace::parent_path(db, parent_id).await?;

    if let Some(category_id) = target.category_id {
        category::Entity::find_by_id(category_id)
            .one(db)
            .await?
            .ok_or(AppError::CategoryNotFound)?;
    }

    let hash = staged.hash();
    let hex = hash.to_hex();
    let length = staged.length();

    if let Some(existing) = namespace::find_child(db, parent_id, &name).await?
        && !existing.is_directory
        && existing.content_hash.as_deref() == Some(hex.as_str())
    {
        info!(file_id = existing.id, content_hash = %hex, "Identical file already present, skipping");
        return Ok(IngestOutcome {
            entry: existing,
            deduplicated: true,
            skipped: true,
        });
    }

    let known = with_retry(&state.config.retry, || register_blob(db, &hex, length)).await?;

    let published = state.blob_store.publish(staged).await.map_err(|e| {
        if let StorageError::LengthMismatch { .. } = &e {
            error!(content_hash = %hex, error = %e, "Refusing to bind content to a blob of a different length");
        }
        AppError::from(e)
    })?;

    let now = Utc::now();
    let size = i64::try_from(length).unwrap_or(i64::MAX);
    let mime_type = target
        .mime_type
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| media::guess_mime(&name));

    let model = file_entry::ActiveModel {
        original_name: Set(name.clone()),
        parent_id: Set(parent_id),
        owner_id: Set(request.owner_id),
        category_id: Set(target.category_id),
        content_hash: Set(Some(hex.clone())),
        size: Set(size),
        mime_type: Set(Some(mime_type)),
        is_directory: Set(false),
        is_deleted: Set(false),
        deleted_at: Set(None),
        deleted_by: Set(None),
        trash_batch: Set(None),
        description: Set(target.description),
        tags: Set(target.tags),
        download_count: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    let slot = Slot {
        parent_id,
        parent_path: parent_path.as_deref(),
        name: &name,
        hex: &hex,
        size,
    };

    let mut attempt = 0;
    let bound = loop {
        attempt += 1;
        let result = with_retry(&state.config.retry, || bind_entry(db, &slot, model.clone())).await;
        match result {
            Err(AppError::Database(e)) if is_unique_violation(&e) && attempt < NAME_ATTEMPTS => {
                debug!(name = %name, attempt, "Sibling name taken concurrently, picking another");
            }
            other => break other?,
        }
    };

    let entry = match bound {
        Bound::Inserted(entry) => entry,
        Bound::Identical(existing) => {
            info!(file_id = existing.id, content_hash = %hex, "Identical file stored concurrently, skipping");
            return Ok(IngestOutcome {
                entry: existing,
                deduplicated: true,
                skipped: true,
            });
        }
    };

    let deduplicated = known || !published.created;
    info!(
        file_id = entry.id,
        content_hash = %hex,
        size,
        deduplicated,
        "Stored upload"
    );

    Ok(IngestOutcome {
        entry,
        deduplicated,
        skipped: false,
    })
}

/// Folder slot an upload is bound into.
struct Slot<'a> {
    parent_id: Option<i32>,
    parent_path: Option<&'a str>,
    name: &'a str,
    hex: &'a str,
    size: i64,
}

enum Bound {
    Inserted(file_entry::Model),
    /// The same content already sits under the requested name.
    Identical(file_entry::Model),
}

/// Pick the sibling name and insert the entry with its blob reference in one transaction.
async fn bind_entry(
    db: &DatabaseConnection,
    slot: &Slot<'_>,
    mut model: file_entry::ActiveModel,
) -> Result<Bound, AppError> {
    let txn = db.begin().await?;

    if let Some(existing) = namespace::find_child(&txn, slot.parent_id, slot.name).await?
        && !existing.is_directory
        && existing.content_hash.as_deref() == Some(slot.hex)
    {
        txn.rollback().await?;
        return Ok(Bound::Identical(existing));
    }

    let final_name = namespace::unique_child_name(&txn, slot.parent_id, slot.name).await?;
    model.virtual_path = Set(path::child_path(slot.parent_path, &final_name));
    model.name = Set(final_name);

    add_reference(&txn, slot.hex, slot.size).await?;
    let entry = model.insert(&txn).await?;
    txn.commit().await?;
    Ok(Bound::Inserted(entry))
}

/// Make sure a row exists for the digest and restart its GC grace window.
///
/// Returns whether the row already existed. A stored length that differs from the
/// incoming one is refused.
async fn register_blob(db: &DatabaseConnection, hex: &str, length: u64) -> Result<bool, AppError> {
    let size = i64::try_from(length).unwrap_or(i64::MAX);

    for _ in 0..3 {
        let now = Utc::now();
        let model = blob::ActiveModel {
            content_hash: Set(hex.to_string()),
            size: Set(size),
            ref_count: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let inserted = blob::Entity::insert(model)
            .on_conflict(
                OnConflict::column(blob::Column::ContentHash)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(db)
            .await;

        match inserted {
            Ok(n) if n > 0 => return Ok(false),
            Ok(_) | Err(DbErr::RecordNotInserted) => {}
            Err(e) => return Err(e.into()),
        }

        let Some(existing) = blob::Entity::find_by_id(hex).one(db).await? else {
            // Reclaimed between the insert and the lookup.
            continue;
        };
        if existing.size != size {
            error!(
                content_hash = %hex,
                stored = existing.size,
                incoming = size,
                "Digest collision or corrupted catalog: same digest, different length"
            );
            return Err(AppError::Storage(format!(
                "blob {hex} is recorded with {} bytes, upload has {size}",
                existing.size
            )));
        }

        let touched = blob::Entity::update_many()
            .col_expr(blob::Column::UpdatedAt, Expr::value(now))
            .filter(blob::Column::ContentHash.eq(hex))
            .exec(db)
            .await?
            .rows_affected;
        if touched > 0 {
            return Ok(true);
        }
    }

    Err(AppError::Storage(format!(
        "blob {hex} kept disappearing while being registered"
    )))
}

/// Take one reference on a blob: insert it with refcount 1 or increment.
pub(crate) async fn add_reference<C: ConnectionTrait>(
    db: &C,
    hex: &str,
    size: i64,
) -> Result<(), DbErr> {
    let now = Utc::now();
    let model = blob::ActiveModel {
        content_hash: Set(hex.to_string()),
        size: Set(size),
        ref_count: Set(1),
        created_at: Set(now),
        updated_at: Set(now),
    };

    blob::Entity::insert(model)
        .on_conflict(
            OnConflict::column(blob::Column::ContentHash)
                .value(
                    blob::Column::RefCount,
                    Expr::col((blob::Entity, blob::Column::RefCount)).add(1),
                )
                .value(blob::Column::UpdatedAt, Expr::value(now))
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    Ok(())
}
