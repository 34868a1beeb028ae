use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Days, Local, NaiveDate, Utc};
use common::TypeClass;
use common::storage::ContentHash;
use sea_orm::sea_query::{Expr, ExprTrait};
use sea_orm::*;
use serde::{Deserialize, Serialize};

use crate::entity::{category, file_entry};
use crate::error::AppError;
use crate::namespace;
use crate::utils::filename::first_free_name;

/// Which files go into an export. Atoms are combined with AND; type classes with OR.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ExportFilter {
    #[serde(default)]
    pub category_ids: Vec<i32>,
    /// First creation day included, server local time.
    pub date_from: Option<NaiveDate>,
    /// Last creation day included, server local time.
    pub date_to: Option<NaiveDate>,
    #[serde(default)]
    pub file_types: Vec<TypeClass>,
    /// Only files in this folder.
    pub folder_id: Option<i32>,
    /// With `folder_id`, also files in its subfolders.
    #[serde(default)]
    pub include_subfolders: bool,
}

impl ExportFilter {
    pub fn validate(&self) -> Result<(), AppError> {
        if let (Some(from), Some(to)) = (self.date_from, self.date_to)
            && from > to
        {
            return Err(AppError::Validation(
                "date_from must not be after date_to".into(),
            ));
        }
        Ok(())
    }
}

/// Midnight of `date` in the server's timezone.
pub fn local_midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0)?
        .and_local_timezone(Local)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

/// One file to put in an archive.
#[derive(Debug, Clone)]
pub struct ExportItem {
    pub file_id: i32,
    /// Unique path inside the archive.
    pub path: String,
    pub hash: ContentHash,
    pub size: u64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}

/// Restrict a selection to the requester's live files.
fn owned_files(owner_id: i32) -> Select<file_entry::Entity> {
    file_entry::Entity::find()
        .filter(file_entry::Column::OwnerId.eq(owner_id))
        .filter(file_entry::Column::IsDeleted.eq(false))
        .filter(file_entry::Column::IsDirectory.eq(false))
        .filter(file_entry::Column::ContentHash.is_not_null())
}

fn type_condition(classes: &[TypeClass]) -> Condition {
    classes.iter().fold(Condition::any(), |cond, class| {
        class.like_patterns().iter().fold(cond, |cond, pattern| {
            cond.add(Expr::col(file_entry::Column::MimeType).like(*pattern))
        })
    })
}

/// Files matching `filter`, oldest first.
///
/// With `newest` set, only the `newest` most recent files are returned, newest first.
pub async fn matching_files(
    db: &DatabaseConnection,
    owner_id: i32,
    filter: &ExportFilter,
    newest: Option<u64>,
) -> Result<Vec<ExportItem>, AppError> {
    let mut select = owned_files(owner_id);

    if !filter.category_ids.is_empty() {
        select = select.filter(file_entry::Column::CategoryId.is_in(filter.category_ids.clone()));
    }
    if let Some(from) = filter.date_from.and_then(local_midnight) {
        select = select.filter(file_entry::Column::CreatedAt.gte(from));
    }
    if let Some(end) = filter
        .date_to
        .and_then(|d| d.checked_add_days(Days::new(1)))
        .and_then(local_midnight)
    {
        select = select.filter(file_entry::Column::CreatedAt.lt(end));
    }
    if !filter.file_types.is_empty() {
        select = select.filter(type_condition(&filter.file_types));
    }
    if let Some(folder_id) = filter.folder_id {
        namespace::find_folder(db, folder_id).await?;
        let mut folders = vec![folder_id];
        if filter.include_subfolders {
            folders.extend(
                namespace::collect_descendants(
                    db,
                    &[folder_id],
                    Condition::all()
                        .add(file_entry::Column::IsDirectory.eq(true))
                        .add(file_entry::Column::IsDeleted.eq(false)),
                )
                .await?,
            );
        }
        select = select.filter(file_entry::Column::ParentId.is_in(folders));
    }

    select = match newest {
        Some(limit) => select
            .order_by_desc(file_entry::Column::CreatedAt)
            .order_by_desc(file_entry::Column::Id)
            .limit(Some(limit)),
        None => select
            .order_by_asc(file_entry::Column::CreatedAt)
            .order_by_asc(file_entry::Column::Id),
    };

    let rows = select.all(db).await?;
    archive_items(db, rows).await
}

/// Give each file its archive path: `<category name>/<name>`, or `<name>` without a
/// category. Clashes get a ` (n)` suffix.
async fn archive_items(
    db: &DatabaseConnection,
    rows: Vec<file_entry::Model>,
) -> Result<Vec<ExportItem>, AppError> {
    let category_ids: HashSet<i32> = rows.iter().filter_map(|r| r.category_id).collect();
    let categories: HashMap<i32, String> = if category_ids.is_empty() {
        HashMap::new()
    } else {
        category::Entity::find()
            .select_only()
            .column(category::Column::Id)
            .column(category::Column::Name)
            .filter(category::Column::Id.is_in(category_ids))
            .into_tuple::<(i32, String)>()
            .all(db)
            .await?
            .into_iter()
            .collect()
    };

    let mut taken = HashSet::new();
    let mut items = Vec::with_capacity(rows.len());

    for row in rows {
        let Some(hex) = row.content_hash.as_deref() else {
            continue;
        };
        let hash = ContentHash::from_hex(hex)?;

        let folder = row
            .category_id
            .and_then(|id| categories.get(&id))
            .map(|name| path_segment(name))
            .unwrap_or_default();
        let name = first_free_name(&row.original_name, |candidate| {
            taken.contains(&join(&folder, candidate))
        });
        let path = join(&folder, &name);
        taken.insert(path.clone());

        items.push(ExportItem {
            file_id: row.id,
            path,
            hash,
            size: u64::try_from(row.size).unwrap_or_default(),
            mime_type: row
                .mime_type
                .unwrap_or_else(|| "application/octet-stream".into()),
            created_at: row.created_at,
        });
    }

    Ok(items)
}

fn path_segment(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\') || c.is_control() { '_' } else { c })
        .collect()
}

fn join(folder: &str, name: &str) -> String {
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{folder}/{name}")
    }
}
