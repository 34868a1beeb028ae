use chrono::Utc;
use sea_orm::sea_query::{
    Index, IndexCreateStatement, MysqlQueryBuilder, OnConflict, PostgresQueryBuilder,
    SqliteQueryBuilder,
};
use sea_orm::*;
use tracing::{error, info, warn};

use crate::config::AdminConfig;
use crate::entity::user::{UserRole, UserStatus};
use crate::entity::{blob, export_job, file_entry, user};

pub const LIVE_NAME_INDEX: &str = "uq_file_entry_live_name";

/// Make sure the configured root administrator exists and is an approved admin.
pub async fn seed_root_admin(db: &DatabaseConnection, admin: &AdminConfig) -> Result<(), DbErr> {
    let Some(email) = admin.root_email.as_deref().map(str::trim).filter(|e| !e.is_empty()) else {
        return Ok(());
    };
    let email = email.to_ascii_lowercase();
    let now = Utc::now();

    let model = user::ActiveModel {
        email: Set(email.clone()),
        name: Set(admin.root_name.clone()),
        role: Set(UserRole::Admin),
        status: Set(UserStatus::Approved),
        last_login_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };

    user::Entity::insert(model)
        .on_conflict(
            OnConflict::column(user::Column::Email)
                .update_columns([user::Column::Role, user::Column::Status])
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    info!(email = %email, "Ensured root administrator");
    Ok(())
}

/// Ensure required database indexes exist.
///
/// SeaORM's schema-sync doesn't support composite non-unique indexes,
/// so we create them manually on startup.
pub async fn ensure_indexes(db: &DatabaseConnection) -> Result<(), DbErr> {
    let indexes = [
        (
            "idx_file_entry_parent_name",
            Index::create()
                .table(file_entry::Entity)
                .col(file_entry::Column::ParentId)
                .col(file_entry::Column::Name)
                .to_owned(),
        ),
        (
            "idx_file_entry_owner_created",
            Index::create()
                .table(file_entry::Entity)
                .col(file_entry::Column::OwnerId)
                .col(file_entry::Column::CreatedAt)
                .to_owned(),
        ),
        (
            "idx_file_entry_deleted_parent",
            Index::create()
                .table(file_entry::Entity)
                .col(file_entry::Column::IsDeleted)
                .col(file_entry::Column::ParentId)
                .to_owned(),
        ),
        // GC candidate scan: ref_count = 0 AND updated_at <= cutoff
        (
            "idx_blob_ref_updated",
            Index::create()
                .table(blob::Entity)
                .col(blob::Column::RefCount)
                .col(blob::Column::UpdatedAt)
                .to_owned(),
        ),
        // Worker claim: oldest pending job first
        (
            "idx_export_job_status_created",
            Index::create()
                .table(export_job::Entity)
                .col(export_job::Column::Status)
                .col(export_job::Column::CreatedAt)
                .to_owned(),
        ),
    ];

    let backend = db.get_database_backend();
    for (name, mut index) in indexes {
        index.if_not_exists().name(name);
        let stmt = build_index(&index, backend);

        match db.execute_unprepared(&stmt).await {
            Ok(_) => info!("Ensured index {} exists", name),
            Err(e) => warn!("Failed to create index {}: {}", name, e),
        }
    }

    ensure_live_name_index(db, backend).await;
    Ok(())
}

/// Live siblings never share a name. Root entries have a NULL parent, hence the COALESCE.
///
/// Partial expression indexes are outside sea-query's builder, so this one is raw SQL.
async fn ensure_live_name_index(db: &DatabaseConnection, backend: DbBackend) {
    if backend == DbBackend::MySql {
        warn!("Partial indexes are unavailable on MySQL; sibling names rely on transaction checks");
        return;
    }
    let stmt = format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {LIVE_NAME_INDEX} \
         ON file_entry (COALESCE(parent_id, 0), name) WHERE NOT is_deleted"
    );
    match db.execute_unprepared(&stmt).await {
        Ok(_) => info!("Ensured index {} exists", LIVE_NAME_INDEX),
        Err(e) => error!("Failed to create index {}: {}", LIVE_NAME_INDEX, e),
    }
}

fn build_index(index: &IndexCreateStatement, backend: DbBackend) -> String {
    match backend {
        DbBackend::Postgres => index.to_string(PostgresQueryBuilder),
        DbBackend::MySql => index.to_string(MysqlQueryBuilder),
        _ => index.to_string(SqliteQueryBuilder),
    }
}
