//! Reclaims blobs no entry references any more.
//!
//! A blob is a candidate once its refcount is zero and its row has not been touched
//! for the grace period. The row is deleted conditionally inside a transaction and
//! the file is unlinked before that transaction commits, so an ingest that touched
//! the row in the meantime keeps it, and a failed unlink leaves both row and file.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::storage::ContentHash;
use sea_orm::*;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::entity::blob;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Default, Clone, Serialize, utoipa::ToSchema)]
pub struct GcReport {
    /// Zero-reference blobs looked at.
    pub examined: u64,
    pub reclaimed: u64,
    /// Rows whose file was already gone.
    pub missing_files: u64,
    /// Candidates that regained a reference or could not be removed.
    pub skipped: u64,
    pub bytes_freed: u64,
    /// Abandoned staging files removed.
    pub temp_files_removed: u64,
}

enum Reclaim {
    Removed { bytes: u64, file_existed: bool },
    Kept,
}

/// One GC pass over at most `gc.batch_size` candidates.
pub async fn run_pass(state: &AppState) -> Result<GcReport, AppError> {
    let grace = Duration::from_secs(state.config.gc.grace_period_secs);
    let cutoff =
        Utc::now() - chrono::Duration::seconds(i64::try_from(grace.as_secs()).unwrap_or(i64::MAX));

    let candidates: Vec<String> = blob::Entity::find()
        .select_only()
        .column(blob::Column::ContentHash)
        .filter(blob::Column::RefCount.lte(0))
        .filter(blob::Column::UpdatedAt.lte(cutoff))
        .order_by_asc(blob::Column::UpdatedAt)
        .limit(Some(Ord::max(state.config.gc.batch_size, 1)))
        .into_tuple()
        .all(&state.db)
        .await?;

    let mut report = GcReport::default();

    for hash in candidates {
        report.examined += 1;
        match reclaim(state, &hash, cutoff).await {
            Ok(Reclaim::Removed {
                bytes,
                file_existed,
            }) => {
                report.reclaimed += 1;
                if file_existed {
                    report.bytes_freed += bytes;
                } else {
                    report.missing_files += 1;
                }
            }
            Ok(Reclaim::Kept) => report.skipped += 1,
            Err(e) => {
                error!(content_hash = %hash, error = %e, "Failed to reclaim blob");
                report.skipped += 1;
            }
        }
    }

    match state.blob_store.sweep_temp(grace).await {
        Ok(count) => report.temp_files_removed = count as u64,
        Err(e) => warn!(error = %e, "Failed to sweep blob staging area"),
    }

    Ok(report)
}

async fn reclaim(
    state: &AppState,
    hash: &str,
    cutoff: DateTime<Utc>,
) -> Result<Reclaim, AppError> {
    let digest = ContentHash::from_hex(hash)?;

    let txn = state.db.begin().await?;

    let row = blob::Entity::find_by_id(hash).one(&txn).await?;
    let Some(row) = row else {
        txn.rollback().await?;
        return Ok(Reclaim::Kept);
    };

    let deleted = blob::Entity::delete_many()
        .filter(blob::Column::ContentHash.eq(hash))
        .filter(blob::Column::RefCount.lte(0))
        .filter(blob::Column::UpdatedAt.lte(cutoff))
        .exec(&txn)
        .await?
        .rows_affected;

    if deleted == 0 {
        txn.rollback().await?;
        debug!(content_hash = %hash, "Blob regained a reference, keeping it");
        return Ok(Reclaim::Kept);
    }

    let file_existed = state.blob_store.unlink(&digest).await?;
    txn.commit().await?;

    if file_existed {
        debug!(content_hash = %hash, size = row.size, "Reclaimed blob");
    } else {
        warn!(content_hash = %hash, "Blob file was already missing, dropped its row");
    }

    Ok(Reclaim::Removed {
        bytes: u64::try_from(row.size).unwrap_or_default(),
        file_existed,
    })
}

/// Run passes on a timer and whenever a permanent delete commits.
pub async fn run_gc_worker(state: AppState) {
    let every = Duration::from_secs(Ord::max(state.config.gc.interval_secs, 1));

    info!(
        interval_secs = every.as_secs(),
        grace_period_secs = state.config.gc.grace_period_secs,
        "Starting blob GC worker"
    );

    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = interval.tick() => {},
            _ = state.gc_trigger.notified() => {},
        }

        match run_pass(&state).await {
            Ok(report) if report.reclaimed > 0 || report.temp_files_removed > 0 => info!(
                reclaimed = report.reclaimed,
                bytes_freed = report.bytes_freed,
                missing_files = report.missing_files,
                temp_files_removed = report.temp_files_removed,
                "Blob GC pass finished"
            ),
            Ok(report) => debug!(examined = report.examined, "Blob GC pass found nothing to reclaim"),
            Err(e) => error!(error = %e, "Blob GC pass failed"),
        }
    }

    info!("Blob GC worker stopped");
}
