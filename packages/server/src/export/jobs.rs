//! Spooled export jobs.
//!
//! `pending -> processing -> completed | failed`, then `completed -> expired` once the
//! download window closes. Every status change is a conditional update on the status
//! it leaves, so a cancel and a worker never both win.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::*;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::archive::{self, ArchiveError, ArchiveProgress};
use super::filter::{self, ExportFilter};
use crate::config::AppConfig;
use crate::entity::export_job::{self, ArchiveFormat, ExportStatus};
use crate::error::AppError;
use crate::extractors::auth::AuthUser;
use crate::models::export::ExportRequest;
use crate::namespace;
use crate::state::AppState;

const MAX_LABEL_LEN: usize = 64;

/// `<label>_<YYYYMMDD_HHMMSS>.<ext>`.
pub fn archive_name(label: &str, format: ArchiveFormat, at: DateTime<Local>) -> String {
    format!(
        "{label}_{}.{}",
        at.format("%Y%m%d_%H%M%S"),
        format.extension()
    )
}

/// Reduce a user-supplied label to `[A-Za-z0-9_-]`.
pub fn archive_label(raw: &str) -> String {
    let label: String = raw
        .trim()
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => Some(c),
            ' ' => Some('_'),
            _ => None,
        })
        .take(MAX_LABEL_LEN)
        .collect();
    if label.is_empty() {
        "export".into()
    } else {
        label
    }
}

/// Where a job's archive is spooled.
pub fn spool_path(export_dir: &Path, job_id: &str, format: ArchiveFormat) -> PathBuf {
    export_dir.join(format!("{job_id}.{}", format.extension()))
}

#[instrument(skip(state, request), fields(owner_id = actor.user_id))]
pub async fn create_job(
    state: &AppState,
    actor: &AuthUser,
    request: ExportRequest,
) -> Result<export_job::Model, AppError> {
    request.filter.validate()?;
    if let Some(folder_id) = request.filter.folder_id {
        namespace::find_folder(&state.db, folder_id).await?;
    }

    let filter = serde_json::to_value(&request.filter)
        .map_err(|e| AppError::Internal(format!("failed to store export filter: {e}")))?;
    let label = archive_label(request.name.as_deref().unwrap_or("export"));
    let now = Utc::now();

    let job = export_job::ActiveModel {
        job_id: Set(Uuid::new_v4().to_string()),
        owner_id: Set(actor.user_id),
        filter: Set(filter),
        format: Set(request.format),
        status: Set(ExportStatus::Pending),
        progress: Set(0),
        processed_files: Set(0),
        total_files: Set(0),
        processed_size: Set(0),
        total_size: Set(0),
        archive_name: Set(archive_name(&label, request.format, now.with_timezone(&Local))),
        archive_path: Set(None),
        archive_size: Set(None),
        error: Set(None),
        expires_at: Set(None),
        started_at: Set(None),
        completed_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&state.db)
    .await?;

    info!(job_id = %job.job_id, archive = %job.archive_name, "Queued export job");
    state.exports.wake();
    Ok(job)
}

/// A job visible to `actor`. Other users' jobs are reported as missing.
pub async fn find_job(
    db: &DatabaseConnection,
    actor: &AuthUser,
    job_id: &str,
) -> Result<export_job::Model, AppError> {
    let job = export_job::Entity::find_by_id(job_id.to_string())
        .one(db)
        .await?
        .ok_or(AppError::JobNotFound)?;
    if job.owner_id != actor.user_id && !actor.is_admin() {
        return Err(AppError::JobNotFound);
    }
    Ok(job)
}

/// The actor's jobs, newest first.
pub async fn history(
    db: &DatabaseConnection,
    actor: &AuthUser,
    page: u64,
    per_page: u64,
) -> Result<(Vec<export_job::Model>, u64), AppError> {
    let paginator = export_job::Entity::find()
        .filter(export_job::Column::OwnerId.eq(actor.user_id))
        .order_by_desc(export_job::Column::CreatedAt)
        .paginate(db, per_page);
    let total = paginator.num_items().await?;
    let jobs = paginator.fetch_page(page - 1).await?;
    Ok((jobs, total))
}

/// Stop a pending or running job. It ends up `failed` with error `cancelled`.
#[instrument(skip(state), fields(owner_id = actor.user_id))]
pub async fn cancel_job(
    state: &AppState,
    actor: &AuthUser,
    job_id: &str,
) -> Result<export_job::Model, AppError> {
    let job = find_job(&state.db, actor, job_id).await?;

    match job.status {
        ExportStatus::Pending | ExportStatus::Processing => {}
        status => {
            return Err(AppError::Validation(format!(
                "Job is already {}",
                status.to_value()
            )));
        }
    }

    // A pending job may be claimed between the read and this update; the worker
    // registers its token before claiming, so the cancel below still reaches it.
    let cancelled_pending =
        mark_failed(&state.db, job_id, ExportStatus::Pending, "cancelled").await?;
    if !cancelled_pending && !state.exports.cancel(job_id) {
        // Processing with no live worker, e.g. a row left over from a crash.
        mark_failed(&state.db, job_id, ExportStatus::Processing, "cancelled").await?;
    }

    info!(job_id, "Cancelled export job");
    find_job(&state.db, actor, job_id).await
}

/// The finished archive of a job, or why it cannot be downloaded.
pub async fn download(
    state: &AppState,
    actor: &AuthUser,
    job_id: &str,
) -> Result<(export_job::Model, PathBuf), AppError> {
    let job = find_job(&state.db, actor, job_id).await?;

    match job.status {
        ExportStatus::Completed => {}
        ExportStatus::Expired => return Err(AppError::DownloadExpired),
        status => {
            return Err(AppError::JobNotCompleted {
                status: status.to_value(),
                progress: job.progress,
            });
        }
    }
    if job.expires_at.is_some_and(|at| at <= Utc::now()) {
        return Err(AppError::DownloadExpired);
    }

    let path = job
        .archive_path
        .as_deref()
        .map(PathBuf::from)
        .ok_or(AppError::FileNotFound)?;
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        warn!(job_id, path = %path.display(), "Completed export has no archive on disk");
        return Err(AppError::FileNotFound);
    }
    Ok((job, path))
}

/// `from -> failed`. Returns whether this call made the change.
async fn mark_failed<C: ConnectionTrait>(
    db: &C,
    job_id: &str,
    from: ExportStatus,
    reason: &str,
) -> Result<bool, DbErr> {
    let now = Utc::now();
    let result = export_job::Entity::update_many()
        .col_expr(export_job::Column::Status, Expr::value(ExportStatus::Failed))
        .col_expr(export_job::Column::Error, Expr::value(reason.to_string()))
        .col_expr(export_job::Column::CompletedAt, Expr::value(now))
        .col_expr(export_job::Column::UpdatedAt, Expr::value(now))
        .filter(export_job::Column::JobId.eq(job_id))
        .filter(export_job::Column::Status.eq(from))
        .exec(db)
        .await?;
    Ok(result.rows_affected > 0)
}

/// Turns per-entry progress into occasional, monotonic percent updates.
#[derive(Debug)]
struct ProgressThrottle {
    every_files: u64,
    every_bytes: u64,
    total_files: u64,
    total_bytes: u64,
    flushed: ArchiveProgress,
    percent: i32,
}

impl ProgressThrottle {
    fn new(every_files: u64, every_bytes: u64, total_files: u64, total_bytes: u64) -> Self {
        Self {
            every_files: Ord::max(every_files, 1),
            every_bytes: Ord::max(every_bytes, 1),
            total_files,
            total_bytes,
            flushed: ArchiveProgress { files: 0, bytes: 0 },
            percent: 0,
        }
    }

    /// The percent to persist, if an update is due. Never reaches 100 before completion.
    fn observe(&mut self, done: ArchiveProgress) -> Option<i32> {
        let due = done.files.saturating_sub(self.flushed.files) >= self.every_files
            || done.bytes.saturating_sub(self.flushed.bytes) >= self.every_bytes;
        if !due {
            return None;
        }
        self.flushed = done;

        let raw = if self.total_bytes > 0 {
            done.bytes.saturating_mul(100) / self.total_bytes
        } else if self.total_files > 0 {
            done.files.saturating_mul(100) / self.total_files
        } else {
            0
        };
        self.percent = Ord::max(self.percent, Ord::min(raw, 99) as i32);
        Some(self.percent)
    }
}

enum JobFailure {
    Cancelled,
    /// Stopped by shutdown; the job is picked up again after restart.
    Interrupted,
    Error(String),
}

impl From<AppError> for JobFailure {
    fn from(e: AppError) -> Self {
        JobFailure::Error(e.to_string())
    }
}

impl From<DbErr> for JobFailure {
    fn from(e: DbErr) -> Self {
        JobFailure::Error(e.to_string())
    }
}

impl From<std::io::Error> for JobFailure {
    fn from(e: std::io::Error) -> Self {
        JobFailure::Error(format!("archive write failed: {e}"))
    }
}

pub async fn run_export_worker(state: AppState, worker: usize) {
    let poll = Duration::from_secs(Ord::max(state.config.export.poll_interval_secs, 1));
    info!(worker, "Starting export worker");

    loop {
        if state.shutdown.is_cancelled() {
            break;
        }

        match claim_next(&state).await {
            Ok(Some((job, token))) => {
                run_job(&state, job, token).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => error!(worker, error = %e, "Failed to claim export job"),
        }

        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = state.exports.woken() => {},
            _ = tokio::time::sleep(poll) => {},
        }
    }

    info!(worker, "Export worker stopped");
}

/// Claim the oldest pending job. Its cancel token is registered before the claim.
async fn claim_next(
    state: &AppState,
) -> Result<Option<(export_job::Model, CancellationToken)>, DbErr> {
    let _claiming = state.exports.claim_guard().await;

    let candidates: Vec<String> = export_job::Entity::find()
        .select_only()
        .column(export_job::Column::JobId)
        .filter(export_job::Column::Status.eq(ExportStatus::Pending))
        .order_by_asc(export_job::Column::CreatedAt)
        .limit(Some(8))
        .into_tuple()
        .all(&state.db)
        .await?;

    for job_id in candidates {
        let token = state.shutdown.child_token();
        state.exports.register(&job_id, token.clone());

        let now = Utc::now();
        let claimed = export_job::Entity::update_many()
            .col_expr(export_job::Column::Status, Expr::value(ExportStatus::Processing))
            .col_expr(export_job::Column::StartedAt, Expr::value(now))
            .col_expr(export_job::Column::UpdatedAt, Expr::value(now))
            .filter(export_job::Column::JobId.eq(&job_id))
            .filter(export_job::Column::Status.eq(ExportStatus::Pending))
            .exec(&state.db)
            .await;

        match claimed {
            Ok(r) if r.rows_affected == 1 => {
                if let Some(job) = export_job::Entity::find_by_id(job_id.clone())
                    .one(&state.db)
                    .await?
                {
                    return Ok(Some((job, token)));
                }
                state.exports.unregister(&job_id);
            }
            Ok(_) => state.exports.unregister(&job_id),
            Err(e) => {
                state.exports.unregister(&job_id);
                return Err(e);
            }
        }
    }

    Ok(None)
}

#[instrument(skip_all, fields(job_id = %job.job_id))]
async fn run_job(state: &AppState, job: export_job::Model, token: CancellationToken) {
    let spool = spool_path(&state.config.storage.export_dir(), &job.job_id, job.format);
    info!(archive = %job.archive_name, "Building export");

    let outcome = build(state, &job, &spool, &token).await;
    state.exports.unregister(&job.job_id);

    let reason = match outcome {
        Ok(()) => return,
        Err(JobFailure::Interrupted) => {
            remove_spool(&spool).await;
            info!("Export interrupted by shutdown");
            return;
        }
        Err(JobFailure::Cancelled) => "cancelled".to_string(),
        Err(JobFailure::Error(message)) => message,
    };

    remove_spool(&spool).await;
    match mark_failed(&state.db, &job.job_id, ExportStatus::Processing, &reason).await {
        Ok(_) => warn!(reason, "Export failed"),
        Err(e) => error!(error = %e, reason, "Failed to record export failure"),
    }
}

async fn build(
    state: &AppState,
    job: &export_job::Model,
    spool: &Path,
    token: &CancellationToken,
) -> Result<(), JobFailure> {
    let filter: ExportFilter = serde_json::from_value(job.filter.clone())
        .map_err(|e| JobFailure::Error(format!("stored export filter is unreadable: {e}")))?;
    let items = filter::matching_files(&state.db, job.owner_id, &filter, None).await?;

    let total_files = items.len() as u64;
    let total_bytes: u64 = items.iter().map(|i| i.size).sum();
    export_job::Entity::update_many()
        .col_expr(export_job::Column::TotalFiles, Expr::value(total_files as i64))
        .col_expr(export_job::Column::TotalSize, Expr::value(total_bytes as i64))
        .col_expr(export_job::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(export_job::Column::JobId.eq(&job.job_id))
        .filter(export_job::Column::Status.eq(ExportStatus::Processing))
        .exec(&state.db)
        .await?;
    debug!(total_files, total_bytes, "Resolved export selection");

    if let Some(dir) = spool.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let file = tokio::fs::File::create(spool).await?.into_std().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = archive::spawn_archive(
        archive::file_sink(job.format, file),
        items,
        state.blob_store.clone(),
        token.clone(),
        Some(tx),
    );

    let config = &state.config.export;
    let mut throttle = ProgressThrottle::new(
        config.progress_every_files,
        config.progress_every_bytes,
        total_files,
        total_bytes,
    );
    while let Some(done) = rx.recv().await {
        if let Some(percent) = throttle.observe(done) {
            record_progress(&state.db, &job.job_id, percent, done).await;
        }
    }

    let done = match task.await {
        Ok(Ok(done)) => done,
        Ok(Err(ArchiveError::Cancelled)) if state.shutdown.is_cancelled() => {
            return Err(JobFailure::Interrupted);
        }
        Ok(Err(ArchiveError::Cancelled)) => return Err(JobFailure::Cancelled),
        Ok(Err(e)) => return Err(JobFailure::Error(e.to_string())),
        Err(e) => return Err(JobFailure::Error(format!("export task failed: {e}"))),
    };

    let size = tokio::fs::metadata(spool).await?.len();
    let now = Utc::now();
    let expires_at = now + chrono::Duration::hours(config.ttl_hours);
    let completed = export_job::Entity::update_many()
        .col_expr(export_job::Column::Status, Expr::value(ExportStatus::Completed))
        .col_expr(export_job::Column::Progress, Expr::value(100))
        .col_expr(export_job::Column::ProcessedFiles, Expr::value(done.files as i64))
        .col_expr(export_job::Column::ProcessedSize, Expr::value(done.bytes as i64))
        .col_expr(
            export_job::Column::ArchivePath,
            Expr::value(spool.to_string_lossy().into_owned()),
        )
        .col_expr(export_job::Column::ArchiveSize, Expr::value(size as i64))
        .col_expr(export_job::Column::ExpiresAt, Expr::value(expires_at))
        .col_expr(export_job::Column::CompletedAt, Expr::value(now))
        .col_expr(export_job::Column::UpdatedAt, Expr::value(now))
        .filter(export_job::Column::JobId.eq(&job.job_id))
        .filter(export_job::Column::Status.eq(ExportStatus::Processing))
        .exec(&state.db)
        .await?;

    if completed.rows_affected == 0 {
        // Cancelled after the last entry was written.
        remove_spool(spool).await;
        return Ok(());
    }

    info!(files = done.files, bytes = size, %expires_at, "Export completed");
    Ok(())
}

async fn record_progress(db: &DatabaseConnection, job_id: &str, percent: i32, done: ArchiveProgress) {
    let result = export_job::Entity::update_many()
        .col_expr(export_job::Column::Progress, Expr::value(percent))
        .col_expr(export_job::Column::ProcessedFiles, Expr::value(done.files as i64))
        .col_expr(export_job::Column::ProcessedSize, Expr::value(done.bytes as i64))
        .col_expr(export_job::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(export_job::Column::JobId.eq(job_id))
        .filter(export_job::Column::Status.eq(ExportStatus::Processing))
        .filter(export_job::Column::Progress.lte(percent))
        .exec(db)
        .await;
    if let Err(e) = result {
        warn!(job_id, error = %e, "Failed to record export progress");
    }
}

async fn remove_spool(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove export spool");
    }
}

/// Put jobs left `processing` by a previous run back in the queue.
pub async fn reset_interrupted(db: &DatabaseConnection, config: &AppConfig) -> Result<u64, DbErr> {
    let stuck = export_job::Entity::find()
        .filter(export_job::Column::Status.eq(ExportStatus::Processing))
        .all(db)
        .await?;
    if stuck.is_empty() {
        return Ok(0);
    }

    let export_dir = config.storage.export_dir();
    for job in &stuck {
        remove_spool(&spool_path(&export_dir, &job.job_id, job.format)).await;
    }

    let result = export_job::Entity::update_many()
        .col_expr(export_job::Column::Status, Expr::value(ExportStatus::Pending))
        .col_expr(export_job::Column::Progress, Expr::value(0))
        .col_expr(export_job::Column::ProcessedFiles, Expr::value(0i64))
        .col_expr(export_job::Column::ProcessedSize, Expr::value(0i64))
        .col_expr(
            export_job::Column::StartedAt,
            Expr::value(Option::<DateTime<Utc>>::None),
        )
        .col_expr(export_job::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(export_job::Column::Status.eq(ExportStatus::Processing))
        .exec(db)
        .await?;

    info!(count = result.rows_affected, "Requeued interrupted export jobs");
    Ok(result.rows_affected)
}

/// Expire completed jobs whose download window has closed and delete their archives.
pub async fn sweep_expired(state: &AppState) -> Result<u64, AppError> {
    let now = Utc::now();
    let expired = export_job::Entity::find()
        .filter(export_job::Column::Status.eq(ExportStatus::Completed))
        .filter(export_job::Column::ExpiresAt.lte(now))
        .all(&state.db)
        .await?;

    let mut count = 0;
    for job in expired {
        let result = export_job::Entity::update_many()
            .col_expr(export_job::Column::Status, Expr::value(ExportStatus::Expired))
            .col_expr(
                export_job::Column::ArchivePath,
                Expr::value(Option::<String>::None),
            )
            .col_expr(export_job::Column::UpdatedAt, Expr::value(now))
            .filter(export_job::Column::JobId.eq(&job.job_id))
            .filter(export_job::Column::Status.eq(ExportStatus::Completed))
            .exec(&state.db)
            .await?;
        if result.rows_affected == 0 {
            continue;
        }
        if let Some(path) = job.archive_path.as_deref() {
            remove_spool(Path::new(path)).await;
        }
        debug!(job_id = %job.job_id, "Expired export archive");
        count += 1;
    }
    Ok(count)
}

pub async fn run_export_sweeper(state: AppState) {
    let every = Duration::from_secs(Ord::max(state.config.export.sweep_interval_secs, 1));
    info!(interval_secs = every.as_secs(), "Starting export sweeper");

    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = interval.tick() => {},
        }

        match sweep_expired(&state).await {
            Ok(0) => {}
            Ok(count) => info!(count, "Expired export archives"),
            Err(e) => error!(error = %e, "Export sweep failed"),
        }
    }

    info!("Export sweeper stopped");
}
