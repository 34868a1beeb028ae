//! Resumable uploads assembled from chunks sent in any order.
//!
//! Chunk bytes are written straight into a sparse spool file at their offset, so
//! different chunks of one session can be written in parallel. Only the bookkeeping
//! (the received set on the session row) is serialized, per session, by an
//! in-process mutex.

mod layout;

pub use layout::ChunkLayout;

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::storage::{ContentHash, IngestLimits};
use dashmap::DashMap;
use sea_orm::*;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entity::category;
use crate::entity::upload_session::{self, SessionState};
use crate::error::AppError;
use crate::extractors::auth::AuthUser;
use crate::ingest::{self, IngestOutcome, IngestRequest, UploadTarget, check_upload_name};
use crate::models::chunks::{ChunkInitRequest, ChunkReceipt, SessionStatus};
use crate::namespace::{self, path};
use crate::state::AppState;

const SPOOL_FILE: &str = "data";

/// Per-session guards. Entries are dropped once a session is closed.
#[derive(Default)]
pub struct SessionLocks {
    sessions: DashMap<String, Arc<Mutex<SessionGuard>>>,
}

#[derive(Debug, Default)]
struct SessionGuard {
    /// Indices whose bytes are being written right now.
    writing: HashSet<i32>,
}

impl SessionLocks {
    fn guard(&self, session_id: &str) -> Arc<Mutex<SessionGuard>> {
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    fn forget(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

/// One entry of the received set.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReceivedChunk {
    index: i32,
    offset: u64,
    length: u64,
    sha256: String,
}

fn received(session: &upload_session::Model) -> Result<Vec<ReceivedChunk>, AppError> {
    serde_json::from_value(session.received_chunks.clone()).map_err(|e| {
        AppError::Internal(format!(
            "unreadable chunk record for session {}: {e}",
            session.id
        ))
    })
}

fn layout_of(session: &upload_session::Model) -> ChunkLayout {
    ChunkLayout {
        total_size: u64::try_from(session.total_size).unwrap_or_default(),
        chunk_size: u64::try_from(session.chunk_size).unwrap_or_default(),
        chunk_count: u32::try_from(session.chunk_count).unwrap_or_default(),
    }
}

fn spool_dir(state: &AppState, session_id: &str) -> PathBuf {
    state.config.storage.chunk_dir().join(session_id)
}

fn spool_file(state: &AppState, session_id: &str) -> PathBuf {
    spool_dir(state, session_id).join(SPOOL_FILE)
}

fn spool_error(e: std::io::Error) -> AppError {
    AppError::Storage(format!("upload spool: {e}"))
}

async fn remove_spool(state: &AppState, session_id: &str) {
    let dir = spool_dir(state, session_id);
    if let Err(e) = tokio::fs::remove_dir_all(&dir).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(session_id, error = %e, "Failed to remove upload spool");
    }
}

fn ensure_open(session: &upload_session::Model) -> Result<(), AppError> {
    match session.state {
        SessionState::Open => Ok(()),
        SessionState::Finalized => Err(AppError::UploadSessionClosed(
            "Upload session has already been finalized".into(),
        )),
        SessionState::Aborted => Err(AppError::UploadSessionClosed(
            "Upload session was aborted".into(),
        )),
    }
}

async fn find_session<C: ConnectionTrait>(
    db: &C,
    session_id: &str,
) -> Result<upload_session::Model, AppError> {
    upload_session::Entity::find_by_id(session_id)
        .one(db)
        .await?
        .ok_or(AppError::UploadSessionNotFound)
}

/// A session visible to `actor`. Other users' sessions look missing.
async fn load_session(
    state: &AppState,
    actor: &AuthUser,
    session_id: &str,
) -> Result<upload_session::Model, AppError> {
    // Session ids double as spool directory names.
    Uuid::parse_str(session_id).map_err(|_| AppError::UploadSessionNotFound)?;
    let session = find_session(&state.db, session_id).await?;
    if session.owner_id != actor.user_id && !actor.is_admin() {
        return Err(AppError::UploadSessionNotFound);
    }
    Ok(session)
}

/// Status view of a session row.
pub fn session_status(session: &upload_session::Model) -> Result<SessionStatus, AppError> {
    let chunks = received(session)?;
    let have: HashSet<i32> = chunks.iter().map(|c| c.index).collect();
    let progress = if session.total_size > 0 {
        (session.bytes_received as f64 / session.total_size as f64 * 100.0).min(100.0)
    } else if have.is_empty() {
        0.0
    } else {
        100.0
    };

    Ok(SessionStatus {
        session_id: session.id.clone(),
        file_name: session.file_name.clone(),
        state: session.state,
        total_size: session.total_size,
        chunk_size: session.chunk_size,
        chunk_count: session.chunk_count,
        received_indices: chunks.iter().map(|c| c.index).collect(),
        missing_indices: (0..session.chunk_count)
            .filter(|i| !have.contains(i))
            .collect(),
        bytes_received: session.bytes_received,
        progress,
        expected_hash: session.expected_hash.clone(),
        file_id: session.file_id,
        updated_at: session.updated_at,
    })
}

/// Open a session and allocate its spool.
pub async fn init(
    state: &AppState,
    actor: &AuthUser,
    req: ChunkInitRequest,
) -> Result<upload_session::Model, AppError> {
    let file_name = check_upload_name(&state.config.storage, &req.file_name)?;

    let limit = state.config.storage.max_file_size;
    if req.total_size > limit {
        return Err(AppError::FileSizeExceeded { limit });
    }
    let layout = ChunkLayout::new(req.total_size, req.chunk_count, req.chunk_size)?;

    let expected_hash = match req.expected_hash.as_deref().map(str::trim) {
        Some(hex) if !hex.is_empty() => Some(
            ContentHash::from_hex(hex)
                .map_err(|_| {
                    AppError::Validation("expected_hash must be a SHA-256 hex digest".into())
                })?
                .to_hex(),
        ),
        _ => None,
    };

    namespace::parent_path(&state.db, req.parent_id).await?;
    if let Some(category_id) = req.category_id {
        category::Entity::find_by_id(category_id)
            .one(&state.db)
            .await?
            .ok_or(AppError::CategoryNotFound)?;
    }
    if let Some(rel) = req.relative_path.as_deref() {
        path::relative_folders(rel)?;
    }

    let id = Uuid::new_v4().to_string();
    let dir = spool_dir(state, &id);
    tokio::fs::create_dir_all(&dir).await.map_err(spool_error)?;
    let spool = tokio::fs::File::create(dir.join(SPOOL_FILE))
        .await
        .map_err(spool_error)?;
    spool.set_len(layout.total_size).await.map_err(spool_error)?;

    let now = Utc::now();
    let model = upload_session::ActiveModel {
        id: Set(id.clone()),
        owner_id: Set(actor.user_id),
        file_name: Set(file_name.clone()),
        parent_id: Set(req.parent_id),
        category_id: Set(req.category_id),
        relative_path: Set(req.relative_path),
        description: Set(req.description),
        total_size: Set(i64::try_from(layout.total_size).unwrap_or(i64::MAX)),
        chunk_size: Set(i64::try_from(layout.chunk_size).unwrap_or(i64::MAX)),
        chunk_count: Set(i32::try_from(layout.chunk_count).unwrap_or(i32::MAX)),
        expected_hash: Set(expected_hash),
        received_chunks: Set(serde_json::json!([])),
        bytes_received: Set(0),
        state: Set(SessionState::Open),
        file_id: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    };

    let session = match model.insert(&state.db).await {
        Ok(session) => session,
        Err(e) => {
            remove_spool(state, &id).await;
            return Err(e.into());
        }
    };

    info!(
        session_id = %id,
        file_name = %file_name,
        total_size = layout.total_size,
        chunk_count = layout.chunk_count,
        "Opened upload session"
    );
    Ok(session)
}

async fn write_at(path: &std::path::Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.sync_data().await
}

/// Store one chunk. Replaying a chunk with identical bytes is a no-op.
pub async fn put_chunk(
    state: &AppState,
    actor: &AuthUser,
    session_id: &str,
    index: i32,
    data: &[u8],
    chunk_hash: Option<&str>,
) -> Result<ChunkReceipt, AppError> {
    let session = load_session(state, actor, session_id).await?;
    ensure_open(&session)?;

    let layout = layout_of(&session);
    let position = u32::try_from(index)
        .map_err(|_| AppError::Validation("Chunk index must not be negative".into()))?;
    let expected = layout.expected_length(position)?;
    let offset = layout.offset(position)?;
    if data.len() as u64 != expected {
        return Err(AppError::Validation(format!(
            "Chunk {index} must be {expected} bytes, got {}",
            data.len()
        )));
    }

    let digest = ContentHash::compute(data).to_hex();
    if let Some(claimed) = chunk_hash.map(str::trim).filter(|h| !h.is_empty())
        && !claimed.eq_ignore_ascii_case(&digest)
    {
        return Err(AppError::DigestMismatch {
            expected: claimed.to_ascii_lowercase(),
            actual: digest,
        });
    }

    let guard = state.upload_sessions.guard(session_id);
    {
        let mut inflight = guard.lock().await;
        let current = find_session(&state.db, session_id).await?;
        ensure_open(&current)?;

        if let Some(existing) = received(&current)?.into_iter().find(|c| c.index == index) {
            if existing.sha256 == digest {
                return Ok(ChunkReceipt {
                    index,
                    duplicate: true,
                    status: session_status(&current)?,
                });
            }
            return Err(AppError::ChunkConflict(format!(
                "Chunk {index} was already received with different content"
            )));
        }
        if !inflight.writing.insert(index) {
            return Err(AppError::ChunkConflict(format!(
                "Chunk {index} is already being written"
            )));
        }
    }

    let written = write_at(&spool_file(state, session_id), offset, data).await;

    let mut inflight = guard.lock().await;
    inflight.writing.remove(&index);
    written.map_err(spool_error)?;

    let current = find_session(&state.db, session_id).await?;
    ensure_open(&current)?;

    let mut chunks = received(&current)?;
    chunks.push(ReceivedChunk {
        index,
        offset,
        length: expected,
        sha256: digest,
    });
    chunks.sort_by_key(|c| c.index);
    let bytes_received: u64 = chunks.iter().map(|c| c.length).sum();

    let mut active: upload_session::ActiveModel = current.into();
    active.received_chunks = Set(serde_json::to_value(&chunks)
        .map_err(|e| AppError::Internal(format!("encode chunk record: {e}")))?);
    active.bytes_received = Set(i64::try_from(bytes_received).unwrap_or(i64::MAX));
    active.updated_at = Set(Utc::now());
    let updated = active.update(&state.db).await?;
    drop(inflight);

    debug!(session_id, index, bytes_received, "Stored chunk");

    Ok(ChunkReceipt {
        index,
        duplicate: false,
        status: session_status(&updated)?,
    })
}

pub async fn status(
    state: &AppState,
    actor: &AuthUser,
    session_id: &str,
) -> Result<SessionStatus, AppError> {
    let session = load_session(state, actor, session_id).await?;
    session_status(&session)
}

/// Hand the assembled spool to the ingestor and close the session.
///
/// A digest mismatch clears the received set so the client can re-send, unless
/// `upload.abort_on_integrity_failure` is set.
pub async fn finalize(
    state: &AppState,
    actor: &AuthUser,
    session_id: &str,
) -> Result<IngestOutcome, AppError> {
    load_session(state, actor, session_id).await?;

    let guard = state.upload_sessions.guard(session_id);
    let inflight = guard.lock().await;
    let session = find_session(&state.db, session_id).await?;
    ensure_open(&session)?;

    let chunks = received(&session)?;
    let have: HashSet<i32> = chunks.iter().map(|c| c.index).collect();
    let missing: Vec<i32> = (0..session.chunk_count)
        .filter(|i| !have.contains(i))
        .collect();
    if !missing.is_empty() || !inflight.writing.is_empty() {
        return Err(AppError::IncompleteUpload { missing });
    }

    let total = u64::try_from(session.total_size).unwrap_or_default();
    let expected_hash = session
        .expected_hash
        .as_deref()
        .map(ContentHash::from_hex)
        .transpose()?;

    let spool = tokio::fs::File::open(spool_file(state, session_id))
        .await
        .map_err(spool_error)?;
    let request = IngestRequest {
        file_name: session.file_name.clone(),
        owner_id: session.owner_id,
        target: UploadTarget {
            parent_id: session.parent_id,
            relative_path: session.relative_path.clone(),
            category_id: session.category_id,
            description: session.description.clone(),
            ..Default::default()
        },
    };
    let limits = IngestLimits {
        expected_length: Some(total),
        expected_hash,
    };

    match ingest::ingest_reader(state, Box::new(spool), request, limits).await {
        Ok(outcome) => {
            let mut active: upload_session::ActiveModel = session.into();
            active.state = Set(SessionState::Finalized);
            active.file_id = Set(Some(outcome.entry.id));
            active.updated_at = Set(Utc::now());
            active.update(&state.db).await?;
            drop(inflight);

            state.upload_sessions.forget(session_id);
            remove_spool(state, session_id).await;

            info!(
                session_id,
                file_id = outcome.entry.id,
                deduplicated = outcome.deduplicated,
                "Finalized upload session"
            );
            Ok(outcome)
        }
        Err(err @ AppError::DigestMismatch { .. }) => {
            let abort = state.config.upload.abort_on_integrity_failure;
            warn!(session_id, error = %err, abort, "Assembled upload failed its integrity check");

            let mut active: upload_session::ActiveModel = session.into();
            if abort {
                active.state = Set(SessionState::Aborted);
            } else {
                active.received_chunks = Set(serde_json::json!([]));
                active.bytes_received = Set(0);
            }
            active.updated_at = Set(Utc::now());
            active.update(&state.db).await?;
            drop(inflight);

            if abort {
                state.upload_sessions.forget(session_id);
                remove_spool(state, session_id).await;
            }
            Err(err)
        }
        Err(err) => Err(err),
    }
}

/// Discard an open session and its spool.
pub async fn abort(
    state: &AppState,
    actor: &AuthUser,
    session_id: &str,
) -> Result<SessionStatus, AppError> {
    load_session(state, actor, session_id).await?;

    let guard = state.upload_sessions.guard(session_id);
    let inflight = guard.lock().await;
    let session = find_session(&state.db, session_id).await?;
    ensure_open(&session)?;

    let mut active: upload_session::ActiveModel = session.into();
    active.state = Set(SessionState::Aborted);
    active.updated_at = Set(Utc::now());
    let updated = active.update(&state.db).await?;
    drop(inflight);

    state.upload_sessions.forget(session_id);
    remove_spool(state, session_id).await;

    info!(session_id, "Aborted upload session");
    session_status(&updated)
}

/// Abort open sessions idle longer than the configured TTL.
pub async fn sweep_stale(state: &AppState) -> Result<u64, AppError> {
    let ttl = i64::try_from(state.config.upload.session_ttl_secs).unwrap_or(i64::MAX);
    let cutoff = Utc::now() - chrono::Duration::seconds(ttl);

    let stale: Vec<String> = upload_session::Entity::find()
        .select_only()
        .column(upload_session::Column::Id)
        .filter(upload_session::Column::State.eq(SessionState::Open))
        .filter(upload_session::Column::UpdatedAt.lt(cutoff))
        .into_tuple()
        .all(&state.db)
        .await?;

    let mut aborted = 0;
    for session_id in stale {
        let guard = state.upload_sessions.guard(&session_id);
        let inflight = guard.lock().await;

        let Some(session) = upload_session::Entity::find_by_id(&session_id)
            .one(&state.db)
            .await?
        else {
            continue;
        };
        if session.state != SessionState::Open
            || session.updated_at >= cutoff
            || !inflight.writing.is_empty()
        {
            continue;
        }

        let mut active: upload_session::ActiveModel = session.into();
        active.state = Set(SessionState::Aborted);
        active.updated_at = Set(Utc::now());
        active.update(&state.db).await?;
        drop(inflight);

        state.upload_sessions.forget(&session_id);
        remove_spool(state, &session_id).await;
        aborted += 1;
    }

    Ok(aborted)
}

/// Background loop around [`sweep_stale`].
pub async fn run_session_sweeper(state: AppState) {
    let every = Duration::from_secs(Ord::max(state.config.upload.sweep_interval_secs, 1));

    info!(
        ttl_secs = state.config.upload.session_ttl_secs,
        interval_secs = every.as_secs(),
        "Starting upload session sweeper"
    );

    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = interval.tick() => {},
        }

        match sweep_stale(&state).await {
            Ok(0) => {}
            Ok(count) => info!(count, "Aborted idle upload sessions"),
            Err(e) => error!(error = %e, "Upload session sweep failed"),
        }
    }

    info!("Upload session sweeper stopped");
}
