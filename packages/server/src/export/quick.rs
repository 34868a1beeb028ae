//! Predefined exports streamed straight onto the response.

use std::io;
use std::str::FromStr;

use axum::body::{Body, Bytes};
use axum::http::header;
use axum::response::Response;
use chrono::{DateTime, Datelike, Local};
use common::TypeClass;
use sea_orm::EntityTrait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::archive::{self, ArchiveError, ChannelWriter};
use super::filter::{self, ExportFilter, ExportItem};
use super::jobs::archive_name;
use crate::entity::category;
use crate::entity::export_job::ArchiveFormat;
use crate::error::AppError;
use crate::state::AppState;
use crate::utils::filename::content_disposition;

/// Chunks buffered between the archive writer and the response body.
const STREAM_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickExport {
    /// Files created since the first day of the current month.
    ThisMonth,
    /// The most recent files of the configured sabbath category.
    LastSabbath,
    AllPhotos,
}

impl FromStr for QuickExport {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "this-month" => Ok(QuickExport::ThisMonth),
            "last-sabbath" => Ok(QuickExport::LastSabbath),
            "all-photos" => Ok(QuickExport::AllPhotos),
            other => Err(AppError::Validation(format!(
                "Unknown export type '{other}', expected this-month, last-sabbath or all-photos"
            ))),
        }
    }
}

impl QuickExport {
    pub fn label(&self, now: DateTime<Local>) -> String {
        match self {
            QuickExport::ThisMonth => format!("this-month_{}", now.format("%Y-%m")),
            QuickExport::LastSabbath => "last-sabbath".into(),
            QuickExport::AllPhotos => "all-photos".into(),
        }
    }
}

/// The files a quick export covers for `owner_id`.
pub async fn select(
    state: &AppState,
    owner_id: i32,
    kind: QuickExport,
) -> Result<Vec<ExportItem>, AppError> {
    match kind {
        QuickExport::ThisMonth => {
            let today = Local::now().date_naive();
            let filter = ExportFilter {
                date_from: today.with_day(1),
                ..Default::default()
            };
            filter::matching_files(&state.db, owner_id, &filter, None).await
        }
        QuickExport::LastSabbath => {
            let category_id = state.config.export.sabbath_category_id.ok_or_else(|| {
                AppError::Validation("No sabbath category is configured".into())
            })?;
            category::Entity::find_by_id(category_id)
                .one(&state.db)
                .await?
                .ok_or(AppError::CategoryNotFound)?;
            let filter = ExportFilter {
                category_ids: vec![category_id],
                ..Default::default()
            };
            filter::matching_files(
                &state.db,
                owner_id,
                &filter,
                Some(state.config.export.recent_limit),
            )
            .await
        }
        QuickExport::AllPhotos => {
            let filter = ExportFilter {
                file_types: vec![TypeClass::Image],
                ..Default::default()
            };
            filter::matching_files(&state.db, owner_id, &filter, None).await
        }
    }
}

/// Stream a quick export as an attachment.
///
/// The selection is resolved before the first byte is sent, so an empty or invalid
/// request still gets a proper error response. A client that disconnects stops the
/// writer at its next write.
pub async fn stream(
    state: &AppState,
    owner_id: i32,
    kind: QuickExport,
    format: ArchiveFormat,
) -> Result<Response, AppError> {
    let items = select(state, owner_id, kind).await?;
    let now = Local::now();
    let name = archive_name(&kind.label(now), format, now);
    info!(owner_id, ?kind, files = items.len(), archive = %name, "Streaming quick export");

    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(STREAM_BUFFER);
    let task = archive::spawn_archive(
        archive::stream_sink(format, ChannelWriter::new(tx.clone())),
        items,
        state.blob_store.clone(),
        state.shutdown.child_token(),
        None,
    );

    // Holds a sender until the archive task ends, so a failure can still be
    // surfaced as a body error instead of a silently truncated archive.
    tokio::spawn(async move {
        match task.await {
            Ok(Ok(done)) => debug!(files = done.files, bytes = done.bytes, "Quick export finished"),
            Ok(Err(ArchiveError::Io(e))) if e.kind() == io::ErrorKind::BrokenPipe => {
                info!("Quick export aborted by client")
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Quick export failed");
                let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
            }
            Err(e) => error!(error = %e, "Quick export task failed"),
        }
    });

    let body = Body::from_stream(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    }));

    Response::builder()
        .header(header::CONTENT_TYPE, format.content_type())
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition("attachment", &name),
        )
        .body(body)
        .map_err(|e| AppError::Internal(format!("failed to build export response: {e}")))
}
