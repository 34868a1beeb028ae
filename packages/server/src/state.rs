use std::sync::Arc;

use common::storage::BlobStore;
use sea_orm::DatabaseConnection;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::chunks::SessionLocks;
use crate::config::AppConfig;
use crate::export::ExportControl;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub blob_store: Arc<dyn BlobStore>,
    pub config: Arc<AppConfig>,
    /// Per-session guards for the chunk assembler.
    pub upload_sessions: Arc<SessionLocks>,
    /// Wakes the GC worker after a permanent delete.
    pub gc_trigger: Arc<Notify>,
    pub exports: Arc<ExportControl>,
    /// Cancelled on process shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        db: DatabaseConnection,
        blob_store: Arc<dyn BlobStore>,
        config: AppConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            db,
            blob_store,
            config: Arc::new(config),
            upload_sessions: Arc::new(SessionLocks::default()),
            gc_trigger: Arc::new(Notify::new()),
            exports: Arc::new(ExportControl::default()),
            shutdown,
        }
    }
}
