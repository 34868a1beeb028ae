pub mod chunks;
pub mod config;
pub mod database;
pub mod entity;
pub mod error;
pub mod export;
pub mod extractors;
pub mod gc;
pub mod handlers;
pub mod ingest;
pub mod models;
pub mod namespace;
pub mod routes;
pub mod seed;
pub mod state;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::HeaderValue;
use common::storage::filesystem::FilesystemBlobStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};
use utoipa::openapi::security::{ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;
use utoipa_scalar::{Scalar, Servable as ScalarServable};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::{AppConfig, CorsConfig};
use crate::extractors::auth::GATEWAY_EMAIL_HEADER;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "MemoryArk API",
        version = "0.1.0",
        description = "Media archive with content-addressed storage, a shared folder tree and \
            archive export"
    ),
    tags(
        (name = "Health", description = "Liveness"),
        (name = "Auth", description = "Gateway identity, registration and bearer tokens"),
        (name = "Files", description = "Upload, browse, download and share files"),
        (name = "Chunked Upload", description = "Resumable uploads in independent chunks"),
        (name = "Folders", description = "Folder creation, moves and renames"),
        (name = "Trash", description = "Soft-deleted entries"),
        (name = "Storage", description = "Usage and deduplication statistics"),
        (name = "Categories", description = "Flat tags for files"),
        (name = "Export", description = "Archive exports, queued or streamed"),
        (name = "Share", description = "Public share-link downloads"),
        (name = "Admin", description = "User approval and maintenance"),
    ),
    modifiers(&SecurityAddon),
)]
struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_default();
        components.add_security_scheme(
            "jwt",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
        components.add_security_scheme(
            "gateway",
            SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(GATEWAY_EMAIL_HEADER))),
        );
    }
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allow_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let layer = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(config.max_age));
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

/// Build the application router.
pub fn build_router(state: AppState) -> axum::Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .routes(routes!(handlers::health::health))
        .nest("/api", routes::api_routes(&state.config))
        .split_for_parts();

    let cors = cors_layer(&state.config.server.cors);

    router
        .with_state(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", api.clone()))
        .merge(Scalar::with_url("/scalar", api))
        .layer(CatchPanicLayer::custom(error::panic_response))
        .layer(cors)
}

/// Open storage and the database, seed them and recover state left by a previous run.
pub async fn init_state(config: AppConfig, shutdown: CancellationToken) -> anyhow::Result<AppState> {
    for dir in [config.storage.chunk_dir(), config.storage.export_dir()] {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("cannot create {}", dir.display()))?;
    }
    let blob_store =
        FilesystemBlobStore::new(config.storage.blob_dir(), config.storage.max_file_size)
            .await
            .context("cannot open blob store")?;

    let db = database::init_db(&config.database)
        .await
        .context("cannot open database")?;
    seed::ensure_indexes(&db).await?;
    seed::seed_root_admin(&db, &config.admin).await?;
    export::jobs::reset_interrupted(&db, &config).await?;

    Ok(AppState::new(db, Arc::new(blob_store), config, shutdown))
}

/// Start the GC worker, the sweepers and the export worker pool.
///
/// Every task exits once `state.shutdown` is cancelled.
pub fn spawn_workers(state: &AppState) -> Vec<JoinHandle<()>> {
    let mut handles = vec![
        tokio::spawn(gc::run_gc_worker(state.clone())),
        tokio::spawn(chunks::run_session_sweeper(state.clone())),
        tokio::spawn(export::jobs::run_export_sweeper(state.clone())),
    ];
    let workers = state.config.export.workers.max(1);
    for worker in 0..workers {
        handles.push(tokio::spawn(export::jobs::run_export_worker(
            state.clone(),
            worker,
        )));
    }
    info!(export_workers = workers, "Background workers started");
    handles
}
