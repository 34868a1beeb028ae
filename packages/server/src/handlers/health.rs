use axum::Json;
use axum::extract::State;
use serde::Serialize;
use tracing::warn;

use crate::models::shared::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    #[schema(example = "memoryark")]
    pub service: &'static str,
    #[schema(example = "0.1.0")]
    pub version: &'static str,
    /// `ok` or `degraded`.
    pub status: &'static str,
    pub database: bool,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "health",
    summary = "Service health",
    description = "Reports the service name, version and whether the metadata store answers.",
    responses(
        (status = 200, description = "Service is up", body = ApiResponse<HealthResponse>),
    ),
)]
pub async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let database = match state.db.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Database ping failed");
            false
        }
    };

    Json(ApiResponse::ok(HealthResponse {
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        status: if database { "ok" } else { "degraded" },
        database,
    }))
}
