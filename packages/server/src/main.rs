use std::net::SocketAddr;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use memoryark::config::AppConfig;

fn init_tracing(mode: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,sea_orm=warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if mode == "release" {
        builder.compact().with_ansi(false).init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C");
    }

    info!("Shutting down");
    token.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("invalid configuration")?;
    init_tracing(&config.server.mode);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server.host / server.port")?;

    let shutdown = CancellationToken::new();
    let state = memoryark::init_state(config, shutdown.clone()).await?;
    let workers = memoryark::spawn_workers(&state);
    let app = memoryark::build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server running at http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // The server may also stop on its own; make sure the workers follow.
    shutdown.cancel();
    for handle in workers {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    info!("Stopped");
    Ok(())
}
