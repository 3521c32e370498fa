use std::net::SocketAddr;

use anyhow::Context;
use math_expression_extractor::{app, logging, Config};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    logging::init_logging();

    let config = Config::from_env().context("failed to load configuration")?;
    let router = app(&config).context("failed to build Gemini client")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(
        model = %config.model,
        upload_dir = %config.upload_dir.display(),
        "Server running at http://localhost:{}",
        config.port
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
