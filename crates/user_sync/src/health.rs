use anyhow::Context;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const HEALTH_BODY: &str = "it's alive";

/// Liveness only; reports nothing about broker or store state
pub fn router() -> Router {
    Router::new().route("/healthcheck", get(healthcheck))
}

async fn healthcheck() -> &'static str {
    HEALTH_BODY
}

/// Serve the health router on `addr` until `ctx` is cancelled
pub async fn serve(addr: String, ctx: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind health endpoint on {addr}"))?;
    info!(addr = %addr, "health endpoint listening");

    axum::serve(listener, router())
        .with_graceful_shutdown(async move { ctx.cancelled().await })
        .await
        .context("health server crashed")?;

    info!("health endpoint stopped");
    Ok(())
}
