//! bwlimit gateway binary.
//!
//! Usage: `bwlimit-gateway [config.yaml]` (default `bwlimit.yaml`).
//! Log filter comes from `RUST_LOG`, else `gateway.log_filter`.

use std::net::SocketAddr;

use tracing_subscriber::{fmt, EnvFilter};

use bwlimit_core::error::{BwError, Result};
use bwlimit_gateway::{app_state::AppState, config, router};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("bwlimit-gateway: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "bwlimit.yaml".into());
    let cfg = config::load_from_file(&path)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.gateway.log_filter))
        .map_err(|e| BwError::BadConfig(format!("gateway.log_filter: {e}")))?;
    fmt().with_env_filter(filter).init();

    let listen: SocketAddr = cfg
        .gateway
        .listen
        .parse()
        .map_err(|e| BwError::BadConfig(format!("gateway.listen must be a valid SocketAddr: {e}")))?;

    let state = AppState::new(cfg)?;
    let app = router::build_router(state.clone());

    tracing::info!(%listen, config = %path, "bwlimit-gateway starting");
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| BwError::Internal(format!("bind {listen} failed: {e}")))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .map_err(|e| BwError::Internal(format!("server failed: {e}")))
}

async fn shutdown_signal(state: AppState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested, draining");
    state.begin_shutdown();
}
