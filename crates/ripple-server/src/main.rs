//! # ripple
//!
//! Pusher-protocol realtime WebSocket server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with ./ripple.toml (or /etc/ripple/ripple.toml)
//! ripple-server
//!
//! # Run with a specific config
//! RIPPLE_CONFIG=/path/to/ripple.toml ripple-server
//! ```

use anyhow::{Context, Result};
use ripple_server::handlers::{build_router, AppState};
use ripple_server::Config;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ripple=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::var("RIPPLE_CONFIG") {
        Ok(path) => Config::from_file(path)?,
        Err(_) => Config::load()?,
    };

    tracing::info!(app_id = %config.app_id, "starting ripple on {}:{}", config.host, config.port);

    ripple_core::metrics::describe();
    if config.metrics.enabled {
        install_metrics_exporter(config.metrics.port)?;
    }

    let root = CancellationToken::new();
    let (state, hub_handle) = AppState::new(config.clone(), &root)?;
    let app = build_router(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(
        "websocket endpoint: ws://{}{}",
        addr,
        config.websocket_path
    );

    let shutdown = root.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    // The hub drains registered connections before returning.
    root.cancel();
    let _ = hub_handle.await;
    tracing::info!("shutdown complete");

    Ok(())
}

fn install_metrics_exporter(port: u16) -> Result<()> {
    let addr: std::net::SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .context("invalid metrics port")?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install metrics exporter")?;
    tracing::info!(%addr, "metrics exporter listening");
    Ok(())
}
