#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use sendpath::media::{self, MediaConfig};
use sendpath::metrics::ServerMetrics;
use sendpath::session::SessionManager;
use sendpath::signaling::SignalingServer;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sendpath=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("sendpath - Starting server");

    let media_config = MediaConfig::from_env().context("Invalid media configuration")?;
    if let Some(ip) = &media_config.transport_config.announced_address {
        info!("Announcing {} in ICE candidates", ip);
    } else {
        info!("No ANNOUNCE_IP set, candidates carry {}", media_config.transport_config.listen_ip);
    }

    // Without an engine there is nothing to serve
    let engine = media::start_engine(&media_config)
        .await
        .context("Failed to start media engine")?;
    info!("Media engine initialized");

    let sessions = Arc::new(SessionManager::new(engine, media_config.transport_config.clone()));
    let metrics = ServerMetrics::new();
    let signaling_server = SignalingServer::new(sessions.clone(), metrics);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down...");
    };

    let served = signaling_server
        .serve(port, shutdown)
        .await
        .context("Signaling server failed");

    sessions.shutdown();
    served?;
    info!("Server shutdown complete");
    Ok(())
}
