#![forbid(unsafe_code)]

mod engine;
mod metrics;
mod peer;
mod room;
mod session;
mod signaling;

use anyhow::Result;
use engine::config::EngineConfig;
use engine::memory::MemoryEngine;
use engine::pool::WorkerPool;
use metrics::ServerMetrics;
use room::registry::RoomRegistry;
use signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "greenroom=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Greenroom - Starting server");

    let mut config = EngineConfig::from_env();

    // Announced IP goes into ICE candidates; required when behind NAT
    if let Ok(ip) = std::env::var("ANNOUNCE_IP") {
        info!("Using ANNOUNCE_IP={}", ip);
        let addr = ip
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid ANNOUNCE_IP: {ip}"))?;
        config.listen.announced_ip = Some(addr);
    } else {
        info!("No ANNOUNCE_IP set, announcing {}", config.listen.listen_ip);
    }

    let metrics = ServerMetrics::new();
    let engine = MemoryEngine::new();
    let pool = Arc::new(WorkerPool::start(&engine, config.num_workers).await?);

    let registry = Arc::new(RoomRegistry::new(pool, config, metrics.clone()));

    info!("Room registry and worker pool initialized");

    // Create and start signaling server
    let signaling_server = SignalingServer::new(registry.clone(), metrics);
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);

    info!("Starting signaling server on port {}", port);

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            registry.shutdown().await;
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
