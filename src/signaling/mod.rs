#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod protocol;

use crate::engine::types::SessionId;
use crate::metrics::ServerMetrics;
use crate::peer::PeerHandle;
use crate::room::registry::RoomRegistry;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use protocol::ServerEvent;
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Directory of live connections, used for server-wide announcements
/// such as new rooms appearing.
#[derive(Clone, Default)]
pub struct PeerDirectory {
    peers: Arc<StdRwLock<HashMap<SessionId, Arc<dyn PeerHandle>>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: SessionId, peer: Arc<dyn PeerHandle>) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session, peer);
    }

    pub fn remove(&self, session: SessionId) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session);
    }

    /// Serialize once, then fan out to every connection.
    pub fn broadcast(&self, event: &ServerEvent) {
        let json = match serde_json::to_string(event) {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!("Failed to serialize broadcast: {}", e);
                return;
            }
        };
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        for peer in peers.values() {
            peer.send_frame(json.clone());
        }
    }
}

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    registry: Arc<RoomRegistry>,
    peers: PeerDirectory,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
}

impl SignalingServer {
    /// Creates a new signaling server
    pub fn new(registry: Arc<RoomRegistry>, metrics: ServerMetrics) -> Self {
        let mut max_connections: usize = std::env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default 10000");
            max_connections = 10_000;
        }
        info!("Max connections: {}", max_connections);

        Self {
            registry,
            peers: PeerDirectory::new(),
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let rooms = server.registry.room_count();
    let sessions = server.registry.session_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "rooms": rooms,
        "sessions": sessions,
    }))
}

/// Metrics handler - Prometheus text exposition format.
/// Protected by optional METRICS_TOKEN env var (Bearer auth).
async fn metrics_handler(
    State(server): State<SignalingServer>,
    headers: HeaderMap,
) -> Response {
    // Check bearer token if METRICS_TOKEN is configured
    if let Ok(expected) = std::env::var("METRICS_TOKEN") {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {}", expected) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let rooms = server.registry.room_count();
    let sessions = server.registry.session_count().await;
    let body = server.metrics.render_prometheus(rooms, sessions);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(
                socket,
                server.registry,
                server.peers,
                server.metrics,
                permit,
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::RecordingPeer;

    #[test]
    fn broadcast_reaches_registered_peers_only() {
        let directory = PeerDirectory::new();
        let here = RecordingPeer::new();
        let gone = RecordingPeer::new();
        directory.insert(here.id(), here.clone());
        directory.insert(gone.id(), gone.clone());
        directory.remove(gone.id());

        directory.broadcast(&ServerEvent::NewRoom {
            room_id: crate::engine::types::RoomId::from_name("standup"),
            room_name: "standup".to_string(),
        });

        assert_eq!(here.events("newRoom").len(), 1);
        assert!(gone.frames().is_empty());
    }
}
