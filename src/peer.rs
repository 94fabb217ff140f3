#![forbid(unsafe_code)]

// Peer handles - transport-facing send half of a connected session. Rooms
// talk to peers only through this trait, so they never see the socket.

use crate::engine::types::SessionId;
use crate::signaling::protocol::ServerEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Send half of a connected session. Delivery is best-effort; a slow
/// peer loses frames rather than stalling the room.
pub trait PeerHandle: Send + Sync {
    fn id(&self) -> SessionId;

    /// Queues one pre-serialized frame.
    fn send_frame(&self, frame: Arc<String>);

    /// Serializes `event` and queues it. Callers that fan out to many
    /// peers should serialize once themselves and use [`send_frame`].
    ///
    /// [`send_frame`]: PeerHandle::send_frame
    fn send(&self, event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(json) => self.send_frame(Arc::new(json)),
            Err(e) => warn!("Failed to serialize event for session {}: {}", self.id(), e),
        }
    }
}

/// Peer backed by the bounded send queue of a websocket connection.
pub struct WsPeer {
    session: SessionId,
    tx: mpsc::Sender<Arc<String>>,
}

impl WsPeer {
    pub fn new(session: SessionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self { session, tx }
    }
}

impl PeerHandle for WsPeer {
    fn id(&self) -> SessionId {
        self.session
    }

    fn send_frame(&self, frame: Arc<String>) {
        if let Err(e) = self.tx.try_send(frame) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("Send queue full for session {}, dropping event", self.session);
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!("Send queue closed for session {}", self.session);
                }
            }
        }
    }
}

/// Test peer that records every frame it is handed.
#[cfg(test)]
pub struct RecordingPeer {
    session: SessionId,
    frames: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingPeer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            session: SessionId::new(),
            frames: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().unwrap().clone()
    }

    /// Parsed frames whose `type` tag equals `event`, oldest first.
    pub fn events(&self, event: &str) -> Vec<serde_json::Value> {
        self.frames()
            .iter()
            .filter_map(|f| serde_json::from_str::<serde_json::Value>(f).ok())
            .filter(|v| v["type"] == event)
            .collect()
    }

    pub fn last_event(&self, event: &str) -> Option<serde_json::Value> {
        self.events(event).pop()
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }
}

#[cfg(test)]
impl PeerHandle for RecordingPeer {
    fn id(&self) -> SessionId {
        self.session
    }

    fn send_frame(&self, frame: Arc<String>) {
        self.frames.lock().unwrap().push((*frame).clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::protocol::ServerEvent;

    #[tokio::test]
    async fn ws_peer_queues_frames() {
        let (tx, mut rx) = mpsc::channel(4);
        let peer = WsPeer::new(SessionId::new(), tx);

        peer.send_frame(Arc::new("hello".to_string()));
        assert_eq!(rx.recv().await.as_deref().map(|s| s.as_str()), Some("hello"));
    }

    #[tokio::test]
    async fn recording_peer_parses_event_tags() {
        let peer = RecordingPeer::new();
        peer.send(&ServerEvent::Error {
            message: "nope".to_string(),
        });

        let events = peer.events("error");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["message"], "nope");
    }
}
