#![forbid(unsafe_code)]

// Room registry - name-keyed directory of live rooms

use crate::engine::config::EngineConfig;
use crate::engine::pool::WorkerPool;
use crate::engine::types::RoomId;
use crate::metrics::ServerMetrics;
use crate::room::{Room, RoomError, RoomResult, ACTIVE_SPEAKER_INTERVAL};
use crate::signaling::protocol::RoomSummary;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::OnceCell;
use tracing::info;

type RoomCell = Arc<OnceCell<Arc<Room>>>;

/// Directory of live rooms, keyed by the id their name hashes to.
///
/// Creation is single-flight: concurrent requests for one name share a
/// cell, the first caller builds the router and room, the rest await
/// it. A failed build leaves the cell empty so the next request can
/// retry. Rooms remove their own entry when they close.
pub struct RoomRegistry {
    rooms: Arc<StdRwLock<HashMap<RoomId, RoomCell>>>,
    pool: Arc<WorkerPool>,
    config: EngineConfig,
    metrics: ServerMetrics,
}

impl RoomRegistry {
    pub fn new(pool: Arc<WorkerPool>, config: EngineConfig, metrics: ServerMetrics) -> Self {
        Self {
            rooms: Arc::new(StdRwLock::new(HashMap::new())),
            pool,
            config,
            metrics,
        }
    }

    /// Resolves a room name to its room, creating it on first use.
    /// Returns the room and whether this call created it.
    pub async fn create_or_get(&self, name: &str) -> RoomResult<(Arc<Room>, bool)> {
        let id = RoomId::from_name(name);

        let cell: RoomCell = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.entry(id).or_default().clone()
        };

        let mut created = false;
        let room = cell
            .get_or_try_init(|| async {
                info!("Creating room {} ('{}')", id, name);
                let worker = self.pool.least_loaded().await?;
                let router = worker.create_router(&self.config.codecs).await?;
                let observer = router
                    .create_audio_observer(ACTIVE_SPEAKER_INTERVAL)
                    .await?;
                let room = Room::spawn(
                    id,
                    name.to_string(),
                    router,
                    observer,
                    self.config.listen.clone(),
                    self.metrics.clone(),
                );

                // The room drops itself from the directory once closed.
                let rooms = self.rooms.clone();
                room.on_close(Box::new(move || {
                    let mut rooms = rooms.write().unwrap_or_else(|e| e.into_inner());
                    rooms.remove(&id);
                }));

                self.metrics.inc_rooms_created();
                created = true;
                Ok::<_, RoomError>(room)
            })
            .await?
            .clone();

        Ok((room, created))
    }

    /// Looks up a live room by id.
    pub fn get(&self, id: RoomId) -> RoomResult<Arc<Room>> {
        let cell = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.get(&id).cloned()
        };
        cell.and_then(|cell| cell.get().cloned())
            .ok_or(RoomError::RoomNotFound(id))
    }

    /// Directory of rooms that finished creating and are still open.
    pub fn summaries(&self) -> Vec<RoomSummary> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .values()
            .filter_map(|cell| cell.get())
            .filter(|room| !room.is_closed())
            .map(|room| room.summary())
            .collect()
    }

    pub fn room_count(&self) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .values()
            .filter_map(|cell| cell.get())
            .filter(|room| !room.is_closed())
            .count()
    }

    /// Total clients across all live rooms.
    pub async fn session_count(&self) -> usize {
        let rooms: Vec<Arc<Room>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().filter_map(|cell| cell.get().cloned()).collect()
        };
        let mut total = 0;
        for room in rooms {
            if !room.is_closed() {
                total += room.client_count().await;
            }
        }
        total
    }

    /// Closes every room. Used on graceful shutdown.
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<Room>> = {
            let mut map = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            map.drain()
                .filter_map(|(_, cell)| cell.get().cloned())
                .collect()
        };
        for room in rooms {
            room.close().await;
        }
        info!("All rooms closed");
    }
}
