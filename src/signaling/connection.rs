#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{AckStatus, AudioAction, ClientRequest, ConsumeFailure, ServerEvent};
use super::PeerDirectory;
use crate::engine::types::SessionId;
use crate::metrics::ServerMetrics;
use crate::peer::{PeerHandle, WsPeer};
use crate::room::registry::RoomRegistry;
use crate::room::{Room, RoomError};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
/// Messages queued beyond this are stale - drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout - close connection if no message received within this duration.
/// Prevents Slowloris-style attacks that hold semaphore permits indefinitely.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

const MAX_ROOM_NAME_LEN: usize = 128;
const MAX_USER_NAME_LEN: usize = 64;
const MAX_CHAT_LEN: usize = 4096;

/// Serialize a ServerEvent and send it through the channel as pre-serialized JSON.
fn send_json(sender: &mpsc::Sender<Arc<String>>, event: &ServerEvent) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(event)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    registry: Arc<RoomRegistry>,
    peers: PeerDirectory,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let session = SessionId::new();
    info!("New WebSocket connection: {}", session);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_metrics = metrics.clone();

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for session: {}", session);
    });

    let peer: Arc<dyn PeerHandle> = Arc::new(WsPeer::new(session, tx.clone()));
    peers.insert(session, peer.clone());

    // Session id and the room directory, sent once up front
    if send_json(
        &tx,
        &ServerEvent::Welcome {
            session_id: session,
            rooms: registry.summaries(),
        },
    )
    .is_err()
    {
        warn!("Failed to send welcome to session {}", session);
    }

    // Handle incoming messages
    let mut current_room: Option<Arc<Room>> = None;

    // Token bucket rate limiter state
    let mut tokens_us: u64 = MAX_TOKENS_US;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    loop {
        // Idle timeout: close connection if no message within IDLE_TIMEOUT
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for session {}", session);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                // Token bucket rate limiting
                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                tokens_us = (tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for session {}", session);
                        let _ = send_json(&tx, &ServerEvent::Error {
                            message: format!("Rate limit exceeded: max {} messages/second", RATE_LIMIT_REFILL_RATE),
                        });
                    }
                    continue;
                }

                match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(request) => {
                        let start = Instant::now();
                        let result = handle_client_request(
                            &request,
                            session,
                            &mut current_room,
                            &tx,
                            &peer,
                            &registry,
                            &peers,
                        )
                        .await;
                        metrics.observe_message_handling(start.elapsed());

                        if let Err(e) = result {
                            error!("Error handling request: {}", e);
                            metrics.inc_errors();
                            // If channel is closed, send task has exited - break
                            if tx.is_closed() {
                                break;
                            }
                            let _ = send_json(&tx, &ServerEvent::Error {
                                message: format!("Error: {e}"),
                            });
                        }
                    }
                    Err(e) => {
                        warn!("Invalid message format: {}", e);
                        metrics.inc_errors();
                        let _ = send_json(&tx, &ServerEvent::Error {
                            message: format!("Invalid message format: {e}"),
                        });
                    }
                }
            }
            Message::Close(_) => {
                info!("Session {} closed connection", session);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from session {}", session);
            }
        }
    }

    peers.remove(session);
    if let Some(room) = current_room.take() {
        info!("Session {} disconnected from room {}", session, room.id());
        room.remove_client(session).await;
    }

    // _conn_guard dropped here -> dec_connections_active
    // _permit dropped here -> release semaphore

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for session: {}", session);
}

/// Handle a single client request
async fn handle_client_request(
    request: &ClientRequest,
    session: SessionId,
    current_room: &mut Option<Arc<Room>>,
    sender: &mpsc::Sender<Arc<String>>,
    peer: &Arc<dyn PeerHandle>,
    registry: &Arc<RoomRegistry>,
    peers: &PeerDirectory,
) -> anyhow::Result<()> {
    match request {
        ClientRequest::CreateRoom { room_name } => {
            if room_name.is_empty() || room_name.len() > MAX_ROOM_NAME_LEN {
                anyhow::bail!("Invalid room name: must be 1-{MAX_ROOM_NAME_LEN} characters");
            }

            let (room, created) = registry.create_or_get(room_name).await?;
            send_json(sender, &ServerEvent::RoomCreated {
                room_id: room.id(),
                room_name: room.name().to_string(),
            })?;

            // Everyone connected learns about a genuinely new room.
            if created {
                peers.broadcast(&ServerEvent::NewRoom {
                    room_id: room.id(),
                    room_name: room.name().to_string(),
                });
            }
        }

        ClientRequest::JoinRoom { user_name, room_id } => {
            if user_name.is_empty() || user_name.len() > MAX_USER_NAME_LEN {
                anyhow::bail!("Invalid user name: must be 1-{MAX_USER_NAME_LEN} characters");
            }

            let room = registry.get(*room_id)?;

            // Leave current room if in one
            if let Some(old_room) = current_room.take() {
                old_room.remove_client(session).await;
            }

            let data = room.join(session, user_name.clone(), peer.clone()).await?;
            *current_room = Some(room);

            send_json(sender, &ServerEvent::RoomJoined {
                consume_data: data.consume_data,
                new_room: data.new_room,
                messages: data.messages,
            })?;
        }

        ClientRequest::SendMessage { text, user_name, room_id: _ } => {
            if text.is_empty() || text.len() > MAX_CHAT_LEN {
                anyhow::bail!("Invalid chat message: must be 1-{MAX_CHAT_LEN} characters");
            }
            if user_name.is_empty() || user_name.len() > MAX_USER_NAME_LEN {
                anyhow::bail!("Invalid user name: must be 1-{MAX_USER_NAME_LEN} characters");
            }
            // The session's room is authoritative; the payload's room id
            // is not trusted.
            let Some(room) = current_room.as_ref() else {
                anyhow::bail!("Not in a room");
            };
            room.add_message(user_name.clone(), text.clone()).await?;
        }

        ClientRequest::RequestTransport { direction, audio_pid } => {
            let Some(room) = current_room.as_ref() else {
                anyhow::bail!("Not in a room");
            };
            let params = room.request_transport(session, *direction, *audio_pid).await?;
            send_json(sender, &ServerEvent::TransportCreated {
                direction: *direction,
                audio_pid: *audio_pid,
                params,
            })?;
        }

        ClientRequest::ConnectTransport { direction, dtls_parameters, audio_pid } => {
            let Some(room) = current_room.as_ref() else {
                anyhow::bail!("Not in a room");
            };
            let status = match room
                .connect_transport(session, *direction, *audio_pid, dtls_parameters.clone())
                .await
            {
                Ok(()) => AckStatus::Success,
                Err(e @ (RoomError::TransportNotFound | RoomError::Engine(_))) => {
                    warn!("Connect transport failed for session {}: {}", session, e);
                    AckStatus::Error
                }
                Err(e) => return Err(e.into()),
            };
            send_json(sender, &ServerEvent::TransportConnected {
                direction: *direction,
                audio_pid: *audio_pid,
                status,
            })?;
        }

        ClientRequest::StartProducing { kind, rtp_parameters } => {
            let Some(room) = current_room.as_ref() else {
                anyhow::bail!("Not in a room");
            };
            let id = room.produce(session, *kind, rtp_parameters.clone()).await?;
            send_json(sender, &ServerEvent::ProducerCreated { id, kind: *kind })?;
        }

        ClientRequest::ConsumeMedia { rtp_capabilities, producer_id, kind } => {
            let Some(room) = current_room.as_ref() else {
                anyhow::bail!("Not in a room");
            };
            match room
                .consume(session, *producer_id, *kind, rtp_capabilities.clone())
                .await
            {
                Ok(consumer_options) => {
                    send_json(sender, &ServerEvent::ConsumerCreated { consumer_options })?;
                }
                Err(RoomError::CannotConsume(_)) => {
                    send_json(sender, &ServerEvent::ConsumeFailed {
                        producer_id: *producer_id,
                        kind: *kind,
                        status: ConsumeFailure::CannotConsume,
                    })?;
                }
                Err(e @ RoomError::ConsumeFailed(_)) => {
                    warn!("Consume failed for session {}: {}", session, e);
                    send_json(sender, &ServerEvent::ConsumeFailed {
                        producer_id: *producer_id,
                        kind: *kind,
                        status: ConsumeFailure::ConsumeFailed,
                    })?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        ClientRequest::UnpauseConsumer { producer_id, kind } => {
            let Some(room) = current_room.as_ref() else {
                anyhow::bail!("Not in a room");
            };
            let status = match room.unpause_consumer(session, *producer_id, *kind).await {
                Ok(()) => AckStatus::Success,
                Err(e @ (RoomError::ConsumerNotFound(_) | RoomError::Engine(_))) => {
                    warn!("Unpause failed for session {}: {}", session, e);
                    AckStatus::Error
                }
                Err(e) => return Err(e.into()),
            };
            send_json(sender, &ServerEvent::ConsumerUnpaused {
                producer_id: *producer_id,
                kind: *kind,
                status,
            })?;
        }

        ClientRequest::AudioChange { action } => {
            let Some(room) = current_room.as_ref() else {
                anyhow::bail!("Not in a room");
            };
            // Fire and forget: no ack on success.
            let enabled = matches!(action, AudioAction::Unmute);
            room.set_audio_enabled(session, enabled).await?;
        }
    }

    Ok(())
}
