#![forbid(unsafe_code)]

// Room module - room lifecycle, membership, and the active speaker window
pub mod registry;
pub mod speaker;

use crate::engine::types::{
    DtlsParameters, ListenConfig, MediaKind, ProducerId, RoomId, RtpCapabilities, RtpParameters,
    SessionId, TransportParams,
};
use crate::engine::{
    AudioObserver, EngineError, MediaConsumer, MediaProducer, MediaRouter, MediaTransport,
};
use crate::metrics::ServerMetrics;
use crate::peer::PeerHandle;
use crate::session::{Client, DownstreamEntry, UpstreamTransport};
use crate::signaling::protocol::{
    ChatMessage, ConsumeData, ConsumerOptions, RoomSummary, ServerEvent, TransportDirection,
};
use chrono::Utc;
use speaker::{ClientView, SpeakerAction, SpeakerRanking};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock as TokioRwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How often the engine re-evaluates who the dominant speaker is.
pub(crate) const ACTIVE_SPEAKER_INTERVAL: Duration = Duration::from_millis(300);

/// Chat history kept per room; older messages are dropped.
const MAX_STORED_MESSAGES: usize = 500;

/// Capacity of the dominant-speaker trigger channel. Events past this
/// are stale by definition and safe to drop.
const TRIGGER_CAPACITY: usize = 16;

/// Typed failures for room operations.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),
    #[error("Room is closed")]
    RoomClosed,
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("Transport not found")]
    TransportNotFound,
    #[error("Consumer transport requires an audio pid")]
    MissingAudioPid,
    #[error("No client owns producer {0}")]
    UnknownRemoteProducer(ProducerId),
    #[error("Already producing {0}")]
    AlreadyProducing(MediaKind),
    #[error("No consumer found for producer {0}")]
    ConsumerNotFound(ProducerId),
    #[error("Cannot consume producer {0}")]
    CannotConsume(ProducerId),
    #[error("Consume failed: {0}")]
    ConsumeFailed(EngineError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type RoomResult<T> = Result<T, RoomError>;

/// Events sent from the observer callback (sync Fn) to the async policy task.
enum PolicyTrigger {
    Dominant(ProducerId),
    /// Barrier: acked once every earlier trigger has been processed.
    Sync(oneshot::Sender<()>),
}

/// Engine work queued under the room lock and applied off it, in order.
enum Effect {
    PauseProducer(Arc<dyn MediaProducer>),
    ResumeProducer(Arc<dyn MediaProducer>),
    PauseConsumer(Arc<dyn MediaConsumer>),
    ResumeConsumer(Arc<dyn MediaConsumer>),
    ObserveProducer(ProducerId),
    UnobserveProducer(ProducerId),
    CloseTransport(Arc<dyn MediaTransport>),
    CloseProducer(Arc<dyn MediaProducer>),
    CloseConsumer(Arc<dyn MediaConsumer>),
    /// Barrier: acked once every earlier effect has been applied.
    Flush(oneshot::Sender<()>),
}

/// Everything a joining client needs to start consuming the room.
#[derive(Debug)]
pub struct JoinData {
    pub consume_data: ConsumeData,
    pub new_room: bool,
    pub messages: Vec<ChatMessage>,
}

#[derive(Default)]
struct RoomState {
    clients: Vec<Client>,
    ranking: SpeakerRanking,
    messages: Vec<ChatMessage>,
}

impl RoomState {
    fn client(&self, session: SessionId) -> Option<&Client> {
        self.clients.iter().find(|c| c.session_id == session)
    }

    fn client_mut(&mut self, session: SessionId) -> Option<&mut Client> {
        self.clients.iter_mut().find(|c| c.session_id == session)
    }

    fn owner_of_audio(&self, pid: ProducerId) -> Option<&Client> {
        self.clients.iter().find(|c| c.audio_pid() == Some(pid))
    }

    /// Builds the parallel consume lists for `pids`, each an audio pid
    /// whose owner is still in the room.
    fn consume_data_for(&self, capabilities: RtpCapabilities, pids: &[ProducerId]) -> ConsumeData {
        let mut data = ConsumeData {
            router_rtp_capabilities: capabilities,
            audio_pids_to_create: Vec::new(),
            video_pids_to_create: Vec::new(),
            associated_user_names: Vec::new(),
            active_speaker_list: self.ranking.window().to_vec(),
        };
        for &pid in pids {
            let Some(owner) = self.owner_of_audio(pid) else {
                continue;
            };
            data.audio_pids_to_create.push(pid);
            data.video_pids_to_create.push(owner.video_pid());
            data.associated_user_names.push(owner.user_name.clone());
        }
        data
    }

    /// Broadcast an event to every client, serializing once.
    fn broadcast_all(&self, event: &ServerEvent) {
        let json = match serde_json::to_string(event) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast event: {}", e);
                return;
            }
        };
        for client in &self.clients {
            client.peer.send_frame(json.clone());
        }
    }

    fn send_to(&self, session: SessionId, event: &ServerEvent) {
        if let Some(client) = self.client(session) {
            client.peer.send(event);
        }
    }
}

/// One conference room: a router, its audio observer, and the clients
/// attached to them.
///
/// Membership and media handles live behind a tokio RwLock. Engine calls
/// happen off that lock, either inline (transport setup, consume) or via
/// the effect queue (pause/resume plans, teardown), so a slow engine
/// never stalls the roster.
pub struct Room {
    id: RoomId,
    name: String,
    router: Arc<dyn MediaRouter>,
    observer: Arc<dyn AudioObserver>,
    listen: ListenConfig,
    state: TokioRwLock<RoomState>,
    effects: mpsc::UnboundedSender<Effect>,
    triggers: mpsc::Sender<PolicyTrigger>,
    closed: AtomicBool,
    torn_down: AtomicBool,
    close_handlers: StdMutex<Vec<Box<dyn FnOnce() + Send>>>,
    metrics: ServerMetrics,
}

impl Room {
    /// Wires a room onto its router and observer and starts the policy
    /// and effect tasks. Both tasks hold only what they need: the policy
    /// task a weak handle, the effect task the observer.
    pub fn spawn(
        id: RoomId,
        name: String,
        router: Arc<dyn MediaRouter>,
        observer: Arc<dyn AudioObserver>,
        listen: ListenConfig,
        metrics: ServerMetrics,
    ) -> Arc<Self> {
        let (effect_tx, effect_rx) = mpsc::unbounded_channel();
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_CAPACITY);

        let room = Arc::new(Self {
            id,
            name,
            router,
            observer: observer.clone(),
            listen,
            state: TokioRwLock::new(RoomState::default()),
            effects: effect_tx,
            triggers: trigger_tx.clone(),
            closed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            close_handlers: StdMutex::new(Vec::new()),
            metrics,
        });

        // Dominant speaker events flow through the bounded trigger
        // channel (use try_send; dropping stale events is fine).
        room.observer.on_dominant_speaker(Box::new(move |pid| {
            let _ = trigger_tx.try_send(PolicyTrigger::Dominant(pid));
        }));

        tokio::spawn(Self::policy_task(trigger_rx, Arc::downgrade(&room)));
        tokio::spawn(Self::effect_task(effect_rx, observer));

        room
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_id: self.id,
            room_name: self.name.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn client_count(&self) -> usize {
        self.state.read().await.clients.len()
    }

    /// Registers a callback run exactly once when the room finishes
    /// closing. Runs immediately if it already has.
    pub fn on_close(&self, handler: Box<dyn FnOnce() + Send>) {
        {
            let mut handlers = self.close_handlers.lock().unwrap_or_else(|e| e.into_inner());
            if !self.torn_down.load(Ordering::SeqCst) {
                handlers.push(handler);
                return;
            }
        }
        handler();
    }

    fn ensure_open(&self) -> RoomResult<()> {
        if self.is_closed() {
            return Err(RoomError::RoomClosed);
        }
        Ok(())
    }

    fn queue(&self, effect: Effect) {
        if self.effects.send(effect).is_err() {
            debug!("Effect queue closed for room {}", self.id);
        }
    }

    /// Adds a client to the roster and returns the data it needs to
    /// start consuming the current active window.
    pub async fn join(
        &self,
        session: SessionId,
        user_name: String,
        peer: Arc<dyn PeerHandle>,
    ) -> RoomResult<JoinData> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        // Re-check: the room may have closed while we waited.
        self.ensure_open()?;

        let new_room = state.clients.is_empty();
        state.clients.push(Client::new(session, user_name.clone(), peer));
        self.metrics.inc_joins();
        info!("Session {} joined room {} as '{}'", session, self.id, user_name);

        let window = state.ranking.window().to_vec();
        Ok(JoinData {
            consume_data: state.consume_data_for(self.router.rtp_capabilities(), &window),
            new_room,
            messages: state.messages.clone(),
        })
    }

    /// Stores a chat message and pushes it to everyone in the room.
    pub async fn add_message(&self, user_name: String, text: String) -> RoomResult<()> {
        self.ensure_open()?;
        let message = ChatMessage {
            user_name,
            text,
            sent_at: Utc::now(),
        };

        let mut state = self.state.write().await;
        state.messages.push(message.clone());
        if state.messages.len() > MAX_STORED_MESSAGES {
            let overflow = state.messages.len() - MAX_STORED_MESSAGES;
            state.messages.drain(..overflow);
        }
        state.broadcast_all(&ServerEvent::NewMessage { message });
        Ok(())
    }

    /// Creates (or returns) the transport for `direction`. Repeated
    /// requests for the same target return the original parameters.
    pub async fn request_transport(
        &self,
        session: SessionId,
        direction: TransportDirection,
        audio_pid: Option<ProducerId>,
    ) -> RoomResult<TransportParams> {
        self.ensure_open()?;
        match direction {
            TransportDirection::Producer => self.request_upstream(session).await,
            TransportDirection::Consumer => {
                let pid = audio_pid.ok_or(RoomError::MissingAudioPid)?;
                self.request_downstream(session, pid).await
            }
        }
    }

    async fn request_upstream(&self, session: SessionId) -> RoomResult<TransportParams> {
        {
            let state = self.state.read().await;
            let client = state
                .client(session)
                .ok_or(RoomError::SessionNotFound(session))?;
            if let Some(upstream) = &client.upstream {
                return Ok(upstream.params.clone());
            }
        }

        let transport = self.router.create_transport(&self.listen).await?;
        let params = transport.params();

        let mut state = self.state.write().await;
        let Some(client) = state.client_mut(session) else {
            self.queue(Effect::CloseTransport(transport));
            return Err(RoomError::SessionNotFound(session));
        };
        if let Some(existing) = &client.upstream {
            // Lost a create race against another request from the same
            // client; keep the first transport.
            let params = existing.params.clone();
            self.queue(Effect::CloseTransport(transport));
            return Ok(params);
        }
        debug!("Created upstream transport {} for session {}", transport.id(), session);
        client.upstream = Some(UpstreamTransport {
            transport,
            params: params.clone(),
        });
        Ok(params)
    }

    async fn request_downstream(
        &self,
        session: SessionId,
        remote_audio_pid: ProducerId,
    ) -> RoomResult<TransportParams> {
        {
            let state = self.state.read().await;
            let client = state
                .client(session)
                .ok_or(RoomError::SessionNotFound(session))?;
            if let Some(entry) = client.downstream(remote_audio_pid) {
                return Ok(entry.params.clone());
            }
            if state.owner_of_audio(remote_audio_pid).is_none() {
                return Err(RoomError::UnknownRemoteProducer(remote_audio_pid));
            }
        }

        let transport = self.router.create_transport(&self.listen).await?;
        let params = transport.params();

        let mut state = self.state.write().await;
        let Some(client) = state.client_mut(session) else {
            self.queue(Effect::CloseTransport(transport));
            return Err(RoomError::SessionNotFound(session));
        };
        if let Some(existing) = client.downstream(remote_audio_pid) {
            let params = existing.params.clone();
            self.queue(Effect::CloseTransport(transport));
            return Ok(params);
        }
        debug!(
            "Created downstream transport {} for session {} toward producer {}",
            transport.id(),
            session,
            remote_audio_pid
        );
        client
            .downstreams
            .push(DownstreamEntry::new(remote_audio_pid, transport, params.clone()));
        Ok(params)
    }

    /// Finishes the DTLS handshake on one of the client's transports.
    pub async fn connect_transport(
        &self,
        session: SessionId,
        direction: TransportDirection,
        audio_pid: Option<ProducerId>,
        dtls: DtlsParameters,
    ) -> RoomResult<()> {
        self.ensure_open()?;
        let transport = {
            let state = self.state.read().await;
            let client = state
                .client(session)
                .ok_or(RoomError::SessionNotFound(session))?;
            match direction {
                TransportDirection::Producer => {
                    client.upstream.as_ref().map(|u| u.transport.clone())
                }
                TransportDirection::Consumer => {
                    let pid = audio_pid.ok_or(RoomError::MissingAudioPid)?;
                    client.downstream(pid).map(|d| d.transport.clone())
                }
            }
            .ok_or(RoomError::TransportNotFound)?
        };

        transport.connect(dtls).await?;
        debug!("Transport {} connected for session {}", transport.id(), session);
        Ok(())
    }

    /// Starts producing one kind of media on the client's upstream
    /// transport. Audio producers enter the speaker ranking at the back.
    pub async fn produce(
        &self,
        session: SessionId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> RoomResult<ProducerId> {
        self.ensure_open()?;
        let transport = {
            let state = self.state.read().await;
            let client = state
                .client(session)
                .ok_or(RoomError::SessionNotFound(session))?;
            if client.producer(kind).is_some() {
                return Err(RoomError::AlreadyProducing(kind));
            }
            client
                .upstream
                .as_ref()
                .map(|u| u.transport.clone())
                .ok_or(RoomError::TransportNotFound)?
        };

        let producer = transport.produce(kind, rtp_parameters).await?;
        let pid = producer.id();

        {
            let mut state = self.state.write().await;
            match state.client_mut(session) {
                Some(client) => {
                    if client.producer(kind).is_some() {
                        self.queue(Effect::CloseProducer(producer));
                        return Err(RoomError::AlreadyProducing(kind));
                    }
                    client.set_producer(kind, producer);
                }
                None => {
                    // Client left while the engine was creating the producer.
                    self.queue(Effect::CloseProducer(producer));
                    return Err(RoomError::SessionNotFound(session));
                }
            }
            if kind == MediaKind::Audio {
                state.ranking.push_tail(pid);
                self.queue(Effect::ObserveProducer(pid));
            }
        }

        info!("Session {} producing {} as {}", session, kind, pid);
        self.metrics.inc_producers_created();
        self.apply_speaker_policy(None).await;
        Ok(pid)
    }

    /// Creates a paused consumer for one track of a remote producer on
    /// the downstream transport toward that producer's owner.
    pub async fn consume(
        &self,
        session: SessionId,
        producer_id: ProducerId,
        kind: MediaKind,
        capabilities: RtpCapabilities,
    ) -> RoomResult<ConsumerOptions> {
        self.ensure_open()?;
        let (entry_key, transport) = {
            let mut state = self.state.write().await;
            // Downstreams are keyed by the owner's audio pid; for video
            // we resolve the owner first and backfill the video pid.
            let entry_key = match kind {
                MediaKind::Audio => producer_id,
                MediaKind::Video => state
                    .clients
                    .iter()
                    .find(|c| c.video_pid() == Some(producer_id))
                    .and_then(|c| c.audio_pid())
                    .ok_or(RoomError::UnknownRemoteProducer(producer_id))?,
            };
            let client = state
                .client_mut(session)
                .ok_or(RoomError::SessionNotFound(session))?;
            let entry = client
                .downstream_mut(entry_key)
                .ok_or(RoomError::TransportNotFound)?;
            if kind == MediaKind::Video {
                entry.remote_video_pid = Some(producer_id);
            }
            (entry_key, entry.transport.clone())
        };

        if !self.router.can_consume(producer_id, &capabilities).await {
            return Err(RoomError::CannotConsume(producer_id));
        }

        // Consumers start paused; the client unpauses once it is wired up.
        let consumer = transport
            .consume(producer_id, capabilities, true)
            .await
            .map_err(RoomError::ConsumeFailed)?;
        let options = ConsumerOptions {
            id: consumer.id(),
            producer_id,
            kind,
            rtp_parameters: consumer.rtp_parameters(),
        };

        let mut state = self.state.write().await;
        let Some(client) = state.client_mut(session) else {
            self.queue(Effect::CloseConsumer(consumer));
            return Err(RoomError::SessionNotFound(session));
        };
        let Some(entry) = client.downstream_mut(entry_key) else {
            self.queue(Effect::CloseConsumer(consumer));
            return Err(RoomError::TransportNotFound);
        };
        if let Some(old) = entry.replace_consumer(kind, consumer) {
            self.queue(Effect::CloseConsumer(old));
        }
        debug!("Session {} consuming {} producer {}", session, kind, producer_id);
        self.metrics.inc_consumers_created();
        Ok(options)
    }

    /// Resumes the client's consumer for `producer_id`. A later policy
    /// pass may pause it again if the speaker leaves the window.
    pub async fn unpause_consumer(
        &self,
        session: SessionId,
        producer_id: ProducerId,
        kind: MediaKind,
    ) -> RoomResult<()> {
        self.ensure_open()?;
        let consumer = {
            let state = self.state.read().await;
            let client = state
                .client(session)
                .ok_or(RoomError::SessionNotFound(session))?;
            client
                .downstreams
                .iter()
                .filter_map(|d| d.consumer(kind))
                .find(|c| c.producer_id() == producer_id)
                .cloned()
                .ok_or(RoomError::ConsumerNotFound(producer_id))?
        };

        consumer.resume().await?;
        debug!("Session {} unpaused {} consumer for producer {}", session, kind, producer_id);
        Ok(())
    }

    /// Mute toggle for the client's own audio producer. Fire and forget;
    /// a missing producer is a no-op. The ranking slot is kept either
    /// way, so an unmute needs no rejoin.
    pub async fn set_audio_enabled(&self, session: SessionId, enabled: bool) -> RoomResult<()> {
        self.ensure_open()?;
        let producer = {
            let state = self.state.read().await;
            let client = state
                .client(session)
                .ok_or(RoomError::SessionNotFound(session))?;
            client.audio_producer.clone()
        };

        match producer {
            Some(producer) => {
                if enabled {
                    self.queue(Effect::ResumeProducer(producer));
                } else {
                    self.queue(Effect::PauseProducer(producer));
                }
            }
            None => debug!("Session {} toggled audio with no audio producer", session),
        }
        Ok(())
    }

    /// Removes a client and closes its media. Closes the room when the
    /// roster empties; otherwise re-runs the speaker policy. Idempotent.
    pub async fn remove_client(&self, session: SessionId) {
        let (resources, audio_pid, now_empty) = {
            let mut state = self.state.write().await;
            let Some(index) = state.clients.iter().position(|c| c.session_id == session) else {
                return;
            };
            let mut client = state.clients.remove(index);
            let audio_pid = client.audio_pid();
            if let Some(pid) = audio_pid {
                state.ranking.remove(pid);
            }
            let now_empty = state.clients.is_empty();
            if now_empty {
                // Gate new joins before the lock drops so teardown
                // cannot race a late arrival.
                self.closed.store(true, Ordering::SeqCst);
            }
            (client.take_resources(), audio_pid, now_empty)
        };

        if let Some(pid) = audio_pid {
            self.queue(Effect::UnobserveProducer(pid));
        }
        for consumer in resources.consumers {
            self.queue(Effect::CloseConsumer(consumer));
        }
        for producer in resources.producers {
            self.queue(Effect::CloseProducer(producer));
        }
        for transport in resources.transports {
            self.queue(Effect::CloseTransport(transport));
        }

        self.metrics.inc_leaves();
        info!("Session {} left room {}", session, self.id);

        if now_empty {
            info!("Room {} is empty, closing", self.id);
            self.close().await;
        } else {
            self.apply_speaker_policy(None).await;
        }
    }

    /// Closes the room: strips and closes all client media, drains the
    /// effect queue, then closes the observer and router. Idempotent.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let clients = {
            let mut state = self.state.write().await;
            std::mem::take(&mut state.clients)
        };
        for mut client in clients {
            let resources = client.take_resources();
            for consumer in resources.consumers {
                self.queue(Effect::CloseConsumer(consumer));
            }
            for producer in resources.producers {
                self.queue(Effect::CloseProducer(producer));
            }
            for transport in resources.transports {
                self.queue(Effect::CloseTransport(transport));
            }
        }

        self.flush_effects().await;
        self.observer.close().await;
        self.router.close().await;

        let handlers = {
            let mut handlers = self.close_handlers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *handlers)
        };
        for handler in handlers {
            handler();
        }

        self.metrics.inc_rooms_closed();
        info!("Room {} closed", self.id);
    }

    /// Waits until every queued trigger and engine effect has been
    /// applied. Used by shutdown and tests.
    pub async fn settle(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.triggers.send(PolicyTrigger::Sync(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        self.flush_effects().await;
    }

    async fn flush_effects(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.effects.send(Effect::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// One pass of the active-speaker policy: optionally promote a
    /// dominant speaker, pause everyone outside the window, resume
    /// everyone inside it, tell clients about speakers they are not yet
    /// consuming, and broadcast the new window.
    async fn apply_speaker_policy(&self, promoted: Option<ProducerId>) {
        if self.is_closed() {
            return;
        }
        let mut state = self.state.write().await;

        if let Some(pid) = promoted {
            // Observer events can outlive the producer's owner; never
            // reinsert a pid with no owner in the roster.
            if state.owner_of_audio(pid).is_none() {
                debug!("Ignoring dominant speaker event for unowned producer {}", pid);
                return;
            }
            state.ranking.promote(pid);
            self.metrics.inc_dominant_events();
        }

        let views: Vec<ClientView> = state.clients.iter().map(Client::view).collect();
        let decision = speaker::evaluate(&state.ranking, &views);
        self.metrics.inc_policy_passes();

        for action in &decision.actions {
            match *action {
                SpeakerAction::PauseOwn(session) => {
                    if let Some(client) = state.client(session) {
                        if let Some(producer) = &client.audio_producer {
                            self.queue(Effect::PauseProducer(producer.clone()));
                        }
                        if let Some(producer) = &client.video_producer {
                            self.queue(Effect::PauseProducer(producer.clone()));
                        }
                    }
                }
                SpeakerAction::ResumeOwn(session) => {
                    if let Some(client) = state.client(session) {
                        if let Some(producer) = &client.audio_producer {
                            self.queue(Effect::ResumeProducer(producer.clone()));
                        }
                        if let Some(producer) = &client.video_producer {
                            self.queue(Effect::ResumeProducer(producer.clone()));
                        }
                    }
                }
                SpeakerAction::PauseSubscription(session, pid) => {
                    if let Some(entry) = state.client(session).and_then(|c| c.downstream(pid)) {
                        if let Some(consumer) = &entry.audio_consumer {
                            self.queue(Effect::PauseConsumer(consumer.clone()));
                        }
                        if let Some(consumer) = &entry.video_consumer {
                            self.queue(Effect::PauseConsumer(consumer.clone()));
                        }
                    }
                }
                SpeakerAction::ResumeSubscription(session, pid) => {
                    if let Some(entry) = state.client(session).and_then(|c| c.downstream(pid)) {
                        if let Some(consumer) = &entry.audio_consumer {
                            self.queue(Effect::ResumeConsumer(consumer.clone()));
                        }
                        if let Some(consumer) = &entry.video_consumer {
                            self.queue(Effect::ResumeConsumer(consumer.clone()));
                        }
                    }
                }
            }
        }

        state.broadcast_all(&ServerEvent::UpdateActiveSpeakers {
            active_speaker_list: decision.active.clone(),
        });

        for (session, fresh) in &decision.new_subscriptions {
            let consume_data = state.consume_data_for(self.router.rtp_capabilities(), fresh);
            state.send_to(
                *session,
                &ServerEvent::NewProducersToConsume { consume_data },
            );
        }
    }

    async fn policy_task(mut triggers: mpsc::Receiver<PolicyTrigger>, room: Weak<Room>) {
        while let Some(trigger) = triggers.recv().await {
            let Some(room) = room.upgrade() else {
                break;
            };
            match trigger {
                PolicyTrigger::Dominant(pid) => room.apply_speaker_policy(Some(pid)).await,
                PolicyTrigger::Sync(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        debug!("Policy task exiting");
    }

    async fn effect_task(mut effects: mpsc::UnboundedReceiver<Effect>, observer: Arc<dyn AudioObserver>) {
        while let Some(effect) = effects.recv().await {
            match effect {
                Effect::PauseProducer(producer) => {
                    if let Err(e) = producer.pause().await {
                        debug!("Pausing producer {} failed: {}", producer.id(), e);
                    }
                }
                Effect::ResumeProducer(producer) => {
                    if let Err(e) = producer.resume().await {
                        debug!("Resuming producer {} failed: {}", producer.id(), e);
                    }
                }
                Effect::PauseConsumer(consumer) => {
                    if let Err(e) = consumer.pause().await {
                        debug!("Pausing consumer {} failed: {}", consumer.id(), e);
                    }
                }
                Effect::ResumeConsumer(consumer) => {
                    if let Err(e) = consumer.resume().await {
                        debug!("Resuming consumer {} failed: {}", consumer.id(), e);
                    }
                }
                Effect::ObserveProducer(pid) => {
                    if let Err(e) = observer.add_producer(pid).await {
                        debug!("Adding producer {} to observer failed: {}", pid, e);
                    }
                }
                Effect::UnobserveProducer(pid) => {
                    if let Err(e) = observer.remove_producer(pid).await {
                        debug!("Removing producer {} from observer failed: {}", pid, e);
                    }
                }
                Effect::CloseTransport(transport) => transport.close().await,
                Effect::CloseProducer(producer) => producer.close().await,
                Effect::CloseConsumer(consumer) => consumer.close().await,
                Effect::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        debug!("Effect task exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::default_media_codecs;
    use crate::engine::memory::MemoryEngine;
    use crate::engine::MediaEngine;
    use crate::peer::RecordingPeer;
    use serde_json::json;

    struct TestClient {
        session: SessionId,
        peer: Arc<RecordingPeer>,
        audio: ProducerId,
    }

    async fn spawn_room(engine: &MemoryEngine) -> Arc<Room> {
        let worker = engine.spawn_worker().await.unwrap();
        let router = worker.create_router(&default_media_codecs()).await.unwrap();
        let observer = router
            .create_audio_observer(ACTIVE_SPEAKER_INTERVAL)
            .await
            .unwrap();
        Room::spawn(
            RoomId::from_name("standup"),
            "standup".to_string(),
            router,
            observer,
            ListenConfig::default(),
            ServerMetrics::new(),
        )
    }

    async fn join_client(room: &Room, name: &str) -> (SessionId, Arc<RecordingPeer>) {
        let session = SessionId::new();
        let peer = RecordingPeer::new();
        room.join(session, name.to_string(), peer.clone())
            .await
            .unwrap();
        (session, peer)
    }

    async fn join_with_audio(room: &Room, name: &str) -> TestClient {
        let (session, peer) = join_client(room, name).await;
        room.request_transport(session, TransportDirection::Producer, None)
            .await
            .unwrap();
        let audio = room
            .produce(session, MediaKind::Audio, RtpParameters::default())
            .await
            .unwrap();
        TestClient { session, peer, audio }
    }

    fn audio_caps() -> RtpCapabilities {
        RtpCapabilities(json!({
            "codecs": [{ "mimeType": "audio/opus", "clockRate": 48000 }]
        }))
    }

    #[tokio::test]
    async fn join_reports_roster_and_first_client_flag() {
        let engine = MemoryEngine::new();
        let room = spawn_room(&engine).await;

        let session = SessionId::new();
        let data = room
            .join(session, "alice".to_string(), RecordingPeer::new())
            .await
            .unwrap();
        assert!(data.new_room);
        assert!(data.consume_data.audio_pids_to_create.is_empty());

        room.request_transport(session, TransportDirection::Producer, None)
            .await
            .unwrap();
        let audio = room
            .produce(session, MediaKind::Audio, RtpParameters::default())
            .await
            .unwrap();

        let data = room
            .join(SessionId::new(), "bob".to_string(), RecordingPeer::new())
            .await
            .unwrap();
        assert!(!data.new_room);
        assert_eq!(data.consume_data.audio_pids_to_create, vec![audio]);
        assert_eq!(data.consume_data.video_pids_to_create, vec![None]);
        assert_eq!(data.consume_data.associated_user_names, vec!["alice".to_string()]);
        assert_eq!(data.consume_data.active_speaker_list, vec![audio]);
    }

    #[tokio::test]
    async fn six_speakers_leave_the_least_recent_outside_the_window() {
        let engine = MemoryEngine::new();
        let room = spawn_room(&engine).await;

        let mut clients = Vec::new();
        for name in ["c1", "c2", "c3", "c4", "c5", "c6"] {
            clients.push(join_with_audio(&room, name).await);
        }
        room.settle().await;

        // Dominance in reverse join order leaves c1..c5 in the window.
        for client in clients.iter().rev() {
            assert!(engine.drive_dominant_speaker(client.audio));
        }
        room.settle().await;

        let expected: Vec<ProducerId> = clients[..5].iter().map(|c| c.audio).collect();
        let event = clients[0].peer.last_event("updateActiveSpeakers").unwrap();
        assert_eq!(event["activeSpeakerList"], serde_json::to_value(&expected).unwrap());

        assert_eq!(engine.producer_paused(clients[5].audio), Some(true));
        for client in &clients[..5] {
            assert_eq!(engine.producer_paused(client.audio), Some(false));
        }
    }

    #[tokio::test]
    async fn subscribers_of_a_displaced_speaker_get_paused_consumers() {
        let engine = MemoryEngine::new();
        let room = spawn_room(&engine).await;

        let mut clients = Vec::new();
        for name in ["c1", "c2", "c3", "c4", "c5", "c6"] {
            clients.push(join_with_audio(&room, name).await);
        }

        // c1 consumes c6's audio before the window overflows.
        room.request_transport(
            clients[0].session,
            TransportDirection::Consumer,
            Some(clients[5].audio),
        )
        .await
        .unwrap();
        let options = room
            .consume(clients[0].session, clients[5].audio, MediaKind::Audio, audio_caps())
            .await
            .unwrap();
        room.settle().await;

        for client in clients.iter().rev() {
            assert!(engine.drive_dominant_speaker(client.audio));
        }
        room.settle().await;

        assert_eq!(engine.consumer_paused(options.id), Some(true));
        assert_eq!(engine.producer_paused(clients[5].audio), Some(true));
    }

    #[tokio::test]
    async fn clients_are_told_about_window_speakers_they_do_not_consume() {
        let engine = MemoryEngine::new();
        let room = spawn_room(&engine).await;

        let alice = join_with_audio(&room, "alice").await;
        let bob = join_with_audio(&room, "bob").await;
        room.request_transport(alice.session, TransportDirection::Consumer, Some(bob.audio))
            .await
            .unwrap();

        let carol = join_with_audio(&room, "carol").await;
        room.settle().await;

        // Alice already consumes bob, so only carol is news to her.
        let event = alice.peer.last_event("newProducersToConsume").unwrap();
        assert_eq!(
            event["audioPidsToCreate"],
            serde_json::to_value(vec![carol.audio]).unwrap()
        );

        // Carol consumes nobody yet and is told about both.
        let event = carol.peer.last_event("newProducersToConsume").unwrap();
        assert_eq!(
            event["audioPidsToCreate"],
            serde_json::to_value(vec![alice.audio, bob.audio]).unwrap()
        );
        assert_eq!(event["associatedUserNames"], json!(["alice", "bob"]));
    }

    #[tokio::test]
    async fn request_transport_is_idempotent_per_target() {
        let engine = MemoryEngine::new();
        let room = spawn_room(&engine).await;

        let alice = join_with_audio(&room, "alice").await;
        let (bob, _) = join_client(&room, "bob").await;

        let first = room
            .request_transport(alice.session, TransportDirection::Producer, None)
            .await
            .unwrap();
        let second = room
            .request_transport(alice.session, TransportDirection::Producer, None)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        let first = room
            .request_transport(bob, TransportDirection::Consumer, Some(alice.audio))
            .await
            .unwrap();
        let second = room
            .request_transport(bob, TransportDirection::Consumer, Some(alice.audio))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        let err = room
            .request_transport(bob, TransportDirection::Consumer, Some(ProducerId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::UnknownRemoteProducer(_)));

        let err = room
            .request_transport(bob, TransportDirection::Consumer, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::MissingAudioPid));
    }

    #[tokio::test]
    async fn consume_is_refused_for_incompatible_capabilities() {
        let engine = MemoryEngine::new();
        let room = spawn_room(&engine).await;

        let alice = join_with_audio(&room, "alice").await;
        let (bob, _) = join_client(&room, "bob").await;
        room.request_transport(bob, TransportDirection::Consumer, Some(alice.audio))
            .await
            .unwrap();

        let video_only = RtpCapabilities(json!({
            "codecs": [{ "mimeType": "video/VP8", "clockRate": 90000 }]
        }));
        let err = room
            .consume(bob, alice.audio, MediaKind::Audio, video_only)
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::CannotConsume(_)));
        assert_eq!(engine.consumer_count(), 0);
    }

    #[tokio::test]
    async fn consumers_are_created_paused_and_unpaused_on_request() {
        let engine = MemoryEngine::new();
        let room = spawn_room(&engine).await;

        let alice = join_with_audio(&room, "alice").await;
        let (bob, _) = join_client(&room, "bob").await;
        room.request_transport(bob, TransportDirection::Consumer, Some(alice.audio))
            .await
            .unwrap();

        let options = room
            .consume(bob, alice.audio, MediaKind::Audio, audio_caps())
            .await
            .unwrap();
        assert_eq!(options.producer_id, alice.audio);
        assert_eq!(engine.consumer_paused(options.id), Some(true));

        room.unpause_consumer(bob, alice.audio, MediaKind::Audio)
            .await
            .unwrap();
        assert_eq!(engine.consumer_paused(options.id), Some(false));

        let err = room
            .unpause_consumer(bob, ProducerId::new(), MediaKind::Audio)
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::ConsumerNotFound(_)));
    }

    #[tokio::test]
    async fn video_consume_goes_through_the_audio_keyed_downstream() {
        let engine = MemoryEngine::new();
        let room = spawn_room(&engine).await;

        let alice = join_with_audio(&room, "alice").await;
        let video = room
            .produce(alice.session, MediaKind::Video, RtpParameters::default())
            .await
            .unwrap();

        let (bob, _) = join_client(&room, "bob").await;
        room.request_transport(bob, TransportDirection::Consumer, Some(alice.audio))
            .await
            .unwrap();

        let caps = RtpCapabilities(json!({
            "codecs": [{ "mimeType": "video/VP8", "clockRate": 90000 }]
        }));
        let options = room.consume(bob, video, MediaKind::Video, caps).await.unwrap();
        assert_eq!(options.kind, MediaKind::Video);
        assert_eq!(options.producer_id, video);
    }

    #[tokio::test]
    async fn audio_change_pauses_only_the_audio_producer() {
        let engine = MemoryEngine::new();
        let room = spawn_room(&engine).await;

        let alice = join_with_audio(&room, "alice").await;
        let video = room
            .produce(alice.session, MediaKind::Video, RtpParameters::default())
            .await
            .unwrap();
        room.settle().await;

        room.set_audio_enabled(alice.session, false).await.unwrap();
        room.settle().await;
        assert_eq!(engine.producer_paused(alice.audio), Some(true));
        assert_eq!(engine.producer_paused(video), Some(false));

        room.set_audio_enabled(alice.session, true).await.unwrap();
        room.settle().await;
        assert_eq!(engine.producer_paused(alice.audio), Some(false));
    }

    #[tokio::test]
    async fn chat_messages_are_stored_and_broadcast() {
        let engine = MemoryEngine::new();
        let room = spawn_room(&engine).await;

        let (_, alice_peer) = join_client(&room, "alice").await;
        let (_, bob_peer) = join_client(&room, "bob").await;

        room.add_message("alice".to_string(), "hello".to_string())
            .await
            .unwrap();

        for peer in [&alice_peer, &bob_peer] {
            let event = peer.last_event("newMessage").unwrap();
            assert_eq!(event["userName"], "alice");
            assert_eq!(event["text"], "hello");
        }

        let data = room
            .join(SessionId::new(), "carol".to_string(), RecordingPeer::new())
            .await
            .unwrap();
        assert_eq!(data.messages.len(), 1);
        assert_eq!(data.messages[0].text, "hello");
    }

    #[tokio::test]
    async fn leaving_closes_media_and_empty_room_closes_itself() {
        let engine = MemoryEngine::new();
        let room = spawn_room(&engine).await;

        let alice = join_with_audio(&room, "alice").await;
        let bob = join_with_audio(&room, "bob").await;
        room.settle().await;
        assert!(engine.observed_producers().contains(&alice.audio));

        room.remove_client(alice.session).await;
        room.settle().await;
        assert_eq!(engine.producer_closed(alice.audio), Some(true));
        assert!(!engine.observed_producers().contains(&alice.audio));
        assert!(!room.is_closed());

        room.remove_client(bob.session).await;
        assert!(room.is_closed());

        let err = room
            .join(SessionId::new(), "late".to_string(), RecordingPeer::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::RoomClosed));
    }

    #[tokio::test]
    async fn stale_dominant_events_do_not_resurrect_a_leaver() {
        let engine = MemoryEngine::new();
        let room = spawn_room(&engine).await;

        let alice = join_with_audio(&room, "alice").await;
        let bob = join_with_audio(&room, "bob").await;
        room.remove_client(alice.session).await;

        // A stale event for alice's pid may still be in flight.
        room.triggers
            .send(PolicyTrigger::Dominant(alice.audio))
            .await
            .unwrap();
        room.settle().await;

        let event = bob.peer.last_event("updateActiveSpeakers").unwrap();
        assert_eq!(
            event["activeSpeakerList"],
            serde_json::to_value(vec![bob.audio]).unwrap()
        );
    }
}
