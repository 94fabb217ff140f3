#![forbid(unsafe_code)]

// In-memory media engine - process-local implementation of the engine
// capability traits. Carries no media; tracks enough state (pause flags,
// liveness, observer membership) for development mode and the test suite,
// which drives dominant-speaker events through it directly.

use crate::engine::types::{
    ConsumerId, DtlsParameters, IceCandidates, IceParameters, ListenConfig, MediaKind,
    ProducerId, RouterCodecs, RtpCapabilities, RtpParameters, TransportId, TransportParams,
    WorkerId,
};
use crate::engine::{
    AudioObserver, DominantSpeakerCallback, EngineError, EngineResult, MediaConsumer,
    MediaEngine, MediaProducer, MediaRouter, MediaTransport, MediaWorker,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

struct ProducerState {
    kind: MediaKind,
    paused: bool,
    closed: bool,
}

struct ConsumerState {
    paused: bool,
    closed: bool,
}

struct TransportState {
    connected: bool,
    closed: bool,
}

#[derive(Default)]
struct EngineState {
    workers: Vec<(WorkerId, f64)>,
    routers_created: u64,
    transports: HashMap<TransportId, TransportState>,
    producers: HashMap<ProducerId, ProducerState>,
    consumers: HashMap<ConsumerId, ConsumerState>,
    next_port: u16,
    next_ssrc: u32,
}

struct EngineShared {
    state: StdRwLock<EngineState>,
    observers: StdRwLock<Vec<Weak<ObserverShared>>>,
}

/// Process-local media engine.
#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<EngineShared>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(EngineShared {
                state: StdRwLock::new(EngineState {
                    next_port: 40_000,
                    next_ssrc: 0x1000_0000,
                    ..EngineState::default()
                }),
                observers: StdRwLock::new(Vec::new()),
            }),
        }
    }

    /// Injects a dominant-speaker event for `producer`, firing the callback
    /// of every live observer the producer is registered with. Returns
    /// whether any callback fired.
    pub fn drive_dominant_speaker(&self, producer: ProducerId) -> bool {
        let observers: Vec<Arc<ObserverShared>> = {
            let mut list = self.shared.observers.write().unwrap_or_else(|e| e.into_inner());
            list.retain(|w| w.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };

        let mut fired = false;
        for observer in observers {
            if observer.closed.load(Ordering::Relaxed) {
                continue;
            }
            let registered = {
                let producers = observer.producers.read().unwrap_or_else(|e| e.into_inner());
                producers.contains(&producer)
            };
            if !registered {
                continue;
            }
            let callback = observer.callback.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cb) = callback.as_ref() {
                cb(producer);
                fired = true;
            }
        }
        fired
    }

    // --- Inspection hooks ---

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        let state = self.shared.state.read().unwrap_or_else(|e| e.into_inner());
        state.workers.iter().map(|(id, _)| *id).collect()
    }

    pub fn set_worker_usage(&self, worker: WorkerId, usage: f64) {
        let mut state = self.shared.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = state.workers.iter_mut().find(|(id, _)| *id == worker) {
            entry.1 = usage;
        }
    }

    pub fn router_count(&self) -> u64 {
        let state = self.shared.state.read().unwrap_or_else(|e| e.into_inner());
        state.routers_created
    }

    pub fn transport_connected(&self, transport: TransportId) -> Option<bool> {
        let state = self.shared.state.read().unwrap_or_else(|e| e.into_inner());
        state.transports.get(&transport).map(|t| t.connected)
    }

    pub fn producer_paused(&self, producer: ProducerId) -> Option<bool> {
        let state = self.shared.state.read().unwrap_or_else(|e| e.into_inner());
        state.producers.get(&producer).map(|p| p.paused)
    }

    pub fn producer_closed(&self, producer: ProducerId) -> Option<bool> {
        let state = self.shared.state.read().unwrap_or_else(|e| e.into_inner());
        state.producers.get(&producer).map(|p| p.closed)
    }

    pub fn consumer_paused(&self, consumer: ConsumerId) -> Option<bool> {
        let state = self.shared.state.read().unwrap_or_else(|e| e.into_inner());
        state.consumers.get(&consumer).map(|c| c.paused)
    }

    pub fn consumer_closed(&self, consumer: ConsumerId) -> Option<bool> {
        let state = self.shared.state.read().unwrap_or_else(|e| e.into_inner());
        state.consumers.get(&consumer).map(|c| c.closed)
    }

    /// Number of consumers that have been created and not yet closed.
    pub fn consumer_count(&self) -> usize {
        let state = self.shared.state.read().unwrap_or_else(|e| e.into_inner());
        state.consumers.values().filter(|c| !c.closed).count()
    }

    /// Producers currently registered with any live observer.
    pub fn observed_producers(&self) -> Vec<ProducerId> {
        let observers = self.shared.observers.read().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        for observer in observers.iter().filter_map(Weak::upgrade) {
            let producers = observer.producers.read().unwrap_or_else(|e| e.into_inner());
            out.extend(producers.iter().copied());
        }
        out
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for MemoryEngine {
    async fn spawn_worker(&self) -> EngineResult<Arc<dyn MediaWorker>> {
        let id = WorkerId::new();
        {
            let mut state = self.shared.state.write().unwrap_or_else(|e| e.into_inner());
            state.workers.push((id, 0.0));
        }
        debug!("Memory engine spawned worker {}", id);
        Ok(Arc::new(InMemoryWorker {
            id,
            shared: self.shared.clone(),
        }))
    }
}

struct InMemoryWorker {
    id: WorkerId,
    shared: Arc<EngineShared>,
}

#[async_trait]
impl MediaWorker for InMemoryWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn usage(&self) -> EngineResult<f64> {
        let state = self.shared.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .workers
            .iter()
            .find(|(id, _)| *id == self.id)
            .map(|(_, usage)| *usage)
            .ok_or_else(|| EngineError::Worker(format!("Unknown worker: {}", self.id)))
    }

    async fn create_router(&self, codecs: &RouterCodecs) -> EngineResult<Arc<dyn MediaRouter>> {
        {
            let mut state = self.shared.state.write().unwrap_or_else(|e| e.into_inner());
            state.routers_created += 1;
        }
        debug!("Memory engine created router on worker {}", self.id);
        Ok(Arc::new(InMemoryRouter {
            codecs: codecs.clone(),
            closed: AtomicBool::new(false),
            shared: self.shared.clone(),
        }))
    }
}

struct InMemoryRouter {
    codecs: RouterCodecs,
    closed: AtomicBool,
    shared: Arc<EngineShared>,
}

#[async_trait]
impl MediaRouter for InMemoryRouter {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities(json!({
            "codecs": self.codecs.0,
            "headerExtensions": [],
        }))
    }

    async fn can_consume(&self, producer: ProducerId, capabilities: &RtpCapabilities) -> bool {
        let kind = {
            let state = self.shared.state.read().unwrap_or_else(|e| e.into_inner());
            match state.producers.get(&producer) {
                Some(p) if !p.closed => p.kind,
                _ => return false,
            }
        };
        caps_support(capabilities, kind)
    }

    async fn create_transport(
        &self,
        listen: &ListenConfig,
    ) -> EngineResult<Arc<dyn MediaTransport>> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(EngineError::Router("Router is closed".to_string()));
        }

        let id = TransportId::new();
        let port = {
            let mut state = self.shared.state.write().unwrap_or_else(|e| e.into_inner());
            state.transports.insert(
                id,
                TransportState {
                    connected: false,
                    closed: false,
                },
            );
            let port = state.next_port;
            state.next_port = state.next_port.wrapping_add(1).max(40_000);
            port
        };

        Ok(Arc::new(InMemoryTransport {
            id,
            params: make_transport_params(id, listen, port),
            shared: self.shared.clone(),
        }))
    }

    async fn create_audio_observer(
        &self,
        interval: Duration,
    ) -> EngineResult<Arc<dyn AudioObserver>> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(EngineError::Router("Router is closed".to_string()));
        }

        let observer = Arc::new(ObserverShared {
            producers: StdRwLock::new(HashSet::new()),
            callback: StdRwLock::new(None),
            closed: AtomicBool::new(false),
        });
        {
            let mut observers = self.shared.observers.write().unwrap_or_else(|e| e.into_inner());
            observers.push(Arc::downgrade(&observer));
        }
        debug!("Memory engine created audio observer (interval {:?})", interval);
        Ok(Arc::new(InMemoryObserver { shared: observer }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

struct InMemoryTransport {
    id: TransportId,
    params: TransportParams,
    shared: Arc<EngineShared>,
}

impl InMemoryTransport {
    fn ensure_open(&self) -> EngineResult<()> {
        let state = self.shared.state.read().unwrap_or_else(|e| e.into_inner());
        match state.transports.get(&self.id) {
            Some(t) if !t.closed => Ok(()),
            _ => Err(EngineError::Transport(format!(
                "Transport is closed: {}",
                self.id
            ))),
        }
    }
}

#[async_trait]
impl MediaTransport for InMemoryTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn params(&self) -> TransportParams {
        self.params.clone()
    }

    async fn connect(&self, _dtls: DtlsParameters) -> EngineResult<()> {
        self.ensure_open()?;
        let mut state = self.shared.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(t) = state.transports.get_mut(&self.id) {
            t.connected = true;
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        _rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn MediaProducer>> {
        self.ensure_open()
            .map_err(|e| EngineError::Producer(e.to_string()))?;

        let id = ProducerId::new();
        {
            let mut state = self.shared.state.write().unwrap_or_else(|e| e.into_inner());
            state.producers.insert(
                id,
                ProducerState {
                    kind,
                    paused: false,
                    closed: false,
                },
            );
        }
        debug!("Memory engine created {} producer {}", kind, id);
        Ok(Arc::new(InMemoryProducer {
            id,
            kind,
            shared: self.shared.clone(),
        }))
    }

    async fn consume(
        &self,
        producer: ProducerId,
        capabilities: RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn MediaConsumer>> {
        self.ensure_open()
            .map_err(|e| EngineError::Consumer(e.to_string()))?;

        let (kind, ssrc) = {
            let mut state = self.shared.state.write().unwrap_or_else(|e| e.into_inner());
            let kind = match state.producers.get(&producer) {
                Some(p) if !p.closed => p.kind,
                _ => {
                    return Err(EngineError::Consumer(format!(
                        "Producer not found: {producer}"
                    )))
                }
            };
            let ssrc = state.next_ssrc;
            state.next_ssrc = state.next_ssrc.wrapping_add(1);
            (kind, ssrc)
        };

        let id = ConsumerId::new();
        let rtp_parameters = RtpParameters(json!({
            "codecs": filter_codecs(&capabilities, kind),
            "headerExtensions": [],
            "encodings": [{ "ssrc": ssrc }],
            "rtcp": { "reducedSize": true },
        }));
        {
            let mut state = self.shared.state.write().unwrap_or_else(|e| e.into_inner());
            state.consumers.insert(id, ConsumerState { paused, closed: false });
        }
        debug!("Memory engine created {} consumer {} for producer {}", kind, id, producer);
        Ok(Arc::new(InMemoryConsumer {
            id,
            producer_id: producer,
            kind,
            rtp_parameters,
            shared: self.shared.clone(),
        }))
    }

    async fn close(&self) {
        let mut state = self.shared.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(t) = state.transports.get_mut(&self.id) {
            t.closed = true;
        }
    }
}

struct InMemoryProducer {
    id: ProducerId,
    kind: MediaKind,
    shared: Arc<EngineShared>,
}

impl InMemoryProducer {
    fn set_paused(&self, paused: bool) -> EngineResult<()> {
        let mut state = self.shared.state.write().unwrap_or_else(|e| e.into_inner());
        match state.producers.get_mut(&self.id) {
            Some(p) if !p.closed => {
                p.paused = paused;
                Ok(())
            }
            _ => Err(EngineError::Producer(format!(
                "Producer is closed: {}",
                self.id
            ))),
        }
    }
}

#[async_trait]
impl MediaProducer for InMemoryProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn pause(&self) -> EngineResult<()> {
        self.set_paused(true)
    }

    async fn resume(&self) -> EngineResult<()> {
        self.set_paused(false)
    }

    async fn close(&self) {
        let mut state = self.shared.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(p) = state.producers.get_mut(&self.id) {
            p.closed = true;
        }
    }
}

struct InMemoryConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    shared: Arc<EngineShared>,
}

impl InMemoryConsumer {
    fn set_paused(&self, paused: bool) -> EngineResult<()> {
        let mut state = self.shared.state.write().unwrap_or_else(|e| e.into_inner());
        match state.consumers.get_mut(&self.id) {
            Some(c) if !c.closed => {
                c.paused = paused;
                Ok(())
            }
            _ => Err(EngineError::Consumer(format!(
                "Consumer is closed: {}",
                self.id
            ))),
        }
    }
}

#[async_trait]
impl MediaConsumer for InMemoryConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn pause(&self) -> EngineResult<()> {
        self.set_paused(true)
    }

    async fn resume(&self) -> EngineResult<()> {
        self.set_paused(false)
    }

    async fn close(&self) {
        let mut state = self.shared.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(c) = state.consumers.get_mut(&self.id) {
            c.closed = true;
        }
    }
}

struct ObserverShared {
    producers: StdRwLock<HashSet<ProducerId>>,
    callback: StdRwLock<Option<DominantSpeakerCallback>>,
    closed: AtomicBool,
}

struct InMemoryObserver {
    shared: Arc<ObserverShared>,
}

#[async_trait]
impl AudioObserver for InMemoryObserver {
    async fn add_producer(&self, producer: ProducerId) -> EngineResult<()> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(EngineError::Observer("Observer is closed".to_string()));
        }
        let mut producers = self.shared.producers.write().unwrap_or_else(|e| e.into_inner());
        producers.insert(producer);
        Ok(())
    }

    async fn remove_producer(&self, producer: ProducerId) -> EngineResult<()> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(EngineError::Observer("Observer is closed".to_string()));
        }
        let mut producers = self.shared.producers.write().unwrap_or_else(|e| e.into_inner());
        producers.remove(&producer);
        Ok(())
    }

    fn on_dominant_speaker(&self, callback: DominantSpeakerCallback) {
        let mut slot = self.shared.callback.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(callback);
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::Relaxed);
        // Drop the callback so anything it captured is released.
        let mut slot = self.shared.callback.write().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
}

fn make_transport_params(id: TransportId, listen: &ListenConfig, port: u16) -> TransportParams {
    let advertised = listen.announced_ip.unwrap_or(listen.listen_ip);
    TransportParams {
        id,
        ice_parameters: IceParameters(json!({
            "usernameFragment": Uuid::new_v4().simple().to_string(),
            "password": Uuid::new_v4().simple().to_string(),
            "iceLite": true,
        })),
        ice_candidates: IceCandidates(json!([{
            "foundation": "udpcandidate",
            "priority": 1_076_302_079u32,
            "address": advertised.to_string(),
            "protocol": "udp",
            "port": port,
            "type": "host",
        }])),
        dtls_parameters: DtlsParameters(json!({
            "role": "auto",
            "fingerprints": [{
                "algorithm": "sha-256",
                "value": Uuid::new_v4().simple().to_string(),
            }],
        })),
    }
}

fn caps_support(capabilities: &RtpCapabilities, kind: MediaKind) -> bool {
    let prefix = match kind {
        MediaKind::Audio => "audio/",
        MediaKind::Video => "video/",
    };
    capabilities
        .0
        .get("codecs")
        .and_then(Value::as_array)
        .map(|codecs| {
            codecs.iter().any(|codec| {
                codec
                    .get("mimeType")
                    .and_then(Value::as_str)
                    .map(|m| m.to_ascii_lowercase().starts_with(prefix))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

fn filter_codecs(capabilities: &RtpCapabilities, kind: MediaKind) -> Vec<Value> {
    let prefix = match kind {
        MediaKind::Audio => "audio/",
        MediaKind::Video => "video/",
    };
    capabilities
        .0
        .get("codecs")
        .and_then(Value::as_array)
        .map(|codecs| {
            codecs
                .iter()
                .filter(|codec| {
                    codec
                        .get("mimeType")
                        .and_then(Value::as_str)
                        .map(|m| m.to_ascii_lowercase().starts_with(prefix))
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::default_media_codecs;

    async fn make_router(engine: &MemoryEngine) -> Arc<dyn MediaRouter> {
        let worker = engine.spawn_worker().await.unwrap();
        worker.create_router(&default_media_codecs()).await.unwrap()
    }

    #[tokio::test]
    async fn can_consume_requires_matching_kind() {
        let engine = MemoryEngine::new();
        let router = make_router(&engine).await;
        let transport = router
            .create_transport(&ListenConfig::default())
            .await
            .unwrap();
        let producer = transport
            .produce(MediaKind::Audio, RtpParameters::default())
            .await
            .unwrap();

        let audio_caps = RtpCapabilities(json!({
            "codecs": [{ "mimeType": "audio/opus", "clockRate": 48000 }]
        }));
        let video_caps = RtpCapabilities(json!({
            "codecs": [{ "mimeType": "video/VP8", "clockRate": 90000 }]
        }));
        let empty_caps = RtpCapabilities(json!({ "codecs": [] }));

        assert!(router.can_consume(producer.id(), &audio_caps).await);
        assert!(!router.can_consume(producer.id(), &video_caps).await);
        assert!(!router.can_consume(producer.id(), &empty_caps).await);
    }

    #[tokio::test]
    async fn closed_producer_cannot_be_consumed() {
        let engine = MemoryEngine::new();
        let router = make_router(&engine).await;
        let transport = router
            .create_transport(&ListenConfig::default())
            .await
            .unwrap();
        let producer = transport
            .produce(MediaKind::Audio, RtpParameters::default())
            .await
            .unwrap();

        let caps = router.rtp_capabilities();
        assert!(router.can_consume(producer.id(), &caps).await);

        producer.close().await;
        assert!(!router.can_consume(producer.id(), &caps).await);
        assert!(transport.consume(producer.id(), caps, true).await.is_err());
    }

    #[tokio::test]
    async fn consumers_start_paused_when_requested() {
        let engine = MemoryEngine::new();
        let router = make_router(&engine).await;
        let transport = router
            .create_transport(&ListenConfig::default())
            .await
            .unwrap();
        let producer = transport
            .produce(MediaKind::Audio, RtpParameters::default())
            .await
            .unwrap();

        let consumer = transport
            .consume(producer.id(), router.rtp_capabilities(), true)
            .await
            .unwrap();
        assert_eq!(engine.consumer_paused(consumer.id()), Some(true));

        consumer.resume().await.unwrap();
        assert_eq!(engine.consumer_paused(consumer.id()), Some(false));
        consumer.pause().await.unwrap();
        assert_eq!(engine.consumer_paused(consumer.id()), Some(true));
    }

    #[tokio::test]
    async fn dominant_speaker_fires_only_for_registered_producers() {
        let engine = MemoryEngine::new();
        let router = make_router(&engine).await;
        let transport = router
            .create_transport(&ListenConfig::default())
            .await
            .unwrap();
        let registered = transport
            .produce(MediaKind::Audio, RtpParameters::default())
            .await
            .unwrap();
        let unregistered = transport
            .produce(MediaKind::Audio, RtpParameters::default())
            .await
            .unwrap();

        let observer = router
            .create_audio_observer(Duration::from_millis(300))
            .await
            .unwrap();
        observer.add_producer(registered.id()).await.unwrap();

        let seen = Arc::new(StdRwLock::new(Vec::new()));
        let sink = seen.clone();
        observer.on_dominant_speaker(Box::new(move |pid| {
            sink.write().unwrap().push(pid);
        }));

        assert!(engine.drive_dominant_speaker(registered.id()));
        assert!(!engine.drive_dominant_speaker(unregistered.id()));
        assert_eq!(seen.read().unwrap().as_slice(), &[registered.id()]);
    }
}
