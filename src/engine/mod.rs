#![forbid(unsafe_code)]

// Media engine capability interface - the narrow surface the signaling core
// depends on. Worker processes, routers, transports, producers, consumers and
// the audio-level observer live in an external engine; the core only holds
// handles.

pub mod config;
pub mod memory;
pub mod pool;
pub mod types;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use types::{
    ConsumerId, DtlsParameters, ListenConfig, MediaKind, ProducerId, RouterCodecs,
    RtpCapabilities, RtpParameters, TransportId, TransportParams, WorkerId,
};

/// Custom error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Router error: {0}")]
    Router(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Producer error: {0}")]
    Producer(String),

    #[error("Consumer error: {0}")]
    Consumer(String),

    #[error("Observer error: {0}")]
    Observer(String),

    #[error("No workers available")]
    NoWorkers,
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Callback invoked by the engine's audio-level observer whenever it judges a
/// new audio producer dominant.
pub type DominantSpeakerCallback = Box<dyn Fn(ProducerId) + Send + Sync>;

/// Entry point into the media engine: spawns worker processes.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn spawn_worker(&self) -> EngineResult<Arc<dyn MediaWorker>>;
}

/// One engine worker process.
#[async_trait]
pub trait MediaWorker: Send + Sync {
    fn id(&self) -> WorkerId;

    /// Current CPU utilization as reported by the engine, in `[0.0, 1.0]`.
    async fn usage(&self) -> EngineResult<f64>;

    async fn create_router(&self, codecs: &RouterCodecs) -> EngineResult<Arc<dyn MediaRouter>>;
}

/// Per-room engine entity mediating capability negotiation.
#[async_trait]
pub trait MediaRouter: Send + Sync {
    /// RTP capabilities clients must load before consuming.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a client with the given capabilities can consume the producer.
    /// Absent or closed producers simply cannot be consumed.
    async fn can_consume(&self, producer: ProducerId, capabilities: &RtpCapabilities) -> bool;

    async fn create_transport(&self, listen: &ListenConfig)
        -> EngineResult<Arc<dyn MediaTransport>>;

    /// Creates an audio-level observer polling at `interval`.
    async fn create_audio_observer(&self, interval: Duration)
        -> EngineResult<Arc<dyn AudioObserver>>;

    async fn close(&self);
}

/// One WebRTC transport (upstream or downstream).
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> TransportId;

    /// Handshake parameters to hand to the client.
    fn params(&self) -> TransportParams;

    /// Finalizes DTLS with the remote end's parameters.
    async fn connect(&self, dtls: DtlsParameters) -> EngineResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn MediaProducer>>;

    /// Creates a consumer for `producer`. Callers pass `paused = true` so no
    /// media flows before the client has acknowledged the consumer.
    async fn consume(
        &self,
        producer: ProducerId,
        capabilities: RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn MediaConsumer>>;

    async fn close(&self);
}

/// A producer handle (one media track sent by a client).
#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    async fn pause(&self) -> EngineResult<()>;
    async fn resume(&self) -> EngineResult<()>;
    async fn close(&self);
}

/// A consumer handle (one remote track forwarded to a client).
#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;
    fn producer_id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    async fn pause(&self) -> EngineResult<()>;
    async fn resume(&self) -> EngineResult<()>;
    async fn close(&self);
}

/// Audio-level observer attached to a router. Producers registered here are
/// candidates for dominant-speaker detection.
#[async_trait]
pub trait AudioObserver: Send + Sync {
    async fn add_producer(&self, producer: ProducerId) -> EngineResult<()>;
    async fn remove_producer(&self, producer: ProducerId) -> EngineResult<()>;

    /// Registers the dominant-speaker callback. Replaces any previous one.
    fn on_dominant_speaker(&self, callback: DominantSpeakerCallback);

    async fn close(&self);
}
