#![forbid(unsafe_code)]

// Session state - per-client media handles tracked by a room

use crate::engine::types::{MediaKind, ProducerId, SessionId, TransportParams};
use crate::engine::{MediaConsumer, MediaProducer, MediaTransport};
use crate::peer::PeerHandle;
use crate::room::speaker::ClientView;
use std::sync::Arc;

/// Upstream (send) transport of one client.
pub struct UpstreamTransport {
    pub transport: Arc<dyn MediaTransport>,
    pub params: TransportParams,
}

/// Downstream (receive) transport toward one remote client, keyed by the
/// remote client's audio producer id. The video pid is filled in lazily
/// since the remote may produce video after this entry was created.
pub struct DownstreamEntry {
    pub remote_audio_pid: ProducerId,
    pub remote_video_pid: Option<ProducerId>,
    pub transport: Arc<dyn MediaTransport>,
    pub params: TransportParams,
    pub audio_consumer: Option<Arc<dyn MediaConsumer>>,
    pub video_consumer: Option<Arc<dyn MediaConsumer>>,
}

impl DownstreamEntry {
    pub fn new(
        remote_audio_pid: ProducerId,
        transport: Arc<dyn MediaTransport>,
        params: TransportParams,
    ) -> Self {
        Self {
            remote_audio_pid,
            remote_video_pid: None,
            transport,
            params,
            audio_consumer: None,
            video_consumer: None,
        }
    }

    pub fn consumer(&self, kind: MediaKind) -> Option<&Arc<dyn MediaConsumer>> {
        match kind {
            MediaKind::Audio => self.audio_consumer.as_ref(),
            MediaKind::Video => self.video_consumer.as_ref(),
        }
    }

    /// Installs a consumer, returning the one it displaced, if any.
    pub fn replace_consumer(
        &mut self,
        kind: MediaKind,
        consumer: Arc<dyn MediaConsumer>,
    ) -> Option<Arc<dyn MediaConsumer>> {
        match kind {
            MediaKind::Audio => self.audio_consumer.replace(consumer),
            MediaKind::Video => self.video_consumer.replace(consumer),
        }
    }
}

/// Media resources stripped from a client on removal, ready to close.
#[derive(Default)]
pub struct ClientResources {
    pub transports: Vec<Arc<dyn MediaTransport>>,
    pub producers: Vec<Arc<dyn MediaProducer>>,
    pub consumers: Vec<Arc<dyn MediaConsumer>>,
}

/// One connected client inside a room.
pub struct Client {
    pub session_id: SessionId,
    pub user_name: String,
    pub peer: Arc<dyn PeerHandle>,
    pub upstream: Option<UpstreamTransport>,
    pub audio_producer: Option<Arc<dyn MediaProducer>>,
    pub video_producer: Option<Arc<dyn MediaProducer>>,
    pub downstreams: Vec<DownstreamEntry>,
}

impl Client {
    pub fn new(session_id: SessionId, user_name: String, peer: Arc<dyn PeerHandle>) -> Self {
        Self {
            session_id,
            user_name,
            peer,
            upstream: None,
            audio_producer: None,
            video_producer: None,
            downstreams: Vec::new(),
        }
    }

    pub fn downstream(&self, remote_audio_pid: ProducerId) -> Option<&DownstreamEntry> {
        self.downstreams
            .iter()
            .find(|d| d.remote_audio_pid == remote_audio_pid)
    }

    pub fn downstream_mut(&mut self, remote_audio_pid: ProducerId) -> Option<&mut DownstreamEntry> {
        self.downstreams
            .iter_mut()
            .find(|d| d.remote_audio_pid == remote_audio_pid)
    }

    pub fn producer(&self, kind: MediaKind) -> Option<&Arc<dyn MediaProducer>> {
        match kind {
            MediaKind::Audio => self.audio_producer.as_ref(),
            MediaKind::Video => self.video_producer.as_ref(),
        }
    }

    pub fn set_producer(&mut self, kind: MediaKind, producer: Arc<dyn MediaProducer>) {
        match kind {
            MediaKind::Audio => self.audio_producer = Some(producer),
            MediaKind::Video => self.video_producer = Some(producer),
        }
    }

    pub fn audio_pid(&self) -> Option<ProducerId> {
        self.audio_producer.as_ref().map(|p| p.id())
    }

    pub fn video_pid(&self) -> Option<ProducerId> {
        self.video_producer.as_ref().map(|p| p.id())
    }

    /// Audio pids of the remote clients this client holds downstreams for.
    pub fn subscribed_audio_pids(&self) -> Vec<ProducerId> {
        self.downstreams.iter().map(|d| d.remote_audio_pid).collect()
    }

    /// Snapshot used by the active-speaker policy.
    pub fn view(&self) -> ClientView {
        ClientView {
            session: self.session_id,
            audio_pid: self.audio_pid(),
            subscribed: self.subscribed_audio_pids(),
        }
    }

    /// Strips every media handle off the client so the caller can close
    /// them without holding the room lock.
    pub fn take_resources(&mut self) -> ClientResources {
        let mut resources = ClientResources::default();
        if let Some(upstream) = self.upstream.take() {
            resources.transports.push(upstream.transport);
        }
        if let Some(producer) = self.audio_producer.take() {
            resources.producers.push(producer);
        }
        if let Some(producer) = self.video_producer.take() {
            resources.producers.push(producer);
        }
        for mut entry in self.downstreams.drain(..) {
            if let Some(consumer) = entry.audio_consumer.take() {
                resources.consumers.push(consumer);
            }
            if let Some(consumer) = entry.video_consumer.take() {
                resources.consumers.push(consumer);
            }
            resources.transports.push(entry.transport);
        }
        resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::default_media_codecs;
    use crate::engine::memory::MemoryEngine;
    use crate::engine::types::{ListenConfig, RtpParameters};
    use crate::engine::MediaEngine;
    use crate::peer::RecordingPeer;

    async fn client_with_media(engine: &MemoryEngine) -> Client {
        let worker = engine.spawn_worker().await.unwrap();
        let router = worker.create_router(&default_media_codecs()).await.unwrap();
        let transport = router
            .create_transport(&ListenConfig::default())
            .await
            .unwrap();
        let params = transport.params();

        let mut client = Client::new(SessionId::new(), "alice".to_string(), RecordingPeer::new());
        client.upstream = Some(UpstreamTransport {
            transport: transport.clone(),
            params: params.clone(),
        });
        let audio = transport
            .produce(MediaKind::Audio, RtpParameters::default())
            .await
            .unwrap();
        client.set_producer(MediaKind::Audio, audio);

        let remote = ProducerId::new();
        let down = router
            .create_transport(&ListenConfig::default())
            .await
            .unwrap();
        let down_params = down.params();
        client
            .downstreams
            .push(DownstreamEntry::new(remote, down, down_params));
        client
    }

    #[tokio::test]
    async fn producers_are_tracked_per_kind() {
        let engine = MemoryEngine::new();
        let client = client_with_media(&engine).await;

        assert!(client.audio_pid().is_some());
        assert!(client.video_pid().is_none());
        assert!(client.producer(MediaKind::Audio).is_some());
        assert!(client.producer(MediaKind::Video).is_none());
    }

    #[tokio::test]
    async fn take_resources_strips_everything() {
        let engine = MemoryEngine::new();
        let mut client = client_with_media(&engine).await;

        let resources = client.take_resources();
        assert_eq!(resources.transports.len(), 2);
        assert_eq!(resources.producers.len(), 1);
        assert!(resources.consumers.is_empty());

        assert!(client.upstream.is_none());
        assert!(client.audio_producer.is_none());
        assert!(client.downstreams.is_empty());
    }

    #[tokio::test]
    async fn view_reports_subscriptions() {
        let engine = MemoryEngine::new();
        let client = client_with_media(&engine).await;

        let view = client.view();
        assert_eq!(view.audio_pid, client.audio_pid());
        assert_eq!(view.subscribed.len(), 1);
        assert_eq!(view.subscribed[0], client.downstreams[0].remote_audio_pid);
    }
}
