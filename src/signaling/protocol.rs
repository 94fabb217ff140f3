#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use crate::engine::types::{
    ConsumerId, DtlsParameters, MediaKind, ProducerId, RoomId, RtpCapabilities, RtpParameters,
    SessionId, TransportParams,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientRequest {
    /// Create a room (or fetch it if the name already exists)
    #[serde(rename_all = "camelCase")]
    CreateRoom {
        room_name: String,
    },
    /// Join a room by id
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        user_name: String,
        room_id: RoomId,
    },
    /// Send a chat message to the current room
    #[serde(rename_all = "camelCase")]
    SendMessage {
        text: String,
        user_name: String,
        room_id: RoomId,
    },
    /// Create a WebRTC transport. Consumer transports are keyed by the
    /// audio producer id of the remote client they will pull from.
    #[serde(rename_all = "camelCase")]
    RequestTransport {
        direction: TransportDirection,
        #[serde(default)]
        audio_pid: Option<ProducerId>,
    },
    /// Finish the DTLS handshake on a previously created transport
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
        #[serde(default)]
        audio_pid: Option<ProducerId>,
    },
    /// Start producing media on the upstream transport
    #[serde(rename_all = "camelCase")]
    StartProducing {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    /// Consume one track of a remote producer
    #[serde(rename_all = "camelCase")]
    ConsumeMedia {
        rtp_capabilities: RtpCapabilities,
        producer_id: ProducerId,
        kind: MediaKind,
    },
    /// Unpause a consumer once the client is ready to render it
    #[serde(rename_all = "camelCase")]
    UnpauseConsumer {
        producer_id: ProducerId,
        kind: MediaKind,
    },
    /// Mute or unmute the client's own audio
    AudioChange {
        action: AudioAction,
    },
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Sent once on connect with the session id and the room directory
    #[serde(rename_all = "camelCase")]
    Welcome {
        session_id: SessionId,
        rooms: Vec<RoomSummary>,
    },
    /// Room created (or already existed under that name)
    #[serde(rename_all = "camelCase")]
    RoomCreated {
        room_id: RoomId,
        room_name: String,
    },
    /// Joined a room; carries everything needed to start consuming
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        consume_data: ConsumeData,
        new_room: bool,
        messages: Vec<ChatMessage>,
    },
    /// Chat message from a client in the room
    NewMessage {
        #[serde(flatten)]
        message: ChatMessage,
    },
    /// Transport created
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        direction: TransportDirection,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_pid: Option<ProducerId>,
        #[serde(flatten)]
        params: TransportParams,
    },
    /// Transport DTLS connect result
    #[serde(rename_all = "camelCase")]
    TransportConnected {
        direction: TransportDirection,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_pid: Option<ProducerId>,
        status: AckStatus,
    },
    /// Producer created
    #[serde(rename_all = "camelCase")]
    ProducerCreated {
        id: ProducerId,
        kind: MediaKind,
    },
    /// Consumer created, paused, ready for the client to unpause
    #[serde(rename_all = "camelCase")]
    ConsumerCreated {
        consumer_options: ConsumerOptions,
    },
    /// Consume request refused or failed
    #[serde(rename_all = "camelCase")]
    ConsumeFailed {
        producer_id: ProducerId,
        kind: MediaKind,
        status: ConsumeFailure,
    },
    /// Unpause result
    #[serde(rename_all = "camelCase")]
    ConsumerUnpaused {
        producer_id: ProducerId,
        kind: MediaKind,
        status: AckStatus,
    },
    /// Speakers entered the active window; consume their tracks
    NewProducersToConsume {
        #[serde(flatten)]
        consume_data: ConsumeData,
    },
    /// Active speaker window changed
    #[serde(rename_all = "camelCase")]
    UpdateActiveSpeakers {
        active_speaker_list: Vec<ProducerId>,
    },
    /// A new room appeared in the directory
    #[serde(rename_all = "camelCase")]
    NewRoom {
        room_id: RoomId,
        room_name: String,
    },
    /// Error response
    Error {
        message: String,
    },
}

/// Which side of the media path a transport serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Client-to-server (send) transport
    Producer,
    /// Server-to-client (receive) transport
    Consumer,
}

/// Own-audio mute toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioAction {
    Mute,
    Unmute,
}

/// Generic success/error acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
}

/// Why a consume request produced no consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConsumeFailure {
    /// Router rejected the capabilities for this producer
    CannotConsume,
    /// Engine failed while creating the consumer
    ConsumeFailed,
}

/// Everything a client needs to start consuming a set of speakers.
/// The four lists are parallel: entry `i` of each describes the same
/// remote client, keyed by its audio producer id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeData {
    pub router_rtp_capabilities: RtpCapabilities,
    pub audio_pids_to_create: Vec<ProducerId>,
    pub video_pids_to_create: Vec<Option<ProducerId>>,
    pub associated_user_names: Vec<String>,
    pub active_speaker_list: Vec<ProducerId>,
}

/// Parameters the client needs to instantiate a consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerOptions {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Directory entry for one room
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub room_name: String,
}

/// Chat message as stored and broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub user_name: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_room_parses_camel_case_fields() {
        let raw = json!({
            "type": "joinRoom",
            "userName": "alice",
            "roomId": "67e55044-10b1-426f-9247-bb680e5fe0c8",
        });
        let request: ClientRequest = serde_json::from_value(raw).unwrap();
        match request {
            ClientRequest::JoinRoom { user_name, .. } => assert_eq!(user_name, "alice"),
            other => panic!("Unexpected request: {other:?}"),
        }
    }

    #[test]
    fn request_transport_audio_pid_defaults_to_none() {
        let raw = json!({ "type": "requestTransport", "direction": "producer" });
        let request: ClientRequest = serde_json::from_value(raw).unwrap();
        match request {
            ClientRequest::RequestTransport { direction, audio_pid } => {
                assert_eq!(direction, TransportDirection::Producer);
                assert!(audio_pid.is_none());
            }
            other => panic!("Unexpected request: {other:?}"),
        }
    }

    #[test]
    fn transport_created_flattens_params() {
        let event = ServerEvent::TransportCreated {
            direction: TransportDirection::Consumer,
            audio_pid: Some(ProducerId::new()),
            params: TransportParams {
                id: crate::engine::types::TransportId::new(),
                ice_parameters: Default::default(),
                ice_candidates: Default::default(),
                dtls_parameters: Default::default(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "transportCreated");
        assert_eq!(value["direction"], "consumer");
        assert!(value.get("id").is_some());
        assert!(value.get("iceParameters").is_some());
        assert!(value.get("iceCandidates").is_some());
        assert!(value.get("dtlsParameters").is_some());
        assert!(value.get("params").is_none());
    }

    #[test]
    fn new_message_flattens_chat_fields() {
        let event = ServerEvent::NewMessage {
            message: ChatMessage {
                user_name: "bob".to_string(),
                text: "hi".to_string(),
                sent_at: Utc::now(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "newMessage");
        assert_eq!(value["userName"], "bob");
        assert_eq!(value["text"], "hi");
        assert!(value.get("sentAt").is_some());
    }

    #[test]
    fn audio_change_actions_are_lowercase() {
        let mute: ClientRequest =
            serde_json::from_value(json!({ "type": "audioChange", "action": "mute" })).unwrap();
        match mute {
            ClientRequest::AudioChange { action } => assert_eq!(action, AudioAction::Mute),
            other => panic!("Unexpected request: {other:?}"),
        }
    }

    #[test]
    fn consume_failure_statuses_are_camel_case() {
        let event = ServerEvent::ConsumeFailed {
            producer_id: ProducerId::new(),
            kind: MediaKind::Video,
            status: ConsumeFailure::CannotConsume,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["status"], "cannotConsume");
        assert_eq!(value["kind"], "video");
    }
}
