#![forbid(unsafe_code)]

// Engine types - identifiers and opaque payloads exchanged with the media engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

/// Namespace for deriving room ids from room names (uuid v5).
/// Same name always maps to the same room id.
const ROOM_ID_NAMESPACE: Uuid = Uuid::from_u128(0x8f3c_1b7a_42d6_4e1f_9a05_c4d8_27b3_66e1);

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

id_type!(
    /// Identifies one conferencing room.
    RoomId
);
id_type!(
    /// Identifies one connected peer (one signaling connection).
    SessionId
);
id_type!(
    /// Identifies one media-engine worker process.
    WorkerId
);
id_type!(
    /// Identifies one WebRTC transport inside the engine.
    TransportId
);
id_type!(
    /// Identifies one RTP producer. Audio producer ids double as the
    /// correlation key for active-speaker ranking and downstream transports.
    ProducerId
);
id_type!(
    /// Identifies one RTP consumer.
    ConsumerId
);

impl RoomId {
    /// Derives the room id from its display name. Deterministic: repeated
    /// creation of a room with the same name yields the same id.
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&ROOM_ID_NAMESPACE, name.as_bytes()))
    }
}

/// Media kind of a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

macro_rules! opaque_payload {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub serde_json::Value);
    };
}

// The signaling core relays these blobs between clients and the engine
// without interpreting them.
opaque_payload!(
    /// RTP capabilities of a router or a receiving client.
    RtpCapabilities
);
opaque_payload!(
    /// RTP send/receive parameters for a producer or consumer.
    RtpParameters
);
opaque_payload!(
    /// DTLS parameters from the remote end of a transport handshake.
    DtlsParameters
);
opaque_payload!(
    /// ICE parameters of a server-side transport.
    IceParameters
);
opaque_payload!(
    /// ICE candidate list of a server-side transport.
    IceCandidates
);
opaque_payload!(
    /// Codec capability set used when creating a router.
    RouterCodecs
);

/// Parameters a client needs to complete the ICE/DTLS handshake for one
/// server-side transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: IceCandidates,
    pub dtls_parameters: DtlsParameters,
}

/// Listen configuration for engine transports.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub listen_ip: IpAddr,
    /// Public IP announced in ICE candidates (behind NAT). Falls back to
    /// `listen_ip` when unset.
    pub announced_ip: Option<IpAddr>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            announced_ip: None,
        }
    }
}
