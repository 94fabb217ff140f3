#![forbid(unsafe_code)]

// Engine configuration - worker count, transport listen addresses, codec set

use crate::engine::types::{ListenConfig, RouterCodecs};
use serde_json::json;
use std::net::IpAddr;
use tracing::warn;

/// Configuration for the media engine and its routers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub num_workers: usize,
    pub listen: ListenConfig,
    pub codecs: RouterCodecs,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            listen: ListenConfig::default(),
            codecs: default_media_codecs(),
        }
    }
}

impl EngineConfig {
    /// Builds a configuration from environment variables, falling back to
    /// defaults: `NUM_WORKERS` (default: CPU count), `LISTEN_IP`
    /// (default: 127.0.0.1).
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = std::env::var("NUM_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            if n == 0 {
                warn!("NUM_WORKERS=0 is invalid, using {}", config.num_workers);
            } else {
                config.num_workers = n;
            }
        }

        if let Ok(ip) = std::env::var("LISTEN_IP") {
            match ip.parse::<IpAddr>() {
                Ok(addr) => config.listen.listen_ip = addr,
                Err(_) => warn!("Invalid LISTEN_IP={}, using {}", ip, config.listen.listen_ip),
            }
        }

        config
    }
}

/// The server's fixed codec capability set: Opus for audio, VP8 for video.
/// Every router is created with exactly these capabilities.
pub fn default_media_codecs() -> RouterCodecs {
    RouterCodecs(json!([
        {
            "kind": "audio",
            "mimeType": "audio/opus",
            "preferredPayloadType": 111,
            "clockRate": 48000,
            "channels": 2,
            "parameters": {
                "minptime": 10,
                "useinbandfec": 1,
            },
        },
        {
            "kind": "video",
            "mimeType": "video/VP8",
            "preferredPayloadType": 96,
            "clockRate": 90000,
            "parameters": {
                "x-google-start-bitrate": 1000,
            },
        },
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_codecs_cover_both_kinds() {
        let codecs = default_media_codecs();
        let arr = codecs.0.as_array().unwrap();
        assert!(arr.iter().any(|c| c["kind"] == "audio"));
        assert!(arr.iter().any(|c| c["kind"] == "video"));
    }
}
