#![forbid(unsafe_code)]

// Greenroom library - SFU signaling and session orchestration server

pub mod engine;
pub mod metrics;
pub mod peer;
pub mod room;
pub mod session;
pub mod signaling;
