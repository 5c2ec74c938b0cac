#![forbid(unsafe_code)]

// sendpath - WebRTC send-path signaling server over mediasoup

pub mod media;
pub mod metrics;
pub mod room;
pub mod session;
pub mod signaling;
