#![forbid(unsafe_code)]

// Per-peer lifecycle state

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lifecycle of one peer connection.
///
/// ```text
/// Connected -> Joined -> TransportCreated -> TransportConnected -> Producing
///     any state --disconnect--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connected,
    Joined,
    TransportCreated,
    TransportConnected,
    Producing,
    Closed,
}

impl PeerState {
    /// A send transport may be (re)created.
    pub fn can_create_transport(self) -> bool {
        matches!(self, Self::Joined | Self::TransportCreated)
    }

    /// A registered transport may be (re)connected.
    pub fn can_connect_transport(self) -> bool {
        matches!(self, Self::TransportCreated | Self::TransportConnected | Self::Producing)
    }

    /// A producer may be created or replaced.
    pub fn can_produce(self) -> bool {
        matches!(self, Self::TransportConnected | Self::Producing)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connected => "connected",
            Self::Joined => "joined",
            Self::TransportCreated => "transport created",
            Self::TransportConnected => "transport connected",
            Self::Producing => "producing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Session record for a live peer. Dropped from the table on disconnect.
pub struct PeerSession {
    pub state: PeerState,
    pub room_id: Option<String>,
    /// Outbound channel for server-pushed notifications
    pub notifier: mpsc::Sender<Arc<String>>,
}

impl PeerSession {
    pub fn new(notifier: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            state: PeerState::Connected,
            room_id: None,
            notifier,
        }
    }
}
