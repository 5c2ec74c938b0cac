#![forbid(unsafe_code)]

// Engine seam: the capability, transport, and producer operations the session layer needs

use crate::media::config::TransportConfig;
use crate::media::types::{MediaResult, TransportInfo};
use async_trait::async_trait;
use mediasoup::prelude::{DtlsParameters, MediaKind, RtpCapabilitiesFinalized, RtpParameters};
use std::sync::Arc;

/// Process-wide handle to the media engine.
///
/// Created once at startup and shared by every session. Transport allocation is a
/// suspending call; capability negotiation is answered from the router's cached set.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Capability set peers must load before they can produce.
    fn rtp_capabilities(&self) -> RtpCapabilitiesFinalized;

    /// Allocates a new WebRTC send transport with the given network settings.
    async fn create_transport(&self, config: &TransportConfig) -> MediaResult<Arc<dyn SendTransport>>;
}

/// A WebRTC transport owned by exactly one peer.
#[async_trait]
pub trait SendTransport: Send + Sync {
    fn id(&self) -> String;

    /// ICE and DTLS negotiation parameters for the remote side.
    fn info(&self) -> TransportInfo;

    /// Completes the DTLS handshake with the remote parameters.
    async fn connect(&self, dtls_parameters: DtlsParameters) -> MediaResult<()>;

    /// Creates a producer sending `kind` media over this transport.
    async fn produce(&self, kind: MediaKind, rtp_parameters: RtpParameters) -> MediaResult<Arc<dyn MediaProducer>>;

    /// Releases the underlying engine transport. Idempotent.
    fn close(&self);

    fn closed(&self) -> bool;
}

/// A single audio or video stream being sent by a peer.
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;

    /// Releases the underlying engine producer. Idempotent.
    fn close(&self);

    fn closed(&self) -> bool;
}
