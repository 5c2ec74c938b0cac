#![forbid(unsafe_code)]

// Mediasoup-backed transport and producer handles

use crate::media::engine::{MediaProducer, SendTransport};
use crate::media::types::{MediaError, MediaResult, TransportInfo};
use async_trait::async_trait;
use mediasoup::prelude::*;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Send transport wrapper.
///
/// Mediasoup closes a transport when its last clone is dropped, so closing takes the
/// inner transport out of the slot. A call already in flight holds its own clone and
/// releases it when the call resolves.
pub struct MediasoupTransport {
    id: String,
    info: TransportInfo,
    inner: Mutex<Option<WebRtcTransport>>,
}

impl MediasoupTransport {
    pub fn new(transport: WebRtcTransport) -> Self {
        let info = TransportInfo::from(&transport);
        Self::setup_transport_handlers(&transport);
        Self {
            id: info.id.clone(),
            info,
            inner: Mutex::new(Some(transport)),
        }
    }

    fn current(&self) -> MediaResult<WebRtcTransport> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::TransportClosed(self.id.clone()))
    }

    /// Handlers are detached so they persist for the transport's lifetime.
    fn setup_transport_handlers(transport: &WebRtcTransport) {
        let transport_id = transport.id().to_string();

        transport
            .on_close({
                let transport_id = transport_id.clone();
                Box::new(move || {
                    debug!("Transport {} closed", transport_id);
                })
            })
            .detach();

        transport
            .on_dtls_state_change({
                let transport_id = transport_id.clone();
                move |dtls_state| {
                    info!("DTLS state: {:?} for transport {}", dtls_state, transport_id);
                }
            })
            .detach();

        transport
            .on_ice_state_change({
                let transport_id = transport_id;
                move |ice_state| {
                    info!("ICE state: {:?} for transport {}", ice_state, transport_id);
                }
            })
            .detach();
    }
}

#[async_trait]
impl SendTransport for MediasoupTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn info(&self) -> TransportInfo {
        self.info.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> MediaResult<()> {
        let transport = self.current()?;
        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to connect transport: {e}")))
    }

    async fn produce(&self, kind: MediaKind, rtp_parameters: RtpParameters) -> MediaResult<Arc<dyn MediaProducer>> {
        let transport = self.current()?;
        let producer = transport
            .produce(ProducerOptions::new(kind, rtp_parameters))
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to create producer: {e}")))?;

        Ok(Arc::new(MediasoupProducer::new(producer)))
    }

    fn close(&self) {
        if self.inner.lock().unwrap_or_else(|e| e.into_inner()).take().is_some() {
            debug!("Released transport {}", self.id);
        }
    }

    fn closed(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

/// Producer wrapper; dropping the inner producer closes it in the worker.
pub struct MediasoupProducer {
    id: String,
    kind: MediaKind,
    inner: Mutex<Option<Producer>>,
}

impl MediasoupProducer {
    pub fn new(producer: Producer) -> Self {
        Self::setup_producer_handlers(&producer);
        Self {
            id: producer.id().to_string(),
            kind: producer.kind(),
            inner: Mutex::new(Some(producer)),
        }
    }

    fn setup_producer_handlers(producer: &Producer) {
        let producer_id = producer.id().to_string();

        producer
            .on_transport_close({
                let producer_id = producer_id.clone();
                move || {
                    warn!("Producer {} lost its transport", producer_id);
                }
            })
            .detach();

        producer
            .on_close(move || {
                debug!("Producer {} closed", producer_id);
            })
            .detach();
    }
}

impl MediaProducer for MediasoupProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        if self.inner.lock().unwrap_or_else(|e| e.into_inner()).take().is_some() {
            debug!("Released producer {}", self.id);
        }
    }

    fn closed(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}
