#![forbid(unsafe_code)]

// Single mediasoup worker and router backing the process-wide engine handle

use crate::media::config::{MediaConfig, TransportConfig};
use crate::media::engine::{MediaEngine, SendTransport};
use crate::media::handles::MediasoupTransport;
use crate::media::types::{MediaError, MediaResult};
use async_trait::async_trait;
use mediasoup::prelude::*;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Engine handle backed by one mediasoup worker hosting one router.
///
/// Every room shares the router; rooms only group peers for signaling.
pub struct MediasoupEngine {
    // Keeps the worker thread pool alive for the engine's lifetime
    _worker_manager: mediasoup::worker_manager::WorkerManager,
    // Owns the worker process the router runs in
    _worker: Worker,
    router: Router,
}

impl MediasoupEngine {
    /// Starts the worker and creates the router.
    ///
    /// # Errors
    /// Returns `MediaError::WorkerError` or `MediaError::RouterError` if the engine cannot start
    pub async fn new(config: &MediaConfig) -> MediaResult<Self> {
        config.validate()?;

        let worker_manager = mediasoup::worker_manager::WorkerManager::new();
        let worker = worker_manager
            .create_worker(config.worker_config.to_worker_settings())
            .await
            .map_err(|e| MediaError::WorkerError(format!("Failed to create worker: {e}")))?;

        Self::setup_worker_handlers(&worker);

        let router = worker
            .create_router(config.router_config.to_router_options())
            .await
            .map_err(|e| MediaError::RouterError(format!("Failed to create router: {e}")))?;

        info!("Mediasoup worker {} and router {} created", worker.id(), router.id());

        Ok(Self {
            _worker_manager: worker_manager,
            _worker: worker,
            router,
        })
    }

    /// Sets up event handlers for the worker
    fn setup_worker_handlers(worker: &Worker) {
        let worker_id = worker.id();

        worker
            .on_dead(move |reason| {
                error!("Worker {} died: {:?}", worker_id, reason);
            })
            .detach();

        worker
            .on_close(move || {
                debug!("Worker {} closed", worker_id);
            })
            .detach();
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    fn rtp_capabilities(&self) -> RtpCapabilitiesFinalized {
        self.router.rtp_capabilities().clone()
    }

    async fn create_transport(&self, config: &TransportConfig) -> MediaResult<Arc<dyn SendTransport>> {
        let transport = self
            .router
            .create_webrtc_transport(config.to_transport_options())
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to create send transport: {e}")))?;

        debug!("Router {} allocated transport {}", self.router.id(), transport.id());
        Ok(Arc::new(MediasoupTransport::new(transport)))
    }
}
