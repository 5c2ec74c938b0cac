#![forbid(unsafe_code)]

// Media module - engine handle over mediasoup
// The session layer only sees the traits in `engine`; mediasoup lives behind them.

pub mod config;
pub mod engine;
pub mod handles;
pub mod types;
pub mod worker_manager;

#[cfg(test)]
pub mod testing;

pub use config::{MediaConfig, RouterConfig, TransportConfig, WorkerConfig};
pub use engine::{MediaEngine, MediaProducer, SendTransport};
pub use types::{MediaError, MediaResult, ProducerInfo, TransportInfo};
pub use worker_manager::MediasoupEngine;

use std::sync::Arc;
use tracing::info;

/// Starts the process-wide engine handle.
///
/// # Errors
/// Returns the engine's error if the worker or router cannot be created; callers treat this as fatal
pub async fn start_engine(config: &MediaConfig) -> MediaResult<Arc<dyn MediaEngine>> {
    info!("Starting media engine");
    let engine = MediasoupEngine::new(config).await?;
    Ok(Arc::new(engine))
}
