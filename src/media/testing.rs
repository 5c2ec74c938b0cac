#![forbid(unsafe_code)]

// In-memory engine used by unit tests: deterministic ids, failure injection, and
// gates that hold an engine call open so tests can interleave a disconnect.

use crate::media::config::TransportConfig;
use crate::media::engine::{MediaEngine, MediaProducer, SendTransport};
use crate::media::types::{MediaError, MediaResult, TransportInfo};
use async_trait::async_trait;
use mediasoup::data_structures::DtlsRole;
use mediasoup::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Holds one kind of engine call until released.
#[derive(Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    /// Waits until a gated call has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Lets the gated call resolve.
    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

#[derive(Default)]
struct Failures {
    create_transport: AtomicBool,
    connect: AtomicBool,
    produce: AtomicBool,
}

#[derive(Default)]
struct Gates {
    create_transport: Mutex<Option<Arc<Gate>>>,
    connect: Mutex<Option<Arc<Gate>>>,
    produce: Mutex<Option<Arc<Gate>>>,
}

fn take_gate(slot: &Mutex<Option<Arc<Gate>>>) -> Option<Arc<Gate>> {
    slot.lock().unwrap().take()
}

fn install_gate(slot: &Mutex<Option<Arc<Gate>>>) -> Arc<Gate> {
    let gate = Arc::new(Gate::default());
    *slot.lock().unwrap() = Some(gate.clone());
    gate
}

#[derive(Default)]
struct Shared {
    transport_seq: AtomicUsize,
    producer_seq: AtomicUsize,
    failures: Failures,
    gates: Gates,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    producers: Mutex<Vec<Arc<FakeProducer>>>,
    last_config: Mutex<Option<TransportConfig>>,
}

fn next_id(seq: &AtomicUsize, prefix: &str) -> String {
    format!("{prefix}{}", seq.fetch_add(1, Ordering::Relaxed) + 1)
}

/// Engine double shared between the code under test and the test body.
#[derive(Clone, Default)]
pub struct FakeEngine {
    shared: Arc<Shared>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_create_transport(&self) {
        self.shared.failures.create_transport.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_connect(&self) {
        self.shared.failures.connect.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_produce(&self) {
        self.shared.failures.produce.store(true, Ordering::SeqCst);
    }

    pub fn gate_create_transport(&self) -> Arc<Gate> {
        install_gate(&self.shared.gates.create_transport)
    }

    pub fn gate_connect(&self) -> Arc<Gate> {
        install_gate(&self.shared.gates.connect)
    }

    pub fn gate_produce(&self) -> Arc<Gate> {
        install_gate(&self.shared.gates.produce)
    }

    /// Every transport allocated so far, in creation order.
    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.shared.transports.lock().unwrap().clone()
    }

    /// Every producer created so far, in creation order.
    pub fn producers(&self) -> Vec<Arc<FakeProducer>> {
        self.shared.producers.lock().unwrap().clone()
    }

    pub fn transport(&self, id: &str) -> Arc<FakeTransport> {
        self.transports()
            .into_iter()
            .find(|t| t.id == id)
            .unwrap_or_else(|| panic!("no transport {id}"))
    }

    pub fn producer(&self, id: &str) -> Arc<FakeProducer> {
        self.producers()
            .into_iter()
            .find(|p| p.id == id)
            .unwrap_or_else(|| panic!("no producer {id}"))
    }

    pub fn last_transport_config(&self) -> Option<TransportConfig> {
        self.shared.last_config.lock().unwrap().clone()
    }

    pub fn capabilities() -> RtpCapabilitiesFinalized {
        RtpCapabilitiesFinalized::default()
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    fn rtp_capabilities(&self) -> RtpCapabilitiesFinalized {
        Self::capabilities()
    }

    async fn create_transport(&self, config: &TransportConfig) -> MediaResult<Arc<dyn SendTransport>> {
        *self.shared.last_config.lock().unwrap() = Some(config.clone());
        if let Some(gate) = take_gate(&self.shared.gates.create_transport) {
            gate.pass().await;
        }
        if self.shared.failures.create_transport.swap(false, Ordering::SeqCst) {
            return Err(MediaError::TransportError("injected create failure".to_string()));
        }

        let transport = Arc::new(FakeTransport {
            id: next_id(&self.shared.transport_seq, "t"),
            shared: self.shared.clone(),
            connected: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        });
        self.shared.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

pub struct FakeTransport {
    pub id: String,
    shared: Arc<Shared>,
    connected: AtomicBool,
    close_calls: AtomicUsize,
}

impl FakeTransport {
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SendTransport for FakeTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn info(&self) -> TransportInfo {
        TransportInfo {
            id: self.id.clone(),
            ice_parameters: IceParameters {
                username_fragment: format!("ufrag-{}", self.id),
                password: format!("pwd-{}", self.id),
                ice_lite: Some(true),
            },
            ice_candidates: Vec::new(),
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: Vec::new(),
            },
        }
    }

    async fn connect(&self, _dtls_parameters: DtlsParameters) -> MediaResult<()> {
        if self.closed() {
            return Err(MediaError::TransportClosed(self.id.clone()));
        }
        // An in-flight call keeps the engine object alive even if closed meanwhile
        if let Some(gate) = take_gate(&self.shared.gates.connect) {
            gate.pass().await;
        }
        if self.shared.failures.connect.swap(false, Ordering::SeqCst) {
            return Err(MediaError::TransportError("injected connect failure".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn produce(&self, kind: MediaKind, _rtp_parameters: RtpParameters) -> MediaResult<Arc<dyn MediaProducer>> {
        if self.closed() {
            return Err(MediaError::TransportClosed(self.id.clone()));
        }
        // An in-flight call keeps the engine object alive even if closed meanwhile
        if let Some(gate) = take_gate(&self.shared.gates.produce) {
            gate.pass().await;
        }
        if self.shared.failures.produce.swap(false, Ordering::SeqCst) {
            return Err(MediaError::ProducerError("injected produce failure".to_string()));
        }

        let producer = Arc::new(FakeProducer {
            id: next_id(&self.shared.producer_seq, "p"),
            kind,
            transport_id: self.id.clone(),
            close_calls: AtomicUsize::new(0),
        });
        self.shared.producers.lock().unwrap().push(producer.clone());
        Ok(producer)
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn closed(&self) -> bool {
        self.close_calls() > 0
    }
}

pub struct FakeProducer {
    pub id: String,
    pub kind: MediaKind,
    pub transport_id: String,
    close_calls: AtomicUsize,
}

impl FakeProducer {
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl MediaProducer for FakeProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn closed(&self) -> bool {
        self.close_calls() > 0
    }
}
