#![forbid(unsafe_code)]

// WebSocket connection handler for individual peers

use super::protocol::{Ack, Notification, Request, RequestEnvelope, Response, ServerMessage};
use crate::metrics::ServerMetrics;
use crate::session::{SessionError, SessionManager, SessionResult};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded capacity of a peer's outbound and request queues.
/// Acks wait for room; notifications beyond this are dropped.
const CHANNEL_CAPACITY: usize = 64;

/// Close the connection if nothing arrives within this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Token bucket burst capacity.
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket refill rate, tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// One token in microseconds, for integer math.
const TOKEN_US: u64 = 1_000_000;
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Per-connection token bucket.
pub(crate) struct RateLimiter {
    tokens_us: u64,
    last_refill: Instant,
    warned: bool,
}

impl RateLimiter {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            tokens_us: MAX_TOKENS_US,
            last_refill: now,
            warned: false,
        }
    }

    /// Takes one token. Returns `false` when the bucket is empty.
    pub(crate) fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed_us = now.saturating_duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        self.tokens_us = self
            .tokens_us
            .saturating_add(elapsed_us.saturating_mul(RATE_LIMIT_REFILL_RATE))
            .min(MAX_TOKENS_US);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            true
        } else {
            false
        }
    }

    /// True once per run of rejected requests.
    fn should_warn(&mut self) -> bool {
        !std::mem::replace(&mut self.warned, true)
    }
}

/// A text frame after decoding.
#[derive(Debug)]
pub(crate) enum Frame {
    /// Carries a request id, so it is answered with an ack either way.
    Request { id: u64, request: SessionResult<Request> },
    /// No usable id; answered with an error notification.
    Malformed(String),
}

pub(crate) fn parse_frame(text: &str) -> Frame {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return Frame::Malformed(format!("Invalid JSON: {e}")),
    };
    let Some(id) = value.get("id").and_then(Value::as_u64) else {
        return Frame::Malformed("Missing or invalid request id".to_string());
    };

    let request = serde_json::from_value::<RequestEnvelope>(value)
        .and_then(RequestEnvelope::into_request)
        .map_err(|e| SessionError::protocol(format!("Invalid request: {e}")));
    Frame::Request { id, request }
}

/// Routes one typed request to the session manager.
pub async fn dispatch(
    sessions: &SessionManager,
    peer_id: &str,
    request: Request,
) -> SessionResult<Response> {
    match request {
        Request::Join { room_id } => sessions.join(peer_id, &room_id).map(Response::Capabilities),
        Request::CreateSendTransport { room_id } => sessions
            .create_send_transport(peer_id, room_id.as_deref())
            .await
            .map(Response::Transport),
        Request::ConnectTransport {
            dtls_parameters,
            room_id,
        } => sessions
            .connect_transport(peer_id, dtls_parameters, room_id.as_deref())
            .await
            .map(|()| Response::Connected),
        Request::Produce {
            kind,
            rtp_parameters,
            room_id,
        } => sessions
            .produce(peer_id, kind, rtp_parameters, room_id.as_deref())
            .await
            .map(Response::Producer),
    }
}

/// Runs one request to completion and builds its acknowledgement.
pub async fn handle_request(
    sessions: &SessionManager,
    metrics: &ServerMetrics,
    peer_id: &str,
    id: u64,
    request: Request,
) -> Ack {
    let method = request.method();
    let start = Instant::now();
    let result = dispatch(sessions, peer_id, request).await;
    metrics.observe_request_handling(start.elapsed());
    metrics.inc_requests();

    match &result {
        Ok(_) => match method {
            "join" => metrics.inc_joins(),
            "createSendTransport" => metrics.inc_transports_created(),
            "produce" => metrics.inc_producers_created(),
            _ => {}
        },
        Err(e) => {
            metrics.inc_requests_failed();
            warn!("{} #{} from peer {} failed: {}", method, id, peer_id, e);
        }
    }

    Ack::from_result(id, &result)
}

/// Queues a best-effort notification; dropped if the peer's channel is full.
fn send_notification(sender: &mpsc::Sender<Arc<String>>, notification: Notification) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(&ServerMessage::Notification(notification))?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Queues an acknowledgement, waiting for room in the peer's channel.
async fn send_ack(sender: &mpsc::Sender<Arc<String>>, ack: Ack) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(&ServerMessage::Ack(ack))?);
    sender.send(json).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// A decoded frame waiting its turn. Rejections are queued too so acks keep request order.
pub(crate) struct QueuedRequest {
    pub(crate) id: u64,
    pub(crate) request: SessionResult<Request>,
}

/// Handles one peer's requests strictly in arrival order.
///
/// Runs apart from the receive loop so a socket close can still disconnect the peer
/// while an engine call is in flight.
pub(crate) async fn process_requests(
    mut queue: mpsc::Receiver<QueuedRequest>,
    sessions: Arc<SessionManager>,
    metrics: ServerMetrics,
    peer_id: String,
    tx: mpsc::Sender<Arc<String>>,
) {
    while let Some(QueuedRequest { id, request }) = queue.recv().await {
        let ack = match request {
            Ok(request) => handle_request(&sessions, &metrics, &peer_id, id, request).await,
            Err(e) => {
                metrics.inc_requests();
                metrics.inc_requests_failed();
                Ack::failure(id, &e)
            }
        };
        if let Err(e) = send_ack(&tx, ack).await {
            debug!("Ack #{} for peer {} not delivered: {}", id, peer_id, e);
        }
    }
    debug!("Request worker finished for peer: {}", peer_id);
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    sessions: Arc<SessionManager>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let peer_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", peer_id);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (ws_sender, ws_receiver) = socket.split();
    run_connection(ws_receiver, ws_sender, peer_id, sessions, metrics).await;
}

/// Drives one peer's socket until it closes, then releases everything the peer owns.
pub(crate) async fn run_connection<St, Si, E>(
    mut inbound: St,
    mut outbound: Si,
    peer_id: String,
    sessions: Arc<SessionManager>,
    metrics: ServerMetrics,
) where
    St: Stream<Item = Result<Message, E>> + Unpin,
    Si: Sink<Message> + Unpin + Send + 'static,
    E: fmt::Display,
{
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);
    let (queue_tx, queue_rx) = mpsc::channel::<QueuedRequest>(CHANNEL_CAPACITY);

    sessions.connect(&peer_id, tx.clone());

    let send_peer_id = peer_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if outbound.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for peer: {}", send_peer_id);
    });

    let worker = tokio::spawn(process_requests(
        queue_rx,
        sessions.clone(),
        metrics.clone(),
        peer_id.clone(),
        tx.clone(),
    ));

    let mut limiter = RateLimiter::new(Instant::now());

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, inbound.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!("Socket error for peer {}: {}", peer_id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout for peer {}", peer_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let (id, request) = match parse_frame(text.as_str()) {
                    Frame::Malformed(message) => {
                        warn!("Malformed frame from peer {}: {}", peer_id, message);
                        metrics.inc_malformed_frames();
                        let _ = send_notification(&tx, Notification::Error { message });
                        continue;
                    }
                    Frame::Request { id, request } => (id, request),
                };

                let request = if limiter.try_acquire(Instant::now()) {
                    request
                } else {
                    if limiter.should_warn() {
                        warn!("Rate limit exceeded for peer {}", peer_id);
                    }
                    metrics.inc_rate_limited();
                    Err(SessionError::protocol(format!(
                        "Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} requests/second"
                    )))
                };

                if queue_tx.send(QueuedRequest { id, request }).await.is_err() {
                    warn!("Request worker for peer {} stopped", peer_id);
                    break;
                }
            }
            Message::Close(_) => {
                info!("Peer {} closed connection", peer_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {
                warn!("Unexpected message type from peer {}", peer_id);
            }
        }
    }

    // Disconnect first so a request still in the engine finds the peer gone
    if sessions.disconnect(&peer_id) {
        metrics.inc_disconnects();
    }

    drop(queue_tx);
    let _ = worker.await;
    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for peer: {}", peer_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::TransportConfig;
    use crate::media::testing::FakeEngine;
    use crate::session::PeerState;
    use mediasoup::data_structures::DtlsRole;
    use mediasoup::prelude::{DtlsParameters, RtpParameters};
    use serde_json::json;
    use std::convert::Infallible;
    use tokio::task::JoinHandle;

    fn manager() -> (FakeEngine, SessionManager) {
        let engine = FakeEngine::new();
        let sessions = SessionManager::new(Arc::new(engine.clone()), TransportConfig::default());
        (engine, sessions)
    }

    fn request(text: Value) -> (u64, Request) {
        match parse_frame(&text.to_string()) {
            Frame::Request { id, request } => (id, request.unwrap()),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    fn ack_json(ack: Ack) -> Value {
        serde_json::to_value(ServerMessage::Ack(ack)).unwrap()
    }

    fn dtls_json() -> Value {
        serde_json::to_value(DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: Vec::new(),
        })
        .unwrap()
    }

    fn rtp_json() -> Value {
        serde_json::to_value(RtpParameters::default()).unwrap()
    }

    /// In-process socket: frames pushed on `inbound` reach the loop, frames it writes land on `outbound`.
    struct Socket {
        inbound: mpsc::Sender<Message>,
        outbound: mpsc::Receiver<Message>,
        task: JoinHandle<()>,
    }

    impl Socket {
        fn open(peer_id: &str, sessions: Arc<SessionManager>, metrics: ServerMetrics) -> Self {
            let (in_tx, in_rx) = mpsc::channel::<Message>(256);
            let (out_tx, out_rx) = mpsc::channel::<Message>(512);

            let inbound = Box::pin(futures_util::stream::unfold(in_rx, |mut rx| async move {
                rx.recv().await.map(|m| (Ok::<_, Infallible>(m), rx))
            }));
            let outbound = Box::pin(futures_util::sink::unfold(out_tx, |tx, msg: Message| async move {
                tx.send(msg).await.map_err(|_| std::io::Error::other("socket closed"))?;
                Ok::<_, std::io::Error>(tx)
            }));

            let task = tokio::spawn(run_connection(inbound, outbound, peer_id.to_string(), sessions, metrics));
            Self {
                inbound: in_tx,
                outbound: out_rx,
                task,
            }
        }

        async fn send(&self, frame: Value) {
            self.send_text(frame.to_string()).await;
        }

        async fn send_text(&self, text: String) {
            self.inbound.send(Message::Text(text.into())).await.unwrap();
        }

        async fn next(&mut self) -> Value {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
                .await
                .expect("no frame within 5s")
                .expect("socket closed");
            match msg {
                Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
                other => panic!("unexpected frame {other:?}"),
            }
        }

        async fn next_ack(&mut self) -> Value {
            loop {
                let frame = self.next().await;
                if frame["type"] == "ack" {
                    return frame;
                }
            }
        }

        async fn close(self) {
            drop(self.inbound);
            tokio::time::timeout(Duration::from_secs(5), self.task)
                .await
                .expect("connection did not finish")
                .unwrap();
        }
    }

    #[test]
    fn test_parse_frame_without_id_is_malformed() {
        assert!(matches!(parse_frame("not json"), Frame::Malformed(_)));
        assert!(matches!(parse_frame(r#"{"method":"join"}"#), Frame::Malformed(_)));
        assert!(matches!(parse_frame(r#"{"id":"x","method":"join"}"#), Frame::Malformed(_)));
    }

    #[test]
    fn test_parse_frame_with_bad_request_keeps_id() {
        match parse_frame(r#"{"id":4,"method":"consume","data":{}}"#) {
            Frame::Request { id, request } => {
                assert_eq!(id, 4);
                assert_eq!(request.unwrap_err().code(), "protocol");
            }
            other => panic!("unexpected frame {other:?}"),
        }
        match parse_frame(r#"{"id":5}"#) {
            Frame::Request { id, request } => {
                assert_eq!(id, 5);
                assert!(request.is_err());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_rate_limiter_refills() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(start);
        for _ in 0..RATE_LIMIT_MAX_TOKENS {
            assert!(limiter.try_acquire(start));
        }
        assert!(!limiter.try_acquire(start));
        assert!(limiter.should_warn());
        assert!(!limiter.should_warn());

        // 10ms refills one token at 100/s
        assert!(limiter.try_acquire(start + Duration::from_millis(10)));
        assert!(!limiter.try_acquire(start + Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_request_flow_acks() {
        let (engine, sessions) = manager();
        let metrics = ServerMetrics::new();
        let (tx, _rx) = mpsc::channel(8);
        sessions.connect("a", tx);

        let (id, join) = request(json!({"id": 1, "method": "join", "data": {"roomId": "r1"}}));
        let ack = ack_json(handle_request(&sessions, &metrics, "a", id, join).await);
        assert_eq!(ack["id"], 1);
        assert_eq!(ack["ok"], true);
        assert_eq!(ack["data"], serde_json::to_value(FakeEngine::capabilities()).unwrap());

        let (id, create) = request(json!({"id": 2, "method": "createSendTransport", "data": {"roomId": "r1"}}));
        let ack = ack_json(handle_request(&sessions, &metrics, "a", id, create).await);
        assert_eq!(ack["data"]["id"], "t1");
        assert_eq!(ack["data"]["iceParameters"]["usernameFragment"], "ufrag-t1");

        let (id, connect) = request(json!({"id": 3, "method": "connectTransport", "data": {"dtlsParameters": dtls_json()}}));
        let ack = ack_json(handle_request(&sessions, &metrics, "a", id, connect).await);
        assert_eq!(ack, json!({"type": "ack", "id": 3, "ok": true, "data": null}));
        assert!(engine.transport("t1").connected());

        let (id, produce) = request(json!({"id": 4, "method": "produce", "data": {"kind": "audio", "rtpParameters": rtp_json()}}));
        let ack = ack_json(handle_request(&sessions, &metrics, "a", id, produce).await);
        assert_eq!(ack["data"], json!({"id": "p1"}));
        assert_eq!(sessions.state("a"), PeerState::Producing);

        let out = metrics.render_prometheus(sessions.room_count(), sessions.peer_count(), 0);
        assert!(out.contains("sendpath_requests_total 4"));
        assert!(out.contains("sendpath_producers_created_total 1"));
        assert!(out.contains("sendpath_requests_failed_total 0"));
    }

    #[tokio::test]
    async fn test_failure_ack_carries_code() {
        let (_engine, sessions) = manager();
        let metrics = ServerMetrics::new();
        let (tx, _rx) = mpsc::channel(8);
        sessions.connect("b", tx);
        sessions.join("b", "r1").unwrap();

        let (id, connect) = request(json!({"id": 7, "method": "connectTransport", "data": {"dtlsParameters": dtls_json()}}));
        let ack = ack_json(handle_request(&sessions, &metrics, "b", id, connect).await);

        assert_eq!(ack["ok"], false);
        assert_eq!(ack["error"]["code"], "notFound");
        assert_eq!(ack["error"]["message"], "Transport not found");
        assert_eq!(sessions.state("b"), PeerState::Joined);
        assert!(metrics.render_prometheus(0, 0, 0).contains("sendpath_requests_failed_total 1"));
    }

    #[tokio::test]
    async fn test_dispatch_engine_failure() {
        let (engine, sessions) = manager();
        let (tx, _rx) = mpsc::channel(8);
        sessions.connect("a", tx);
        sessions.join("a", "r1").unwrap();

        engine.fail_next_create_transport();
        let err = dispatch(&sessions, "a", Request::CreateSendTransport { room_id: None })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "engine");
        assert_eq!(sessions.state("a"), PeerState::Joined);
    }

    #[tokio::test]
    async fn test_ack_waits_for_room_behind_notifications() {
        let (_engine, sessions) = manager();
        let (tx, mut rx) = mpsc::channel::<Arc<String>>(1);
        tx.try_send(Arc::new("notification".to_string())).unwrap();

        let (queue_tx, queue_rx) = mpsc::channel(4);
        let worker = tokio::spawn(process_requests(
            queue_rx,
            Arc::new(sessions),
            ServerMetrics::new(),
            "a".to_string(),
            tx.clone(),
        ));
        for id in 1..=3 {
            queue_tx
                .send(QueuedRequest {
                    id,
                    request: Err(SessionError::protocol("Rate limit exceeded")),
                })
                .await
                .unwrap();
        }
        drop(queue_tx);

        assert_eq!(rx.recv().await.unwrap().as_str(), "notification");
        for id in 1..=3 {
            let ack: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(ack["id"], id);
            assert_eq!(ack["ok"], false);
        }
        worker.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pipelined_requests_run_in_order() {
        let engine = FakeEngine::new();
        let sessions = Arc::new(SessionManager::new(Arc::new(engine.clone()), TransportConfig::default()));

        for i in 0..50 {
            let peer_id = format!("peer-{i}");
            let mut socket = Socket::open(&peer_id, sessions.clone(), ServerMetrics::new());

            socket.send(json!({"id": 1, "method": "join", "data": {"roomId": "r1"}})).await;
            socket.send(json!({"id": 2, "method": "createSendTransport"})).await;
            socket.send(json!({"id": 3, "method": "connectTransport", "data": {"dtlsParameters": dtls_json()}})).await;
            socket.send(json!({"id": 4, "method": "produce", "data": {"kind": "video", "rtpParameters": rtp_json()}})).await;

            for id in 1..=4 {
                let ack = socket.next_ack().await;
                assert_eq!(ack["id"], id);
                assert_eq!(ack["ok"], true, "request {id} of {peer_id} failed: {ack}");
            }
            assert_eq!(sessions.state(&peer_id), PeerState::Producing);
            socket.close().await;
        }
        assert_eq!(sessions.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_socket_close_releases_resources() {
        let engine = FakeEngine::new();
        let sessions = Arc::new(SessionManager::new(Arc::new(engine.clone()), TransportConfig::default()));
        let metrics = ServerMetrics::new();
        let mut socket = Socket::open("a", sessions.clone(), metrics.clone());

        socket.send(json!({"id": 1, "method": "join", "data": {"roomId": "r1"}})).await;
        socket.send(json!({"id": 2, "method": "createSendTransport"})).await;
        assert_eq!(socket.next_ack().await["ok"], true);
        assert_eq!(socket.next_ack().await["ok"], true);

        socket.close().await;
        assert_eq!(engine.transport("t1").close_calls(), 1);
        assert_eq!(sessions.state("a"), PeerState::Closed);
        assert_eq!(sessions.room_count(), 0);
        assert!(metrics.render_prometheus(0, 0, 0).contains("sendpath_disconnects_total 1"));
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_notification() {
        let (_engine, sessions) = manager();
        let mut socket = Socket::open("a", Arc::new(sessions), ServerMetrics::new());

        socket.send_text("not json".to_string()).await;
        let frame = socket.next().await;
        assert_eq!(frame["type"], "notification");
        assert_eq!(frame["method"], "error");

        // Still serving afterwards
        socket.send(json!({"id": 9, "method": "join", "data": {"roomId": "r1"}})).await;
        assert_eq!(socket.next_ack().await["id"], 9);
        socket.close().await;
    }

    #[tokio::test]
    async fn test_rate_limited_requests_are_still_acknowledged() {
        let (_engine, sessions) = manager();
        let mut socket = Socket::open("a", Arc::new(sessions), ServerMetrics::new());

        let total = RATE_LIMIT_MAX_TOKENS + 50;
        for id in 0..total {
            socket.send(json!({"id": id, "method": "createSendTransport"})).await;
        }

        let mut rate_limited = 0;
        for id in 0..total {
            let ack = socket.next_ack().await;
            assert_eq!(ack["id"], id);
            assert_eq!(ack["ok"], false);
            if ack["error"]["message"].as_str().unwrap().starts_with("Rate limit exceeded") {
                rate_limited += 1;
            }
        }
        assert!(rate_limited > 0);
        socket.close().await;
    }
}
