#![forbid(unsafe_code)]

// Session module - peer lifecycle state machine over the media engine

pub mod error;
pub mod registry;
pub mod state;

pub use error::{SessionError, SessionResult};
pub use registry::{MediaResource, ResourceKind, ResourceRegistry};
pub use state::{PeerSession, PeerState};

use crate::media::config::TransportConfig;
use crate::media::engine::MediaEngine;
use crate::media::types::{ProducerInfo, TransportInfo};
use crate::room::RoomMembership;
use crate::signaling::protocol::{Notification, ServerMessage};
use mediasoup::prelude::{DtlsParameters, MediaKind, RtpCapabilitiesFinalized, RtpParameters};
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const MAX_ROOM_ID_LEN: usize = 128;

/// Sessions, room membership, and owned resources, mutated together.
#[derive(Default)]
struct SessionTable {
    peers: HashMap<String, PeerSession>,
    rooms: RoomMembership,
    resources: ResourceRegistry,
}

impl SessionTable {
    fn session(&self, peer_id: &str) -> SessionResult<&PeerSession> {
        self.peers.get(peer_id).ok_or_else(|| closed_error(peer_id))
    }

    /// Error for a request whose engine call resolved after the peer moved on.
    fn stale(&self, peer_id: &str, operation: &str) -> SessionError {
        match self.peers.get(peer_id) {
            None => SessionError::protocol(format!(
                "Peer disconnected while {operation} was in flight"
            )),
            Some(session) => SessionError::protocol(format!(
                "Session changed while {operation} was in flight (now {})",
                session.state
            )),
        }
    }

    /// Sends `notification` to every member of `room_id` except `except`.
    fn notify_room(&self, room_id: &str, except: &str, notification: Notification) {
        let json = match serde_json::to_string(&ServerMessage::Notification(notification)) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize notification: {}", e);
                return;
            }
        };

        for member in self.rooms.members(room_id) {
            if member == except {
                continue;
            }
            let Some(session) = self.peers.get(&member) else {
                error!("Room {} lists peer {} without a session", room_id, member);
                continue;
            };
            match session.notifier.try_send(json.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Channel full for peer {} in room {}, dropping notification", member, room_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Channel closed for peer {} in room {} (disconnected)", member, room_id);
                }
            }
        }
    }

    /// Closes the peer's producer, telling the rest of the room.
    fn close_producer(&mut self, peer_id: &str, room_id: Option<&str>) {
        if let Some(old) = self.resources.remove(peer_id, ResourceKind::Producer) {
            if let Some(room_id) = room_id {
                self.notify_room(room_id, peer_id, Notification::ProducerClosed {
                    peer_id: peer_id.to_string(),
                    producer_id: old.id(),
                });
            }
        }
    }
}

fn closed_error(peer_id: &str) -> SessionError {
    SessionError::protocol(format!("Peer {peer_id} is closed"))
}

/// Rejects a request naming a room other than the one the peer joined.
fn check_room(session: &PeerSession, room_id: Option<&str>) -> SessionResult<()> {
    match room_id {
        Some(requested) if session.room_id.as_deref() != Some(requested) => Err(SessionError::protocol(
            format!("Not joined to room {requested}"),
        )),
        _ => Ok(()),
    }
}

/// Drives every peer through its lifecycle.
///
/// All state sits in one table behind a std::sync::RwLock that is held only for
/// synchronous sections, never across an engine call. Engine-calling operations
/// validate before the call and re-validate after it; a completion that no longer
/// applies is closed and reported as a protocol error.
pub struct SessionManager {
    engine: Arc<dyn MediaEngine>,
    transport_config: TransportConfig,
    table: StdRwLock<SessionTable>,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn MediaEngine>, transport_config: TransportConfig) -> Self {
        Self {
            engine,
            transport_config,
            table: StdRwLock::new(SessionTable::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionTable> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a newly connected peer in the `Connected` state.
    pub fn connect(&self, peer_id: &str, notifier: mpsc::Sender<Arc<String>>) {
        let mut table = self.write();
        if table.peers.contains_key(peer_id) {
            error!("Peer {} connected twice", peer_id);
            return;
        }
        table
            .peers
            .insert(peer_id.to_string(), PeerSession::new(notifier));
        debug!("Peer {} connected", peer_id);
    }

    /// Joins `room_id` and returns the engine's capability set unmodified.
    ///
    /// Re-joining the same room is idempotent; joining a second room is rejected.
    pub fn join(&self, peer_id: &str, room_id: &str) -> SessionResult<RtpCapabilitiesFinalized> {
        let len = room_id.chars().count();
        if len == 0 || len > MAX_ROOM_ID_LEN {
            return Err(SessionError::protocol(format!(
                "Invalid roomId: must be 1-{MAX_ROOM_ID_LEN} characters"
            )));
        }

        let mut guard = self.write();
        let table = &mut *guard;
        table.session(peer_id)?;
        let current = table.rooms.room_of(peer_id).map(str::to_string);

        match current.as_deref() {
            None => {
                if let Some(session) = table.peers.get_mut(peer_id) {
                    session.room_id = Some(room_id.to_string());
                    session.state = PeerState::Joined;
                }
                table.rooms.join(room_id, peer_id);
                table.notify_room(room_id, peer_id, Notification::PeerJoined {
                    peer_id: peer_id.to_string(),
                });
                info!("Peer {} joined room {}", peer_id, room_id);
            }
            Some(current) if current == room_id => {
                debug!("Peer {} re-joined room {}", peer_id, room_id);
            }
            Some(current) => {
                return Err(SessionError::protocol(format!("Already joined room {current}")));
            }
        }

        Ok(self.engine.rtp_capabilities())
    }

    /// Allocates a send transport, replacing (and closing) any previous one.
    pub async fn create_send_transport(
        &self,
        peer_id: &str,
        room_id: Option<&str>,
    ) -> SessionResult<TransportInfo> {
        {
            let table = self.read();
            let session = table.session(peer_id)?;
            check_room(session, room_id)?;
            if !session.state.can_create_transport() {
                return Err(SessionError::protocol(format!(
                    "Cannot create a send transport while {}",
                    session.state
                )));
            }
        }

        let transport = self.engine.create_transport(&self.transport_config).await?;

        let mut guard = self.write();
        let table = &mut *guard;
        let admissible = table
            .peers
            .get(peer_id)
            .is_some_and(|s| s.state.can_create_transport());
        if !admissible {
            transport.close();
            warn!("Discarded transport {} for peer {}", transport.id(), peer_id);
            return Err(table.stale(peer_id, "createSendTransport"));
        }

        let joined_room = table.peers.get(peer_id).and_then(|s| s.room_id.clone());
        table.close_producer(peer_id, joined_room.as_deref());
        if let Some(old) = table.resources.remove(peer_id, ResourceKind::Transport) {
            info!("Replaced transport {} of peer {}", old.id(), peer_id);
        }
        table
            .resources
            .put(peer_id, MediaResource::Transport(transport.clone()));
        if let Some(session) = table.peers.get_mut(peer_id) {
            session.state = PeerState::TransportCreated;
        }

        info!("Created send transport {} for peer {}", transport.id(), peer_id);
        Ok(transport.info())
    }

    /// Completes the DTLS handshake on the peer's send transport.
    pub async fn connect_transport(
        &self,
        peer_id: &str,
        dtls_parameters: DtlsParameters,
        room_id: Option<&str>,
    ) -> SessionResult<()> {
        let transport = {
            let table = self.read();
            let session = table.session(peer_id)?;
            check_room(session, room_id)?;
            let transport = table
                .resources
                .transport(peer_id)
                .ok_or(SessionError::NotFound("Transport"))?;
            if !session.state.can_connect_transport() {
                error!("Peer {} owns transport {} while {}", peer_id, transport.id(), session.state);
                return Err(SessionError::protocol(format!(
                    "Cannot connect a transport while {}",
                    session.state
                )));
            }
            transport
        };

        transport.connect(dtls_parameters).await?;

        let mut guard = self.write();
        let table = &mut *guard;
        // Disconnect drops the registry entry too, so this also catches a closed peer
        let current = table.resources.transport(peer_id).map(|t| t.id());
        if current.as_deref() != Some(transport.id().as_str()) {
            return Err(table.stale(peer_id, "connectTransport"));
        }
        if let Some(session) = table.peers.get_mut(peer_id) {
            if session.state == PeerState::TransportCreated {
                session.state = PeerState::TransportConnected;
            }
        }

        info!("Connected transport {} for peer {}", transport.id(), peer_id);
        Ok(())
    }

    /// Creates a producer on the peer's connected transport, replacing any previous one.
    pub async fn produce(
        &self,
        peer_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        room_id: Option<&str>,
    ) -> SessionResult<ProducerInfo> {
        let transport = {
            let table = self.read();
            let session = table.session(peer_id)?;
            check_room(session, room_id)?;
            let transport = table
                .resources
                .transport(peer_id)
                .ok_or(SessionError::NotFound("Transport"))?;
            if !session.state.can_produce() {
                return Err(SessionError::protocol(format!(
                    "Cannot produce while {}",
                    session.state
                )));
            }
            transport
        };

        let producer = transport.produce(kind, rtp_parameters).await?;

        let mut guard = self.write();
        let table = &mut *guard;
        let same_transport = table
            .resources
            .transport(peer_id)
            .is_some_and(|t| t.id() == transport.id());
        let admissible = same_transport
            && table.peers.get(peer_id).is_some_and(|s| s.state.can_produce());
        if !admissible {
            producer.close();
            warn!("Discarded producer {} for peer {}", producer.id(), peer_id);
            return Err(table.stale(peer_id, "produce"));
        }

        let joined_room = table.peers.get(peer_id).and_then(|s| s.room_id.clone());
        table.close_producer(peer_id, joined_room.as_deref());
        table
            .resources
            .put(peer_id, MediaResource::Producer(producer.clone()));
        if let Some(session) = table.peers.get_mut(peer_id) {
            session.state = PeerState::Producing;
        }
        if let Some(room_id) = joined_room.as_deref() {
            table.notify_room(room_id, peer_id, Notification::NewProducer {
                peer_id: peer_id.to_string(),
                producer_id: producer.id(),
                kind,
            });
        }

        info!("Created {:?} producer {} for peer {}", kind, producer.id(), peer_id);
        Ok(ProducerInfo { id: producer.id() })
    }

    /// Releases everything the peer owns and removes it from its room.
    ///
    /// Returns `false` if the peer was already closed.
    pub fn disconnect(&self, peer_id: &str) -> bool {
        let mut guard = self.write();
        let table = &mut *guard;
        let Some(session) = table.peers.remove(peer_id) else {
            debug!("Peer {} already closed", peer_id);
            return false;
        };

        let producer_id = table
            .resources
            .get(peer_id, ResourceKind::Producer)
            .map(|p| p.id());
        let released = table.resources.remove_all(peer_id);

        if let Some(room_id) = session.room_id.as_deref() {
            if !table.rooms.leave(room_id, peer_id) {
                error!("Peer {} was not a member of its room {}", peer_id, room_id);
            }
            if let Some(producer_id) = producer_id {
                table.notify_room(room_id, peer_id, Notification::ProducerClosed {
                    peer_id: peer_id.to_string(),
                    producer_id,
                });
            }
            table.notify_room(room_id, peer_id, Notification::PeerLeft {
                peer_id: peer_id.to_string(),
            });
        }

        info!(
            "Peer {} closed from state {} ({} resources released)",
            peer_id, session.state, released
        );
        true
    }

    /// Closes every session. Used at shutdown.
    pub fn shutdown(&self) {
        let peer_ids: Vec<String> = self.read().peers.keys().cloned().collect();
        info!("Closing {} sessions", peer_ids.len());
        for peer_id in peer_ids {
            self.disconnect(&peer_id);
        }
    }

    pub fn room_count(&self) -> usize {
        self.read().rooms.room_count()
    }

    pub fn peer_count(&self) -> usize {
        self.read().peers.len()
    }

    /// Transports and producers closed since startup.
    pub fn released_count(&self) -> usize {
        self.read().resources.released_count()
    }
}

// Inspection helpers for tests across the crate
#[cfg(test)]
impl SessionManager {
    /// Current state; ids without a session read as `Closed`.
    pub fn state(&self, peer_id: &str) -> PeerState {
        self.read()
            .peers
            .get(peer_id)
            .map_or(PeerState::Closed, |s| s.state)
    }

    pub fn room_of(&self, peer_id: &str) -> Option<String> {
        self.read().rooms.room_of(peer_id).map(str::to_string)
    }

    pub fn room_members(&self, room_id: &str) -> Vec<String> {
        self.read().rooms.members(room_id)
    }

    pub fn transport_id(&self, peer_id: &str) -> Option<String> {
        self.read().resources.transport(peer_id).map(|t| t.id())
    }

    pub fn producer_id(&self, peer_id: &str) -> Option<String> {
        self.read().resources.producer(peer_id).map(|p| p.id())
    }
}
