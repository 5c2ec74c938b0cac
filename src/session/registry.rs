#![forbid(unsafe_code)]

// Resource registry - the transport and producer each peer owns

use crate::media::engine::{MediaProducer, SendTransport};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Transport,
    Producer,
}

/// Handle to an engine resource held on a peer's behalf
#[derive(Clone)]
pub enum MediaResource {
    Transport(Arc<dyn SendTransport>),
    Producer(Arc<dyn MediaProducer>),
}

impl MediaResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Transport(_) => ResourceKind::Transport,
            Self::Producer(_) => ResourceKind::Producer,
        }
    }

    pub fn id(&self) -> String {
        match self {
            Self::Transport(t) => t.id(),
            Self::Producer(p) => p.id(),
        }
    }

    pub fn close(&self) {
        match self {
            Self::Transport(t) => t.close(),
            Self::Producer(p) => p.close(),
        }
    }
}

#[derive(Default)]
struct PeerResources {
    transport: Option<Arc<dyn SendTransport>>,
    producer: Option<Arc<dyn MediaProducer>>,
}

impl PeerResources {
    fn is_empty(&self) -> bool {
        self.transport.is_none() && self.producer.is_none()
    }
}

/// Peer id → owned transport and producer.
///
/// At most one of each per peer. Removal always closes the handle, and a producer
/// never outlives the transport it was created on.
#[derive(Default)]
pub struct ResourceRegistry {
    peers: HashMap<String, PeerResources>,
    released: usize,
}

impl ResourceRegistry {
    /// Registers `resource` for `peer_id`.
    ///
    /// Returns the handle of the same kind it displaced, still open; the caller
    /// decides when to close it.
    pub fn put(&mut self, peer_id: &str, resource: MediaResource) -> Option<MediaResource> {
        let entry = self.peers.entry(peer_id.to_string()).or_default();
        match resource {
            MediaResource::Transport(t) => entry.transport.replace(t).map(MediaResource::Transport),
            MediaResource::Producer(p) => entry.producer.replace(p).map(MediaResource::Producer),
        }
    }

    /// Looks up the `kind` resource of `peer_id`; absence is not an error.
    pub fn get(&self, peer_id: &str, kind: ResourceKind) -> Option<MediaResource> {
        match kind {
            ResourceKind::Transport => self.transport(peer_id).map(MediaResource::Transport),
            ResourceKind::Producer => self.producer(peer_id).map(MediaResource::Producer),
        }
    }

    pub fn transport(&self, peer_id: &str) -> Option<Arc<dyn SendTransport>> {
        self.peers.get(peer_id).and_then(|r| r.transport.clone())
    }

    pub fn producer(&self, peer_id: &str) -> Option<Arc<dyn MediaProducer>> {
        self.peers.get(peer_id).and_then(|r| r.producer.clone())
    }

    /// Removes and closes the `kind` resource of `peer_id`.
    ///
    /// Removing the transport first removes and closes its producer.
    pub fn remove(&mut self, peer_id: &str, kind: ResourceKind) -> Option<MediaResource> {
        let entry = self.peers.get_mut(peer_id)?;

        let removed = match kind {
            ResourceKind::Producer => entry.producer.take().map(MediaResource::Producer),
            ResourceKind::Transport => {
                if let Some(producer) = entry.producer.take() {
                    producer.close();
                    self.released += 1;
                    debug!("Closed producer {} of peer {} with its transport", producer.id(), peer_id);
                }
                entry.transport.take().map(MediaResource::Transport)
            }
        };

        if entry.is_empty() {
            self.peers.remove(peer_id);
        }

        if let Some(resource) = &removed {
            resource.close();
            self.released += 1;
            debug!("Closed {:?} {} of peer {}", resource.kind(), resource.id(), peer_id);
        }
        removed
    }

    /// Closes and drops everything `peer_id` owns, producer before transport.
    ///
    /// Returns the number of handles released; zero for a peer with nothing registered.
    pub fn remove_all(&mut self, peer_id: &str) -> usize {
        let Some(entry) = self.peers.remove(peer_id) else {
            return 0;
        };

        let mut count = 0;
        if let Some(producer) = entry.producer {
            producer.close();
            count += 1;
        }
        if let Some(transport) = entry.transport {
            transport.close();
            count += 1;
        }

        self.released += count;
        debug!("Released {} resources of peer {}", count, peer_id);
        count
    }

    /// Total handles closed by this registry since creation.
    pub fn released_count(&self) -> usize {
        self.released
    }
}
