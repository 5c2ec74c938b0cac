#![forbid(unsafe_code)]

// Room module - which peers are joined to which room

use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Room id → member peer ids, plus the reverse index.
///
/// Rooms are created on first join and reclaimed when the last member leaves.
/// Not synchronized on its own: it lives inside the session table lock.
#[derive(Debug, Default)]
pub struct RoomMembership {
    rooms: HashMap<String, HashSet<String>>,
    peer_rooms: HashMap<String, String>,
}

impl RoomMembership {
    /// Adds `peer_id` to `room_id`, creating the room if needed.
    ///
    /// Returns `true` if the peer was newly added. A peer already in another room is
    /// moved; callers that forbid that must check `room_of` first.
    pub fn join(&mut self, room_id: &str, peer_id: &str) -> bool {
        if let Some(previous) = self.peer_rooms.get(peer_id).cloned() {
            if previous == room_id {
                return false;
            }
            warn!("Peer {} moved from room {} to {}", peer_id, previous, room_id);
            self.leave(&previous, peer_id);
        }

        let members = self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            info!("Room {} created", room_id);
            HashSet::new()
        });
        members.insert(peer_id.to_string());
        self.peer_rooms.insert(peer_id.to_string(), room_id.to_string());

        debug!("Peer {} joined room {} ({} members)", peer_id, room_id, members.len());
        true
    }

    /// Removes `peer_id` from `room_id`; an emptied room is reclaimed.
    ///
    /// Returns `true` if the peer was a member.
    pub fn leave(&mut self, room_id: &str, peer_id: &str) -> bool {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return false;
        };
        if !members.remove(peer_id) {
            return false;
        }
        if self.peer_rooms.get(peer_id).is_some_and(|r| r == room_id) {
            self.peer_rooms.remove(peer_id);
        }

        if members.is_empty() {
            self.rooms.remove(room_id);
            info!("Room {} is empty, cleaning up", room_id);
        }
        debug!("Peer {} left room {}", peer_id, room_id);
        true
    }

    pub fn room_of(&self, peer_id: &str) -> Option<&str> {
        self.peer_rooms.get(peer_id).map(String::as_str)
    }

    /// Member ids of `room_id`, in no particular order.
    pub fn members(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
