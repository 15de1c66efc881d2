// ============================
// duet-backend-lib/src/registry.rs
// ============================
//! Room membership.
//!
//! An in-memory arena of connected peers and the rooms they occupy. A room holds at most
//! two members, each in its own positional [`Slot`]. A departing member frees its slot for
//! the next joiner; the first slot is preferred when both are free.
use duet_common::{PeerId, PeerInfo, Slot};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("room {0} is full")]
    RoomFull(String),

    #[error("peer {peer_id} is already in room {room_id}")]
    AlreadyInRoom { peer_id: PeerId, room_id: String },

    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
}

/// A connected participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub peer_id: PeerId,
    pub identity: Option<String>,
    pub room_id: Option<String>,
    pub slot: Option<Slot>,
}

#[derive(Debug, Default)]
struct Room {
    /// Join order
    members: Vec<(PeerId, Slot)>,
}

impl Room {
    fn free_slot(&self) -> Option<Slot> {
        Slot::ALL
            .into_iter()
            .find(|slot| self.members.iter().all(|(_, taken)| taken != slot))
    }
}

/// A successful join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub slot: Slot,
    /// Members present before this join
    pub others: Vec<PeerInfo>,
}

/// A peer leaving a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub peer_id: PeerId,
    pub room_id: String,
    pub slot: Slot,
    pub identity: String,
    /// Members still in the room
    pub remaining: Vec<PeerId>,
}

/// Room occupancy for status reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: String,
    pub members: Vec<PeerInfo>,
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    peers: HashMap<PeerId, Peer>,
    rooms: HashMap<String, Room>,
}

impl RoomRegistry {
    pub const ROOM_CAPACITY: usize = 2;

    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly connected peer
    pub fn connect(&mut self, peer_id: PeerId) {
        self.peers.entry(peer_id).or_insert(Peer {
            peer_id,
            identity: None,
            room_id: None,
            slot: None,
        });
    }

    /// Forget a peer, leaving its room first
    pub fn disconnect(&mut self, peer_id: PeerId) -> Option<Departure> {
        let departure = self.leave(peer_id);
        self.peers.remove(&peer_id);
        departure
    }

    /// Place a peer in a room. Rejections leave every structure untouched.
    pub fn join(
        &mut self,
        room_id: &str,
        peer_id: PeerId,
        identity: &str,
    ) -> Result<JoinOutcome, RegistryError> {
        let peer = self
            .peers
            .get(&peer_id)
            .ok_or(RegistryError::UnknownPeer(peer_id))?;
        if let Some(current) = &peer.room_id {
            return Err(RegistryError::AlreadyInRoom {
                peer_id,
                room_id: current.clone(),
            });
        }

        let slot = match self.rooms.get(room_id) {
            Some(room) if room.members.len() >= Self::ROOM_CAPACITY => None,
            Some(room) => room.free_slot(),
            None => Some(Slot::First),
        }
        .ok_or_else(|| RegistryError::RoomFull(room_id.to_string()))?;

        let others = self.members(room_id);

        let room = self.rooms.entry(room_id.to_string()).or_default();
        room.members.push((peer_id, slot));

        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.identity = Some(identity.to_string());
            peer.room_id = Some(room_id.to_string());
            peer.slot = Some(slot);
        }

        Ok(JoinOutcome { slot, others })
    }

    /// Take a peer out of its room. `None` if it was not in one.
    pub fn leave(&mut self, peer_id: PeerId) -> Option<Departure> {
        let peer = self.peers.get_mut(&peer_id)?;
        let room_id = peer.room_id.take()?;
        let slot = peer.slot.take()?;
        let identity = peer.identity.clone().unwrap_or_default();

        let remaining = match self.rooms.get_mut(&room_id) {
            Some(room) => {
                room.members.retain(|(member, _)| *member != peer_id);
                room.members.iter().map(|(member, _)| *member).collect()
            },
            None => Vec::new(),
        };
        if remaining.is_empty() {
            self.rooms.remove(&room_id);
        }

        Some(Departure {
            peer_id,
            room_id,
            slot,
            identity,
            remaining,
        })
    }

    pub fn peer(&self, peer_id: PeerId) -> Option<&Peer> {
        self.peers.get(&peer_id)
    }

    /// Members of a room in join order
    pub fn members(&self, room_id: &str) -> Vec<PeerInfo> {
        let Some(room) = self.rooms.get(room_id) else {
            return Vec::new();
        };
        room.members
            .iter()
            .filter_map(|(id, _)| self.peers.get(id))
            .filter_map(|peer| {
                Some(PeerInfo {
                    peer_id: peer.peer_id,
                    identity: peer.identity.clone()?,
                    slot: peer.slot?,
                })
            })
            .collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn rooms(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self
            .rooms
            .keys()
            .map(|room_id| RoomSummary {
                room_id: room_id.clone(),
                members: self.members(room_id),
            })
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }
}
