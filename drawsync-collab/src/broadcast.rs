//! Fan-out of relayed frames to the peers of one room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! frames; every frame carries its sender so a peer skips its own.
//!
//! Reference: Patterson & Hennessy, Section 6.4, Interconnection Networks

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::ControlMessage;

/// Frame body as it travels between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    /// Protocol frame, forwarded untouched
    Binary(Vec<u8>),
    /// Control JSON generated by the relay
    Text(String),
}

/// A frame queued for fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    /// Originating connection; nil for relay-generated frames
    pub sender: Uuid,
    pub payload: FramePayload,
}

impl RelayFrame {
    pub fn binary(sender: Uuid, bytes: Vec<u8>) -> Self {
        Self {
            sender,
            payload: FramePayload::Binary(bytes),
        }
    }

    /// Control message addressed to every peer, sender included.
    pub fn control(msg: &ControlMessage) -> Self {
        Self {
            sender: Uuid::nil(),
            payload: FramePayload::Text(msg.to_json()),
        }
    }

    pub fn is_from(&self, peer_id: Uuid) -> bool {
        !self.sender.is_nil() && self.sender == peer_id
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub active_peers: usize,
}

/// Connections in one room sharing one broadcast channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RelayFrame>>,
    /// Connection id → remote address
    peers: RwLock<HashMap<Uuid, SocketAddr>>,
    capacity: usize,
    frames_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per peer before a slow peer lags.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Register a connection; returns its receiver.
    pub async fn add_peer(&self, peer_id: Uuid, addr: SocketAddr) -> broadcast::Receiver<Arc<RelayFrame>> {
        let mut peers = self.peers.write().await;
        peers.insert(peer_id, addr);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<SocketAddr> {
        self.peers.write().await.remove(peer_id)
    }

    /// Queue a frame for every subscriber. Returns the receiver count.
    pub fn broadcast(&self, frame: RelayFrame) -> usize {
        let count = self.sender.send(Arc::new(frame)).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Tell every peer how many peers the room has.
    pub async fn announce_user_count(&self) -> usize {
        let count = self.peer_count().await;
        self.broadcast(RelayFrame::control(&ControlMessage::UserCount { count }));
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peer_ids(&self) -> Vec<Uuid> {
        self.peers.read().await.keys().copied().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Why a connection could not join a room.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("room {room_id} is full ({limit} peers)")]
    RoomFull { room_id: String, limit: usize },
}

/// A connection's place in a room, handed out by [`RoomManager::join`].
pub struct Membership {
    pub group: Arc<BroadcastGroup>,
    pub receiver: broadcast::Receiver<Arc<RelayFrame>>,
    /// Peers in the room including this one
    pub peer_count: usize,
}

/// Room id → broadcast group. Rooms are isolated from each other.
///
/// Joins and leaves run under the write lock of the room map, so a room is
/// never dropped between a joiner finding it and registering in it. Every
/// peer of a room id therefore shares one group.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    capacity: usize,
    max_peers: usize,
}

impl RoomManager {
    /// `capacity` frames buffered per peer; at most `max_peers` per room.
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            max_peers,
        }
    }

    /// Register `peer_id` in `room_id`, creating the room on first join,
    /// and announce the new user count to the room.
    pub async fn join(
        &self,
        room_id: &str,
        peer_id: Uuid,
        addr: SocketAddr,
    ) -> Result<Membership, JoinError> {
        let mut rooms = self.rooms.write().await;

        let occupied = match rooms.get(room_id) {
            Some(group) => group.peer_count().await,
            None => 0,
        };
        if occupied >= self.max_peers {
            return Err(JoinError::RoomFull {
                room_id: room_id.to_string(),
                limit: self.max_peers,
            });
        }

        let group = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.capacity)))
            .clone();
        let receiver = group.add_peer(peer_id, addr).await;
        let peer_count = group.announce_user_count().await;

        Ok(Membership {
            group,
            receiver,
            peer_count,
        })
    }

    /// Remove `peer_id` from `room_id`. The last peer out drops the room;
    /// otherwise the remaining peers get the new user count.
    ///
    /// Returns the number of peers left.
    pub async fn leave(&self, room_id: &str, peer_id: &Uuid) -> usize {
        let mut rooms = self.rooms.write().await;
        let Some(group) = rooms.get(room_id).cloned() else {
            return 0;
        };

        group.remove_peer(peer_id).await;
        let remaining = group.peer_count().await;
        if remaining == 0 {
            rooms.remove(room_id);
        } else {
            group.announce_user_count().await;
        }
        remaining
    }

    /// The live group for `room_id`, if anyone is in it.
    pub async fn group(&self, room_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }
}
