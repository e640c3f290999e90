//! Ephemeral pointer presence.
//!
//! Pointer updates bypass the document replica entirely: they travel as
//! plaintext JSON under the `POINTER` opcode, are never persisted, never
//! queued or retried, and each update for a user supersedes the previous.
//!
//! ```text
//! local pointer move
//!       │
//!       ▼
//! PointerUpdate ──JSON──► POINTER frame ──► relay ──► peers
//!                                                      │
//!                                                      ▼
//!                                     PresenceBoard::apply (latest per user)
//! ```
//!
//! Reference: Kleppmann, Chapter 8, Broadcast Protocols

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::protocol::ProtocolError;

/// Identity of the local participant, stamped on outgoing pointer updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub id: String,
    pub name: String,
}

impl LocalUser {
    /// Create with a fresh random id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
        }
    }

    /// Create with explicit id (backend user ids, tests).
    pub fn with_id(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Cursor position of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerUpdate {
    pub x: f64,
    pub y: f64,
    pub user_id: String,
    pub user_name: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl PointerUpdate {
    /// Pointer update for `user`, stamped now.
    pub fn new(x: f64, y: f64, user: &LocalUser) -> Self {
        Self {
            x,
            y,
            user_id: user.id.clone(),
            user_name: user.name.clone(),
            timestamp: now_millis(),
        }
    }
}

/// Presence messages carried in `POINTER` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceMessage {
    Pointer(PointerUpdate),
}

impl PresenceMessage {
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Malformed {
            kind: "presence",
            reason: e.to_string(),
        })
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed {
            kind: "presence",
            reason: e.to_string(),
        })
    }

    pub fn user_id(&self) -> &str {
        match self {
            PresenceMessage::Pointer(update) => &update.user_id,
        }
    }
}

/// Remote pointer as tracked locally.
#[derive(Debug, Clone)]
struct RemotePointer {
    update: PointerUpdate,
    last_seen: Instant,
}

/// Latest pointer per remote user in a room.
pub struct PresenceBoard {
    local_user_id: String,
    peers: HashMap<String, RemotePointer>,
    /// Users silent for longer than this are pruned.
    idle_timeout: Duration,
}

impl PresenceBoard {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self::with_idle_timeout(local_user_id, Duration::from_secs(30))
    }

    pub fn with_idle_timeout(local_user_id: impl Into<String>, idle_timeout: Duration) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            peers: HashMap::new(),
            idle_timeout,
        }
    }

    /// Record an inbound pointer update.
    ///
    /// Returns `false` for our own echo and for updates older than the
    /// one already held for that user.
    pub fn apply(&mut self, update: PointerUpdate) -> bool {
        if update.user_id == self.local_user_id {
            return false;
        }
        if let Some(existing) = self.peers.get(&update.user_id) {
            if update.timestamp < existing.update.timestamp {
                log::trace!("stale pointer from {} dropped", update.user_id);
                return false;
            }
        }
        self.peers.insert(
            update.user_id.clone(),
            RemotePointer {
                update,
                last_seen: Instant::now(),
            },
        );
        true
    }

    pub fn get(&self, user_id: &str) -> Option<&PointerUpdate> {
        self.peers.get(user_id).map(|p| &p.update)
    }

    pub fn remove(&mut self, user_id: &str) -> Option<PointerUpdate> {
        self.peers.remove(user_id).map(|p| p.update)
    }

    /// Snapshot of all remote pointers.
    pub fn pointers(&self) -> Vec<PointerUpdate> {
        self.peers.values().map(|p| p.update.clone()).collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Drop users that have been silent past the idle timeout.
    pub fn prune_idle(&mut self) -> Vec<String> {
        let timeout = self.idle_timeout;
        let idle: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.last_seen.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &idle {
            self.peers.remove(id);
        }
        idle
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(user: &str, x: f64, timestamp: u64) -> PointerUpdate {
        PointerUpdate {
            x,
            y: 2.0,
            user_id: user.to_string(),
            user_name: format!("name-{user}"),
            timestamp,
        }
    }

    #[test]
    fn test_pointer_json_shape() {
        let msg = PresenceMessage::Pointer(update("u1", 10.5, 1_700_000_000_000));
        let json: serde_json::Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "pointer");
        assert_eq!(json["x"], 10.5);
        assert_eq!(json["y"], 2.0);
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["userName"], "name-u1");
        assert_eq!(json["timestamp"], 1_700_000_000_000u64);
    }

    #[test]
    fn test_pointer_json_roundtrip() {
        let msg = PresenceMessage::Pointer(update("u1", 1.0, 5));
        let decoded = PresenceMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.user_id(), "u1");
    }

    #[test]
    fn test_parse_external_pointer_json() {
        let raw = br#"{"type":"pointer","x":3,"y":4,"userId":"abc","userName":"Ann","timestamp":9}"#;
        let PresenceMessage::Pointer(p) = PresenceMessage::from_json(raw).unwrap();
        assert_eq!((p.x, p.y), (3.0, 4.0));
        assert_eq!(p.user_name, "Ann");
    }

    #[test]
    fn test_malformed_presence_rejected() {
        assert!(PresenceMessage::from_json(b"not json").is_err());
        assert!(PresenceMessage::from_json(br#"{"type":"pointer","x":1}"#).is_err());
    }

    #[test]
    fn test_new_pointer_stamps_user_and_time() {
        let user = LocalUser::with_id("me", "Me");
        let p = PointerUpdate::new(1.0, 2.0, &user);
        assert_eq!(p.user_id, "me");
        assert_eq!(p.user_name, "Me");
        assert!(p.timestamp > 0);
    }

    #[test]
    fn test_board_supersedes_per_user() {
        let mut board = PresenceBoard::new("me");
        assert!(board.apply(update("a", 1.0, 10)));
        assert!(board.apply(update("a", 2.0, 11)));
        assert!(board.apply(update("b", 5.0, 1)));

        assert_eq!(board.peer_count(), 2);
        assert_eq!(board.get("a").unwrap().x, 2.0);
    }

    #[test]
    fn test_board_ignores_self_and_stale() {
        let mut board = PresenceBoard::new("me");
        assert!(!board.apply(update("me", 1.0, 1)));

        board.apply(update("a", 1.0, 10));
        assert!(!board.apply(update("a", 9.0, 9)));
        assert_eq!(board.get("a").unwrap().x, 1.0);
        // equal timestamps still supersede
        assert!(board.apply(update("a", 3.0, 10)));
        assert_eq!(board.get("a").unwrap().x, 3.0);
    }

    #[test]
    fn test_board_prune_idle() {
        let mut board = PresenceBoard::with_idle_timeout("me", Duration::ZERO);
        board.apply(update("a", 1.0, 1));
        std::thread::sleep(Duration::from_millis(5));

        let pruned = board.prune_idle();
        assert_eq!(pruned, vec!["a".to_string()]);
        assert_eq!(board.peer_count(), 0);
    }

    #[test]
    fn test_board_remove_and_clear() {
        let mut board = PresenceBoard::new("me");
        board.apply(update("a", 1.0, 1));
        board.apply(update("b", 1.0, 1));
        assert!(board.remove("a").is_some());
        assert_eq!(board.pointers().len(), 1);
        board.clear();
        assert_eq!(board.peer_count(), 0);
    }

    #[test]
    fn test_local_user_ids_unique() {
        assert_ne!(LocalUser::new("A").id, LocalUser::new("A").id);
    }
}
