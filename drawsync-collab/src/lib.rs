//! # drawsync-collab: encrypted real-time sync for shared diagrams
//!
//! Carries replica deltas between editors over WebSocket, end-to-end
//! encrypted with a key derived from the room secret, and elects one
//! client per room to persist periodic snapshots.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   [opcode|IV||ciphertext]   ┌───────────────┐
//! │ CollabSession │ ◄─────────────────────────► │ RelayServer   │
//! │ (per editor)  │        WebSocket            │ (fan-out only)│
//! └──────┬────────┘                             └───────────────┘
//!        │ DocChange
//!        ▼
//! ┌─────────────────────┐  check_lock / upload  ┌───────────────┐
//! │ SnapshotCoordinator │ ────────────────────► │ backend       │
//! └─────────────────────┘                       └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: `[opcode:1][payload]` frames, sync requests, control JSON
//! - [`crypto`]: PBKDF2 key derivation and AES-256-GCM
//! - [`room`]: room identity, roles, send permissions
//! - [`session`]: client connection lifecycle and document sync
//! - [`presence`]: pointer updates and the remote pointer board
//! - [`snapshot`]: debounced, lock-coordinated snapshot uploads
//! - [`broadcast`]: per-room fan-out
//! - [`relay`]: WebSocket relay server

pub mod broadcast;
pub mod crypto;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod room;
pub mod session;
pub mod snapshot;

// Re-exports for convenience
pub use crypto::{derive_key, CryptoError, RoomCipher, RoomKey};
pub use presence::{LocalUser, PointerUpdate, PresenceBoard, PresenceMessage};
pub use protocol::{pack, unpack, ControlMessage, Opcode, ProtocolError, ProtocolMessage, SyncRequest};
pub use relay::{RelayConfig, RelayError, RelayServer, RelayStats};
pub use room::{can_receive, can_send, Role, Room};
pub use session::{
    Backoff, CollabSession, ConnectionState, ReconnectPolicy, SendOutcome, SessionConfig,
    SessionError, SessionEvent,
};
pub use snapshot::{
    BackendError, CoordinatorHandle, LockService, MemoryLockService, MemorySnapshotStore,
    PersistenceConfig, PersistenceError, RpcResponse, SaveOutcome, Snapshot, SnapshotCoordinator,
    SnapshotUploader, RPC_SUCCESS,
};
