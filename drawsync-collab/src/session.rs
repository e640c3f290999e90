//! WebSocket transport session for one room.
//!
//! Provides:
//! - Connection lifecycle (connect, reconnect with linear backoff, dispose)
//! - Encrypted document sync on top of the local [`DocumentReplica`]
//! - Role-checked sends and pointer presence
//!
//! ```text
//!                 ┌────────────── driver task ──────────────┐
//! connect() ────► │ connect_async ─► pump ─► backoff ─► ... │
//!                 │                   │                     │
//!                 │   inbound frame ──┤── outgoing channel  │
//!                 │   shutdown ───────┘                     │
//!                 └─────────────────────────────────────────┘
//!                        │                    ▲
//!                        ▼                    │
//!              SessionEvent / DocChange   send / apply_local_edit
//! ```
//!
//! Reference: Kleppmann, Chapter 5, Replication

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use drawsync_core::{DocChange, DocumentReplica, TxnOrigin};

use crate::crypto::{CryptoError, RoomCipher};
use crate::presence::{LocalUser, PointerUpdate, PresenceBoard, PresenceMessage};
use crate::protocol::{pack, unpack, ControlMessage, Opcode, ProtocolError, SyncRequest};
use crate::room::{can_send, Room};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `dispose` waits for the driver to send its close frame.
const DISPOSE_GRACE: Duration = Duration::from_millis(500);

/// Linear reconnect schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry; retry `n` waits `n * base_interval`.
    pub base_interval: Duration,
    /// Retries before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(2),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_interval * attempt
    }
}

/// Retry counter driven by a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    /// Advance to the next retry. `None` once the policy is exhausted.
    pub fn next_delay(&mut self) -> Option<(u32, Duration)> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some((self.attempts, self.policy.delay_for(self.attempts)))
    }

    /// Called after a successful open.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket base URL; the room id is appended as the last path segment
    pub base_url: String,
    pub reconnect: ReconnectPolicy,
    /// Buffered session events before new ones are dropped
    pub event_capacity: usize,
    /// Buffered outbound frames per connection
    pub outgoing_capacity: usize,
    /// Remote pointers silent for this long are dropped
    pub pointer_idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://127.0.0.1:9090".to_string(),
            reconnect: ReconnectPolicy::default(),
            event_capacity: 256,
            outgoing_capacity: 256,
            pointer_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    /// Defaults, with `base_url` taken from `DRAWSYNC_WS_URL` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("DRAWSYNC_WS_URL") {
            if !url.trim().is_empty() {
                config.base_url = url.trim().to_string();
            }
        }
        config
    }

    pub fn room_url(&self, room_id: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), room_id)
    }
}

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting on the backoff timer
    Reconnecting,
    /// Terminal
    Disposed,
}

/// Events emitted by the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    /// An established connection closed. `clean` is true for close code 1000.
    Disconnected { clean: bool },
    Reconnecting { attempt: u32, delay: Duration },
    /// Retries used up; the session will not reconnect on its own.
    ReconnectExhausted { attempts: u32 },
    /// A remote delta or full state changed the document
    DocumentChanged(DocChange),
    Pointer(PointerUpdate),
    /// A remote pointer went idle and was removed
    PointerGone { user_id: String },
    UserCount(usize),
    DecryptFailed { opcode: Opcode, error: CryptoError },
}

/// Result of a send attempt. Declined sends are outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The room role may not send this opcode
    Forbidden,
    NotConnected,
    /// Pointer discarded because the outgoing queue was full
    Dropped,
    /// The text matched the replica; nothing to send
    Unchanged,
    Disposed,
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("session already connected")]
    AlreadyConnected,
    #[error("session disposed")]
    Disposed,
}

/// State shared between the session handle and its driver task.
struct Shared {
    room: Room,
    user: LocalUser,
    cipher: RoomCipher,
    replica: Mutex<DocumentReplica>,
    presence: Mutex<PresenceBoard>,
    state: RwLock<ConnectionState>,
    /// Present only while a connection is open
    outgoing: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    user_count: AtomicUsize,
    disposed: AtomicBool,
    event_tx: mpsc::Sender<SessionEvent>,
    change_tx: broadcast::Sender<DocChange>,
}

impl Shared {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().await;
        if *state != ConnectionState::Disposed {
            *state = next;
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.event_tx.try_send(event) {
            log::debug!("event channel full, dropping {event:?}");
        }
    }

    fn publish_change(&self, change: DocChange) {
        // no subscribers is fine
        let _ = self.change_tx.send(change);
    }

    async fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> SendOutcome {
        if self.is_disposed() {
            return SendOutcome::Disposed;
        }
        if !can_send(opcode, self.room.role()) {
            log::warn!(
                "{:?} role may not send {opcode} in room {}",
                self.room.role(),
                self.room.id()
            );
            return SendOutcome::Forbidden;
        }
        let Some(tx) = self.outgoing.read().await.clone() else {
            return SendOutcome::NotConnected;
        };
        let frame = pack(opcode, payload);
        if opcode == Opcode::Pointer {
            // presence is lossy: never wait behind document frames
            return match tx.try_send(frame) {
                Ok(()) => SendOutcome::Sent,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::trace!("outgoing queue full, pointer dropped");
                    SendOutcome::Dropped
                }
                Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::NotConnected,
            };
        }
        match tx.send(frame).await {
            Ok(()) => SendOutcome::Sent,
            Err(_) => SendOutcome::NotConnected,
        }
    }

    async fn send_encrypted(
        &self,
        opcode: Opcode,
        plaintext: &[u8],
    ) -> Result<SendOutcome, SessionError> {
        let ciphertext = self.cipher.encrypt(plaintext)?;
        Ok(self.send_frame(opcode, &ciphertext).await)
    }

    /// Encrypt and frame a reply produced by the driver itself.
    ///
    /// Driver replies are written straight to the socket by [`pump`], never
    /// through the outgoing channel the driver drains.
    fn seal_frame(&self, opcode: Opcode, plaintext: &[u8], kind: &str) -> Option<Vec<u8>> {
        if !can_send(opcode, self.room.role()) {
            return None;
        }
        match self.cipher.encrypt(plaintext) {
            Ok(ciphertext) => {
                log::debug!("sending {kind} in room {}", self.room.id());
                Some(pack(opcode, &ciphertext))
            }
            Err(e) => {
                log::error!("failed to encrypt {kind}: {e}");
                None
            }
        }
    }

    /// Sync frame sent after every open.
    async fn resync_on_open(&self) -> Option<Vec<u8>> {
        if !self.room.role().can_edit() {
            return None;
        }
        let (body, kind) = {
            let replica = self.replica.lock().await;
            if replica.is_empty() {
                let request = SyncRequest::new(Some(replica.state_vector()));
                (request.encode(), "sync request")
            } else {
                (replica.encode_full_state(), "full state")
            }
        };
        self.seal_frame(Opcode::FullSync, &body, kind)
    }

    async fn full_state_frame(&self) -> Option<Vec<u8>> {
        if !self.room.role().can_edit() {
            return None;
        }
        let state = {
            let replica = self.replica.lock().await;
            if replica.is_empty() {
                return None;
            }
            replica.encode_full_state()
        };
        self.seal_frame(Opcode::FullSync, &state, "full state")
    }

    /// Handle one inbound binary frame; returns a reply frame, if any.
    async fn handle_binary(&self, data: &[u8]) -> Option<Vec<u8>> {
        let msg = match unpack(data) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("dropping frame in room {}: {e}", self.room.id());
                return None;
            }
        };
        log::trace!("received {} ({} bytes)", msg.opcode, msg.payload.len());

        match msg.opcode {
            Opcode::Pointer => {
                self.handle_pointer(&msg.payload).await;
                None
            }
            Opcode::ElementsUpdate => {
                let plaintext = self.open_payload(msg.opcode, &msg.payload)?;
                self.merge(&plaintext).await;
                None
            }
            Opcode::FullSync => {
                let plaintext = self.open_payload(msg.opcode, &msg.payload)?;
                match SyncRequest::parse(&plaintext) {
                    Some(request) => self.answer_sync_request(request).await,
                    None => {
                        self.merge(&plaintext).await;
                        None
                    }
                }
            }
        }
    }

    fn open_payload(&self, opcode: Opcode, payload: &[u8]) -> Option<Vec<u8>> {
        match self.cipher.decrypt(payload) {
            Ok(plaintext) => Some(plaintext),
            Err(error) => {
                log::error!("failed to decrypt {opcode} in room {}: {error}", self.room.id());
                self.emit(SessionEvent::DecryptFailed { opcode, error });
                None
            }
        }
    }

    async fn merge(&self, delta: &[u8]) {
        let result = {
            let mut replica = self.replica.lock().await;
            replica.apply_remote_delta(delta, TxnOrigin::remote(self.room.id()))
        };
        match result {
            Ok(Some(change)) => {
                self.publish_change(change.clone());
                self.emit(SessionEvent::DocumentChanged(change));
            }
            Ok(None) => log::trace!("remote delta left document unchanged"),
            Err(e) => log::warn!("rejected remote delta in room {}: {e}", self.room.id()),
        }
    }

    async fn answer_sync_request(&self, request: SyncRequest) -> Option<Vec<u8>> {
        if !self.room.role().can_edit() {
            return None;
        }
        let body = {
            let replica = self.replica.lock().await;
            if replica.is_empty() {
                return None;
            }
            match request.state_vector {
                Some(sv) => replica.diff_since(&sv).unwrap_or_else(|e| {
                    log::debug!("bad state vector in sync request ({e}), sending full state");
                    replica.encode_full_state()
                }),
                None => replica.encode_full_state(),
            }
        };
        self.seal_frame(Opcode::FullSync, &body, "sync answer")
    }

    async fn handle_pointer(&self, payload: &[u8]) {
        match PresenceMessage::from_json(payload) {
            Ok(PresenceMessage::Pointer(update)) => {
                let accepted = self.presence.lock().await.apply(update.clone());
                if accepted {
                    self.emit(SessionEvent::Pointer(update));
                }
            }
            Err(e) => log::warn!("dropping pointer frame: {e}"),
        }
    }

    /// Handle one control message; returns a full-state frame when a
    /// newcomer needs hydrating.
    async fn handle_text(&self, text: &str) -> Option<Vec<u8>> {
        let count = match ControlMessage::parse(text) {
            Ok(ControlMessage::UserCount { count }) => count,
            Err(e) => {
                log::debug!("ignoring text frame: {e}");
                return None;
            }
        };
        let previous = self.user_count.swap(count, Ordering::SeqCst);
        log::debug!("room {} now has {count} users", self.room.id());
        self.emit(SessionEvent::UserCount(count));

        if count < previous {
            self.sweep_presence().await;
        }
        // 0 means this connection has not seen a count yet and
        // already resynced on open
        if previous != 0 && count > previous {
            return self.full_state_frame().await;
        }
        None
    }

    /// Drop remote pointers that went idle.
    async fn sweep_presence(&self) {
        let gone = self.presence.lock().await.prune_idle();
        for user_id in gone {
            log::debug!("pointer of {user_id} went idle in room {}", self.room.id());
            self.emit(SessionEvent::PointerGone { user_id });
        }
    }
}

/// Owned handle to one room connection.
///
/// The replica survives reconnects; it is rehydrated over `FULL_SYNC`
/// whenever the session rejoins with nothing local.
pub struct CollabSession {
    shared: Arc<Shared>,
    config: SessionConfig,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    shutdown_tx: watch::Sender<bool>,
    driver: Option<JoinHandle<()>>,
}

impl CollabSession {
    /// Create a session. Derives the room key once.
    pub fn new(config: SessionConfig, room: Room, user: LocalUser) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (change_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        let cipher = RoomCipher::new(room.secret());
        let presence = PresenceBoard::with_idle_timeout(user.id.clone(), config.pointer_idle_timeout);

        Self {
            shared: Arc::new(Shared {
                room,
                user,
                cipher,
                replica: Mutex::new(DocumentReplica::new()),
                presence: Mutex::new(presence),
                state: RwLock::new(ConnectionState::Disconnected),
                outgoing: RwLock::new(None),
                user_count: AtomicUsize::new(0),
                disposed: AtomicBool::new(false),
                event_tx,
                change_tx,
            }),
            config,
            event_rx: Some(event_rx),
            shutdown_tx,
            driver: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Subscribe to document change notifications, local and remote.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<DocChange> {
        self.shared.change_tx.subscribe()
    }

    /// Start the driver task and wait for the first connection attempt.
    ///
    /// A failed first attempt is reported here, and the driver keeps
    /// retrying on the reconnect schedule until dispose or exhaustion.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if self.shared.is_disposed() {
            return Err(SessionError::Disposed);
        }
        if self.driver.as_ref().is_some_and(|d| !d.is_finished()) {
            return Err(SessionError::AlreadyConnected);
        }

        let (first_tx, first_rx) = oneshot::channel();
        let shared = self.shared.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown_tx.subscribe();
        self.driver = Some(tokio::spawn(drive(shared, config, shutdown, first_tx)));

        first_rx.await.unwrap_or(Err(SessionError::Disposed))
    }

    /// Send a frame with `payload` as given.
    ///
    /// Encrypted opcodes expect ciphertext produced by [`Self::cipher`].
    pub async fn send(&self, opcode: Opcode, payload: &[u8]) -> SendOutcome {
        self.shared.send_frame(opcode, payload).await
    }

    /// Replace the document with `text` and broadcast the delta.
    ///
    /// An edit made offline stays in the replica and reaches peers with
    /// the full state sent on the next open.
    pub async fn apply_local_edit(&self, text: &str) -> Result<SendOutcome, SessionError> {
        if self.shared.is_disposed() {
            return Ok(SendOutcome::Disposed);
        }
        if !can_send(Opcode::ElementsUpdate, self.shared.room.role()) {
            log::warn!("view client edit declined in room {}", self.shared.room.id());
            return Ok(SendOutcome::Forbidden);
        }

        let edit = self.shared.replica.lock().await.local_edit(text);
        let Some(edit) = edit else {
            return Ok(SendOutcome::Unchanged);
        };
        self.shared.publish_change(edit.change);
        self.shared
            .send_encrypted(Opcode::ElementsUpdate, &edit.delta)
            .await
    }

    /// Broadcast the local pointer position.
    ///
    /// Never waits: returns [`SendOutcome::Dropped`] when the outgoing queue
    /// is full.
    pub async fn send_pointer(&self, x: f64, y: f64) -> Result<SendOutcome, SessionError> {
        let update = PointerUpdate::new(x, y, &self.shared.user);
        let json = PresenceMessage::Pointer(update).to_json()?;
        Ok(self.shared.send_frame(Opcode::Pointer, &json).await)
    }

    pub async fn materialize(&self) -> String {
        self.shared.replica.lock().await.materialize()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub fn room(&self) -> &Room {
        &self.shared.room
    }

    pub fn user(&self) -> &LocalUser {
        &self.shared.user
    }

    pub fn cipher(&self) -> &RoomCipher {
        &self.shared.cipher
    }

    pub async fn remote_pointers(&self) -> Vec<PointerUpdate> {
        self.shared.presence.lock().await.pointers()
    }

    /// Last user count reported by the relay.
    pub fn user_count(&self) -> usize {
        self.shared.user_count.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Close the connection with code 1000 and stop reconnecting.
    ///
    /// Idempotent. Afterwards every send returns [`SendOutcome::Disposed`].
    pub async fn dispose(&mut self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("disposing session for room {}", self.shared.room.id());
        *self.shared.state.write().await = ConnectionState::Disposed;
        self.shutdown_tx.send_replace(true);

        if let Some(mut driver) = self.driver.take() {
            if tokio::time::timeout(DISPOSE_GRACE, &mut driver).await.is_err() {
                log::warn!("session driver did not stop in time, aborting");
                driver.abort();
            }
        }
        *self.shared.outgoing.write().await = None;
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut state) = self.shared.state.try_write() {
            *state = ConnectionState::Disposed;
        }
        // the driver sends its close frame and exits on its own
        self.shutdown_tx.send_replace(true);
    }
}

/// Connect, pump, back off, repeat.
async fn drive(
    shared: Arc<Shared>,
    config: SessionConfig,
    mut shutdown: watch::Receiver<bool>,
    first: oneshot::Sender<Result<(), SessionError>>,
) {
    let url = config.room_url(shared.room.id());
    let mut backoff = Backoff::new(config.reconnect.clone());
    let mut first = Some(first);

    loop {
        if *shutdown.borrow() || shared.is_disposed() {
            break;
        }
        shared.set_state(ConnectionState::Connecting).await;

        let attempt = tokio::select! {
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
            _ = shutdown.changed() => break,
        };

        match attempt {
            Ok((stream, _)) => {
                log::info!("connected to room {}", shared.room.id());
                backoff.reset();
                let clean = pump(&shared, stream, &config, &mut shutdown, &mut first).await;
                shared.presence.lock().await.clear();
                if shared.is_disposed() {
                    break;
                }
                log::info!("disconnected from room {} (clean: {clean})", shared.room.id());
                shared.emit(SessionEvent::Disconnected { clean });
            }
            Err(e) => {
                log::warn!("connection to {url} failed: {e}");
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(SessionError::Transport(e.to_string())));
                }
            }
        }

        shared.set_state(ConnectionState::Disconnected).await;
        if shared.is_disposed() {
            break;
        }

        match backoff.next_delay() {
            Some((attempt, delay)) => {
                log::info!("reconnecting in {delay:?} (attempt {attempt})");
                shared.set_state(ConnectionState::Reconnecting).await;
                shared.emit(SessionEvent::Reconnecting { attempt, delay });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
            None => {
                log::error!(
                    "giving up on room {} after {} reconnect attempts",
                    shared.room.id(),
                    backoff.attempts()
                );
                shared.set_state(ConnectionState::Disconnected).await;
                shared.emit(SessionEvent::ReconnectExhausted {
                    attempts: backoff.attempts(),
                });
                break;
            }
        }
    }

    shared.set_state(ConnectionState::Disconnected).await;
}

/// Serve one open connection. Returns whether it closed cleanly.
///
/// Application frames arrive on the outgoing channel; replies the driver
/// produces itself (sync answers, full-state broadcasts) are written to the
/// socket directly, so the driver never waits on a channel only it drains.
async fn pump(
    shared: &Arc<Shared>,
    stream: WsStream,
    config: &SessionConfig,
    shutdown: &mut watch::Receiver<bool>,
    first: &mut Option<oneshot::Sender<Result<(), SessionError>>>,
) -> bool {
    let (mut writer, mut reader) = stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(config.outgoing_capacity.max(1));
    let sweep_period = (config.pointer_idle_timeout / 2).max(Duration::from_millis(10));
    let mut sweep = tokio::time::interval_at(Instant::now() + sweep_period, sweep_period);

    *shared.outgoing.write().await = Some(out_tx);
    shared.user_count.store(0, Ordering::SeqCst);
    shared.set_state(ConnectionState::Connected).await;
    shared.emit(SessionEvent::Connected);
    if let Some(tx) = first.take() {
        let _ = tx.send(Ok(()));
    }
    let mut reply = shared.resync_on_open().await;

    let clean = loop {
        if let Some(frame) = reply.take() {
            if let Err(e) = writer.send(Message::Binary(frame.into())).await {
                log::warn!("failed to write frame: {e}");
                break false;
            }
        }

        reply = tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(Message::Binary(data))) => shared.handle_binary(&data).await,
                Some(Ok(Message::Text(text))) => shared.handle_text(text.as_str()).await,
                Some(Ok(Message::Close(frame))) => {
                    break frame.is_some_and(|f| f.code == CloseCode::Normal);
                }
                Some(Ok(_)) => None,
                Some(Err(e)) => {
                    log::warn!("websocket error in room {}: {e}", shared.room.id());
                    break false;
                }
                None => break false,
            },

            Some(frame) = out_rx.recv() => Some(frame),

            _ = sweep.tick() => {
                shared.sweep_presence().await;
                None
            }

            _ = shutdown.changed() => {
                let close = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "session disposed".into(),
                };
                if let Err(e) = writer.send(Message::Close(Some(close))).await {
                    log::debug!("close frame not delivered: {e}");
                }
                break true;
            }
        };
    };

    *shared.outgoing.write().await = None;
    clean
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::Role;

    fn session(role: Role) -> CollabSession {
        session_with(SessionConfig::default(), role)
    }

    fn session_with(config: SessionConfig, role: Role) -> CollabSession {
        CollabSession::new(
            config,
            Room::new("room-1", "secret", role),
            LocalUser::with_id("u1", "Alice"),
        )
    }

    /// Decrypt a FULL_SYNC reply into a fresh replica and return its text.
    fn replay_full_sync(session: &CollabSession, frame: &[u8]) -> String {
        let msg = unpack(frame).unwrap();
        assert_eq!(msg.opcode, Opcode::FullSync);
        let state = session.cipher().decrypt(&msg.payload).unwrap();
        let mut replica = DocumentReplica::new();
        replica
            .apply_remote_delta(&state, TxnOrigin::remote("test"))
            .unwrap();
        replica.materialize()
    }

    #[test]
    fn test_backoff_linear_then_exhausted() {
        let mut backoff = Backoff::new(ReconnectPolicy {
            base_interval: Duration::from_secs(2),
            max_attempts: 3,
        });
        assert_eq!(backoff.next_delay(), Some((1, Duration::from_secs(2))));
        assert_eq!(backoff.next_delay(), Some((2, Duration::from_secs(4))));
        assert_eq!(backoff.next_delay(), Some((3, Duration::from_secs(6))));
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempts(), 3);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some((1, Duration::from_secs(2))));
    }

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_interval, Duration::from_secs(2));
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.delay_for(10), Duration::from_secs(20));
    }

    #[test]
    fn test_room_url() {
        let mut config = SessionConfig::default();
        assert_eq!(config.room_url("abc"), "ws://127.0.0.1:9090/abc");
        config.base_url = "wss://example.com/ws/".to_string();
        assert_eq!(config.room_url("abc"), "wss://example.com/ws/abc");
    }

    #[tokio::test]
    async fn test_initial_state() {
        let mut session = session(Role::Edit);
        assert_eq!(session.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(session.user_count(), 0);
        assert_eq!(session.room().id(), "room-1");
        assert!(session.take_event_rx().is_some());
        assert!(session.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_view_edit_declined_without_mutation() {
        let session = session(Role::View);
        let outcome = session.apply_local_edit("<mxfile/>").await.unwrap();
        assert_eq!(outcome, SendOutcome::Forbidden);
        assert_eq!(session.materialize().await, "");

        assert_eq!(session.send(Opcode::FullSync, b"x").await, SendOutcome::Forbidden);
        assert_eq!(session.send(Opcode::ElementsUpdate, b"x").await, SendOutcome::Forbidden);
        assert_eq!(session.send(Opcode::Pointer, b"{}").await, SendOutcome::NotConnected);
    }

    #[tokio::test]
    async fn test_offline_edit_kept_locally() {
        let session = session(Role::Edit);
        let mut changes = session.subscribe_changes();

        let outcome = session.apply_local_edit("<mxfile>A</mxfile>").await.unwrap();
        assert_eq!(outcome, SendOutcome::NotConnected);
        assert_eq!(session.materialize().await, "<mxfile>A</mxfile>");

        let change = changes.recv().await.unwrap();
        assert!(change.origin.is_local());
        assert_eq!(change.text, "<mxfile>A</mxfile>");

        let again = session.apply_local_edit("<mxfile>A</mxfile>").await.unwrap();
        assert_eq!(again, SendOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_pointer_offline_not_queued() {
        let session = session(Role::View);
        assert_eq!(session.send_pointer(1.0, 2.0).await.unwrap(), SendOutcome::NotConnected);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let mut session = session(Role::Edit);
        session.dispose().await;
        session.dispose().await;

        assert!(session.is_disposed());
        assert_eq!(session.connection_state().await, ConnectionState::Disposed);
        assert_eq!(session.send(Opcode::Pointer, b"{}").await, SendOutcome::Disposed);
        assert_eq!(
            session.apply_local_edit("<mxfile/>").await.unwrap(),
            SendOutcome::Disposed
        );
        assert!(matches!(session.connect().await, Err(SessionError::Disposed)));
    }

    #[tokio::test]
    async fn test_inbound_frames_dispatch() {
        let mut session = session(Role::View);
        let mut events = session.take_event_rx().unwrap();

        let mut source = DocumentReplica::new();
        let delta = source.local_edit("<mxfile>remote</mxfile>").unwrap().delta;
        let ciphertext = session.cipher().encrypt(&delta).unwrap();
        session
            .shared
            .handle_binary(&pack(Opcode::ElementsUpdate, &ciphertext))
            .await;

        match events.recv().await.unwrap() {
            SessionEvent::DocumentChanged(change) => {
                assert!(change.origin.is_remote());
                assert_eq!(change.text, "<mxfile>remote</mxfile>");
            }
            other => panic!("unexpected event {other:?}"),
        }

        // wrong key
        let foreign = RoomCipher::new("other").encrypt(&delta).unwrap();
        session
            .shared
            .handle_binary(&pack(Opcode::ElementsUpdate, &foreign))
            .await;
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::DecryptFailed { opcode: Opcode::ElementsUpdate, .. }
        ));

        // malformed frames are dropped silently
        session.shared.handle_binary(&[]).await;
        session.shared.handle_binary(&[0x09, 1]).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_inbound_pointer_and_user_count() {
        let mut session = session(Role::View);
        let mut events = session.take_event_rx().unwrap();

        let peer = LocalUser::with_id("u2", "Bob");
        let json = PresenceMessage::Pointer(PointerUpdate::new(3.0, 4.0, &peer))
            .to_json()
            .unwrap();
        session.shared.handle_binary(&pack(Opcode::Pointer, &json)).await;
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Pointer(p) if p.user_id == "u2"));
        assert_eq!(session.remote_pointers().await.len(), 1);

        session
            .shared
            .handle_text(r#"{"type":"user_count","count":2}"#)
            .await;
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::UserCount(2)));
        assert_eq!(session.user_count(), 2);
    }

    #[tokio::test]
    async fn test_sync_request_answered_as_reply_frame() {
        let session = session(Role::Edit);
        session.apply_local_edit("<mxfile>A</mxfile>").await.unwrap();

        let request = session.cipher().encrypt(&SyncRequest::new(None).encode()).unwrap();
        let reply = session
            .shared
            .handle_binary(&pack(Opcode::FullSync, &request))
            .await
            .expect("editor with content answers");
        assert_eq!(replay_full_sync(&session, &reply), "<mxfile>A</mxfile>");

        // nothing went through the application queue
        assert!(session.shared.outgoing.read().await.is_none());
    }

    #[tokio::test]
    async fn test_user_count_growth_yields_full_state() {
        let editor = session(Role::Edit);
        editor.apply_local_edit("<mxfile>A</mxfile>").await.unwrap();

        let first = editor.shared.handle_text(r#"{"type":"user_count","count":1}"#).await;
        assert!(first.is_none());
        let grown = editor
            .shared
            .handle_text(r#"{"type":"user_count","count":2}"#)
            .await
            .expect("newcomer is hydrated");
        assert_eq!(replay_full_sync(&editor, &grown), "<mxfile>A</mxfile>");

        let viewer = session(Role::View);
        viewer.shared.handle_text(r#"{"type":"user_count","count":1}"#).await;
        assert!(viewer
            .shared
            .handle_text(r#"{"type":"user_count","count":2}"#)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_pointer_dropped_when_queue_full() {
        let session = session(Role::View);
        let (tx, mut rx) = mpsc::channel(1);
        *session.shared.outgoing.write().await = Some(tx);

        assert_eq!(session.send_pointer(1.0, 1.0).await.unwrap(), SendOutcome::Sent);
        assert_eq!(session.send_pointer(2.0, 2.0).await.unwrap(), SendOutcome::Dropped);

        let frame = rx.recv().await.unwrap();
        assert_eq!(unpack(&frame).unwrap().opcode, Opcode::Pointer);
        assert_eq!(session.send_pointer(3.0, 3.0).await.unwrap(), SendOutcome::Sent);
    }

    #[tokio::test]
    async fn test_idle_pointers_swept() {
        let mut session = session_with(
            SessionConfig {
                pointer_idle_timeout: Duration::from_millis(20),
                ..SessionConfig::default()
            },
            Role::View,
        );
        let mut events = session.take_event_rx().unwrap();

        let peer = LocalUser::with_id("u2", "Bob");
        let json = PresenceMessage::Pointer(PointerUpdate::new(3.0, 4.0, &peer))
            .to_json()
            .unwrap();
        session.shared.handle_binary(&pack(Opcode::Pointer, &json)).await;
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Pointer(_)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        session.shared.sweep_presence().await;

        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::PointerGone { user_id } if user_id == "u2"
        ));
        assert!(session.remote_pointers().await.is_empty());
    }

    #[tokio::test]
    async fn test_zero_capacities_are_clamped() {
        let mut session = session_with(
            SessionConfig {
                event_capacity: 0,
                outgoing_capacity: 0,
                ..SessionConfig::default()
            },
            Role::Edit,
        );
        let mut changes = session.subscribe_changes();
        assert!(session.take_event_rx().is_some());

        let outcome = session.apply_local_edit("<mxfile>A</mxfile>").await.unwrap();
        assert_eq!(outcome, SendOutcome::NotConnected);
        assert_eq!(changes.recv().await.unwrap().text, "<mxfile>A</mxfile>");
    }
}
