//! Debounced, lock-coordinated snapshot persistence.
//!
//! Architecture:
//! ```text
//! ┌────────────────┐  DocChange   ┌─────────────────────┐
//! │ CollabSession  │ ───────────► │ coordinator task    │
//! └────────────────┘  (broadcast) │  debounce / count   │
//!                                 └──────────┬──────────┘
//!                                            │ save(text)
//!                                            ▼
//!                     ┌──────────────────────────────────────────┐
//!                     │ check_lock ──► encrypt ──► base64 ──► upload │
//!                     └──────────────────────────────────────────┘
//! ```
//!
//! Every connected client runs a coordinator, but only the one holding the
//! room lock uploads. The lock is advisory and time-bounded: the backend
//! grants it for a cooldown window and no client ever releases it.
//!
//! | Trigger        | Default | Behaviour                              |
//! |----------------|---------|----------------------------------------|
//! | Debounce       | 2000 ms | timer resets on every change           |
//! | Update count   | 500     | fires after N changes, timer cleared   |
//! | `flush()`      | -       | immediate, bypasses the timer          |
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 8

pub mod memory;

pub use memory::{LockClient, MemoryLockService, MemorySnapshotStore, LOCK_COOLDOWN};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use drawsync_core::DocChange;

use crate::crypto::{CryptoError, RoomCipher, IV_LEN};

/// Response code meaning success in backend RPCs.
pub const RPC_SUCCESS: i32 = 0;

/// Envelope returned by backend RPCs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse<T> {
    pub code: i32,
    #[serde(default)]
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

impl<T> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: RPC_SUCCESS,
            data: Some(data),
            message: None,
        }
    }

    pub fn err(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            data: None,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == RPC_SUCCESS
    }
}

impl RpcResponse<bool> {
    /// Lock granted to the caller.
    pub fn acquired(&self) -> bool {
        self.is_success() && self.data == Some(true)
    }
}

/// Transport-level backend failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend error: {0}")]
    Other(String),
}

/// Room-scoped snapshot lock.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to take the lock; `data == Some(true)` means acquired.
    async fn check_lock(&self, room_id: &str) -> Result<RpcResponse<bool>, BackendError>;
}

/// Durable snapshot storage.
#[async_trait]
pub trait SnapshotUploader: Send + Sync {
    /// Store `body` (base64 of `IV || ciphertext`) as the room's snapshot.
    async fn upload_snapshot(
        &self,
        room_id: &str,
        body: &str,
    ) -> Result<RpcResponse<()>, BackendError>;
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("upload rejected (code {code}): {message}")]
    Rejected { code: i32, message: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),
    #[error("coordinator stopped")]
    Stopped,
}

/// Outcome of a save attempt. Only `Saved` wrote anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// Another save is still running
    InFlight,
    /// Text equals the last saved text
    Unchanged,
    /// Another client holds the lock
    LockContended,
}

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Quiet period before a save
    pub debounce: Duration,
    /// Changes that force a save regardless of the timer
    pub update_threshold: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(2000),
            update_threshold: 500,
        }
    }
}

/// Encrypted snapshot as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub room_id: String,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl Snapshot {
    /// Encrypt `text` for `room_id`.
    pub fn seal(room_id: &str, cipher: &RoomCipher, text: &str) -> Result<Self, CryptoError> {
        let blob = cipher.encrypt(text.as_bytes())?;
        let (iv, ciphertext) = blob.split_at(IV_LEN);
        Ok(Self {
            room_id: room_id.to_string(),
            iv: iv.to_vec(),
            ciphertext: ciphertext.to_vec(),
        })
    }

    /// Parse an uploaded body.
    pub fn from_body(room_id: &str, body: &str) -> Result<Self, PersistenceError> {
        let blob = base64::engine::general_purpose::STANDARD
            .decode(body.trim())
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        if blob.len() < IV_LEN {
            return Err(PersistenceError::Corrupt(format!(
                "{} bytes, shorter than the IV",
                blob.len()
            )));
        }
        let (iv, ciphertext) = blob.split_at(IV_LEN);
        Ok(Self {
            room_id: room_id.to_string(),
            iv: iv.to_vec(),
            ciphertext: ciphertext.to_vec(),
        })
    }

    /// Base64 of `IV || ciphertext`, the upload body.
    pub fn to_body(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.blob())
    }

    /// Decrypt back to document text.
    pub fn open(&self, cipher: &RoomCipher) -> Result<String, PersistenceError> {
        let plaintext = cipher.decrypt(&self.blob())?;
        String::from_utf8(plaintext).map_err(|e| PersistenceError::Corrupt(e.to_string()))
    }

    fn blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(self.iv.len() + self.ciphertext.len());
        blob.extend_from_slice(&self.iv);
        blob.extend_from_slice(&self.ciphertext);
        blob
    }
}

/// Clears the in-flight flag when a save finishes, however it finishes.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Elects this client as writer when it can and uploads snapshots.
pub struct SnapshotCoordinator {
    room_id: String,
    cipher: RoomCipher,
    lock: Arc<dyn LockService>,
    uploader: Arc<dyn SnapshotUploader>,
    in_flight: AtomicBool,
    last_saved: Mutex<Option<String>>,
}

impl SnapshotCoordinator {
    pub fn new(
        room_id: impl Into<String>,
        cipher: RoomCipher,
        lock: Arc<dyn LockService>,
        uploader: Arc<dyn SnapshotUploader>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            cipher,
            lock,
            uploader,
            in_flight: AtomicBool::new(false),
            last_saved: Mutex::new(None),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// One lock-then-upload cycle for `text`.
    ///
    /// Contention is an outcome, not an error. Upload failures are
    /// returned and retried only by the next cycle.
    pub async fn save(&self, text: &str) -> Result<SaveOutcome, PersistenceError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Ok(SaveOutcome::InFlight);
        }
        let _guard = InFlightGuard(&self.in_flight);

        if self.last_saved.lock().await.as_deref() == Some(text) {
            return Ok(SaveOutcome::Unchanged);
        }

        let lock = self.lock.check_lock(&self.room_id).await?;
        if !lock.acquired() {
            log::debug!("snapshot lock for room {} held elsewhere", self.room_id);
            return Ok(SaveOutcome::LockContended);
        }

        let snapshot = Snapshot::seal(&self.room_id, &self.cipher, text)?;
        let body = snapshot.to_body();
        let response = self.uploader.upload_snapshot(&self.room_id, &body).await?;
        if !response.is_success() {
            return Err(PersistenceError::Rejected {
                code: response.code,
                message: response.message.unwrap_or_default(),
            });
        }

        *self.last_saved.lock().await = Some(text.to_string());
        log::info!(
            "saved snapshot for room {} ({} bytes)",
            self.room_id,
            body.len()
        );
        Ok(SaveOutcome::Saved)
    }

    /// Run the debounce loop over `changes` in a background task.
    pub fn spawn(
        self: Arc<Self>,
        config: PersistenceConfig,
        changes: broadcast::Receiver<DocChange>,
    ) -> CoordinatorHandle {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (outcome_tx, outcome_rx) = mpsc::channel(64);
        let task = tokio::spawn(self.run(config, changes, command_rx, outcome_tx));

        CoordinatorHandle {
            commands: command_tx,
            outcome_rx: Some(outcome_rx),
            task: Some(task),
        }
    }

    async fn run(
        self: Arc<Self>,
        config: PersistenceConfig,
        mut changes: broadcast::Receiver<DocChange>,
        mut commands: mpsc::Receiver<Command>,
        outcomes: mpsc::Sender<Result<SaveOutcome, PersistenceError>>,
    ) {
        let mut latest: Option<String> = None;
        let mut pending = 0usize;
        let mut deadline: Option<Instant> = None;

        loop {
            let timer_deadline = deadline;
            let timer = async move {
                match timer_deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    // nothing pending
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                change = changes.recv() => match change {
                    Ok(change) => {
                        latest = Some(change.text);
                        pending += 1;
                        if pending >= config.update_threshold {
                            log::debug!("{pending} changes pending, saving room {}", self.room_id);
                            deadline = None;
                            pending = 0;
                            self.save_latest(&latest, &outcomes).await;
                        } else {
                            deadline = Some(Instant::now() + config.debounce);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("snapshot coordinator lagged by {n} changes");
                        pending += n as usize;
                        deadline = Some(Instant::now() + config.debounce);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                _ = timer => {
                    deadline = None;
                    pending = 0;
                    self.save_latest(&latest, &outcomes).await;
                }

                command = commands.recv() => match command {
                    Some(Command::Flush(reply)) => {
                        deadline = None;
                        pending = 0;
                        let result = match &latest {
                            Some(text) => self.save(text).await,
                            None => Ok(SaveOutcome::Unchanged),
                        };
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }
        }

        log::debug!("snapshot coordinator for room {} stopped", self.room_id);
    }

    async fn save_latest(
        &self,
        latest: &Option<String>,
        outcomes: &mpsc::Sender<Result<SaveOutcome, PersistenceError>>,
    ) {
        let Some(text) = latest else {
            return;
        };
        let result = self.save(text).await;
        if let Err(e) = &result {
            log::error!("snapshot for room {} failed: {e}", self.room_id);
        }
        if outcomes.try_send(result).is_err() {
            log::debug!("outcome channel full or closed, dropping save outcome");
        }
    }
}

enum Command {
    Flush(oneshot::Sender<Result<SaveOutcome, PersistenceError>>),
    Shutdown,
}

/// Handle to a running coordinator task.
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    outcome_rx: Option<mpsc::Receiver<Result<SaveOutcome, PersistenceError>>>,
    task: Option<JoinHandle<()>>,
}

impl CoordinatorHandle {
    /// Save now, bypassing the debounce timer.
    pub async fn flush(&self) -> Result<SaveOutcome, PersistenceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Flush(reply_tx))
            .await
            .map_err(|_| PersistenceError::Stopped)?;
        reply_rx.await.map_err(|_| PersistenceError::Stopped)?
    }

    /// Take the outcome receiver for timer- and count-triggered saves
    /// (can only be called once).
    pub fn take_outcome_rx(
        &mut self,
    ) -> Option<mpsc::Receiver<Result<SaveOutcome, PersistenceError>>> {
        self.outcome_rx.take()
    }

    /// Stop the task and drop any pending timer. Idempotent.
    pub async fn dispose(&mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };
        let _ = self.commands.send(Command::Shutdown).await;
        if tokio::time::timeout(Duration::from_secs(1), &mut task)
            .await
            .is_err()
        {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
