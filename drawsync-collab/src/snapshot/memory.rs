//! In-process lock service and snapshot store.
//!
//! Stand-ins for the REST backend, used by the relay binary and tests.
//! Lock expiry is time-based only: the holder can re-enter while its
//! cooldown runs but never extends it, and nothing releases it early.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{BackendError, LockService, RpcResponse, SnapshotUploader, RPC_SUCCESS};

/// How long a granted lock excludes other clients.
pub const LOCK_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct LockEntry {
    holder: String,
    expires_at: Instant,
}

/// Advisory per-room lock with a fixed cooldown.
pub struct MemoryLockService {
    cooldown: Duration,
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::with_cooldown(LOCK_COOLDOWN)
    }

    pub fn with_cooldown(cooldown: Duration) -> Self {
        Self {
            cooldown,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Grant the room lock to `holder` unless someone else holds it.
    pub async fn try_acquire(&self, room_id: &str, holder: &str) -> bool {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;

        match locks.get(room_id) {
            Some(entry) if entry.expires_at > now => entry.holder == holder,
            _ => {
                locks.insert(
                    room_id.to_string(),
                    LockEntry {
                        holder: holder.to_string(),
                        expires_at: now + self.cooldown,
                    },
                );
                log::debug!("snapshot lock for room {room_id} granted to {holder}");
                true
            }
        }
    }

    /// Current unexpired holder.
    pub async fn holder(&self, room_id: &str) -> Option<String> {
        let locks = self.locks.lock().await;
        locks
            .get(room_id)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.holder.clone())
    }

    /// A [`LockService`] that asks on behalf of `holder`.
    pub fn client(self: &Arc<Self>, holder: impl Into<String>) -> LockClient {
        LockClient {
            service: self.clone(),
            holder: holder.into(),
        }
    }
}

impl Default for MemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

/// One client's view of a [`MemoryLockService`].
#[derive(Clone)]
pub struct LockClient {
    service: Arc<MemoryLockService>,
    holder: String,
}

impl LockClient {
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

#[async_trait]
impl LockService for LockClient {
    async fn check_lock(&self, room_id: &str) -> Result<RpcResponse<bool>, BackendError> {
        let acquired = self.service.try_acquire(room_id, &self.holder).await;
        Ok(RpcResponse::ok(acquired))
    }
}

/// Latest snapshot body per room.
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, String>>,
    uploads: AtomicU64,
    /// Non-zero makes every upload fail with this code
    reject_code: AtomicI32,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self {
            snapshots: Mutex::new(HashMap::new()),
            uploads: AtomicU64::new(0),
            reject_code: AtomicI32::new(RPC_SUCCESS),
        }
    }

    pub async fn latest(&self, room_id: &str) -> Option<String> {
        self.snapshots.lock().await.get(room_id).cloned()
    }

    /// Upload attempts, failed ones included.
    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn reject_uploads(&self, code: i32) {
        self.reject_code.store(code, Ordering::SeqCst);
    }

    pub fn accept_uploads(&self) {
        self.reject_code.store(RPC_SUCCESS, Ordering::SeqCst);
    }
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotUploader for MemorySnapshotStore {
    async fn upload_snapshot(
        &self,
        room_id: &str,
        body: &str,
    ) -> Result<RpcResponse<()>, BackendError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);

        let code = self.reject_code.load(Ordering::SeqCst);
        if code != RPC_SUCCESS {
            return Ok(RpcResponse::err(code, "upload rejected"));
        }

        self.snapshots
            .lock()
            .await
            .insert(room_id.to_string(), body.to_string());
        Ok(RpcResponse::ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_check_lock_single_winner() {
        let service = Arc::new(MemoryLockService::new());
        let a = service.client("a");
        let b = service.client("b");

        let (ra, rb) = tokio::join!(a.check_lock("room-1"), b.check_lock("room-1"));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert!(ra.acquired() ^ rb.acquired());
    }

    #[tokio::test]
    async fn test_locks_are_per_room() {
        let service = MemoryLockService::new();
        assert!(service.try_acquire("room-1", "a").await);
        assert!(service.try_acquire("room-2", "b").await);
        assert_eq!(service.holder("room-1").await.as_deref(), Some("a"));
        assert_eq!(service.holder("room-2").await.as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_expiry() {
        let service = MemoryLockService::new();
        assert!(service.try_acquire("room-1", "a").await);

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        assert!(!service.try_acquire("room-1", "b").await);
        // re-entry does not extend the window
        assert!(service.try_acquire("room-1", "a").await);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(service.holder("room-1").await, None);
        assert!(service.try_acquire("room-1", "b").await);
        assert!(!service.try_acquire("room-1", "a").await);
    }

    #[tokio::test]
    async fn test_store_keeps_latest() {
        let store = MemorySnapshotStore::new();
        store.upload_snapshot("room-1", "one").await.unwrap();
        store.upload_snapshot("room-1", "two").await.unwrap();

        assert_eq!(store.latest("room-1").await.as_deref(), Some("two"));
        assert_eq!(store.latest("room-2").await, None);
        assert_eq!(store.upload_count(), 2);
    }

    #[tokio::test]
    async fn test_store_forced_failure() {
        let store = MemorySnapshotStore::new();
        store.reject_uploads(503);

        let response = store.upload_snapshot("room-1", "body").await.unwrap();
        assert!(!response.is_success());
        assert_eq!(response.code, 503);
        assert_eq!(store.latest("room-1").await, None);
        assert_eq!(store.upload_count(), 1);
    }
}
