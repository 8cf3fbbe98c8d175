use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::session::UserSession;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("coordination store error: {0}")]
    Store(String),
    #[error("coordination payload error: {0}")]
    Payload(String),
}

/// Cross-replica request to cancel whatever is registered under `resource_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortNotice {
    pub resource_id: String,
    pub reason: String,
}

pub type AbortStream = BoxStream<'static, AbortNotice>;

/// Lease-based mutual exclusion. Implementations must make `try_lease`
/// atomic: at most one unexpired owner per key.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Single non-blocking attempt. Returns the fencing token on success and
    /// `None` while another owner holds an unexpired lease.
    async fn try_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<u64>, StoreError>;

    /// Releases the lease if `owner` still holds it. Returns `false` when the
    /// lease already expired or changed hands.
    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool, StoreError>;
}

/// Shared `user_id -> UserSession` mapping.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn get_session(&self, user_id: &str) -> Result<Option<UserSession>, StoreError>;

    async fn put_session(&self, session: &UserSession) -> Result<(), StoreError>;

    async fn remove_session(&self, user_id: &str) -> Result<(), StoreError>;
}

/// Pub/sub delivery of abort notices (at-least-once, best-effort ordering).
#[async_trait]
pub trait AbortBus: Send + Sync {
    async fn publish_abort(&self, notice: &AbortNotice) -> Result<(), StoreError>;

    async fn subscribe_aborts(&self) -> Result<AbortStream, StoreError>;
}

/// The three coordination concerns, usually backed by one store.
#[derive(Clone)]
pub struct Coordination {
    pub leases: Arc<dyn LeaseStore>,
    pub directory: Arc<dyn SessionDirectory>,
    pub aborts: Arc<dyn AbortBus>,
}

impl Coordination {
    pub fn from_backend<T>(backend: Arc<T>) -> Self
    where
        T: LeaseStore + SessionDirectory + AbortBus + 'static,
    {
        Self {
            leases: backend.clone(),
            directory: backend.clone(),
            aborts: backend,
        }
    }

    pub fn in_memory() -> Self {
        Self::from_backend(InMemoryCoordination::new())
    }
}

struct HeldLease {
    owner: String,
    expires_at: Instant,
}

/// In-memory adapter for tests and single-replica deployments. Lease expiry
/// follows the tokio clock so paused-time tests can drive it.
pub struct InMemoryCoordination {
    leases: Mutex<HashMap<String, HeldLease>>,
    fencing: AtomicU64,
    sessions: Mutex<HashMap<String, UserSession>>,
    aborts: broadcast::Sender<AbortNotice>,
}

impl Default for InMemoryCoordination {
    fn default() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            fencing: AtomicU64::new(0),
            sessions: Mutex::new(HashMap::new()),
            aborts: broadcast::channel(256).0,
        }
    }
}

impl InMemoryCoordination {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl LeaseStore for InMemoryCoordination {
    async fn try_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<u64>, StoreError> {
        let now = Instant::now();
        let mut guard = self.leases.lock().await;
        if let Some(held) = guard.get(key) {
            if held.expires_at > now && held.owner != owner {
                return Ok(None);
            }
        }
        guard.insert(
            key.to_string(),
            HeldLease {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(self.fencing.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut guard = self.leases.lock().await;
        match guard.get(key) {
            Some(held) if held.owner == owner => {
                let live = held.expires_at > now;
                guard.remove(key);
                Ok(live)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl SessionDirectory for InMemoryCoordination {
    async fn get_session(&self, user_id: &str) -> Result<Option<UserSession>, StoreError> {
        Ok(self.sessions.lock().await.get(user_id).cloned())
    }

    async fn put_session(&self, session: &UserSession) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .await
            .insert(session.user_id.clone(), session.clone());
        Ok(())
    }

    async fn remove_session(&self, user_id: &str) -> Result<(), StoreError> {
        self.sessions.lock().await.remove(user_id);
        Ok(())
    }
}

#[async_trait]
impl AbortBus for InMemoryCoordination {
    async fn publish_abort(&self, notice: &AbortNotice) -> Result<(), StoreError> {
        // No subscribers is not an error; the notice simply has no audience.
        let _ = self.aborts.send(notice.clone());
        Ok(())
    }

    async fn subscribe_aborts(&self) -> Result<AbortStream, StoreError> {
        let stream = BroadcastStream::new(self.aborts.subscribe())
            .filter_map(|item| async move { item.ok() })
            .boxed();
        Ok(stream)
    }
}
