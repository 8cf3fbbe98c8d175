use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use gateway_sdk::coordination::{LeaseStore, StoreError};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::background::BackgroundTasks;

/// Proof of a lease. Valid until `expires_at` at the latest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    pub owner: String,
    pub fencing_token: u64,
    pub expires_at: Instant,
}

impl LockHandle {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

/// Lease-based mutual exclusion over a shared [`LeaseStore`].
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LeaseStore>,
    tasks: BackgroundTasks,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LeaseStore>, tasks: BackgroundTasks) -> Self {
        Self { store, tasks }
    }

    /// One attempt, no waiting. `Ok(None)` means someone else holds the lease.
    pub async fn try_acquire(
        &self,
        key: &str,
        lease: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        let owner = Uuid::new_v4().to_string();
        // measured before the round trip so the local view never outlives the store's
        let expires_at = Instant::now() + lease;
        let mut in_flight = AcquireInFlight {
            lock: self,
            key,
            owner: &owner,
            armed: true,
        };
        let granted = self.store.try_lease(key, &owner, lease).await;
        in_flight.armed = false;
        drop(in_flight);
        let Some(fencing_token) = granted? else {
            return Ok(None);
        };
        debug!(key, fencing_token, lease_ms = lease.as_millis() as u64, "lock acquired");
        Ok(Some(LockGuard {
            handle: Some(LockHandle {
                key: key.to_string(),
                owner,
                fencing_token,
                expires_at,
            }),
            lock: self.clone(),
        }))
    }

    /// Idempotent. Store failures are logged; the lease TTL bounds the damage.
    pub async fn release(&self, handle: &LockHandle) {
        match self.store.release_lease(&handle.key, &handle.owner).await {
            Ok(true) => debug!(key = %handle.key, fencing_token = handle.fencing_token, "lock released"),
            Ok(false) => debug!(
                key = %handle.key,
                fencing_token = handle.fencing_token,
                "lease already expired or taken over"
            ),
            Err(err) => warn!(
                key = %handle.key,
                fencing_token = handle.fencing_token,
                error = %err,
                "lock release failed; lease will expire"
            ),
        }
    }
}

/// Armed while a lease request is on the wire. The store may have granted
/// the lease even if the caller stops waiting for the reply, so a dropped
/// request releases by owner in the background.
struct AcquireInFlight<'a> {
    lock: &'a DistributedLock,
    key: &'a str,
    owner: &'a str,
    armed: bool,
}

impl Drop for AcquireInFlight<'_> {
    fn drop(&mut self) {
        if !self.armed || tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        debug!(key = self.key, "lock request dropped mid-flight; releasing by owner");
        let handle = LockHandle {
            key: self.key.to_string(),
            owner: self.owner.to_string(),
            fencing_token: 0,
            expires_at: Instant::now(),
        };
        let lock = self.lock.clone();
        self.lock.tasks.submit("lock-release", async move {
            lock.release(&handle).await;
            Ok(())
        });
    }
}

/// Holds an acquired lease. Released by [`LockGuard::release`] or
/// [`LockGuard::scope`]; a guard dropped without either (its task was
/// cancelled) hands the release to the background registry.
pub struct LockGuard {
    handle: Option<LockHandle>,
    lock: DistributedLock,
}

impl LockGuard {
    pub fn handle(&self) -> Option<&LockHandle> {
        self.handle.as_ref()
    }

    pub fn fencing_token(&self) -> u64 {
        self.handle.as_ref().map_or(0, |h| h.fencing_token)
    }

    pub async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            self.lock.release(&handle).await;
        }
    }

    /// Runs `work` while holding the lease and releases it afterwards.
    /// The outcome of `work` is returned untouched.
    pub async fn scope<F>(self, work: F) -> F::Output
    where
        F: Future,
    {
        let out = work.await;
        self.release().await;
        out
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(key = %handle.key, "lock guard dropped outside a runtime; lease will expire");
            return;
        }
        let lock = self.lock.clone();
        self.lock.tasks.submit("lock-release", async move {
            lock.release(&handle).await;
            Ok(())
        });
    }
}
