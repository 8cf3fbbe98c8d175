//! Cooperative cancellation.
//!
//! An [`AbortController`] owns the trigger, any number of cloned
//! [`AbortSignal`]s observe it. Every suspension point in the gateway goes
//! through [`run_with_cancellation`] so a fired signal unwinds the caller with
//! an [`AbortError`] instead of leaving it parked on I/O.
//!
//! Signals are process-local. The [`AbortRegistry`] maps resource ids (the
//! request id of a proxied call) to live controllers, and the listener started
//! by [`spawn_abort_listener`] turns notices from the shared abort bus into
//! local aborts, so an abort issued on one replica reaches the request parked
//! on another.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::future::Either;
use futures_util::StreamExt;
use gateway_sdk::coordination::{AbortBus, AbortNotice, StoreError};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::metrics;

const DEFAULT_REASON: &str = "aborted";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("operation aborted: {reason}")]
pub struct AbortError {
    pub reason: String,
}

impl AbortError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

struct SignalState {
    reason: OnceLock<String>,
    token: CancellationToken,
}

/// Read side of an abort. Cheap to clone; all clones observe the same trigger.
#[derive(Clone)]
pub struct AbortSignal {
    state: Arc<SignalState>,
}

impl AbortSignal {
    fn fresh() -> Self {
        Self {
            state: Arc::new(SignalState {
                reason: OnceLock::new(),
                token: CancellationToken::new(),
            }),
        }
    }

    /// A signal nobody can trigger.
    pub fn never() -> Self {
        Self::fresh()
    }

    pub fn aborted(&self) -> bool {
        self.state.token.is_cancelled()
    }

    /// Reason of the first `abort` call, if any.
    pub fn reason(&self) -> Option<&str> {
        self.state.reason.get().map(String::as_str)
    }

    /// Resolves once the signal fires. Returns immediately if it already has.
    pub async fn wait(&self) {
        self.state.token.cancelled().await
    }

    pub fn error(&self) -> AbortError {
        AbortError::new(self.reason().unwrap_or(DEFAULT_REASON))
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.aborted())
            .field("reason", &self.reason())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct AbortController {
    signal: AbortSignal,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::fresh(),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Fires the signal. Only the first call has an effect; it returns
    /// whether this call was the one that fired.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        if self.signal.state.reason.set(reason.into()).is_err() {
            return false;
        }
        self.signal.state.token.cancel();
        true
    }
}

/// Polls both futures until one completes; the other is dropped before this
/// returns. Ties go to `a`.
pub async fn race<A, B>(a: A, b: B) -> Either<A::Output, B::Output>
where
    A: Future,
    B: Future,
{
    tokio::select! {
        biased;
        out = a => Either::Left(out),
        out = b => Either::Right(out),
    }
}

/// Runs `work` unless `signal` fires first, in which case `work` is dropped
/// and the signal's reason comes back as an [`AbortError`].
pub async fn run_with_cancellation<F>(work: F, signal: &AbortSignal) -> Result<F::Output, AbortError>
where
    F: Future,
{
    if signal.aborted() {
        return Err(signal.error());
    }
    match race(signal.wait(), work).await {
        Either::Left(()) => Err(signal.error()),
        Either::Right(out) => Ok(out),
    }
}

/// Abortable sleep.
pub async fn sleep(delay: Duration, signal: &AbortSignal) -> Result<(), AbortError> {
    run_with_cancellation(tokio::time::sleep(delay), signal).await
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    entries: Mutex<HashMap<String, HashMap<u64, AbortController>>>,
}

/// Live controllers by resource id. Several registrations may share an id
/// (a client retrying with the same request id); an abort hits all of them.
#[derive(Clone, Default)]
pub struct AbortRegistry {
    inner: Arc<RegistryInner>,
}

/// Keeps a controller registered until dropped.
pub struct AbortRegistration {
    inner: Arc<RegistryInner>,
    resource_id: String,
    id: u64,
    signal: AbortSignal,
}

impl AbortRegistration {
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }
}

impl Drop for AbortRegistration {
    fn drop(&mut self) {
        let mut entries = self.inner.entries.lock();
        if let Some(controllers) = entries.get_mut(&self.resource_id) {
            controllers.remove(&self.id);
            if controllers.is_empty() {
                entries.remove(&self.resource_id);
            }
        }
    }
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, resource_id: impl Into<String>) -> AbortRegistration {
        let resource_id = resource_id.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let controller = AbortController::new();
        let signal = controller.signal();
        self.inner
            .entries
            .lock()
            .entry(resource_id.clone())
            .or_default()
            .insert(id, controller);
        AbortRegistration {
            inner: Arc::clone(&self.inner),
            resource_id,
            id,
            signal,
        }
    }

    /// Aborts every controller registered under `resource_id`. Returns how
    /// many fired now (already-aborted ones are not counted).
    pub fn abort(&self, resource_id: &str, reason: &str) -> usize {
        let controllers: Vec<AbortController> = match self.inner.entries.lock().get(resource_id) {
            Some(controllers) => controllers.values().cloned().collect(),
            None => return 0,
        };
        controllers
            .iter()
            .filter(|controller| controller.abort(reason))
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Publishes an abort for `resource_id` to every replica, this one included.
pub async fn broadcast_abort(
    bus: &dyn AbortBus,
    resource_id: &str,
    reason: &str,
) -> Result<(), StoreError> {
    bus.publish_abort(&AbortNotice {
        resource_id: resource_id.to_string(),
        reason: reason.to_string(),
    })
    .await
}

/// Feeds remote abort notices into `registry` until the returned handle is
/// aborted. A dropped or failed subscription is re-established with backoff.
pub fn spawn_abort_listener(
    bus: Arc<dyn AbortBus>,
    registry: AbortRegistry,
    policy: BackoffPolicy,
) -> JoinHandle<()> {
    let policy = policy.with_max_total_duration(Duration::MAX);
    tokio::spawn(async move {
        let mut backoff = policy.start();
        loop {
            match bus.subscribe_aborts().await {
                Ok(mut notices) => {
                    debug!("abort listener subscribed");
                    backoff = policy.start();
                    while let Some(notice) = notices.next().await {
                        let fired = registry.abort(&notice.resource_id, &notice.reason);
                        if fired > 0 {
                            metrics::REMOTE_ABORTS.inc_by(fired as u64);
                            info!(
                                resource_id = %notice.resource_id,
                                reason = %notice.reason,
                                fired,
                                "remote abort delivered"
                            );
                        }
                    }
                    warn!("abort subscription closed; resubscribing");
                }
                Err(err) => warn!(error = %err, "abort subscription failed"),
            }
            let delay = backoff
                .next_delay()
                .unwrap_or(policy.config().initial_delay);
            tokio::time::sleep(delay).await;
        }
    })
}
