use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::abort::AbortError;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackgroundStats {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
    drained: Notify,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Fire-and-forget work that is still accounted for: every task is tracked
/// until it ends and its outcome is logged. Failures never reach the
/// submitter.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    registry: Arc<Registry>,
}

enum Outcome {
    Finished,
    Failed(anyhow::Error),
    Panicked(Box<dyn Any + Send>),
}

/// Lives inside the spawned task; dropping it is the single point where the
/// registry entry goes away, whether the task finished, failed or was
/// aborted mid-flight.
struct Completion {
    registry: Arc<Registry>,
    id: u64,
    name: &'static str,
    outcome: Option<Outcome>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let registry = &self.registry;
        match self.outcome.take() {
            Some(Outcome::Finished) => {
                registry.completed.fetch_add(1, Ordering::Relaxed);
                metrics::BACKGROUND_TASKS.with_label_values(&["completed"]).inc();
                debug!(task = self.name, id = self.id, "background task finished");
            }
            Some(Outcome::Failed(err)) if err.downcast_ref::<AbortError>().is_some() => {
                registry.cancelled.fetch_add(1, Ordering::Relaxed);
                metrics::BACKGROUND_TASKS.with_label_values(&["cancelled"]).inc();
                debug!(task = self.name, id = self.id, reason = %err, "background task aborted");
            }
            Some(Outcome::Failed(err)) => {
                registry.failed.fetch_add(1, Ordering::Relaxed);
                metrics::BACKGROUND_TASKS.with_label_values(&["failed"]).inc();
                error!(task = self.name, id = self.id, error = ?err, "background task failed");
            }
            Some(Outcome::Panicked(payload)) => {
                registry.failed.fetch_add(1, Ordering::Relaxed);
                metrics::BACKGROUND_TASKS.with_label_values(&["panicked"]).inc();
                error!(
                    task = self.name,
                    id = self.id,
                    panic = panic_message(payload.as_ref()),
                    "background task panicked"
                );
            }
            None => {
                registry.cancelled.fetch_add(1, Ordering::Relaxed);
                metrics::BACKGROUND_TASKS.with_label_values(&["cancelled"]).inc();
                debug!(task = self.name, id = self.id, "background task cancelled");
            }
        }
        registry.tasks.lock().remove(&self.id);
        registry.drained.notify_waiters();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `work` on the runtime and tracks it until it ends.
    pub fn submit<F>(&self, name: &'static str, work: F) -> TaskHandle
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut completion = Completion {
            registry: Arc::clone(&self.registry),
            id,
            name,
            outcome: None,
        };
        // The task waits for the gate so it cannot deregister before it is registered.
        let (gate, opened) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            if opened.await.is_err() {
                return;
            }
            let outcome = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(Ok(())) => Outcome::Finished,
                Ok(Err(err)) => Outcome::Failed(err),
                Err(payload) => Outcome::Panicked(payload),
            };
            completion.outcome = Some(outcome);
        });
        // A runtime that is shutting down drops the future inside spawn.
        if !handle.is_finished() {
            self.registry.tasks.lock().insert(id, handle);
        }
        let _ = gate.send(());
        TaskHandle(id)
    }

    pub fn len(&self) -> usize {
        self.registry.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, handle: TaskHandle) -> bool {
        self.registry.tasks.lock().contains_key(&handle.0)
    }

    pub fn stats(&self) -> BackgroundStats {
        BackgroundStats {
            completed: self.registry.completed.load(Ordering::Relaxed),
            failed: self.registry.failed.load(Ordering::Relaxed),
            cancelled: self.registry.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Waits up to `grace` for outstanding tasks, then aborts the rest.
    /// Returns how many tasks had to be aborted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let wait_for_drain = async {
            loop {
                let drained = self.registry.drained.notified();
                if self.is_empty() {
                    return;
                }
                drained.await;
            }
        };
        if tokio::time::timeout(grace, wait_for_drain).await.is_ok() {
            return 0;
        }
        let leftovers: Vec<JoinHandle<()>> = self
            .registry
            .tasks
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        let count = leftovers.len();
        warn!(count, "aborting background tasks still running at shutdown");
        for handle in &leftovers {
            handle.abort();
        }
        for handle in leftovers {
            let _ = handle.await;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use test_timeout::tokio_timeout_test;

    async fn settle(tasks: &BackgroundTasks) {
        while !tasks.is_empty() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio_timeout_test(5)]
    async fn completed_tasks_leave_the_registry() {
        let tasks = BackgroundTasks::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let handle = tasks.submit("flag", async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        assert!(tasks.contains(handle));
        settle(&tasks).await;
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(tasks.stats().completed, 1);
    }

    #[tokio_timeout_test(5)]
    async fn failures_are_observed_not_propagated() {
        let tasks = BackgroundTasks::new();
        tasks.submit("boom", async { Err(anyhow::anyhow!("backend went away")) });
        tasks.submit("panic", async {
            panic!("worker exploded");
        });
        settle(&tasks).await;
        let stats = tasks.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.completed, 0);
    }

    #[tokio_timeout_test(5)]
    async fn cooperative_abort_is_not_a_failure() {
        let tasks = BackgroundTasks::new();
        tasks.submit("aborted", async {
            Err(AbortError::new("client went away").into())
        });
        settle(&tasks).await;
        assert_eq!(tasks.stats().cancelled, 1);
        assert_eq!(tasks.stats().failed, 0);
    }

    #[tokio_timeout_test(5, paused)]
    async fn shutdown_aborts_stragglers() {
        let tasks = BackgroundTasks::new();
        tasks.submit("quick", async { Ok(()) });
        tasks.submit("stuck", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        let aborted = tasks.shutdown(Duration::from_secs(1)).await;
        assert_eq!(aborted, 1);
        assert!(tasks.is_empty());
        let stats = tasks.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.cancelled, 1);
    }

    #[tokio_timeout_test(5)]
    async fn shutdown_returns_immediately_when_idle() {
        let tasks = BackgroundTasks::new();
        assert_eq!(tasks.shutdown(Duration::from_secs(1)).await, 0);
    }
}
