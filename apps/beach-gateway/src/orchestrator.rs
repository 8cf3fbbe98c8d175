//! `ensure_session`: find or create the caller's worker and return its
//! address, with at most one creation in flight per user across replicas.
//!
//! Fast path: a `Ready` directory entry whose address answers the liveness
//! probe is returned without touching the lock. Otherwise the caller loops
//! until its budget runs out: re-read the directory, try the per-user lease,
//! and either create the worker (lease holder) or back off and look again
//! (everyone else). The lease holder writes `Ready` to the shared directory,
//! which is what releases the waiters.

use std::sync::Arc;
use std::time::Duration;

use gateway_sdk::coordination::SessionDirectory;
use gateway_sdk::{JobLifecycle, JobPhase, SessionState, UserSession};
use tracing::{debug, info, warn};

use crate::abort::{self, run_with_cancellation, AbortError, AbortSignal};
use crate::backoff::{Backoff, BackoffPolicy};
use crate::lock::{DistributedLock, LockError};
use crate::metrics;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not ready within {0:?}")]
    ServiceTimeout(Duration),
    #[error(transparent)]
    Aborted(#[from] AbortError),
    #[error("coordination store unavailable: {0}")]
    CoordinationUnavailable(String),
    #[error("job api rejected the worker: {0}")]
    JobRejected(String),
    #[error("worker job {job_name} exited before becoming ready")]
    WorkerFailed { job_name: String },
}

impl From<LockError> for SessionError {
    fn from(err: LockError) -> Self {
        SessionError::CoordinationUnavailable(err.to_string())
    }
}

impl SessionError {
    pub fn label(&self) -> &'static str {
        match self {
            SessionError::ServiceTimeout(_) => "timeout",
            SessionError::Aborted(_) => "aborted",
            SessionError::CoordinationUnavailable(_) => "coordination_unavailable",
            SessionError::JobRejected(_) => "job_rejected",
            SessionError::WorkerFailed { .. } => "worker_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Budget for one `ensure_session` call, lock waits included.
    pub ensure_timeout: Duration,
    pub lock_lease: Duration,
    pub backoff: BackoffPolicy,
    /// How often a long wait reports progress at info level.
    pub progress_interval: Duration,
}

pub fn lock_key(user_id: &str) -> String {
    format!("session-lock:{user_id}")
}

/// Per-call polling state.
struct Attempt<'a> {
    user_id: &'a str,
    signal: &'a AbortSignal,
    backoff: Backoff,
}

#[derive(Clone)]
pub struct SessionOrchestrator {
    jobs: Arc<dyn JobLifecycle>,
    directory: Arc<dyn SessionDirectory>,
    lock: DistributedLock,
    settings: OrchestratorSettings,
}

impl SessionOrchestrator {
    pub fn new(
        jobs: Arc<dyn JobLifecycle>,
        directory: Arc<dyn SessionDirectory>,
        lock: DistributedLock,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            jobs,
            directory,
            lock,
            settings,
        }
    }

    /// Returns the base address of a ready worker for `user_id`.
    pub async fn ensure_session(
        &self,
        user_id: &str,
        signal: &AbortSignal,
    ) -> Result<String, SessionError> {
        let outcome = self.ensure(user_id, signal).await;
        let label = match &outcome {
            Ok((_, path)) => *path,
            Err(err) => err.label(),
        };
        metrics::ENSURE_OUTCOMES.with_label_values(&[label]).inc();
        match &outcome {
            Ok((address, path)) => debug!(user_id, address = %address, path, "session ensured"),
            Err(SessionError::Aborted(err)) => debug!(user_id, reason = %err.reason, "ensure aborted"),
            Err(err) => warn!(user_id, error = %err, "ensure session failed"),
        }
        outcome.map(|(address, _)| address)
    }

    pub async fn session(&self, user_id: &str) -> Result<Option<UserSession>, SessionError> {
        self.directory
            .get_session(user_id)
            .await
            .map_err(|err| SessionError::CoordinationUnavailable(err.to_string()))
    }

    /// Resets the entry to `Unknown` if it still points at `address`.
    pub async fn invalidate(&self, user_id: &str, address: &str) {
        let mut session = match self.directory.get_session(user_id).await {
            Ok(Some(session)) if session.base_address.as_deref() == Some(address) => session,
            Ok(_) => return,
            Err(err) => {
                warn!(user_id, error = %err, "could not read session for invalidation");
                return;
            }
        };
        session.invalidate();
        match self.directory.put_session(&session).await {
            Ok(()) => info!(user_id, address, "session invalidated"),
            Err(err) => warn!(user_id, error = %err, "could not invalidate session"),
        }
    }

    async fn ensure(
        &self,
        user_id: &str,
        signal: &AbortSignal,
    ) -> Result<(String, &'static str), SessionError> {
        if let Some(address) = self.fast_path(user_id, signal).await? {
            return Ok((address, "fast"));
        }

        let mut backoff = self
            .settings
            .backoff
            .with_max_total_duration(self.settings.ensure_timeout)
            .start();
        backoff
            .deadline_mut()
            .set_action_interval(self.settings.progress_interval);
        let mut attempt = Attempt {
            user_id,
            signal,
            backoff,
        };

        loop {
            match run_with_cancellation(self.directory.get_session(user_id), signal).await? {
                Ok(Some(session)) if session.is_ready() => {
                    if let Some(address) = session.base_address {
                        return Ok((address, "waited"));
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(user_id, error = %err, "directory read failed; retrying"),
            }

            // not raced against the signal: a lease granted after an abort
            // still has to come back as a guard and be released
            let acquired = self
                .lock
                .try_acquire(&lock_key(user_id), self.settings.lock_lease)
                .await?;
            if let Some(guard) = acquired {
                if signal.aborted() {
                    guard.release().await;
                    return Err(signal.error().into());
                }
                let generation = guard.fencing_token();
                let address = guard
                    .scope(self.create_session(&mut attempt, generation))
                    .await?;
                return Ok((address, "created"));
            }

            debug!(user_id, "session creation in progress elsewhere");
            self.pause(&mut attempt, "waiting for lock holder").await?;
        }
    }

    async fn fast_path(
        &self,
        user_id: &str,
        signal: &AbortSignal,
    ) -> Result<Option<String>, SessionError> {
        // an unreachable store fails the request rather than risking a duplicate worker
        let session = run_with_cancellation(self.directory.get_session(user_id), signal)
            .await?
            .map_err(|err| SessionError::CoordinationUnavailable(err.to_string()))?;
        let Some(mut session) = session.filter(UserSession::is_ready) else {
            return Ok(None);
        };
        let Some(address) = session.base_address.clone() else {
            return Ok(None);
        };
        if run_with_cancellation(self.jobs.probe(&address), signal).await? {
            return Ok(Some(address));
        }
        warn!(user_id, address = %address, "session failed liveness probe; recreating");
        session.invalidate();
        self.store(&session, signal).await?;
        Ok(None)
    }

    /// Runs under the user's lease. `generation` (the lease's fencing token)
    /// goes into the job name, so a finished job the platform still retains
    /// is never picked up again.
    async fn create_session(
        &self,
        attempt: &mut Attempt<'_>,
        generation: u64,
    ) -> Result<String, SessionError> {
        let user_id = attempt.user_id;
        let signal = attempt.signal;

        // the previous holder may have finished between our read and the acquire
        if let Ok(Some(session)) =
            run_with_cancellation(self.directory.get_session(user_id), signal).await?
        {
            if let (true, Some(address)) = (session.is_ready(), session.base_address) {
                return Ok(address);
            }
        }

        let job_name = self.create_job(attempt, generation).await?;
        let mut session = UserSession::creating(user_id, job_name.as_str());
        self.store(&session, signal).await?;
        metrics::JOB_CREATIONS.inc();
        info!(user_id, job_name = %job_name, generation, "worker job created");

        loop {
            match run_with_cancellation(self.jobs.get_status(&job_name), signal).await? {
                Ok(status) if status.is_terminal() => {
                    warn!(user_id, job_name = %job_name, phase = ?status.status, "worker job exited");
                    self.mark_failed(&mut session, signal).await?;
                    return Err(SessionError::WorkerFailed { job_name });
                }
                Ok(status) => {
                    if status.is_ready() {
                        if let Some(address) = status.address.as_deref() {
                            if run_with_cancellation(self.jobs.probe(address), signal).await? {
                                if session.mark_ready(address).is_ok() {
                                    self.store(&session, signal).await?;
                                }
                                info!(user_id, job_name = %job_name, address, "session ready");
                                return Ok(address.to_string());
                            }
                            debug!(user_id, address, "worker started but not reachable yet");
                        }
                    }
                    if status.status == JobPhase::Running
                        && session.state != SessionState::Starting
                        && session.transition(SessionState::Starting).is_ok()
                    {
                        self.store(&session, signal).await?;
                    }
                }
                Err(err) if err.is_transient() => {
                    debug!(user_id, job_name = %job_name, error = %err, "status poll failed; retrying");
                }
                Err(err) => {
                    self.mark_failed(&mut session, signal).await?;
                    return Err(SessionError::JobRejected(err.to_string()));
                }
            }

            if let Err(err) = self.pause(attempt, "waiting for worker").await {
                if matches!(err, SessionError::ServiceTimeout(_)) {
                    self.mark_failed(&mut session, signal).await?;
                }
                return Err(err);
            }
        }
    }

    async fn create_job(
        &self,
        attempt: &mut Attempt<'_>,
        generation: u64,
    ) -> Result<String, SessionError> {
        loop {
            let create = self.jobs.create(attempt.user_id, generation);
            match run_with_cancellation(create, attempt.signal).await? {
                Ok(job_name) => return Ok(job_name),
                Err(err) if err.is_transient() => warn!(
                    user_id = attempt.user_id,
                    attempt = attempt.backoff.attempt(),
                    error = %err,
                    "job create failed; retrying"
                ),
                Err(err) => return Err(SessionError::JobRejected(err.to_string())),
            }
            self.pause(attempt, "retrying job creation").await?;
        }
    }

    /// Sleeps for the next backoff delay, or fails once the budget is spent.
    async fn pause(&self, attempt: &mut Attempt<'_>, phase: &'static str) -> Result<(), SessionError> {
        let Some(delay) = attempt.backoff.next_delay() else {
            return Err(SessionError::ServiceTimeout(self.settings.ensure_timeout));
        };
        let deadline = attempt.backoff.deadline_mut();
        if deadline.is_action_due() {
            info!(
                user_id = attempt.user_id,
                phase,
                elapsed_ms = deadline.elapsed().as_millis() as u64,
                remaining_ms = deadline.remaining().as_millis() as u64,
                "still waiting for session"
            );
        }
        debug!(
            user_id = attempt.user_id,
            phase,
            attempt = attempt.backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "backing off"
        );
        abort::sleep(delay, attempt.signal).await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        session: &mut UserSession,
        signal: &AbortSignal,
    ) -> Result<(), SessionError> {
        if session.transition(SessionState::Failed).is_ok() {
            self.store(session, signal).await?;
        }
        Ok(())
    }

    /// Directory writes are best effort; only an abort stops the caller.
    async fn store(&self, session: &UserSession, signal: &AbortSignal) -> Result<(), SessionError> {
        if let Err(err) = run_with_cancellation(self.directory.put_session(session), signal).await? {
            warn!(
                user_id = %session.user_id,
                state = session.state.as_str(),
                error = %err,
                "directory write failed"
            );
        }
        Ok(())
    }
}
