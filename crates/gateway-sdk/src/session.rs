use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a per-user worker as recorded in the shared directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unknown,
    Creating,
    Starting,
    Ready,
    Failed,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            SessionState::Unknown => 0,
            SessionState::Creating => 1,
            SessionState::Starting => 2,
            SessionState::Ready => 3,
            SessionState::Failed => 4,
        }
    }

    /// Forward moves along Unknown→Creating→Starting→Ready are allowed, as is
    /// failing any session that never became ready. Re-stating the current
    /// state is a no-op.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        if self == next {
            return true;
        }
        match next {
            SessionState::Failed => self != SessionState::Ready,
            SessionState::Unknown => false,
            _ => self != SessionState::Failed && next.rank() > self.rank(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Unknown => "unknown",
            SessionState::Creating => "creating",
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid session transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Directory entry for one user's worker. Shared by every gateway replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSession {
    pub user_id: String,
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub base_address: Option<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_verified_at: Option<DateTime<Utc>>,
}

impl UserSession {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            job_name: None,
            base_address: None,
            state: SessionState::Unknown,
            created_at: Utc::now(),
            last_verified_at: None,
        }
    }

    /// Entry written right after the worker job was created.
    pub fn creating(user_id: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self {
            job_name: Some(job_name.into()),
            state: SessionState::Creating,
            ..Self::new(user_id)
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready && self.base_address.is_some()
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn mark_ready(&mut self, base_address: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(SessionState::Ready)?;
        self.base_address = Some(base_address.into());
        self.last_verified_at = Some(Utc::now());
        Ok(())
    }

    /// Liveness probe failed: forget the address and start over.
    pub fn invalidate(&mut self) {
        self.state = SessionState::Unknown;
        self.base_address = None;
        self.last_verified_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_only() {
        let mut session = UserSession::new("alice");
        session.transition(SessionState::Creating).unwrap();
        session.transition(SessionState::Starting).unwrap();
        assert!(session.transition(SessionState::Creating).is_err());
        session.mark_ready("http://10.0.0.4:8080").unwrap();
        assert!(session.is_ready());
        assert!(session.transition(SessionState::Failed).is_err());
    }

    #[test]
    fn creating_records_the_job() {
        let session = UserSession::creating("frank", "session-frank-0a1b2c3d4e5f");
        assert_eq!(session.state, SessionState::Creating);
        assert_eq!(session.job_name.as_deref(), Some("session-frank-0a1b2c3d4e5f"));
        assert!(session.base_address.is_none());
    }

    #[test]
    fn creating_can_skip_starting() {
        let mut session = UserSession::new("bob");
        session.transition(SessionState::Creating).unwrap();
        session.mark_ready("http://worker:8080").unwrap();
        assert_eq!(session.state, SessionState::Ready);
    }

    #[test]
    fn invalidate_resets_to_unknown() {
        let mut session = UserSession::new("carol");
        session.transition(SessionState::Creating).unwrap();
        session.mark_ready("http://worker:8080").unwrap();
        session.invalidate();
        assert_eq!(session.state, SessionState::Unknown);
        assert!(session.base_address.is_none());
        assert!(!session.is_ready());
    }

    #[test]
    fn failed_is_terminal_for_forward_moves() {
        let mut session = UserSession::new("dave");
        session.transition(SessionState::Creating).unwrap();
        session.transition(SessionState::Failed).unwrap();
        assert!(session.transition(SessionState::Starting).is_err());
    }

    #[test]
    fn serializes_state_as_snake_case() {
        let session = UserSession::new("erin");
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["state"], "unknown");
        let back: UserSession = serde_json::from_value(json).unwrap();
        assert_eq!(back, session);
    }
}
