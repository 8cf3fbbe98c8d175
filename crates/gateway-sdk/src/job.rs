use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub status: JobPhase,
    #[serde(default)]
    pub started: bool,
    #[serde(default)]
    pub address: Option<String>,
}

impl JobStatus {
    /// Running and the worker process reported start-up.
    pub fn is_ready(&self) -> bool {
        self.status == JobPhase::Running && self.started
    }

    /// The job exited and will never become ready.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobPhase::Succeeded | JobPhase::Failed)
    }
}

/// CPU/memory envelope handed to the scheduler verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceEnvelope {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

impl Default for ResourceEnvelope {
    fn default() -> Self {
        Self {
            cpu_request: "500m".into(),
            cpu_limit: "2".into(),
            memory_request: "1Gi".into(),
            memory_limit: "4Gi".into(),
        }
    }
}

/// Everything the scheduler needs to launch a worker besides the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTemplate {
    pub image: String,
    pub port: u16,
    pub resources: ResourceEnvelope,
    pub idle_timeout_minutes: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job api request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("job {0} not found")]
    NotFound(String),
}

impl JobError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            JobError::Http(_) => true,
            JobError::UnexpectedStatus { status, .. } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            // freshly created jobs can lag behind in the scheduler's read path
            JobError::NotFound(_) => true,
        }
    }
}

/// Worker lifecycle operations consumed from the cluster platform.
#[async_trait]
pub trait JobLifecycle: Send + Sync {
    /// Create-or-get: calling twice with the same user and generation
    /// yields the same job. A new generation always means a new job.
    async fn create(&self, user_id: &str, generation: u64) -> Result<String, JobError>;

    async fn get_status(&self, job_name: &str) -> Result<JobStatus, JobError>;

    /// Plain reachability check against a resolved worker address.
    async fn probe(&self, base_address: &str) -> bool;
}

/// Deterministic job name for one user and generation, so retries of the
/// same creation get the same job. Stays within the 63-character DNS label
/// limit.
pub fn job_name_for(user_id: &str, generation: u64) -> String {
    let slug: String = user_id
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .take(20)
        .collect();
    let slug = slug.trim_matches('-');
    let digest = hex::encode(Sha1::digest(user_id.as_bytes()));
    if slug.is_empty() {
        format!("session-{}-g{generation}", &digest[..12])
    } else {
        format!("session-{slug}-{}-g{generation}", &digest[..12])
    }
}

/// TCP connect against the host/port of `base_address`.
pub async fn probe_tcp(base_address: &str, timeout: Duration) -> bool {
    let Ok(url) = Url::parse(base_address) else {
        return false;
    };
    let (Some(host), Some(port)) = (url.host_str(), url.port_or_known_default()) else {
        return false;
    };
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_names_are_stable_and_dns_safe() {
        let a = job_name_for("Alice@Example.com", 3);
        assert_eq!(a, job_name_for("Alice@Example.com", 3));
        assert!(a.starts_with("session-alice-example-com-"));
        assert!(a.ends_with("-g3"));
        assert!(a
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert_ne!(a, job_name_for("alice@example.com", 3));
    }

    #[test]
    fn each_generation_gets_its_own_job() {
        assert_ne!(job_name_for("alice", 1), job_name_for("alice", 2));
    }

    #[test]
    fn job_names_fit_a_dns_label() {
        let long_user = "a".repeat(200);
        assert!(job_name_for(&long_user, u64::MAX).len() <= 63);
    }

    #[test]
    fn job_name_for_symbol_only_user() {
        let name = job_name_for("@@@", 7);
        assert!(name.starts_with("session-"));
        assert_eq!(name.len(), "session-".len() + 12 + "-g7".len());
    }

    #[test]
    fn status_readiness() {
        let pending = JobStatus {
            status: JobPhase::Running,
            started: false,
            address: None,
        };
        assert!(!pending.is_ready());
        let ready: JobStatus =
            serde_json::from_str(r#"{"status":"running","started":true}"#).unwrap();
        assert!(ready.is_ready());
        let odd: JobStatus = serde_json::from_str(r#"{"status":"evicted"}"#).unwrap();
        assert_eq!(odd.status, JobPhase::Unknown);
        assert!(!odd.is_terminal());
    }

    #[test]
    fn transient_classification() {
        let busy = JobError::UnexpectedStatus {
            status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        };
        assert!(busy.is_transient());
        let denied = JobError::UnexpectedStatus {
            status: reqwest::StatusCode::FORBIDDEN,
            body: "quota".into(),
        };
        assert!(!denied.is_transient());
    }

    #[tokio::test]
    async fn probe_hits_listening_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(probe_tcp(&format!("http://{addr}"), Duration::from_secs(1)).await);
        drop(listener);
        assert!(!probe_tcp("not a url", Duration::from_secs(1)).await);
    }
}
