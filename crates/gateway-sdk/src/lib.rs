//! Collaborator interfaces for the Beach gateway.
//!
//! The gateway consumes two external systems: the cluster platform's job API
//! (create and inspect per-user workers) and a coordination store shared by
//! every gateway replica (leases, the user → session directory, abort
//! broadcast). This crate holds the traits for both, the HTTP job client and
//! an in-memory coordination backend used by tests and single-replica setups.

pub mod coordination;
pub mod job;
pub mod session;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use job::{JobError, JobLifecycle, JobPhase, JobStatus, JobTemplate, ResourceEnvelope};
pub use session::{SessionState, UserSession};

/// HTTP client for the cluster platform's job-scheduling API.
#[derive(Clone)]
pub struct JobClient {
    http: Client,
    base_url: String,
    token: Option<String>,
    template: JobTemplate,
    probe_timeout: Duration,
}

#[derive(Serialize)]
struct CreateJobRequest<'a> {
    name: &'a str,
    image: &'a str,
    port: u16,
    labels: BTreeMap<&'static str, &'a str>,
    env: BTreeMap<&'static str, String>,
    resources: &'a ResourceEnvelope,
}

#[derive(Deserialize)]
struct CreateJobResponse {
    name: String,
}

impl JobClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>, template: JobTemplate) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            template,
            probe_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn default_address(&self, job_name: &str) -> String {
        format!("http://{}:{}", job_name, self.template.port)
    }
}

#[async_trait]
impl JobLifecycle for JobClient {
    async fn create(&self, user_id: &str, generation: u64) -> Result<String, JobError> {
        let name = job::job_name_for(user_id, generation);
        let body = CreateJobRequest {
            name: &name,
            image: &self.template.image,
            port: self.template.port,
            labels: BTreeMap::from([("beach.user", user_id), ("beach.role", "session")]),
            env: BTreeMap::from([
                (
                    "IDLE_TIMEOUT_MINUTES",
                    self.template.idle_timeout_minutes.to_string(),
                ),
                ("SESSION_PORT", self.template.port.to_string()),
            ]),
            resources: &self.template.resources,
        };
        let res = self
            .request(Method::POST, "/v1/jobs")
            .json(&body)
            .send()
            .await?;

        match res.status() {
            status if status.is_success() => {
                let created = res
                    .json::<CreateJobResponse>()
                    .await
                    .map(|r| r.name)
                    .unwrap_or(name);
                Ok(created)
            }
            StatusCode::CONFLICT => {
                debug!(job_name = %name, "job already exists; reusing");
                Ok(name)
            }
            status => {
                let body = res.text().await.unwrap_or_default();
                Err(JobError::UnexpectedStatus { status, body })
            }
        }
    }

    async fn get_status(&self, job_name: &str) -> Result<JobStatus, JobError> {
        let res = self
            .request(Method::GET, &format!("/v1/jobs/{job_name}"))
            .send()
            .await?;

        match res.status() {
            status if status.is_success() => {
                let mut status = res.json::<JobStatus>().await?;
                if status.is_ready() && status.address.is_none() {
                    status.address = Some(self.default_address(job_name));
                }
                Ok(status)
            }
            StatusCode::NOT_FOUND => Err(JobError::NotFound(job_name.to_string())),
            status => {
                let body = res.text().await.unwrap_or_default();
                Err(JobError::UnexpectedStatus { status, body })
            }
        }
    }

    async fn probe(&self, base_address: &str) -> bool {
        job::probe_tcp(base_address, self.probe_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Path,
        http::StatusCode as HttpStatus,
        routing::{get, post},
        Json, Router,
    };
    use test_timeout::tokio_timeout_test;

    fn template() -> JobTemplate {
        JobTemplate {
            image: "registry.local/beach-worker:1".into(),
            port: 8080,
            resources: ResourceEnvelope::default(),
            idle_timeout_minutes: 30,
        }
    }

    async fn spawn_fake_scheduler() -> String {
        let app = Router::new()
            .route(
                "/v1/jobs",
                post(|Json(body): Json<serde_json::Value>| async move {
                    if body["labels"]["beach.user"] == "existing" {
                        return (HttpStatus::CONFLICT, Json(serde_json::json!({})));
                    }
                    (
                        HttpStatus::CREATED,
                        Json(serde_json::json!({ "name": body["name"] })),
                    )
                }),
            )
            .route(
                "/v1/jobs/:name",
                get(|Path(name): Path<String>| async move {
                    if name == "missing" {
                        return Err(HttpStatus::NOT_FOUND);
                    }
                    Ok(Json(serde_json::json!({ "status": "running", "started": true })))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio_timeout_test(10)]
    async fn create_returns_deterministic_name() {
        let client = JobClient::new(spawn_fake_scheduler().await, None, template());
        let name = client.create("alice", 1).await.unwrap();
        assert_eq!(name, job::job_name_for("alice", 1));
    }

    #[tokio_timeout_test(10)]
    async fn create_treats_conflict_as_existing() {
        let client = JobClient::new(spawn_fake_scheduler().await, None, template());
        let name = client.create("existing", 4).await.unwrap();
        assert_eq!(name, job::job_name_for("existing", 4));
    }

    #[tokio_timeout_test(10)]
    async fn status_fills_default_address() {
        let client = JobClient::new(spawn_fake_scheduler().await, None, template());
        let status = client.get_status("session-alice").await.unwrap();
        assert!(status.is_ready());
        assert_eq!(status.address.as_deref(), Some("http://session-alice:8080"));
        let missing = client.get_status("missing").await.unwrap_err();
        assert!(matches!(missing, JobError::NotFound(_)));
        assert!(missing.is_transient());
    }
}
