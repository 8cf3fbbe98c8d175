use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode, Uri},
    response::Response,
    routing::get,
    Json, Router,
};
use beach_gateway::background::BackgroundTasks;
use beach_gateway::config::AppConfig;
use beach_gateway::routes;
use beach_gateway::state::AppState;
use gateway_sdk::coordination::Coordination;
use gateway_sdk::job::job_name_for;
use gateway_sdk::{JobError, JobLifecycle, JobPhase, JobStatus, SessionState};
use http_body_util::BodyExt;
use serde_json::Value;
use test_timeout::tokio_timeout_test;
use tower::ServiceExt;

/// Scheduler stand-in whose workers are all served by one address.
struct FixedJobs {
    address: String,
    creates: AtomicUsize,
}

impl FixedJobs {
    fn new(address: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            creates: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl JobLifecycle for FixedJobs {
    async fn create(&self, user_id: &str, generation: u64) -> Result<String, JobError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(job_name_for(user_id, generation))
    }

    async fn get_status(&self, _job_name: &str) -> Result<JobStatus, JobError> {
        Ok(JobStatus {
            status: JobPhase::Running,
            started: true,
            address: Some(self.address.clone()),
        })
    }

    async fn probe(&self, _base_address: &str) -> bool {
        true
    }
}

async fn echo(method: Method, uri: Uri, headers: HeaderMap) -> Json<Value> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Json(serde_json::json!({
        "method": method.as_str(),
        "uri": uri.to_string(),
        "user": header("x-user-id"),
        "request_id": header("x-request-id"),
    }))
}

async fn spawn_worker() -> String {
    let app = Router::new()
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        )
        .fallback(echo);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn closed_address() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

fn gateway(jobs: Arc<FixedJobs>) -> (Router, AppState) {
    let cfg = AppConfig {
        session_timeout_secs: 5,
        backoff_initial_ms: 10,
        backoff_max_ms: 50,
        ..AppConfig::default()
    };
    let state = AppState::new(
        &cfg,
        &Coordination::in_memory(),
        jobs,
        BackgroundTasks::new(),
    )
    .unwrap();
    (routes::router(state.clone()), state)
}

fn request(method: Method, uri: &str, user: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio_timeout_test(10)]
async fn health_and_readiness() {
    let (app, _) = gateway(FixedJobs::new("http://127.0.0.1:1"));
    let res = app
        .clone()
        .oneshot(request(Method::GET, "/healthz", None))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .oneshot(request(Method::GET, "/readyz", None))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["instance_id"], "gateway-1");
    assert_eq!(body["inflight_requests"], 0);
}

#[tokio_timeout_test(10)]
async fn requests_without_user_are_rejected() {
    let jobs = FixedJobs::new("http://127.0.0.1:1");
    let (app, _) = gateway(jobs.clone());
    let res = app
        .clone()
        .oneshot(request(Method::GET, "/session/anything", None))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(res).await["error"], "unauthorized");

    let res = app
        .oneshot(request(Method::POST, "/sessions", Some("   ")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(jobs.creates.load(Ordering::SeqCst), 0);
}

#[tokio_timeout_test(10)]
async fn warm_up_creates_then_reuses_session() {
    let worker = spawn_worker().await;
    let jobs = FixedJobs::new(worker.clone());
    let (app, _) = gateway(jobs.clone());

    let res = app
        .clone()
        .oneshot(request(Method::GET, "/sessions", Some("alice")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = app
        .clone()
        .oneshot(request(Method::POST, "/sessions", Some("alice")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().contains_key("x-request-id"));
    let body = json_body(res).await;
    assert_eq!(body["base_address"], worker.as_str());
    assert_eq!(body["state"], "ready");

    let res = app
        .clone()
        .oneshot(request(Method::POST, "/sessions", Some("alice")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(jobs.creates.load(Ordering::SeqCst), 1);

    let res = app
        .oneshot(request(Method::GET, "/sessions", Some("alice")))
        .await
        .unwrap();
    let body = json_body(res).await;
    assert_eq!(body["state"], SessionState::Ready.as_str());
    assert_eq!(body["job_name"], job_name_for("alice", 1).as_str());
}

#[tokio_timeout_test(10)]
async fn proxies_under_mount_prefix() {
    let worker = spawn_worker().await;
    let (app, state) = gateway(FixedJobs::new(worker));

    let req = Request::builder()
        .method(Method::GET)
        .uri("/session/api/run?step=2")
        .header("x-user-id", "bob")
        .header("x-request-id", "req-77")
        .body(Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["x-request-id"], "req-77");
    let body = json_body(res).await;
    assert_eq!(body["method"], "GET");
    assert_eq!(body["uri"], "/api/run?step=2");
    assert_eq!(body["user"], "bob");
    assert_eq!(body["request_id"], "req-77");
    // the registration is released by the teardown task once the body ends
    while !state.aborts().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio_timeout_test(10)]
async fn dead_worker_is_invalidated() {
    let (app, _) = gateway(FixedJobs::new(closed_address().await));

    let res = app
        .clone()
        .oneshot(request(Method::GET, "/session/ping", Some("carol")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(res).await["error"], "service_unavailable");

    let res = app
        .oneshot(request(Method::GET, "/sessions", Some("carol")))
        .await
        .unwrap();
    let body = json_body(res).await;
    assert_eq!(body["state"], "unknown");
    assert!(body["base_address"].is_null());
}

#[tokio_timeout_test(15)]
async fn abort_endpoint_cancels_inflight_request() {
    let worker = spawn_worker().await;
    let (app, state) = gateway(FixedJobs::new(worker));

    let inflight = {
        let app = app.clone();
        tokio::spawn(async move {
            let req = Request::builder()
                .uri("/session/slow")
                .header("x-user-id", "dave")
                .header("x-request-id", "req-slow")
                .body(Body::empty())
                .unwrap();
            app.oneshot(req).await.unwrap()
        })
    };

    while state.aborts().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let req = Request::builder()
        .method(Method::POST)
        .uri("/abort/req-slow")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"reason":"user pressed stop"}"#))
        .unwrap();
    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body = json_body(res).await;
    assert_eq!(body["request_id"], "req-slow");
    assert_eq!(body["aborted_locally"], 1);
    assert_eq!(body["broadcast"], true);

    let res = inflight.await.unwrap();
    assert_eq!(res.status().as_u16(), 499);
    let body = json_body(res).await;
    assert_eq!(body["error"], "aborted");
    assert!(body["message"]
        .as_str()
        .unwrap_or_default()
        .contains("user pressed stop"));
}

#[tokio_timeout_test(10)]
async fn abort_for_unknown_request_is_still_broadcast() {
    let (app, _) = gateway(FixedJobs::new("http://127.0.0.1:1"));
    let res = app
        .oneshot(request(Method::POST, "/abort/nobody-home", None))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body = json_body(res).await;
    assert_eq!(body["aborted_locally"], 0);
    assert_eq!(body["broadcast"], true);
}

#[tokio_timeout_test(10)]
async fn metrics_are_exposed() {
    beach_gateway::metrics::BOOT_COUNTER.inc();
    let (app, _) = gateway(FixedJobs::new("http://127.0.0.1:1"));
    let res = app
        .oneshot(request(Method::GET, "/metrics", None))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&bytes).contains("gateway_boot_total"));
}
