use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use gateway_sdk::coordination::StoreError;
use gateway_sdk::{SessionState, UserSession};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::abort::broadcast_abort;
use crate::metrics;
use crate::orchestrator::SessionError;
use crate::proxy::ProxyError;
use crate::state::AppState;

const CLIENT_CLOSED_REQUEST: u16 = 499;
const DEFAULT_ABORT_REASON: &str = "aborted by client";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing user identity")]
    MissingUser,
    #[error("no session for user")]
    NotFound,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Serialize)]
struct ApiErrorBody {
    error: &'static str,
    message: Option<String>,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        let client_closed =
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST);
        match self {
            ApiError::MissingUser => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Session(SessionError::ServiceTimeout(_)) => {
                (StatusCode::GATEWAY_TIMEOUT, "session_timeout")
            }
            ApiError::Session(SessionError::Aborted(_)) | ApiError::Proxy(ProxyError::Aborted(_)) => {
                (client_closed, "aborted")
            }
            ApiError::Session(SessionError::CoordinationUnavailable(_)) | ApiError::Store(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "coordination_unavailable")
            }
            ApiError::Session(SessionError::JobRejected(_)) => (StatusCode::BAD_GATEWAY, "job_rejected"),
            ApiError::Session(SessionError::WorkerFailed { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "worker_failed")
            }
            ApiError::Proxy(ProxyError::ServiceUnavailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            ApiError::Proxy(ProxyError::ServiceTimeout(_)) => {
                (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout")
            }
            ApiError::Proxy(ProxyError::InvalidRequest(_)) => (StatusCode::BAD_GATEWAY, "bad_gateway"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = self.status_and_code();
        let message = match self {
            ApiError::MissingUser | ApiError::NotFound => None,
            other => Some(other.to_string()),
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    uptime_secs: u64,
    instance_id: String,
    background_tasks: usize,
    inflight_requests: usize,
}

#[derive(Serialize)]
struct SessionResponse {
    user_id: String,
    job_name: Option<String>,
    base_address: Option<String>,
    state: SessionState,
}

impl From<UserSession> for SessionResponse {
    fn from(session: UserSession) -> Self {
        Self {
            user_id: session.user_id,
            job_name: session.job_name,
            base_address: session.base_address,
            state: session.state,
        }
    }
}

#[derive(Default, Deserialize)]
struct AbortRequest {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Serialize)]
struct AbortResponse {
    request_id: String,
    aborted_locally: usize,
    broadcast: bool,
}

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    Json(ReadyResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        instance_id: state.instance_id().to_string(),
        background_tasks: state.tasks().len(),
        inflight_requests: state.aborts().len(),
    })
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

fn user_id(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(state.user_id_header())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::MissingUser)
}

fn request_id(state: &AppState, headers: &HeaderMap) -> String {
    headers
        .get(state.request_id_header())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn with_request_id(state: &AppState, mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(state.request_id_header().clone(), value);
    }
    response
}

async fn ensure_session(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let request_id = request_id(&state, &headers);
    let response = warm_up(&state, &headers, &request_id).await.into_response();
    with_request_id(&state, response, &request_id)
}

async fn warm_up(
    state: &AppState,
    headers: &HeaderMap,
    request_id: &str,
) -> Result<Json<SessionResponse>, ApiError> {
    let user_id = user_id(state, headers)?;
    let registration = state.aborts().register(request_id);
    let address = state
        .orchestrator()
        .ensure_session(&user_id, &registration.signal())
        .await?;
    Ok(Json(SessionResponse {
        user_id,
        job_name: None,
        base_address: Some(address),
        state: SessionState::Ready,
    }))
}

async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionResponse>, ApiError> {
    let user_id = user_id(&state, &headers)?;
    let session = state
        .orchestrator()
        .session(&user_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(session.into()))
}

async fn abort_request(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<AbortResponse>), ApiError> {
    let reason = serde_json::from_slice::<AbortRequest>(&body)
        .unwrap_or_default()
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ABORT_REASON.to_string());

    let aborted_locally = state.aborts().abort(&request_id, &reason);
    let broadcast = match broadcast_abort(state.abort_bus().as_ref(), &request_id, &reason).await {
        Ok(()) => true,
        Err(err) if aborted_locally > 0 => {
            warn!(request_id = %request_id, error = %err, "abort broadcast failed");
            false
        }
        Err(err) => return Err(err.into()),
    };
    info!(request_id = %request_id, reason = %reason, aborted_locally, "abort requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(AbortResponse {
            request_id,
            aborted_locally,
            broadcast,
        }),
    ))
}

async fn proxy_request(State(state): State<AppState>, request: Request) -> Response {
    let request_id = request_id(&state, request.headers());
    let response = match forward(&state, request, &request_id).await {
        Ok(response) => response,
        Err(err) => {
            warn!(request_id = %request_id, error = %err, "proxy request failed");
            err.into_response()
        }
    };
    with_request_id(&state, response, &request_id)
}

async fn forward(state: &AppState, request: Request, request_id: &str) -> Result<Response, ApiError> {
    let user_id = user_id(state, request.headers())?;
    let registration = state.aborts().register(request_id);
    let address = state
        .orchestrator()
        .ensure_session(&user_id, &registration.signal())
        .await?;
    match state.proxy().forward(request, &address, registration).await {
        Ok(response) => Ok(response),
        Err(ProxyError::ServiceUnavailable(reason)) => {
            // the worker is gone; make the next request recreate it
            state.orchestrator().invalidate(&user_id, &address).await;
            Err(ProxyError::ServiceUnavailable(reason).into())
        }
        Err(err) => Err(err.into()),
    }
}

pub fn router(state: AppState) -> Router {
    let prefix = state.proxy().mount_prefix().to_string();
    let router = Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(ready))
        .route("/metrics", get(metrics_handler))
        .route("/sessions", post(ensure_session).get(get_session))
        .route("/abort/:request_id", post(abort_request));
    let router = if prefix.is_empty() {
        router.fallback(proxy_request)
    } else {
        router
            .route(&prefix, any(proxy_request))
            .route(&format!("{prefix}/*rest"), any(proxy_request))
    };
    router.layer(TraceLayer::new_for_http()).with_state(state)
}
