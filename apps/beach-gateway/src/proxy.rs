use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, HttpBody};
use axum::http::{header, HeaderMap, HeaderName, Request, Response};
use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::abort::{run_with_cancellation, AbortError, AbortRegistration, AbortSignal};
use crate::background::BackgroundTasks;
use crate::metrics;

/// Chunks buffered between the inbound body and the upstream request.
const BODY_BUFFER: usize = 8;

const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("worker unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("worker did not answer within {0:?}")]
    ServiceTimeout(Duration),
    #[error(transparent)]
    Aborted(#[from] AbortError),
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

/// Streams requests under the mount prefix to a worker and the worker's
/// response back, untouched apart from hop-by-hop headers.
#[derive(Clone)]
pub struct ReverseProxy {
    http: reqwest::Client,
    mount_prefix: String,
    timeout: Duration,
    tasks: BackgroundTasks,
}

impl ReverseProxy {
    pub fn new(
        mount_prefix: &str,
        timeout: Duration,
        tasks: BackgroundTasks,
    ) -> Result<Self, ProxyError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| ProxyError::InvalidRequest(err.to_string()))?;
        Ok(Self {
            http,
            mount_prefix: normalize_prefix(mount_prefix),
            timeout,
            tasks,
        })
    }

    pub fn mount_prefix(&self) -> &str {
        &self.mount_prefix
    }

    /// `/session/api/run?x=1` -> `/api/run?x=1`. Paths that merely start
    /// with the same characters (`/sessions`) are left alone.
    pub fn strip_prefix(&self, path_and_query: &str) -> String {
        if self.mount_prefix.is_empty() {
            return path_and_query.to_string();
        }
        match path_and_query.strip_prefix(self.mount_prefix.as_str()) {
            Some("") => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            Some(rest) if rest.starts_with('?') => format!("/{rest}"),
            _ => path_and_query.to_string(),
        }
    }

    /// Forwards `request` to `base_address`. The registration stays alive
    /// (and the request abortable) until the response body is finished.
    pub async fn forward(
        &self,
        request: Request<Body>,
        base_address: &str,
        registration: AbortRegistration,
    ) -> Result<Response<Body>, ProxyError> {
        let signal = registration.signal();
        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!(
            "{}{}",
            base_address.trim_end_matches('/'),
            self.strip_prefix(path)
        );

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        let mut upstream = self.http.request(parts.method, &url).headers(headers);
        if body.size_hint().exact() != Some(0) {
            upstream = upstream.body(reqwest::Body::wrap_stream(self.pump_body(body)));
        }
        let upstream = upstream.send();
        let response = run_with_cancellation(upstream, &signal)
            .await?
            .map_err(|err| self.classify(err, &url))?;

        let status = response.status();
        metrics::PROXY_RESPONSES
            .with_label_values(&[metrics::status_class(status.as_u16())])
            .inc();
        debug!(url = %url, status = status.as_u16(), "upstream responded");

        let mut builder = Response::builder().status(status);
        if let Some(out) = builder.headers_mut() {
            for (name, value) in response.headers() {
                if !HOP_BY_HOP.contains(name) {
                    out.append(name.clone(), value.clone());
                }
            }
        }
        let stream = TeardownStream {
            inner: Some(response.bytes_stream().boxed()),
            aborted: Box::pin(wait_owned(signal)),
            registration: Some(registration),
            tasks: self.tasks.clone(),
            url,
            bytes: 0,
        };
        builder
            .body(Body::from_stream(stream))
            .map_err(|err| ProxyError::InvalidRequest(err.to_string()))
    }

    /// Moves the inbound body onto a channel the upstream client can own.
    fn pump_body(&self, body: Body) -> ReceiverStream<Result<Bytes, io::Error>> {
        let (tx, rx) = mpsc::channel(BODY_BUFFER);
        self.tasks.submit("proxy-request-body", async move {
            let mut chunks = body.into_data_stream();
            while let Some(chunk) = chunks.next().await {
                let item = chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err));
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
            Ok(())
        });
        ReceiverStream::new(rx)
    }

    fn classify(&self, err: reqwest::Error, url: &str) -> ProxyError {
        if err.is_connect() {
            warn!(url, error = %err, "worker connect failed");
            ProxyError::ServiceUnavailable(err.to_string())
        } else if err.is_timeout() {
            warn!(url, timeout_secs = self.timeout.as_secs(), "worker timed out");
            ProxyError::ServiceTimeout(self.timeout)
        } else {
            warn!(url, error = %err, "upstream request failed");
            ProxyError::ServiceUnavailable(err.to_string())
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

fn wait_owned(signal: AbortSignal) -> impl Future<Output = AbortError> + Send + 'static {
    async move {
        signal.wait().await;
        signal.error()
    }
}

/// Response body. Ends with an error if the request is aborted mid-stream;
/// once finished or dropped, closing the upstream connection is handed to the
/// background registry.
struct TeardownStream {
    inner: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    aborted: Pin<Box<dyn Future<Output = AbortError> + Send>>,
    registration: Option<AbortRegistration>,
    tasks: BackgroundTasks,
    url: String,
    bytes: u64,
}

impl TeardownStream {
    fn teardown(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let registration = self.registration.take();
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let url = std::mem::take(&mut self.url);
        let bytes = self.bytes;
        self.tasks.submit("proxy-teardown", async move {
            drop(inner);
            drop(registration);
            debug!(url = %url, bytes, "upstream stream closed");
            Ok(())
        });
    }
}

impl Stream for TeardownStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.inner.is_none() {
            return Poll::Ready(None);
        }
        if let Poll::Ready(err) = this.aborted.as_mut().poll(cx) {
            this.teardown();
            return Poll::Ready(Some(Err(io::Error::new(io::ErrorKind::Interrupted, err))));
        }
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.bytes += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.teardown();
                Poll::Ready(Some(Err(io::Error::new(io::ErrorKind::Other, err))))
            }
            Poll::Ready(None) => {
                this.teardown();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TeardownStream {
    fn drop(&mut self) {
        self.teardown();
    }
}
