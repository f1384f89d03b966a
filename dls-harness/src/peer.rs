//! Scripted HTTP server standing in for the download origin.
//!
//! Responses are served strictly in enqueue order, one per request. Every
//! request is recorded in arrival order for [`crate::RequestCorrelator`].
//! Problems on the server side (a request with nothing enqueued, a response
//! that cannot be encoded) are recorded as faults and answered with a 500;
//! they surface on the scenario thread through
//! [`MockNetworkPeer::check_for_exceptions`].
//!
//! The server is an `axum` router driven by a current-thread `tokio` runtime
//! on its own OS thread, so the harness itself stays synchronous.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

const PEER_THREAD_NAME: &str = "dls-mock-peer";

/// Faults recorded by the mock peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("{method} {path} arrived with no response enqueued")]
    NoResponseEnqueued { method: String, path: String },

    #[error("enqueued response has invalid status code {0}")]
    InvalidStatus(u16),

    #[error("enqueued response has invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("failed to bind mock peer: {0}")]
    Bind(String),

    #[error("mock peer runtime failed: {0}")]
    Runtime(String),
}

/// A scripted response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl MockResponse {
    /// Empty-bodied response with `status`.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// `text/plain` response carrying `body`.
    pub fn text(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self::new(status)
            .with_header("content-type", "text/plain")
            .with_body(body)
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// One request as the peer saw it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedRequest {
    /// Arrival order, starting at 1.
    pub sequence: u64,
    pub method: String,
    /// Path and query, e.g. `/file?x=1`.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// First value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Path without the query string.
    pub fn path_only(&self) -> &str {
        self.path.split_once('?').map_or(self.path.as_str(), |(path, _)| path)
    }
}

/// Recorded requests not yet taken, oldest first.
///
/// The lock is only held to push or pop; takers sleep on the condvar with
/// their own deadline, so concurrent takers never queue behind each other.
#[derive(Default)]
struct RequestLog {
    unread: Mutex<VecDeque<RecordedRequest>>,
    arrived: Condvar,
}

impl RequestLog {
    fn push(&self, request: RecordedRequest) {
        lock(&self.unread).push_back(request);
        self.arrived.notify_all();
    }

    fn take_until(&self, deadline: Instant) -> Option<RecordedRequest> {
        let mut unread = lock(&self.unread);
        loop {
            if let Some(request) = unread.pop_front() {
                return Some(request);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .arrived
                .wait_timeout(unread, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            unread = guard;
        }
    }
}

#[derive(Default)]
pub(crate) struct PeerState {
    responses: Mutex<VecDeque<MockResponse>>,
    faults: Mutex<Vec<PeerError>>,
    requests: RequestLog,
    sequence: AtomicU64,
}

impl PeerState {
    fn record_fault(&self, fault: PeerError) {
        error!(%fault, "mock peer fault");
        lock(&self.faults).push(fault);
    }
}

pub(crate) fn create_router(state: Arc<PeerState>) -> Router {
    Router::new().fallback(serve_request).with_state(state)
}

async fn serve_request(
    State(state): State<Arc<PeerState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());
    let recorded = RecordedRequest {
        sequence: state.sequence.fetch_add(1, Ordering::SeqCst) + 1,
        method: method.to_string(),
        path: path.clone(),
        headers: headers
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body: body.to_vec(),
    };
    debug!(sequence = recorded.sequence, %method, %path, "mock peer received request");
    state.requests.push(recorded);

    let next = lock(&state.responses).pop_front();
    let Some(scripted) = next else {
        state.record_fault(PeerError::NoResponseEnqueued {
            method: method.to_string(),
            path,
        });
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let status = scripted.status;
    match encode_response(scripted) {
        Ok(response) => {
            debug!(status, "mock peer responded");
            response
        }
        Err(fault) => {
            state.record_fault(fault);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn encode_response(scripted: MockResponse) -> Result<Response, PeerError> {
    let status =
        StatusCode::from_u16(scripted.status).map_err(|_| PeerError::InvalidStatus(scripted.status))?;

    let mut response = Response::new(Body::from(scripted.body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in &scripted.headers {
        let invalid = |reason: String| PeerError::InvalidHeader {
            name: name.clone(),
            reason,
        };
        let header_name =
            HeaderName::try_from(name.as_str()).map_err(|err| invalid(err.to_string()))?;
        let header_value =
            HeaderValue::try_from(value.as_str()).map_err(|err| invalid(err.to_string()))?;
        headers.append(header_name, header_value);
    }
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    Ok(response)
}

/// Handle to a running mock peer.
pub struct MockNetworkPeer {
    addr: SocketAddr,
    state: Arc<PeerState>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MockNetworkPeer {
    /// Bind an ephemeral loopback port and start serving.
    pub fn start() -> Result<Self, PeerError> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
            .map_err(|err| PeerError::Bind(err.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| PeerError::Bind(err.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|err| PeerError::Bind(err.to_string()))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| PeerError::Runtime(err.to_string()))?;

        let state = Arc::new(PeerState::default());
        let router = create_router(Arc::clone(&state));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let server_state = Arc::clone(&state);
        let thread = thread::Builder::new()
            .name(PEER_THREAD_NAME.to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(err) => {
                            server_state.record_fault(PeerError::Bind(err.to_string()));
                            return;
                        }
                    };
                    let served = axum::serve(listener, router)
                        .with_graceful_shutdown(async {
                            let _ = shutdown_rx.await;
                        })
                        .await;
                    if let Err(err) = served {
                        server_state.record_fault(PeerError::Runtime(err.to_string()));
                    }
                });
            })
            .map_err(|err| PeerError::Runtime(err.to_string()))?;

        info!(%addr, "mock peer listening");
        Ok(Self {
            addr,
            state,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Absolute URL of `path` on this peer.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("http://{}{}", self.addr, path)
        } else {
            format!("http://{}/{}", self.addr, path)
        }
    }

    /// Queue the response for the next unanswered request.
    pub fn enqueue(&self, response: MockResponse) {
        debug!(status = response.status, "response enqueued");
        lock(&self.state.responses).push_back(response);
    }

    /// Responses not yet served.
    pub fn pending_responses(&self) -> usize {
        lock(&self.state.responses).len()
    }

    /// Requests received so far, read or not.
    pub fn request_count(&self) -> u64 {
        self.state.sequence.load(Ordering::SeqCst)
    }

    /// Oldest unread request, waiting up to `timeout` for one to arrive.
    ///
    /// Each request is handed to exactly one caller. Concurrent callers each
    /// return by their own deadline.
    pub fn take_request_with_timeout(&self, timeout: Duration) -> Option<RecordedRequest> {
        self.state.requests.take_until(Instant::now() + timeout)
    }

    /// Fail with the first fault recorded so far.
    pub fn check_for_exceptions(&self) -> Result<(), PeerError> {
        match lock(&self.state.faults).first() {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }

    pub fn faults(&self) -> Vec<PeerError> {
        lock(&self.state.faults).clone()
    }

    /// Stop serving and join the server thread. Idempotent.
    pub fn shutdown(&self) -> Result<(), PeerError> {
        if let Some(tx) = lock(&self.shutdown_tx).take() {
            let _ = tx.send(());
        }
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| PeerError::Runtime(format!("{PEER_THREAD_NAME} thread panicked")))?;
            info!(addr = %self.addr, "mock peer stopped");
        }
        Ok(())
    }
}

impl Drop for MockNetworkPeer {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "mock peer did not shut down cleanly");
        }
    }
}

impl std::fmt::Debug for MockNetworkPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockNetworkPeer")
            .field("addr", &self.addr)
            .field("pending_responses", &self.pending_responses())
            .field("requests", &self.request_count())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
