//! HTTP mock server for integration testing.
//!
//! Speaks the batch ingestion API so the full HTTP delivery path can be
//! exercised without a real backend.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use skein_trace::{CallId, CallOp, CallRecord, records_from_ops};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::transport::{BatchRequest, BatchResponse, EntryOutcome};

#[derive(Debug, Default)]
struct ServerState {
    ops: Mutex<Vec<CallOp>>,
    requests: AtomicUsize,
    auth_headers: Mutex<Vec<String>>,
    /// Status codes to answer the next requests with.
    failures: Mutex<VecDeque<u16>>,
    rejections: Mutex<HashMap<CallId, String>>,
}

/// An HTTP mock of the ingestion backend.
///
/// # Example
///
/// ```ignore
/// use skein_client::testing::{MockIngestServer, http_config};
///
/// let server = MockIngestServer::start().await;
/// let client = Client::new(http_config(&server.url()))?;
/// // ... record calls ...
/// client.wait_for_batch_processing().await;
/// assert_eq!(server.records().len(), 1);
/// server.shutdown().await;
/// ```
pub struct MockIngestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockIngestServer {
    /// Start a new mock server on a random available port.
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());

        let app = Router::new()
            .route("/call/batch", post(handle_batch))
            .route("/health", get(handle_health))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock server");
        let addr = listener.local_addr().expect("Failed to get local address");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        // Give the server a moment to start
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Get the server's base URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accepted entries, in arrival order.
    pub fn received_ops(&self) -> Vec<CallOp> {
        self.state.ops.lock().unwrap().clone()
    }

    /// Records folded from accepted entries, in creation order.
    pub fn records(&self) -> Vec<CallRecord> {
        records_from_ops(&self.received_ops())
    }

    /// Number of batch requests received, including failed ones.
    pub fn request_count(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// `Authorization` header of every batch request.
    pub fn auth_headers(&self) -> Vec<String> {
        self.state.auth_headers.lock().unwrap().clone()
    }

    /// Answer the next `n` batch requests with `status` and no results.
    pub fn fail_next_requests(&self, n: usize, status: u16) {
        let mut failures = self.state.failures.lock().unwrap();
        failures.extend(std::iter::repeat_n(status, n));
    }

    /// Reject every entry for `call_id`.
    pub fn reject_call(&self, call_id: CallId, reason: impl Into<String>) {
        self.state
            .rejections
            .lock()
            .unwrap()
            .insert(call_id, reason.into());
    }

    /// Shutdown the server.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Handle POST /call/batch
async fn handle_batch(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<BatchRequest>,
) -> impl IntoResponse {
    state.requests.fetch_add(1, Ordering::SeqCst);
    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        state.auth_headers.lock().unwrap().push(auth.to_string());
    }

    let failure = state.failures.lock().unwrap().pop_front();
    if let Some(status) = failure {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({ "error": "simulated failure" });
        return (status, Json(body)).into_response();
    }

    let rejections = state.rejections.lock().unwrap();
    let mut ops = state.ops.lock().unwrap();
    let results = request
        .batch
        .into_iter()
        .map(|op| match rejections.get(op.call_id()) {
            Some(reason) => EntryOutcome::rejected(reason.clone()),
            None => {
                ops.push(op);
                EntryOutcome::accepted()
            }
        })
        .collect();

    (StatusCode::OK, Json(BatchResponse { results })).into_response()
}

/// Handle GET /health
async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}
