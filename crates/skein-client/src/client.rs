//! The client handle.
//!
//! A [`Client`] owns one batching queue, one transport and the flush worker
//! that connects them. Calls reach it through its sink: either an Op bound
//! to the client, or any Op running inside [`Client::scope`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use skein_trace::{
    Call, CallId, CallOp, CallRecord, CallSink, CallStatus, CallUpdate, Scope, SharedSink,
    WeakCall, WriterConfig,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::task::futures::TaskLocalFuture;

use crate::config::{ClientConfig, TransportMode};
use crate::error::{ClientError, Result};
use crate::queue::{BatchConfig, BatchQueue, QueueStats};
use crate::transport::{
    DeliveryFailure, FileTransport, HttpTransport, HttpTransportConfig, LoggingTransport,
    NoopTransport, RetryPolicy, SharedTransport,
};

// ─────────────────────────────────────────────────────────────────────────────
// Call cache
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct CachedCall {
    record: CallRecord,
    live: Option<WeakCall>,
}

/// Bounded record of the calls this client has seen, for `get_call`.
#[derive(Debug)]
struct CallCache {
    calls: HashMap<CallId, CachedCall>,
    order: VecDeque<CallId>,
    capacity: usize,
}

impl CallCache {
    fn new(capacity: usize) -> Self {
        Self {
            calls: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn observe(&mut self, op: &CallOp) {
        if self.capacity == 0 {
            return;
        }
        match op {
            CallOp::Start(start) => {
                if self.calls.contains_key(&start.id) {
                    return;
                }
                while self.order.len() >= self.capacity {
                    if let Some(oldest) = self.order.pop_front() {
                        self.calls.remove(&oldest);
                    }
                }
                self.calls.insert(
                    start.id.clone(),
                    CachedCall {
                        record: CallRecord::from_start(start),
                        live: None,
                    },
                );
                self.order.push_back(start.id.clone());
            }
            other => {
                if let Some(cached) = self.calls.get_mut(other.call_id()) {
                    cached.record.apply(other);
                }
            }
        }
    }

    fn track(&mut self, call: &Call) {
        if let Some(cached) = self.calls.get_mut(call.id()) {
            cached.live = Some(call.downgrade());
        }
    }
}

/// The sink every call attached to a client reports to.
#[derive(Debug)]
struct ClientSink {
    queue: Arc<BatchQueue>,
    calls: Mutex<CallCache>,
}

impl ClientSink {
    fn calls(&self) -> MutexGuard<'_, CallCache> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CallSink for ClientSink {
    fn submit(&self, op: CallOp) {
        self.calls().observe(&op);
        self.queue.enqueue(op);
    }

    fn track(&self, call: &Call) {
        self.calls().track(call);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Call handle
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to a call looked up through [`Client::get_call`].
#[derive(Debug, Clone)]
pub struct CallHandle {
    id: CallId,
    sink: Arc<ClientSink>,
}

impl CallHandle {
    pub fn id(&self) -> &CallId {
        &self.id
    }

    /// Latest known state of the call.
    pub fn record(&self) -> Option<CallRecord> {
        if let Some(call) = self.live() {
            return Some(call.snapshot());
        }
        self.sink
            .calls()
            .calls
            .get(&self.id)
            .map(|cached| cached.record.clone())
    }

    pub fn status(&self) -> Option<CallStatus> {
        self.record().map(|r| r.status)
    }

    /// Relabel the call. Allowed while pending and after finalization.
    pub fn set_display_name(&self, name: impl Into<String>) {
        let name = name.into();
        match self.live() {
            Some(call) => call.set_display_name(name),
            None => self.sink.submit(CallOp::Update(CallUpdate {
                id: self.id.clone(),
                display_name: Some(name),
            })),
        }
    }

    fn live(&self) -> Option<Call> {
        self.sink
            .calls()
            .calls
            .get(&self.id)
            .and_then(|cached| cached.live.as_ref())
            .and_then(WeakCall::upgrade)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// Delivers call mutations to an ingestion backend.
///
/// Cheap to clone; clones share the same queue and worker.
///
/// # Example
///
/// ```ignore
/// use skein_client::{Client, ClientConfig, op};
///
/// let client = Client::new(ClientConfig::load_or_default())?;
/// let double = op(|x: i64| async move { Ok::<_, std::io::Error>(x * 2) });
///
/// client.scope(double.call(21)).await?;
/// client.shutdown().await?;
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    queue: Arc<BatchQueue>,
    transport: SharedTransport,
    sink: Arc<ClientSink>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Create a client with the transport selected by `config`.
    ///
    /// Must be called inside a tokio runtime.
    /// Fails with [`ClientError::Config`] if `config` does not validate.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let errors = config.validate();
        if !errors.is_empty() {
            let errors: Vec<String> = errors.iter().map(ToString::to_string).collect();
            return Err(ClientError::Config(format!(
                "Invalid configuration: {}",
                errors.join("; ")
            )));
        }
        let transport = transport_for(&config)?;
        Self::with_transport(config, transport)
    }

    /// Create a client from discovered configuration and the environment.
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::load_or_default())
    }

    /// Create a client delivering through `transport`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_transport(config: ClientConfig, transport: SharedTransport) -> Result<Self> {
        tokio::runtime::Handle::try_current().map_err(|_| {
            ClientError::Config("Client must be created inside a tokio runtime".to_string())
        })?;

        let queue = Arc::new(BatchQueue::new(BatchConfig::from(&config.batch)));
        let worker = queue.spawn_worker(Arc::clone(&transport), RetryPolicy::from(&config.retry));
        let sink = Arc::new(ClientSink {
            queue: Arc::clone(&queue),
            calls: Mutex::new(CallCache::new(config.call_cache_capacity)),
        });

        tracing::info!(
            project = %config.project,
            transport = transport.name(),
            max_batch_size = config.batch.max_batch_size,
            "Client started"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                queue,
                transport,
                sink,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }

    /// The sink calls attached to this client report to.
    pub fn sink(&self) -> SharedSink {
        self.inner.sink.clone()
    }

    /// Run `fut` with this client attached: calls created inside it are
    /// delivered by this client.
    pub fn scope<F: Future>(&self, fut: F) -> TaskLocalFuture<Scope, F> {
        Scope::current().with_sink(self.sink()).run(fut)
    }

    /// Look up a call this client has seen.
    pub fn get_call(&self, id: &CallId) -> Result<CallHandle> {
        if self.inner.sink.calls().calls.contains_key(id) {
            Ok(CallHandle {
                id: id.clone(),
                sink: Arc::clone(&self.inner.sink),
            })
        } else {
            Err(ClientError::CallNotFound(id.clone()))
        }
    }

    /// Flush without waiting for size or age thresholds.
    pub fn flush(&self) {
        self.inner.queue.flush_now();
    }

    /// Wait until every call mutation made so far has been delivered or has
    /// terminally failed.
    pub async fn wait_for_batch_processing(&self) {
        self.inner.queue.wait_for_batch_processing().await;
    }

    /// Drain the queue and stop the flush worker. Only the first call
    /// drains; later calls fail with `AlreadyShutdown`.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.queue.shutdown().await?;

        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Flush worker failed");
            }
        }

        let stats = self.stats();
        tracing::info!(
            delivered = stats.delivered,
            failed = stats.failed,
            dropped = stats.dropped,
            "Client shut down"
        );
        Ok(())
    }

    /// Subscribe to entries that could not be delivered.
    pub fn delivery_failures(&self) -> broadcast::Receiver<DeliveryFailure> {
        self.inner.queue.subscribe_failures()
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    /// Check that the transport's destination is reachable.
    pub async fn health_check(&self) -> Result<()> {
        self.inner.transport.health_check().await
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("project", &self.inner.config.project)
            .field("transport", &self.inner.transport.name())
            .finish()
    }
}

/// Build the transport named by the configuration.
fn transport_for(config: &ClientConfig) -> Result<SharedTransport> {
    let transport: SharedTransport = match config.transport.mode {
        TransportMode::Http => Arc::new(LoggingTransport::new(HttpTransport::new(
            HttpTransportConfig::from(config),
        )?)),
        TransportMode::File => {
            let path = match ClientConfig::find_and_load() {
                Ok(Some((_, skein_dir))) => config.resolve_log_path(Some(&skein_dir)),
                _ => config.resolve_log_path(None),
            };
            Arc::new(FileTransport::new(WriterConfig::daily_rotation(path))?)
        }
        TransportMode::Disabled => Arc::new(NoopTransport),
    };
    Ok(transport)
}
