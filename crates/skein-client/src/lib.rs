//! skein-client: instrumentation and delivery for recorded calls
//!
//! This crate turns plain async functions into recorded calls and ships
//! those records to an ingestion backend:
//! - Op wrapper that records one call per invocation, nested under the
//!   caller's current call
//! - Coalescing, bounded batching queue with a background flush worker
//! - Transports for the HTTP ingestion API, local JSONL logs and tests
//! - Retry with exponential backoff; failures reported, never raised
//! - Configuration discovery (`.skein/config.toml`) and logging setup

pub mod client;
pub mod config;
pub mod error;
pub mod global;
pub mod logging;
pub mod op;
pub mod queue;
pub mod transport;

// Testing utilities - available in test builds and with the `testing` feature
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{CallHandle, Client};
pub use config::{
    BatchSettings, ClientConfig, ConfigValidationError, LoggingConfig, RetrySettings,
    TransportConfig, TransportMode,
};
pub use error::{ClientError, Result};
pub use logging::init_logging;
pub use op::{IntoOp, Op, OpOptions, ParamPolicy, Trial, Trials, op, op_with};
pub use queue::{BatchConfig, BatchQueue, EnqueueOutcome, FlushBatch, QueueStats};
pub use transport::{
    DeliveryFailure, DeliveryReport, EntryOutcome, FileTransport, HttpTransport,
    HttpTransportConfig, LoggingTransport, NoopTransport, RecordingTransport, RetryPolicy,
    SharedTransport, Transport, deliver,
};

// Context carrier re-exports, so applications need only this crate.
pub use skein_trace::{
    Attributes, Call, CallId, CallRecord, CallStatus, CallTree, Exception, Scope,
    ScopeFutureExt, current_attributes, current_call, run_in_scope, spawn, with_attributes,
};
