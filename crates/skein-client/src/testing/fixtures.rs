//! Test fixtures and builders for common test scenarios.

use std::sync::{Arc, Mutex};

use skein_trace::{Call, CallOp, CallSink};

use crate::client::Client;
use crate::config::{ClientConfig, TransportMode};
use crate::error::Result;
use crate::transport::RecordingTransport;

/// A sink that keeps every mutation it receives.
#[derive(Debug, Default)]
pub struct CollectingSink {
    ops: Mutex<Vec<CallOp>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ops(&self) -> Vec<CallOp> {
        self.ops.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl CallSink for CollectingSink {
    fn submit(&self, op: CallOp) {
        self.ops.lock().unwrap_or_else(|e| e.into_inner()).push(op);
    }
}

/// A config with delivery disabled, small batches and fast retries.
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.project = "test".to_string();
    config.transport.mode = TransportMode::Disabled;
    config.batch.max_batch_size = 10;
    config.batch.max_flush_interval_ms = 50;
    config.retry.max_retries = 3;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 10;
    config
}

/// A config pointing the HTTP transport at `base_url`.
pub fn http_config(base_url: &str) -> ClientConfig {
    let mut config = test_config();
    config.transport.mode = TransportMode::Http;
    config.transport.base_url = base_url.to_string();
    config.transport.api_key = Some("test-key".to_string());
    config.transport.timeout_secs = 5;
    config
}

/// A client delivering into a fresh [`RecordingTransport`].
pub fn recording_client(config: ClientConfig) -> Result<(Client, Arc<RecordingTransport>)> {
    let transport = Arc::new(RecordingTransport::new());
    let client = Client::with_transport(config, transport.clone())?;
    Ok((client, transport))
}

/// Mutations of one call that was started and finished with `output`.
pub fn finished_call_ops(op_name: &str, output: serde_json::Value) -> Vec<CallOp> {
    let sink = CollectingSink::new();
    let call = Call::builder(op_name).sink(Some(sink.clone())).start();
    // A fresh call is always pending.
    let _ = call.finish(output);
    sink.ops()
}
