//! Transport trait and delivery logic.
//!
//! A [`Transport`] sends one batch of call mutations to an ingestion backend
//! and reports a per-entry outcome. [`deliver`] wraps a transport with the
//! retry policy: rejected entries are retried alone, whole-batch failures
//! are retried when transient, and whatever exhausts the budget is reported
//! as a [`DeliveryFailure`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use skein_trace::{CallId, CallOp, CallOpKind};

use crate::config::RetrySettings;
use crate::error::Result;

pub mod file;
pub mod http;
pub mod recording;

pub use file::FileTransport;
pub use http::{HttpTransport, HttpTransportConfig};
pub use recording::RecordingTransport;

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

/// Request body of a batch upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub batch: Vec<CallOp>,
}

/// Response body of a batch upload, one result per entry in batch order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<EntryOutcome>,
}

/// What the backend did with one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryOutcome {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EntryOutcome {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            error: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            error: Some(reason.into()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport trait
// ─────────────────────────────────────────────────────────────────────────────

/// A destination for batches of call mutations.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send one batch. On success returns one outcome per entry, in order.
    ///
    /// An `Err` means the batch as a whole was not processed.
    async fn send(&self, batch: &[CallOp]) -> Result<Vec<EntryOutcome>>;

    /// Name of this transport, for logs.
    fn name(&self) -> &str;

    /// Check if the destination is reachable and properly configured.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

pub type SharedTransport = Arc<dyn Transport>;

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, batch: &[CallOp]) -> Result<Vec<EntryOutcome>> {
        (**self).send(batch).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    async fn health_check(&self) -> Result<()> {
        (**self).health_check().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry and delivery
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff: settings.initial_backoff(),
            max_backoff: settings.max_backoff(),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Backoff before retry number `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Backoff with up to 50% random jitter added, still capped.
    fn jittered(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let half = base.as_millis() as u64 / 2;
        if half == 0 {
            return base;
        }
        let extra = rand::rng().random_range(0..=half);
        (base + Duration::from_millis(extra)).min(self.max_backoff)
    }
}

/// An entry that could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub call_id: CallId,
    pub kind: CallOpKind,
    pub reason: String,
    /// Send attempts made for this entry; zero when it was dropped before
    /// ever being sent.
    pub attempts: u32,
}

impl DeliveryFailure {
    fn new(op: &CallOp, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            call_id: op.call_id().clone(),
            kind: op.kind(),
            reason: reason.into(),
            attempts,
        }
    }

    /// An entry refused by the queue before reaching any transport.
    pub fn dropped(op: &CallOp, reason: impl Into<String>) -> Self {
        Self::new(op, reason, 0)
    }
}

/// Result of delivering one batch.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    /// Entries accepted by the backend.
    pub delivered: usize,
    /// Entry re-sends performed.
    pub retried: usize,
    /// Entries that exhausted the retry budget or failed terminally.
    pub failed: Vec<DeliveryFailure>,
}

/// Deliver `batch` through `transport`, retrying per `policy`.
///
/// Never returns an error: every entry ends up either delivered or in
/// [`DeliveryReport::failed`].
pub async fn deliver<T: Transport + ?Sized>(
    transport: &T,
    batch: Vec<CallOp>,
    policy: &RetryPolicy,
) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    let mut pending = batch;
    let mut attempt: u32 = 0;

    while !pending.is_empty() {
        attempt += 1;
        let start = Instant::now();
        let result = transport.send(&pending).await;
        let exhausted = attempt > policy.max_retries;

        match result {
            Ok(outcomes) => {
                let mut rejected = Vec::new();
                let mut last_reason = String::new();
                for (i, op) in pending.into_iter().enumerate() {
                    match outcomes.get(i) {
                        Some(outcome) if outcome.accepted => report.delivered += 1,
                        Some(outcome) => {
                            last_reason = outcome
                                .error
                                .clone()
                                .unwrap_or_else(|| "rejected by backend".to_string());
                            rejected.push((op, last_reason.clone()));
                        }
                        None => {
                            last_reason = "no result returned for entry".to_string();
                            rejected.push((op, last_reason.clone()));
                        }
                    }
                }

                tracing::debug!(
                    transport = transport.name(),
                    attempt,
                    accepted = outcomes.iter().filter(|o| o.accepted).count(),
                    rejected = rejected.len(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Batch sent"
                );

                if rejected.is_empty() {
                    break;
                }
                if exhausted {
                    tracing::error!(
                        transport = transport.name(),
                        attempts = attempt,
                        entries = rejected.len(),
                        reason = %last_reason,
                        "Entries rejected after exhausting retries"
                    );
                    report.failed.extend(
                        rejected
                            .iter()
                            .map(|(op, reason)| DeliveryFailure::new(op, reason.clone(), attempt)),
                    );
                    break;
                }
                tracing::warn!(
                    transport = transport.name(),
                    attempt,
                    entries = rejected.len(),
                    reason = %last_reason,
                    "Entries rejected, retrying"
                );
                pending = rejected.into_iter().map(|(op, _)| op).collect();
            }
            Err(e) if e.is_retryable() && !exhausted => {
                tracing::warn!(
                    transport = transport.name(),
                    attempt,
                    max_retries = policy.max_retries,
                    batch_size = pending.len(),
                    error = %e,
                    "Batch send failed, retrying"
                );
            }
            Err(e) => {
                tracing::error!(
                    transport = transport.name(),
                    attempts = attempt,
                    batch_size = pending.len(),
                    error = %e,
                    "Batch send failed"
                );
                let reason = e.to_string();
                report.failed.extend(
                    pending
                        .iter()
                        .map(|op| DeliveryFailure::new(op, reason.clone(), attempt)),
                );
                break;
            }
        }

        report.retried += pending.len();
        tokio::time::sleep(policy.jittered(attempt)).await;
    }

    report
}

// ─────────────────────────────────────────────────────────────────────────────
// Decorators and trivial transports
// ─────────────────────────────────────────────────────────────────────────────

/// A transport that logs every send.
#[derive(Debug)]
pub struct LoggingTransport<T: Transport> {
    inner: T,
    name: String,
}

impl<T: Transport> LoggingTransport<T> {
    pub fn new(inner: T) -> Self {
        let name = format!("logging({})", inner.name());
        Self { inner, name }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transport> Transport for LoggingTransport<T> {
    async fn send(&self, batch: &[CallOp]) -> Result<Vec<EntryOutcome>> {
        tracing::debug!(
            transport = self.inner.name(),
            batch_size = batch.len(),
            "Sending batch"
        );

        let start = Instant::now();
        let result = self.inner.send(batch).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(outcomes) => {
                tracing::debug!(
                    transport = self.inner.name(),
                    accepted = outcomes.iter().filter(|o| o.accepted).count(),
                    rejected = outcomes.iter().filter(|o| !o.accepted).count(),
                    duration_ms = elapsed.as_millis() as u64,
                    "Batch acknowledged"
                );
            }
            Err(e) => {
                tracing::warn!(
                    transport = self.inner.name(),
                    error = %e,
                    duration_ms = elapsed.as_millis() as u64,
                    "Batch failed"
                );
            }
        }

        result
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }
}

/// Accepts and discards every entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransport;

#[async_trait]
impl Transport for NoopTransport {
    async fn send(&self, batch: &[CallOp]) -> Result<Vec<EntryOutcome>> {
        Ok(vec![EntryOutcome::accepted(); batch.len()])
    }

    fn name(&self) -> &str {
        "noop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use skein_trace::{Call, CallSink};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Collect(Mutex<Vec<CallOp>>);

    impl CallSink for Collect {
        fn submit(&self, op: CallOp) {
            self.0.lock().unwrap().push(op);
        }
    }

    fn ops(n: usize) -> Vec<CallOp> {
        let sink = Arc::new(Collect::default());
        for i in 0..n {
            Call::builder(format!("op{}", i))
                .sink(Some(sink.clone()))
                .start();
        }
        let ops = sink.0.lock().unwrap().clone();
        ops
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert!(policy.jittered(2) >= Duration::from_millis(200));
        assert!(policy.jittered(9) <= Duration::from_millis(500));
    }

    #[test]
    fn test_policy_from_settings() {
        let policy = RetryPolicy::from(&RetrySettings {
            max_retries: 2,
            initial_backoff_ms: 5,
            max_backoff_ms: 50,
        });
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.initial_backoff, Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_noop_accepts_everything() {
        let report = deliver(&NoopTransport, ops(3), &fast_policy(0)).await;
        assert_eq!(report.delivered, 3);
        assert_eq!(report.retried, 0);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_only_rejected_entries_are_retried() {
        let batch = ops(3);
        let flaky = batch[1].call_id().clone();
        let transport = RecordingTransport::new();
        transport.reject_times(flaky.clone(), 1, "busy");

        let report = deliver(&transport, batch, &fast_policy(3)).await;

        assert_eq!(report.delivered, 3);
        assert_eq!(report.retried, 1);
        let batches = transport.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[1][0].call_id(), &flaky);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_reported() {
        let batch = ops(2);
        let bad = batch[0].call_id().clone();
        let transport = RecordingTransport::new();
        transport.reject_always(bad.clone(), "invalid payload");

        let report = deliver(&transport, batch, &fast_policy(2)).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed.len(), 1);
        let failure = &report.failed[0];
        assert_eq!(failure.call_id, bad);
        assert_eq!(failure.kind, CallOpKind::Start);
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.reason, "invalid payload");
        assert_eq!(transport.send_count(), 3);
    }

    #[tokio::test]
    async fn test_network_failure_retries_whole_batch() {
        let transport = RecordingTransport::new();
        transport.fail_next_sends(2);

        let report = deliver(&transport, ops(4), &fast_policy(3)).await;

        assert_eq!(report.delivered, 4);
        assert_eq!(report.retried, 8);
        assert_eq!(transport.send_count(), 3);
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        #[derive(Debug)]
        struct Unauthorized;

        #[async_trait]
        impl Transport for Unauthorized {
            async fn send(&self, _batch: &[CallOp]) -> Result<Vec<EntryOutcome>> {
                Err(ClientError::Rejected {
                    status: 401,
                    message: "bad key".to_string(),
                })
            }

            fn name(&self) -> &str {
                "unauthorized"
            }
        }

        let report = deliver(&Unauthorized, ops(2), &fast_policy(5)).await;
        assert_eq!(report.delivered, 0);
        assert_eq!(report.retried, 0);
        assert_eq!(report.failed.len(), 2);
        assert!(report.failed.iter().all(|f| f.attempts == 1));
    }

    #[tokio::test]
    async fn test_logging_transport_delegates() {
        let transport = LoggingTransport::new(NoopTransport);
        assert_eq!(transport.name(), "logging(noop)");

        let outcomes = transport.send(&ops(2)).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(transport.health_check().await.is_ok());
    }

    #[test]
    fn test_wire_format() {
        let request = BatchRequest {
            project_id: None,
            batch: ops(1),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["batch"][0]["mode"], "start");
        assert!(json.get("project_id").is_none());

        let response: BatchResponse = serde_json::from_str(
            r#"{"results":[{"accepted":true},{"accepted":false,"error":"nope"}]}"#,
        )
        .unwrap();
        assert_eq!(response.results[0], EntryOutcome::accepted());
        assert_eq!(response.results[1], EntryOutcome::rejected("nope"));
    }
}
