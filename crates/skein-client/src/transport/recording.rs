//! In-memory transport that records what it is sent.
//!
//! Useful for tests and for embedding the client where the caller wants to
//! inspect deliveries directly. Rejections, network failures and latency can
//! be scripted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use skein_trace::{CallId, CallOp, CallRecord, CallTree, records_from_ops};

use super::{EntryOutcome, Transport};
use crate::error::{ClientError, Result};

/// A transport that keeps every batch in memory.
///
/// # Example
///
/// ```ignore
/// use skein_client::transport::RecordingTransport;
///
/// let transport = RecordingTransport::new().with_latency(Duration::from_millis(5));
/// transport.fail_next_sends(1);
/// ```
#[derive(Debug, Default)]
pub struct RecordingTransport {
    batches: Mutex<Vec<Vec<CallOp>>>,
    delivered: Mutex<Vec<CallOp>>,
    rejections: Mutex<HashMap<CallId, Rejection>>,
    network_failures: AtomicUsize,
    sends: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    latency: Option<Duration>,
}

#[derive(Debug)]
struct Rejection {
    /// Remaining rejections; `None` rejects forever.
    remaining: Option<usize>,
    reason: String,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every send by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Reject every entry for `call_id` the next `times` times it is sent.
    pub fn reject_times(&self, call_id: CallId, times: usize, reason: impl Into<String>) {
        self.rejections.lock().unwrap_or_else(|e| e.into_inner()).insert(
            call_id,
            Rejection {
                remaining: Some(times),
                reason: reason.into(),
            },
        );
    }

    /// Reject every entry for `call_id`, always.
    pub fn reject_always(&self, call_id: CallId, reason: impl Into<String>) {
        self.rejections.lock().unwrap_or_else(|e| e.into_inner()).insert(
            call_id,
            Rejection {
                remaining: None,
                reason: reason.into(),
            },
        );
    }

    /// Fail the next `n` sends as a whole with a network error.
    pub fn fail_next_sends(&self, n: usize) {
        self.network_failures.store(n, Ordering::SeqCst);
    }

    /// Every batch received, including failed attempts.
    pub fn batches(&self) -> Vec<Vec<CallOp>> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Accepted entries, in acceptance order.
    pub fn delivered_ops(&self) -> Vec<CallOp> {
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Records folded from accepted entries, in creation order.
    pub fn records(&self) -> Vec<CallRecord> {
        records_from_ops(&self.delivered_ops())
    }

    /// Call tree rebuilt from accepted entries.
    pub fn tree(&self) -> CallTree {
        // Records come from distinct create entries, so ids are unique.
        CallTree::build(self.records()).unwrap_or_default()
    }

    /// Number of `send` invocations.
    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Highest number of sends observed running at the same time.
    pub fn max_concurrent_sends(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn take_network_failure(&self) -> bool {
        self.network_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn outcome_for(&self, op: &CallOp) -> EntryOutcome {
        let mut rejections = self.rejections.lock().unwrap_or_else(|e| e.into_inner());
        let Some(rejection) = rejections.get_mut(op.call_id()) else {
            return EntryOutcome::accepted();
        };
        let outcome = EntryOutcome::rejected(rejection.reason.clone());
        match rejection.remaining.as_mut() {
            None => outcome,
            Some(0) => EntryOutcome::accepted(),
            Some(n) => {
                *n -= 1;
                outcome
            }
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, batch: &[CallOp]) -> Result<Vec<EntryOutcome>> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(batch.to_vec());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if self.take_network_failure() {
            return Err(ClientError::Network("simulated connection reset".to_string()));
        }

        let outcomes: Vec<EntryOutcome> = batch.iter().map(|op| self.outcome_for(op)).collect();

        let mut delivered = self.delivered.lock().unwrap_or_else(|e| e.into_inner());
        for (op, outcome) in batch.iter().zip(&outcomes) {
            if outcome.accepted {
                delivered.push(op.clone());
            }
        }

        Ok(outcomes)
    }

    fn name(&self) -> &str {
        "recording"
    }
}
