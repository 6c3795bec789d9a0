//! Call batching queue.
//!
//! Buffers call mutations and hands them to a transport in bounded batches.
//! Mutations for the same call id are coalesced while they wait, and a call
//! whose entries are part of an in-flight batch is held back until that
//! batch settles, so a finalize never overtakes its create.
//!
//! The queue itself is runtime-agnostic: [`BatchQueue::flush_due`] and
//! [`BatchQueue::acknowledge`] drive it by hand, and
//! [`BatchQueue::spawn_worker`] runs the flush schedule on a tokio task.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use skein_trace::{CallEnd, CallId, CallOp, CallStart, CallUpdate};
use tokio::sync::{Notify, Semaphore, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::config::BatchSettings;
use crate::error::{ClientError, Result};
use crate::transport::{DeliveryFailure, DeliveryReport, RetryPolicy, SharedTransport, deliver};

/// Capacity of the delivery-failure broadcast channel.
const FAILURE_CHANNEL_CAPACITY: usize = 1024;

/// Batching limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_flush_interval: Duration,
    pub max_queue_size: usize,
    pub max_concurrent_batches: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::from(&BatchSettings::default())
    }
}

impl From<&BatchSettings> for BatchConfig {
    fn from(settings: &BatchSettings) -> Self {
        Self {
            max_batch_size: settings.max_batch_size.max(1),
            max_flush_interval: Duration::from_millis(settings.max_flush_interval_ms),
            max_queue_size: settings.max_queue_size,
            max_concurrent_batches: settings.max_concurrent_batches.max(1),
        }
    }
}

/// What happened to an enqueued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new queue slot was taken.
    Queued,
    /// Merged into the waiting state of the same call.
    Coalesced,
    /// Refused: the queue is full or shut down.
    Dropped,
}

/// Counters describing queue activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub coalesced: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub failed: u64,
    pub retried: u64,
    /// Calls waiting to be flushed.
    pub pending: usize,
    /// Calls that are part of a batch being sent.
    pub in_flight: usize,
}

/// A batch taken from the queue, to be acknowledged once sent.
#[derive(Debug)]
pub struct FlushBatch {
    ops: Vec<CallOp>,
    ids: Vec<CallId>,
    seqs: Vec<u64>,
}

impl FlushBatch {
    pub fn ops(&self) -> &[CallOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Coalesced waiting state of one call.
#[derive(Debug)]
struct PendingCall {
    start: Option<CallStart>,
    update: Option<CallUpdate>,
    end: Option<CallEnd>,
    /// Enqueue sequence numbers folded into this state.
    seqs: Vec<u64>,
    first_enqueued: Instant,
}

impl PendingCall {
    fn new(now: Instant) -> Self {
        Self {
            start: None,
            update: None,
            end: None,
            seqs: Vec::new(),
            first_enqueued: now,
        }
    }

    fn merge(&mut self, op: CallOp) {
        match op {
            CallOp::Start(start) => self.start = Some(start),
            CallOp::Update(update) => match self.update.as_mut() {
                Some(existing) => existing.merge(update),
                None => self.update = Some(update),
            },
            CallOp::End(end) => self.end = Some(end),
        }
    }

    fn entry_count(&self) -> usize {
        usize::from(self.start.is_some())
            + usize::from(self.update.is_some())
            + usize::from(self.end.is_some())
    }

    /// Entries in create, update, finalize order.
    fn into_ops(self) -> Vec<CallOp> {
        let mut ops = Vec::with_capacity(3);
        if let Some(start) = self.start {
            ops.push(CallOp::Start(start));
        }
        if let Some(update) = self.update {
            ops.push(CallOp::Update(update));
        }
        if let Some(end) = self.end {
            ops.push(CallOp::End(end));
        }
        ops
    }
}

#[derive(Debug)]
struct QueueState {
    /// Waiting call ids in first-enqueue order.
    order: VecDeque<CallId>,
    pending: HashMap<CallId, PendingCall>,
    in_flight: HashSet<CallId>,
    /// Accepted sequence numbers without a delivery outcome yet.
    unacked: BTreeSet<u64>,
    next_seq: u64,
    /// Flush regardless of size and age until the queue is empty.
    flush_requested: bool,
    accepting: bool,
}

impl QueueState {
    fn is_eligible(&self, id: &CallId) -> bool {
        !self.in_flight.contains(id)
    }

    fn eligible(&self) -> impl Iterator<Item = (&CallId, &PendingCall)> {
        self.order
            .iter()
            .filter(|id| self.is_eligible(id))
            .filter_map(|id| self.pending.get(id).map(|p| (id, p)))
    }

    fn is_due(&self, config: &BatchConfig, now: Instant) -> bool {
        let mut entries = 0;
        for (i, (_, call)) in self.eligible().enumerate() {
            if i == 0
                && (self.flush_requested
                    || !self.accepting
                    || now.duration_since(call.first_enqueued) >= config.max_flush_interval)
            {
                return true;
            }
            entries += call.entry_count();
            if entries >= config.max_batch_size {
                return true;
            }
        }
        false
    }

    fn next_deadline(&self, config: &BatchConfig) -> Option<Instant> {
        self.eligible()
            .map(|(_, call)| call.first_enqueued + config.max_flush_interval)
            .min()
    }
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    coalesced: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    /// Flush worker loop iterations.
    worker_wakeups: AtomicU64,
}

/// Bounded, coalescing queue of call mutations.
#[derive(Debug)]
pub struct BatchQueue {
    config: BatchConfig,
    state: Mutex<QueueState>,
    counters: Counters,
    /// Wakes the flush worker.
    wake: Notify,
    /// Wakes callers waiting for delivery outcomes.
    settled: Notify,
    failures: broadcast::Sender<DeliveryFailure>,
}

impl BatchQueue {
    pub fn new(config: BatchConfig) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            config,
            state: Mutex::new(QueueState {
                order: VecDeque::new(),
                pending: HashMap::new(),
                in_flight: HashSet::new(),
                unacked: BTreeSet::new(),
                next_seq: 0,
                flush_requested: false,
                accepting: true,
            }),
            counters: Counters::default(),
            wake: Notify::new(),
            settled: Notify::new(),
            failures,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a mutation. Never blocks on delivery.
    pub fn enqueue(&self, op: CallOp) -> EnqueueOutcome {
        let now = Instant::now();
        let mut state = self.lock();

        if !state.accepting {
            drop(state);
            self.drop_entry(&op, "queue is shut down");
            return EnqueueOutcome::Dropped;
        }

        let id = op.call_id().clone();
        let seq = state.next_seq;

        let outcome = if let Some(call) = state.pending.get_mut(&id) {
            call.merge(op);
            call.seqs.push(seq);
            EnqueueOutcome::Coalesced
        } else if state.pending.len() >= self.config.max_queue_size {
            drop(state);
            self.drop_entry(&op, "queue is full");
            return EnqueueOutcome::Dropped;
        } else {
            let mut call = PendingCall::new(now);
            call.merge(op);
            call.seqs.push(seq);
            state.pending.insert(id.clone(), call);
            state.order.push_back(id);
            EnqueueOutcome::Queued
        };

        state.next_seq += 1;
        state.unacked.insert(seq);
        let due = state.is_due(&self.config, now);
        drop(state);

        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        if outcome == EnqueueOutcome::Coalesced {
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
        }
        if due {
            self.wake.notify_one();
        }
        outcome
    }

    fn drop_entry(&self, op: &CallOp, reason: &str) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            call_id = %op.call_id(),
            kind = %op.kind(),
            reason,
            "Dropping call entry"
        );
        let _ = self.failures.send(DeliveryFailure::dropped(op, reason));
    }

    /// Request that everything waiting be flushed without regard to size or
    /// age.
    pub fn flush_now(&self) {
        self.lock().flush_requested = true;
        self.wake.notify_one();
    }

    /// Take the next batch if a flush is due.
    ///
    /// The returned batch's calls are in flight until [`acknowledge`] is
    /// called for it.
    ///
    /// [`acknowledge`]: BatchQueue::acknowledge
    pub fn flush_due(&self) -> Option<FlushBatch> {
        self.take_due(Instant::now())
    }

    fn take_due(&self, now: Instant) -> Option<FlushBatch> {
        let mut state = self.lock();
        if !state.is_due(&self.config, now) {
            if state.pending.is_empty() {
                state.flush_requested = false;
            }
            return None;
        }

        let mut batch = FlushBatch {
            ops: Vec::new(),
            ids: Vec::new(),
            seqs: Vec::new(),
        };
        let mut remaining = VecDeque::with_capacity(state.order.len());
        let mut closed = false;

        while let Some(id) = state.order.pop_front() {
            if closed || !state.is_eligible(&id) {
                remaining.push_back(id);
                continue;
            }
            let count = state.pending.get(&id).map_or(0, PendingCall::entry_count);
            if batch.ops.is_empty() && count > self.config.max_batch_size {
                // A call with more entries than fit in a batch is sent in
                // parts. The rest stays pending behind the in-flight part and
                // carries the sequence numbers, so waiters see it through.
                if let Some(call) = state.pending.remove(&id) {
                    let mut rest = PendingCall::new(call.first_enqueued);
                    rest.seqs = call.seqs.clone();
                    let mut ops = call.into_ops();
                    for op in ops.split_off(self.config.max_batch_size) {
                        rest.merge(op);
                    }
                    batch.ops = ops;
                    state.pending.insert(id.clone(), rest);
                    state.in_flight.insert(id.clone());
                    batch.ids.push(id.clone());
                }
                closed = true;
                remaining.push_back(id);
                continue;
            }
            if !batch.ops.is_empty() && batch.ops.len() + count > self.config.max_batch_size {
                // Later calls wait so that enqueue order is kept across batches.
                closed = true;
                remaining.push_back(id);
                continue;
            }
            if let Some(call) = state.pending.remove(&id) {
                batch.seqs.extend_from_slice(&call.seqs);
                batch.ops.extend(call.into_ops());
                state.in_flight.insert(id.clone());
                batch.ids.push(id);
            }
        }
        state.order = remaining;

        if state.pending.is_empty() {
            state.flush_requested = false;
        }
        drop(state);

        if batch.ids.is_empty() {
            None
        } else {
            tracing::debug!(
                batch_size = batch.ops.len(),
                calls = batch.ids.len(),
                "Flushing batch"
            );
            Some(batch)
        }
    }

    /// Record the delivery outcome of a batch taken with `flush_due`.
    pub fn acknowledge(&self, batch: FlushBatch, report: DeliveryReport) {
        {
            let mut state = self.lock();
            for id in &batch.ids {
                state.in_flight.remove(id);
            }
            for seq in &batch.seqs {
                state.unacked.remove(seq);
            }
        }

        self.counters
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters
            .retried
            .fetch_add(report.retried as u64, Ordering::Relaxed);
        self.counters
            .failed
            .fetch_add(report.failed.len() as u64, Ordering::Relaxed);
        for failure in report.failed {
            let _ = self.failures.send(failure);
        }

        self.settled.notify_waiters();
        self.wake.notify_one();
    }

    /// Wait until every entry accepted before this call has a delivery
    /// outcome (delivered or terminally failed).
    ///
    /// Requires a running flush worker.
    pub async fn wait_for_batch_processing(&self) {
        let target = {
            let mut state = self.lock();
            if state.unacked.is_empty() {
                return;
            }
            state.flush_requested = true;
            state.next_seq
        };
        self.wake.notify_one();
        self.wait_until_settled(target).await;
    }

    async fn wait_until_settled(&self, target: u64) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().unacked.range(..target).next().is_none() {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting entries, flush everything and wait for every
    /// in-flight send to finish or exhaust its retries.
    ///
    /// Only the first call drains; later calls fail with `AlreadyShutdown`.
    pub async fn shutdown(&self) -> Result<()> {
        let target = {
            let mut state = self.lock();
            if !state.accepting {
                return Err(ClientError::AlreadyShutdown);
            }
            state.accepting = false;
            state.flush_requested = true;
            state.next_seq
        };
        tracing::debug!("Draining batch queue");
        self.wake.notify_one();
        self.wait_until_settled(target).await;
        Ok(())
    }

    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    /// Shut down with nothing left to send.
    fn is_drained(&self) -> bool {
        let state = self.lock();
        !state.accepting && state.pending.is_empty() && state.in_flight.is_empty()
    }

    /// Subscribe to entries that could not be delivered.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<DeliveryFailure> {
        self.failures.subscribe()
    }

    pub fn stats(&self) -> QueueStats {
        let (pending, in_flight) = {
            let state = self.lock();
            (state.pending.len(), state.in_flight.len())
        };
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            pending,
            in_flight,
        }
    }

    /// Run the flush schedule on the current tokio runtime.
    ///
    /// The worker exits once the queue has been shut down and drained.
    pub fn spawn_worker(
        self: &Arc<Self>,
        transport: SharedTransport,
        policy: RetryPolicy,
    ) -> JoinHandle<()> {
        tokio::spawn(run_worker(Arc::clone(self), transport, policy))
    }
}

async fn run_worker(queue: Arc<BatchQueue>, transport: SharedTransport, policy: RetryPolicy) {
    let permits = Arc::new(Semaphore::new(queue.config.max_concurrent_batches));
    let mut sends = JoinSet::new();

    tracing::debug!(
        transport = transport.name(),
        max_concurrent_batches = queue.config.max_concurrent_batches,
        "Flush worker started"
    );

    loop {
        queue.counters.worker_wakeups.fetch_add(1, Ordering::Relaxed);
        while let Ok(permit) = Arc::clone(&permits).try_acquire_owned() {
            let Some(mut batch) = queue.take_due(Instant::now()) else {
                break;
            };
            let queue = Arc::clone(&queue);
            let transport = Arc::clone(&transport);
            sends.spawn(async move {
                let ops = std::mem::take(&mut batch.ops);
                let report = deliver(&*transport, ops, &policy).await;
                queue.acknowledge(batch, report);
                drop(permit);
            });
        }

        if queue.is_drained() {
            break;
        }

        // With every permit taken, an overdue deadline would fire at once;
        // only a finished send or an explicit wake can make progress.
        let deadline = if permits.available_permits() > 0 {
            queue.lock().next_deadline(&queue.config)
        } else {
            None
        };
        let sleep = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = queue.wake.notified() => {}
            Some(joined) = sends.join_next(), if !sends.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Batch send task failed");
                }
            }
            _ = sleep => {}
        }
    }

    while let Some(joined) = sends.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Batch send task failed");
        }
    }
    tracing::debug!("Flush worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RecordingTransport;
    use serde_json::json;
    use skein_trace::{Call, CallOpKind, CallSink};
    use tokio_test::{assert_pending, assert_ready};

    /// Sink feeding a queue directly.
    #[derive(Debug)]
    struct QueueSink(Arc<BatchQueue>);

    impl CallSink for QueueSink {
        fn submit(&self, op: CallOp) {
            self.0.enqueue(op);
        }
    }

    fn queue(max_batch_size: usize, interval_ms: u64) -> Arc<BatchQueue> {
        Arc::new(BatchQueue::new(BatchConfig {
            max_batch_size,
            max_flush_interval: Duration::from_millis(interval_ms),
            max_queue_size: 100,
            max_concurrent_batches: 2,
        }))
    }

    fn start(queue: &Arc<BatchQueue>, name: &str) -> Call {
        Call::builder(name)
            .sink(Some(Arc::new(QueueSink(Arc::clone(queue)))))
            .start()
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_coalesces_same_call() {
        let queue = queue(10, 60_000);
        let call = start(&queue, "op");
        call.set_display_name("first");
        call.set_display_name("second");
        call.finish(json!(1)).unwrap();

        let stats = queue.stats();
        assert_eq!(stats.enqueued, 4);
        assert_eq!(stats.coalesced, 3);
        assert_eq!(stats.pending, 1);

        queue.flush_now();
        let batch = queue.flush_due().unwrap();
        let kinds: Vec<_> = batch.ops().iter().map(CallOp::kind).collect();
        assert_eq!(
            kinds,
            vec![CallOpKind::Start, CallOpKind::Update, CallOpKind::End]
        );
        match &batch.ops()[1] {
            CallOp::Update(update) => assert_eq!(update.display_name.as_deref(), Some("second")),
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_not_due_until_size_or_request() {
        let queue = queue(3, 60_000);
        start(&queue, "a");
        start(&queue, "b");
        assert!(queue.flush_due().is_none());

        start(&queue, "c");
        let batch = queue.flush_due().unwrap();
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_batches_respect_max_size_and_order() {
        let queue = queue(2, 60_000);
        let names = ["a", "b", "c", "d", "e"];
        for name in names {
            start(&queue, name);
        }
        queue.flush_now();

        let mut seen = Vec::new();
        while let Some(batch) = queue.flush_due() {
            assert!(batch.len() <= 2);
            for op in batch.ops() {
                if let CallOp::Start(s) = op {
                    seen.push(s.op_name.clone());
                }
            }
            queue.acknowledge(batch, DeliveryReport::default());
        }
        assert_eq!(seen, names);
    }

    #[test]
    fn test_oversized_call_is_split_across_batches() {
        let queue = queue(1, 60_000);
        let call = start(&queue, "op");
        call.set_display_name("renamed");
        call.finish(json!(1)).unwrap();

        let mut wait = tokio_test::task::spawn(queue.wait_for_batch_processing());
        assert_pending!(wait.poll());

        let mut kinds = Vec::new();
        while let Some(batch) = queue.flush_due() {
            assert_eq!(batch.len(), 1);
            kinds.push(batch.ops()[0].kind());
            // The rest of the call waits for this part to settle.
            assert!(queue.flush_due().is_none());
            queue.acknowledge(batch, DeliveryReport::default());
            if kinds.len() < 3 {
                assert_pending!(wait.poll());
            }
        }

        assert_eq!(
            kinds,
            vec![CallOpKind::Start, CallOpKind::Update, CallOpKind::End]
        );
        assert_eq!(queue.stats().pending, 0);
        assert_ready!(wait.poll());
    }

    #[test]
    fn test_in_flight_call_is_held_back() {
        let queue = queue(10, 60_000);
        let call = start(&queue, "op");
        queue.flush_now();
        let first = queue.flush_due().unwrap();

        call.finish(json!("done")).unwrap();
        queue.flush_now();
        assert!(queue.flush_due().is_none());
        assert_eq!(queue.stats().in_flight, 1);

        queue.acknowledge(first, DeliveryReport::default());
        queue.flush_now();
        let second = queue.flush_due().unwrap();
        assert!(matches!(second.ops()[0], CallOp::End(_)));
    }

    #[test]
    fn test_wait_blocks_until_acknowledged() {
        let queue = queue(10, 60_000);
        start(&queue, "op");

        let mut wait = tokio_test::task::spawn(queue.wait_for_batch_processing());
        assert_pending!(wait.poll());

        // Waiting requests a flush even though the batch is not full.
        let batch = queue.flush_due().unwrap();
        assert_pending!(wait.poll());

        queue.acknowledge(batch, DeliveryReport::default());
        assert!(wait.is_woken());
        assert_ready!(wait.poll());
    }

    #[test]
    fn test_age_makes_batch_due() {
        let queue = queue(100, 10);
        start(&queue, "old");
        std::thread::sleep(Duration::from_millis(20));
        assert!(queue.flush_due().is_some());
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_reports() {
        let queue = Arc::new(BatchQueue::new(BatchConfig {
            max_batch_size: 10,
            max_flush_interval: Duration::from_secs(60),
            max_queue_size: 2,
            max_concurrent_batches: 1,
        }));
        let mut failures = queue.subscribe_failures();

        let a = start(&queue, "a");
        start(&queue, "b");
        let c = start(&queue, "c");
        // Coalescing into a waiting call is still accepted.
        a.finish(json!(null)).unwrap();

        let stats = queue.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.pending, 2);

        let failure = failures.recv().await.unwrap();
        assert_eq!(&failure.call_id, c.id());
        assert_eq!(failure.attempts, 0);
    }

    #[tokio::test]
    async fn test_worker_delivers_and_wait_returns() {
        let queue = queue(100, 60_000);
        let transport = Arc::new(RecordingTransport::new());
        let worker = queue.spawn_worker(transport.clone(), fast_policy());

        for i in 0..5 {
            let call = start(&queue, &format!("op{}", i));
            call.finish(json!(i)).unwrap();
        }
        queue.wait_for_batch_processing().await;

        assert_eq!(transport.delivered_ops().len(), 10);
        assert_eq!(queue.stats().delivered, 10);

        queue.shutdown().await.unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_covers_retries() {
        let queue = queue(100, 60_000);
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_next_sends(2);
        let worker = queue.spawn_worker(transport.clone(), fast_policy());

        start(&queue, "flaky").finish(json!(1)).unwrap();
        queue.wait_for_batch_processing().await;

        assert_eq!(transport.delivered_ops().len(), 2);
        assert_eq!(transport.send_count(), 3);
        assert_eq!(queue.stats().retried, 4);

        queue.shutdown().await.unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_sends_are_bounded() {
        let queue = queue(1, 60_000);
        let transport =
            Arc::new(RecordingTransport::new().with_latency(Duration::from_millis(20)));
        let worker = queue.spawn_worker(transport.clone(), fast_policy());

        for i in 0..6 {
            start(&queue, &format!("op{}", i));
        }
        queue.wait_for_batch_processing().await;

        assert_eq!(transport.send_count(), 6);
        assert!(transport.max_concurrent_sends() <= 2);

        queue.shutdown().await.unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_saturated_worker_waits_for_sends() {
        let queue = Arc::new(BatchQueue::new(BatchConfig {
            max_batch_size: 1,
            max_flush_interval: Duration::from_millis(1),
            max_queue_size: 100,
            max_concurrent_batches: 1,
        }));
        let transport =
            Arc::new(RecordingTransport::new().with_latency(Duration::from_millis(300)));
        let worker = queue.spawn_worker(transport.clone(), fast_policy());

        for i in 0..3 {
            start(&queue, &format!("op{}", i));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Overdue entries behind a busy send must not keep the worker spinning.
        assert_eq!(transport.send_count(), 1);
        let wakeups = queue.counters.worker_wakeups.load(Ordering::Relaxed);
        assert!(wakeups < 20, "worker woke {} times while saturated", wakeups);

        queue.shutdown().await.unwrap();
        worker.await.unwrap();
        assert_eq!(transport.send_count(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_drains_once() {
        let queue = queue(100, 60_000);
        let transport = Arc::new(RecordingTransport::new());
        let worker = queue.spawn_worker(transport.clone(), fast_policy());

        start(&queue, "pending-at-shutdown");
        queue.shutdown().await.unwrap();
        worker.await.unwrap();

        assert_eq!(transport.delivered_ops().len(), 1);
        assert!(matches!(
            queue.shutdown().await,
            Err(ClientError::AlreadyShutdown)
        ));

        start(&queue, "late");
        assert!(!queue.is_accepting());
        assert_eq!(queue.stats().dropped, 1);
    }
}
