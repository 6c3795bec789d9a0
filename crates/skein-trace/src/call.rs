//! Call handle and lifecycle state machine.
//!
//! A [`Call`] is a cheap, cloneable handle to one recorded invocation. Every
//! state change is reported to the call's [`CallSink`] (normally a client's
//! batch queue) as a [`CallOp`]. A call without a sink is still a fully
//! valid state machine; its mutations are simply not delivered anywhere.
//!
//! ```text
//!            finish()
//!  pending ──────────▶ finished
//!     │
//!     └──────────────▶ error
//!            fail()
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;

use crate::error::{Result, TraceError};
use crate::types::{
    Attributes, CallEnd, CallId, CallOp, CallRecord, CallStart, CallStatus, CallUpdate, Exception,
    TraceId, monotonic_now, next_stamp,
};

/// Receiver of call mutations.
///
/// Implementations must not block: `submit` is invoked on the instrumented
/// call path.
pub trait CallSink: Send + Sync + fmt::Debug {
    fn submit(&self, op: CallOp);

    /// Called once with the handle of every call created against this sink,
    /// right after its create entry was submitted.
    fn track(&self, _call: &Call) {}
}

/// A sink that can be shared across calls and scopes.
pub type SharedSink = Arc<dyn CallSink>;

/// Handle to one recorded invocation.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

struct CallInner {
    id: CallId,
    trace_id: TraceId,
    parent_id: Option<CallId>,
    op_name: String,
    state: Mutex<CallRecord>,
    sink: Option<SharedSink>,
}

/// Builder for a new pending call.
#[derive(Debug, Default)]
pub struct CallBuilder {
    op_name: String,
    parent: Option<Call>,
    attributes: Attributes,
    inputs: Attributes,
    display_name: Option<String>,
    sink: Option<SharedSink>,
}

impl CallBuilder {
    /// Link the new call under `parent`, inheriting its trace id.
    pub fn parent(mut self, parent: Option<Call>) -> Self {
        self.parent = parent;
        self
    }

    /// Frozen attribute snapshot for the call.
    pub fn attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn inputs(mut self, inputs: Attributes) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn sink(mut self, sink: Option<SharedSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Create the call in `pending` and report its create entry.
    pub fn start(self) -> Call {
        let (seq, started_at) = next_stamp();
        let id = CallId::new();
        let (parent_id, trace_id) = match &self.parent {
            Some(parent) => (Some(parent.id().clone()), parent.trace_id().clone()),
            None => (None, TraceId::new()),
        };

        let start = CallStart {
            id: id.clone(),
            op_name: self.op_name.clone(),
            parent_id: parent_id.clone(),
            trace_id: trace_id.clone(),
            seq,
            attributes: self.attributes,
            inputs: self.inputs,
            started_at,
            display_name: self.display_name,
        };
        let record = CallRecord::from_start(&start);

        if let Some(sink) = &self.sink {
            sink.submit(CallOp::Start(start));
        }

        let call = Call {
            inner: Arc::new(CallInner {
                id,
                trace_id,
                parent_id,
                op_name: self.op_name,
                state: Mutex::new(record),
                sink: self.sink,
            }),
        };
        if let Some(sink) = &call.inner.sink {
            sink.track(&call);
        }
        call
    }
}

impl Call {
    /// Start building a call for the operation `op_name`.
    pub fn builder(op_name: impl Into<String>) -> CallBuilder {
        CallBuilder {
            op_name: op_name.into(),
            ..Default::default()
        }
    }

    pub fn id(&self) -> &CallId {
        &self.inner.id
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.inner.trace_id
    }

    pub fn parent_id(&self) -> Option<&CallId> {
        self.inner.parent_id.as_ref()
    }

    pub fn op_name(&self) -> &str {
        &self.inner.op_name
    }

    /// The sink this call reports to, if any.
    pub fn sink(&self) -> Option<&SharedSink> {
        self.inner.sink.as_ref()
    }

    pub fn status(&self) -> CallStatus {
        self.lock().status
    }

    /// A copy of the call's current state.
    pub fn snapshot(&self) -> CallRecord {
        self.lock().clone()
    }

    /// Transition `pending -> finished` with the given output.
    pub fn finish(&self, output: Value) -> Result<()> {
        self.settle(CallStatus::Finished, Some(output), None)
    }

    /// Transition `pending -> error` with the captured failure.
    pub fn fail(&self, exception: Exception) -> Result<()> {
        self.settle(CallStatus::Error, None, Some(exception))
    }

    fn settle(
        &self,
        to: CallStatus,
        output: Option<Value>,
        exception: Option<Exception>,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.status.is_terminal() {
            return Err(TraceError::InvalidStateTransition {
                call_id: self.inner.id.clone(),
                from: state.status,
                to,
            });
        }

        let ended_at = monotonic_now().max(state.started_at);
        state.status = to;
        state.output = output;
        state.exception = exception;
        state.ended_at = Some(ended_at);

        // Submitted under the lock so a concurrent metadata update cannot
        // reach the sink ahead of the state it was applied to.
        if let Some(sink) = &self.inner.sink {
            sink.submit(CallOp::End(CallEnd {
                id: self.inner.id.clone(),
                status: to,
                output: state.output.clone(),
                exception: state.exception.clone(),
                ended_at,
                summary: state.summary.clone(),
            }));
        }
        Ok(())
    }

    /// Record one summary entry. Fails once the call is finalized.
    pub fn add_summary(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let mut entries = Attributes::new();
        entries.insert(key.into(), value);
        self.merge_summary(entries)
    }

    /// Merge summary entries over the existing summary. Fails once the call
    /// is finalized.
    pub fn merge_summary(&self, entries: Attributes) -> Result<()> {
        let mut state = self.lock();
        if state.status.is_terminal() {
            return Err(TraceError::InvalidStateTransition {
                call_id: self.inner.id.clone(),
                from: state.status,
                to: state.status,
            });
        }
        state.summary.extend(entries);
        Ok(())
    }

    /// Set the human-readable label. Allowed in any state.
    pub fn set_display_name(&self, name: impl Into<String>) {
        let name = name.into();
        let mut state = self.lock();
        state.display_name = Some(name.clone());
        if let Some(sink) = &self.inner.sink {
            sink.submit(CallOp::Update(CallUpdate {
                id: self.inner.id.clone(),
                display_name: Some(name),
            }));
        }
    }

    /// A handle that does not keep the call alive.
    pub fn downgrade(&self) -> WeakCall {
        WeakCall {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether both handles refer to the same call.
    pub fn ptr_eq(&self, other: &Call) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, CallRecord> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.inner.id)
            .field("op_name", &self.inner.op_name)
            .field("parent_id", &self.inner.parent_id)
            .field("status", &self.status())
            .finish()
    }
}

/// Non-owning reference to a [`Call`].
#[derive(Clone)]
pub struct WeakCall {
    inner: Weak<CallInner>,
}

impl WeakCall {
    pub fn upgrade(&self) -> Option<Call> {
        self.inner.upgrade().map(|inner| Call { inner })
    }
}

impl fmt::Debug for WeakCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakCall")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
