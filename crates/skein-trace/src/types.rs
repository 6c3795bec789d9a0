//! Call data types.
//!
//! A [`CallRecord`] is the full state of one recorded invocation. The
//! [`CallOp`] variants are the mutations that travel to the ingestion
//! backend: a create when the call starts, lightweight updates for metadata,
//! and a finalize when the call settles.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered string-keyed JSON mapping used for attributes, inputs and summaries.
pub type Attributes = serde_json::Map<String, Value>;

/// Unique identifier of a single call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier shared by every call descended from one root call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

impl TraceId {
    /// Generate a fresh random trace identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TraceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle status of a call.
///
/// `Pending` is the only non-terminal state. A call leaves it exactly once,
/// into either `Finished` or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Finished,
    Error,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CallStatus::Pending)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallStatus::Pending => "pending",
            CallStatus::Finished => "finished",
            CallStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A captured failure of the wrapped callable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    /// Type name of the failure (e.g. `std::io::Error`).
    pub kind: String,

    /// Rendered failure message.
    pub message: String,
}

impl Exception {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Capture an error value, using its type name as the kind.
    pub fn from_error<E: fmt::Display + ?Sized>(error: &E) -> Self {
        Self {
            kind: std::any::type_name::<E>().to_string(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Full state of one recorded invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    pub op_name: String,
    pub parent_id: Option<CallId>,
    pub trace_id: TraceId,

    /// Process-wide creation order.
    pub seq: u64,

    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub attributes: Attributes,

    #[serde(default)]
    pub inputs: Attributes,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<Exception>,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    pub status: CallStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub summary: Attributes,
}

impl CallRecord {
    /// Rebuild a pending record from its create entry.
    pub fn from_start(start: &CallStart) -> Self {
        Self {
            id: start.id.clone(),
            op_name: start.op_name.clone(),
            parent_id: start.parent_id.clone(),
            trace_id: start.trace_id.clone(),
            seq: start.seq,
            attributes: start.attributes.clone(),
            inputs: start.inputs.clone(),
            output: None,
            exception: None,
            started_at: start.started_at,
            ended_at: None,
            status: CallStatus::Pending,
            display_name: start.display_name.clone(),
            summary: Attributes::new(),
        }
    }

    /// Fold a later mutation for the same call into this record.
    ///
    /// Mutations addressed to another call are ignored.
    pub fn apply(&mut self, op: &CallOp) {
        if op.call_id() != &self.id {
            return;
        }
        match op {
            CallOp::Start(start) => *self = Self::from_start(start),
            CallOp::Update(update) => {
                if let Some(name) = &update.display_name {
                    self.display_name = Some(name.clone());
                }
            }
            CallOp::End(end) => {
                self.status = end.status;
                self.output = end.output.clone();
                self.exception = end.exception.clone();
                self.ended_at = Some(end.ended_at);
                self.summary = end.summary.clone();
            }
        }
    }

    /// Duration of the call, if it has ended.
    pub fn duration_ms(&self) -> Option<u64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }
}

/// Fold a stream of mutations into records, in creation order.
///
/// Mutations for a call whose create entry is absent are dropped.
pub fn records_from_ops<'a>(ops: impl IntoIterator<Item = &'a CallOp>) -> Vec<CallRecord> {
    let mut records: Vec<CallRecord> = Vec::new();
    let mut index = std::collections::HashMap::new();

    for op in ops {
        match op {
            CallOp::Start(start) => {
                index.insert(start.id.clone(), records.len());
                records.push(CallRecord::from_start(start));
            }
            other => {
                if let Some(&i) = index.get(other.call_id()) {
                    records[i].apply(other);
                }
            }
        }
    }

    records.sort_by_key(|r| r.seq);
    records
}

/// Create entry: sent when a call enters `pending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStart {
    pub id: CallId,
    pub op_name: String,
    pub parent_id: Option<CallId>,
    pub trace_id: TraceId,
    pub seq: u64,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub inputs: Attributes,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Metadata-only update entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallUpdate {
    pub id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl CallUpdate {
    /// Merge a newer update over this one; fields set in `newer` win.
    pub fn merge(&mut self, newer: CallUpdate) {
        if newer.display_name.is_some() {
            self.display_name = newer.display_name;
        }
    }
}

/// Finalize entry: sent when a call reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnd {
    pub id: CallId,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<Exception>,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub summary: Attributes,
}

/// One mutation of a call, as delivered to the ingestion backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CallOp {
    Start(CallStart),
    Update(CallUpdate),
    End(CallEnd),
}

impl CallOp {
    pub fn call_id(&self) -> &CallId {
        match self {
            CallOp::Start(s) => &s.id,
            CallOp::Update(u) => &u.id,
            CallOp::End(e) => &e.id,
        }
    }

    pub fn kind(&self) -> CallOpKind {
        match self {
            CallOp::Start(_) => CallOpKind::Start,
            CallOp::Update(_) => CallOpKind::Update,
            CallOp::End(_) => CallOpKind::End,
        }
    }
}

/// Discriminant of a [`CallOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOpKind {
    Start,
    Update,
    End,
}

impl fmt::Display for CallOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallOpKind::Start => "start",
            CallOpKind::Update => "update",
            CallOpKind::End => "end",
        };
        f.write_str(s)
    }
}

static CLOCK: Mutex<Option<(u64, DateTime<Utc>)>> = Mutex::new(None);

/// Next creation stamp: a sequence number and a timestamp that never goes
/// backwards relative to earlier stamps.
pub(crate) fn next_stamp() -> (u64, DateTime<Utc>) {
    let mut guard = CLOCK.lock().unwrap_or_else(|e| e.into_inner());
    let now = Utc::now();
    let next = match *guard {
        None => (0, now),
        Some((seq, last)) => (seq + 1, now.max(last)),
    };
    *guard = Some(next);
    next
}

/// Current time, never earlier than any stamp already handed out.
pub(crate) fn monotonic_now() -> DateTime<Utc> {
    let guard = CLOCK.lock().unwrap_or_else(|e| e.into_inner());
    let now = Utc::now();
    match *guard {
        Some((_, last)) => now.max(last),
        None => now,
    }
}
