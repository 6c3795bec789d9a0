//! Call tracing primitives.
//!
//! This crate provides the foundation for recording instrumented invocations:
//!
//! - **Types**: `CallRecord`, the `CallOp` mutations sent to an ingestion
//!   backend, and their identifiers
//! - **Call**: the `pending -> finished | error` state machine, reporting every
//!   mutation to a `CallSink`
//! - **Context**: task-local "current call / current attributes" that follows
//!   the logical execution path across `.await` points
//! - **Tree**: reconstruction of the caller/callee forest from flat records
//! - **Writer**: JSONL persistence of call mutations
//!
//! # Usage
//!
//! ```rust
//! use skein_trace::{Call, context};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let parent = Call::builder("parent").start();
//!
//! let child_parent = context::run_in_scope(Some(parent.clone()), None, async {
//!     let child = Call::builder("child")
//!         .parent(context::current_call())
//!         .start();
//!     child.finish(serde_json::json!("ok")).unwrap();
//!     child.parent_id().cloned()
//! })
//! .await;
//!
//! assert_eq!(child_parent.as_ref(), Some(parent.id()));
//! # }
//! ```

pub mod call;
pub mod context;
pub mod error;
pub mod tree;
pub mod types;
pub mod writer;

pub use call::{Call, CallBuilder, CallSink, SharedSink, WeakCall};
pub use context::{
    Scope, ScopeFutureExt, current_attributes, current_call, run_in_scope, run_in_scope_sync,
    spawn, with_attributes,
};
pub use error::{Result, TraceError};
pub use tree::{CallNode, CallTree, TreeViolation};
pub use types::{
    Attributes, CallEnd, CallId, CallOp, CallOpKind, CallRecord, CallStart, CallStatus,
    CallUpdate, Exception, TraceId, records_from_ops,
};
pub use writer::{CallLogWriter, WriteError, WriterConfig};
